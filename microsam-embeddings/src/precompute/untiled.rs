//! Untiled 2D images and 3D volumes

use ndarray::{stack, Axis};

use super::batch::{encode_in_batches, StoredSlices};
use super::{set_precomputed, size_attr, Features, ImageEmbeddings, Job, FEATURES};
use crate::encoder::{ImageEncoder, SamPredictor};
use crate::error::{EmbeddingError, Result};
use crate::normalize::{to_image, Pixel};
use crate::progress::ProgressReporter;
use crate::signature::is_complete;

pub(super) fn compute_2d<E: ImageEncoder, T: Pixel>(
    predictor: &mut SamPredictor<E>,
    job: &Job<'_, T>,
    progress: &mut dyn ProgressReporter,
) -> Result<ImageEmbeddings> {
    let attrs = job.container.attrs("")?;
    if job.persist && is_complete(&attrs) {
        log::info!("Loading precomputed 2D embeddings");
        let embeddings = ImageEmbeddings {
            features: Features::Dense(job.container.array(FEATURES)?.read_all()?),
            input_size: size_attr(&attrs, "input_size")?,
            original_size: size_attr(&attrs, "original_size")?,
        };
        set_precomputed(predictor, &embeddings, None, None)?;
        return Ok(embeddings);
    }

    progress.init(1, "Compute Image Embeddings 2D");
    predictor.set_image(&to_image(job.input.view())?)?;
    let features = predictor
        .features()
        .cloned()
        .ok_or_else(|| EmbeddingError::encoder("No features set after encoding the image"))?;
    let original_size = predictor.original_size();
    let input_size = predictor.input_size();
    progress.update(1);

    if job.persist {
        let shape = features.shape().to_vec();
        job.container
            .require_array(FEATURES, shape.clone(), shape)?
            .write_all(features.view())?;
        job.signature.write(&job.container, input_size, original_size)?;
        job.container.flush()?;
    }

    Ok(ImageEmbeddings {
        features: Features::Dense(features),
        input_size,
        original_size,
    })
}

pub(super) fn compute_3d<E: ImageEncoder, T: Pixel>(
    predictor: &mut SamPredictor<E>,
    job: &Job<'_, T>,
    progress: &mut dyn ProgressReporter,
) -> Result<ImageEmbeddings> {
    let attrs = job.container.attrs("")?;
    if job.persist && is_complete(&attrs) {
        log::info!("Loading precomputed 3D embeddings");
        let array = job.container.array(FEATURES)?;
        let features = if job.lazy_loading {
            Features::Lazy(array)
        } else {
            Features::Dense(array.read_all()?)
        };
        return Ok(ImageEmbeddings {
            features,
            input_size: size_attr(&attrs, "input_size")?,
            original_size: size_attr(&attrs, "original_size")?,
        });
    }

    let n_slices = job.input.len_of(Axis(0));
    let load = |z: usize| to_image(job.input.index_axis(Axis(0), z));
    progress.init(n_slices, "Compute Image Embeddings 3D");

    if !job.persist {
        let mut slices = Vec::with_capacity(n_slices);
        let mut sizes = None;
        let all: Vec<usize> = (0..n_slices).collect();
        encode_in_batches(
            predictor,
            &all,
            job.batch_size,
            load,
            |_, embedding, original_size, input_size| {
                slices.push(embedding.to_owned());
                sizes = Some((original_size, input_size));
                Ok(())
            },
            progress,
        )?;

        let views: Vec<_> = slices.iter().map(|slice| slice.view()).collect();
        let features = stack(Axis(0), &views).map_err(|e| EmbeddingError::encoder(e.to_string()))?;
        let (original_size, input_size) = sizes.unzip();
        return Ok(ImageEmbeddings {
            features: Features::Dense(features),
            input_size,
            original_size,
        });
    }

    // Hard fields are checked on resume even before the features are complete
    job.signature.write_pending(&job.container)?;

    let mut slices = StoredSlices::open(&job.container, FEATURES, n_slices)?;
    let pending = slices.pending()?;
    if pending.len() < n_slices {
        log::info!(
            "{} of {} slices already computed",
            n_slices - pending.len(),
            n_slices
        );
        progress.update(n_slices - pending.len());
    }

    encode_in_batches(
        predictor,
        &pending,
        job.batch_size,
        load,
        |z, embedding, original_size, input_size| {
            slices.store(z, embedding, original_size, input_size)
        },
        progress,
    )?;

    let array = slices.into_array()?;
    let array_attrs = array.attrs()?;
    let input_size = size_attr(&array_attrs, "input_size")?;
    let original_size = size_attr(&array_attrs, "original_size")?;
    job.signature.write(&job.container, input_size, original_size)?;
    job.container.flush()?;

    let features = if job.lazy_loading {
        Features::Lazy(array)
    } else {
        Features::Dense(array.read_all()?)
    };
    Ok(ImageEmbeddings {
        features,
        input_size,
        original_size,
    })
}
