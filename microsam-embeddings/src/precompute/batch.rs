//! Batched encoder calls and scatter of the stacked output

use ndarray::{Array3, ArrayViewD, Axis};

use crate::encoder::{ImageEncoder, SamPredictor};
use crate::error::{EmbeddingError, Result};
use crate::progress::ProgressReporter;
use crate::store::{ArrayHandle, Container};

/// Encode `keys` in batches of `batch_size`
///
/// `load` produces the image for a key; `scatter` receives each `(1, C, H', W')`
/// embedding together with the original and resized image sizes.
pub(super) fn encode_in_batches<E, K>(
    predictor: &mut SamPredictor<E>,
    keys: &[K],
    batch_size: usize,
    mut load: impl FnMut(K) -> Result<Array3<u8>>,
    mut scatter: impl FnMut(K, ArrayViewD<'_, f32>, (usize, usize), (usize, usize)) -> Result<()>,
    progress: &mut dyn ProgressReporter,
) -> Result<()>
where
    E: ImageEncoder,
    K: Copy,
{
    for batch in keys.chunks(batch_size.max(1)) {
        let images = batch
            .iter()
            .map(|&key| load(key))
            .collect::<Result<Vec<_>>>()?;
        let encoded = predictor.encode_batch(&images)?;

        for (i, &key) in batch.iter().enumerate() {
            let embedding = encoded
                .features
                .index_axis(Axis(0), i)
                .insert_axis(Axis(0))
                .into_dyn();
            scatter(
                key,
                embedding,
                encoded.original_sizes[i],
                encoded.input_sizes[i],
            )?;
            progress.update(1);
        }
    }
    Ok(())
}

/// Per-slice features of one volume (or one tile of a volume) in a store
///
/// The array is created on the first write, once the encoder output shape is
/// known. Each slice is its own chunk, so chunk presence records which slices
/// are done and an interrupted computation resumes with the missing ones.
pub(super) struct StoredSlices {
    container: Container,
    path: String,
    n_slices: usize,
    array: Option<ArrayHandle>,
    sizes_written: bool,
}

impl StoredSlices {
    pub(super) fn open(container: &Container, path: &str, n_slices: usize) -> Result<Self> {
        let array = if container.contains(path)? {
            let array = container.array(path)?;
            if array.len() != n_slices || array.ndim() != 5 {
                return Err(EmbeddingError::store(format!(
                    "Invalid partial features at '{}': shape {:?} for {} slices",
                    path,
                    array.shape(),
                    n_slices
                )));
            }
            log::info!(
                "Resuming partially computed features at '{}' ({} slices)",
                path,
                n_slices
            );
            Some(array)
        } else {
            None
        };

        Ok(Self {
            container: container.clone(),
            path: path.to_string(),
            n_slices,
            array,
            sizes_written: false,
        })
    }

    pub(super) fn is_done(&self, z: usize) -> Result<bool> {
        match &self.array {
            Some(array) => array.has_item(z),
            None => Ok(false),
        }
    }

    /// Slices that still need to be computed
    pub(super) fn pending(&self) -> Result<Vec<usize>> {
        let mut pending = Vec::with_capacity(self.n_slices);
        for z in 0..self.n_slices {
            if !self.is_done(z)? {
                pending.push(z);
            }
        }
        Ok(pending)
    }

    pub(super) fn store(
        &mut self,
        z: usize,
        embedding: ArrayViewD<'_, f32>,
        original_size: (usize, usize),
        input_size: (usize, usize),
    ) -> Result<()> {
        match &self.array {
            Some(array) if array.meta().item_shape() != embedding.shape() => {
                return Err(EmbeddingError::store(format!(
                    "Invalid partial features at '{}': stored slice shape {:?}, computed {:?}",
                    self.path,
                    array.meta().item_shape(),
                    embedding.shape()
                )));
            }
            Some(_) => {}
            None => {
                let mut shape = vec![self.n_slices];
                shape.extend_from_slice(embedding.shape());
                let mut chunks = vec![1];
                chunks.extend_from_slice(embedding.shape());
                self.array = Some(self.container.create_array(&self.path, shape, chunks)?);
            }
        }

        let array = self
            .array
            .as_ref()
            .ok_or_else(|| EmbeddingError::store(format!("No features array at '{}'", self.path)))?;
        array.write_item(z, embedding)?;

        // All slices of a volume share one size
        if !self.sizes_written {
            array.set_attr("original_size", original_size)?;
            array.set_attr("input_size", input_size)?;
            self.sizes_written = true;
        }
        Ok(())
    }

    pub(super) fn into_array(self) -> Result<ArrayHandle> {
        self.array
            .ok_or_else(|| EmbeddingError::store(format!("No features written at '{}'", self.path)))
    }
}
