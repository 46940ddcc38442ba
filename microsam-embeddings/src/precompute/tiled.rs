//! Tiled 2D images and 3D volumes
//!
//! Every tile is encoded from its halo-expanded outer block. Tiled features
//! always go through a store; without a save path it is an in-memory one.

use ndarray::{ArrayViewD, Axis, Slice};

use super::batch::{encode_in_batches, StoredSlices};
use super::{ImageEmbeddings, Job, FEATURES};
use crate::encoder::{ImageEncoder, SamPredictor};
use crate::error::{EmbeddingError, Result};
use crate::normalize::{to_image, Pixel};
use crate::progress::ProgressReporter;
use crate::signature::is_complete;
use crate::store::{Container, GroupHandle};
use crate::tiling::{Block, BlockWithHalo, Blocking};

pub(super) fn compute_tiled_2d<E: ImageEncoder, T: Pixel>(
    predictor: &mut SamPredictor<E>,
    job: &Job<'_, T>,
    tile_shape: [usize; 2],
    halo: [usize; 2],
    progress: &mut dyn ProgressReporter,
) -> Result<ImageEmbeddings> {
    if is_complete(&job.container.attrs("")?) {
        log::info!("Loading precomputed tiled 2D embeddings");
        return Ok(ImageEmbeddings::tiled(job.container.group(FEATURES)?));
    }

    let shape = [job.input.shape()[0], job.input.shape()[1]];
    let tiles = tiles(shape, tile_shape, halo)?;
    job.signature.write_pending(&job.container)?;
    let group = features_group(&job.container, shape, tile_shape, halo)?;

    progress.init(tiles.len(), "Compute Image Embeddings 2D tiled");
    let tile_ids: Vec<usize> = (0..tiles.len()).collect();
    encode_in_batches(
        predictor,
        &tile_ids,
        job.batch_size,
        |tile_id: usize| to_image(outer_region(job.input.view(), &tiles[tile_id].outer)),
        |tile_id, embedding, original_size, input_size| {
            let shape = embedding.shape().to_vec();
            let array = group.require_array(&tile_id.to_string(), shape.clone(), shape)?;
            array.write_all(embedding)?;
            array.set_attr("original_size", original_size)?;
            array.set_attr("input_size", input_size)
        },
        progress,
    )?;

    job.signature.write(&job.container, None, None)?;
    job.container.flush()?;
    Ok(ImageEmbeddings::tiled(group))
}

pub(super) fn compute_tiled_3d<E: ImageEncoder, T: Pixel>(
    predictor: &mut SamPredictor<E>,
    job: &Job<'_, T>,
    tile_shape: [usize; 2],
    halo: [usize; 2],
    progress: &mut dyn ProgressReporter,
) -> Result<ImageEmbeddings> {
    if is_complete(&job.container.attrs("")?) {
        log::info!("Loading precomputed tiled 3D embeddings");
        return Ok(ImageEmbeddings::tiled(job.container.group(FEATURES)?));
    }

    let n_slices = job.input.len_of(Axis(0));
    let shape = [job.input.shape()[1], job.input.shape()[2]];
    let tiles = tiles(shape, tile_shape, halo)?;
    job.signature.write_pending(&job.container)?;
    let group = features_group(&job.container, shape, tile_shape, halo)?;

    progress.init(tiles.len() * n_slices, "Compute Image Embeddings 3D tiled");
    for (tile_id, tile) in tiles.iter().enumerate() {
        let path = format!("{}/{}", FEATURES, tile_id);
        let mut slices = StoredSlices::open(&job.container, &path, n_slices)?;
        let pending = slices.pending()?;
        if pending.len() < n_slices {
            progress.update(n_slices - pending.len());
        }

        encode_in_batches(
            predictor,
            &pending,
            job.batch_size,
            |z: usize| to_image(outer_region(job.input.index_axis(Axis(0), z), &tile.outer)),
            |z, embedding, original_size, input_size| {
                slices.store(z, embedding, original_size, input_size)
            },
            progress,
        )?;
        slices.into_array()?;
        log::debug!("Tile {}/{} done", tile_id + 1, tiles.len());
    }

    job.signature.write(&job.container, None, None)?;
    job.container.flush()?;
    Ok(ImageEmbeddings::tiled(group))
}

fn tiles(shape: [usize; 2], tile_shape: [usize; 2], halo: [usize; 2]) -> Result<Vec<BlockWithHalo>> {
    let blocking = Blocking::new(shape, tile_shape)?;
    (0..blocking.n_blocks())
        .map(|tile_id| {
            blocking
                .block_with_halo(tile_id, halo)
                .ok_or(EmbeddingError::TileNotFound(tile_id))
        })
        .collect()
}

fn features_group(
    container: &Container,
    shape: [usize; 2],
    tile_shape: [usize; 2],
    halo: [usize; 2],
) -> Result<GroupHandle> {
    let group = container.require_group(FEATURES)?;
    group.set_attr("shape", shape)?;
    group.set_attr("tile_shape", tile_shape)?;
    group.set_attr("halo", halo)?;
    Ok(group)
}

/// View of the first two axes restricted to `block`
fn outer_region<'a, T>(image: ArrayViewD<'a, T>, block: &Block) -> ArrayViewD<'a, T> {
    image
        .slice_axis_move(Axis(0), Slice::from(block.rows()))
        .slice_axis_move(Axis(1), Slice::from(block.cols()))
}
