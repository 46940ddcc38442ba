//! Image embedding computation with store-backed caching
//!
//! [`precompute_image_embeddings`] computes the encoder features of a 2D image
//! or a 3D volume, optionally tiled, and persists them in a [`Container`].
//! Calling it again for the same input, model and tiling loads the stored
//! features instead of running the encoder. A stored signature that disagrees
//! in a hard field (input content, tiling, architecture) is rejected with
//! [`EmbeddingError::StaleCache`].
//!
//! [`set_precomputed`] puts one image (or one slice / tile) of the result into
//! the working state of a [`SamPredictor`].

mod batch;
mod tiled;
mod untiled;

use std::path::{Path, PathBuf};

use ndarray::{ArrayD, ArrayViewD, Axis};
use serde::de::DeserializeOwned;

use crate::encoder::{ImageEncoder, SamPredictor};
use crate::error::{EmbeddingError, Result};
use crate::normalize::Pixel;
use crate::progress::ProgressReporter;
use crate::signature::{is_complete, EmbeddingSignature, SignatureCheck};
use crate::store::{ArrayHandle, Attributes, Container, GroupHandle};
use crate::tiling::Blocking;

/// Name of the features array (untiled) or group (tiled) in a store
pub const FEATURES: &str = "features";

/// Options of [`precompute_image_embeddings`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecomputeOptions {
    /// Store location; without it the features are kept in memory only
    pub save_path: Option<PathBuf>,
    /// Return stored 3D features as a lazy handle instead of loading them
    pub lazy_loading: bool,
    /// Spatial dimensionality, defaults to the rank of the input
    pub ndim: Option<usize>,
    pub tile_shape: Option<[usize; 2]>,
    /// Overlap added on each side of a tile, `(0, 0)` when tiled without halo
    pub halo: Option<[usize; 2]>,
    /// Images (tiles or slices) per encoder call
    pub batch_size: usize,
}

impl Default for PrecomputeOptions {
    fn default() -> Self {
        Self {
            save_path: None,
            lazy_loading: false,
            ndim: None,
            tile_shape: None,
            halo: None,
            batch_size: 1,
        }
    }
}

impl PrecomputeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_save_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.save_path = Some(path.into());
        self
    }

    pub fn with_lazy_loading(mut self, lazy_loading: bool) -> Self {
        self.lazy_loading = lazy_loading;
        self
    }

    pub fn with_ndim(mut self, ndim: usize) -> Self {
        self.ndim = Some(ndim);
        self
    }

    pub fn with_tile_shape(mut self, tile_shape: [usize; 2]) -> Self {
        self.tile_shape = Some(tile_shape);
        self
    }

    pub fn with_halo(mut self, halo: [usize; 2]) -> Self {
        self.halo = Some(halo);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Tile shape and effective halo when tiled
    fn tiling(&self) -> Option<([usize; 2], [usize; 2])> {
        self.tile_shape
            .map(|tile_shape| (tile_shape, self.halo.unwrap_or([0, 0])))
    }

    /// Check the options against the input and return the dimensionality
    fn validate(&self, shape: &[usize]) -> Result<usize> {
        let ndim = self.ndim.unwrap_or(shape.len());
        if ndim != 2 && ndim != 3 {
            return Err(EmbeddingError::UnsupportedDimensionality(ndim));
        }

        let rank_matches = match ndim {
            2 => shape.len() == 2 || (shape.len() == 3 && shape[2] == 3),
            _ => shape.len() == 3,
        };
        if !rank_matches {
            return Err(EmbeddingError::invalid_input(format!(
                "Input of shape {:?} does not match ndim {}",
                shape, ndim
            )));
        }
        if shape.iter().any(|&dim| dim == 0) {
            return Err(EmbeddingError::invalid_input(format!(
                "Input of shape {:?} is empty",
                shape
            )));
        }
        if self.batch_size == 0 {
            return Err(EmbeddingError::invalid_input("batch_size must be at least 1"));
        }
        if self.halo.is_some() && self.tile_shape.is_none() {
            return Err(EmbeddingError::invalid_input(
                "A halo can only be used together with a tile_shape",
            ));
        }
        if let Some(tile_shape) = self.tile_shape {
            if tile_shape.iter().any(|&t| t == 0) {
                return Err(EmbeddingError::invalid_input(format!(
                    "Tile shape must be positive, got {:?}",
                    tile_shape
                )));
            }
        }
        Ok(ndim)
    }
}

/// Feature storage of an [`ImageEmbeddings`]
#[derive(Debug, Clone)]
pub enum Features {
    /// `(1, C, H', W')` for an image or `(Z, 1, C, H', W')` for a volume
    Dense(ArrayD<f32>),
    /// Same shapes as `Dense`, read from the store on access
    Lazy(ArrayHandle),
    /// One array per tile
    Tiled(TiledFeatures),
}

impl Features {
    /// Rank of the feature array, `None` for tiled features
    pub fn ndim(&self) -> Option<usize> {
        match self {
            Features::Dense(array) => Some(array.ndim()),
            Features::Lazy(array) => Some(array.ndim()),
            Features::Tiled(_) => None,
        }
    }

    pub fn shape(&self) -> Option<Vec<usize>> {
        match self {
            Features::Dense(array) => Some(array.shape().to_vec()),
            Features::Lazy(array) => Some(array.shape().to_vec()),
            Features::Tiled(_) => None,
        }
    }

    pub fn is_tiled(&self) -> bool {
        matches!(self, Features::Tiled(_))
    }

    pub fn as_tiled(&self) -> Option<&TiledFeatures> {
        match self {
            Features::Tiled(tiled) => Some(tiled),
            _ => None,
        }
    }

    /// Materialize the full feature array
    pub fn load(&self) -> Result<ArrayD<f32>> {
        match self {
            Features::Dense(array) => Ok(array.clone()),
            Features::Lazy(array) => array.read_all(),
            Features::Tiled(_) => Err(EmbeddingError::index(
                "Tiled features can only be loaded per tile",
            )),
        }
    }

    /// Leading-axis item `index`
    pub fn item(&self, index: usize) -> Result<ArrayD<f32>> {
        match self {
            Features::Dense(array) => {
                check_index(index, array.len_of(Axis(0)))?;
                Ok(array.index_axis(Axis(0), index).to_owned())
            }
            Features::Lazy(array) => {
                check_index(index, array.len())?;
                array.read_item(index)
            }
            Features::Tiled(_) => Err(EmbeddingError::index(
                "Tiled features need a tile id before an index",
            )),
        }
    }
}

fn check_index(index: usize, len: usize) -> Result<()> {
    if index >= len {
        return Err(EmbeddingError::index(format!(
            "Index {} is out of range for {} slices",
            index, len
        )));
    }
    Ok(())
}

/// Tiled features: a store group with one array per tile id
#[derive(Debug, Clone)]
pub struct TiledFeatures {
    group: GroupHandle,
}

impl TiledFeatures {
    pub(crate) fn new(group: GroupHandle) -> Self {
        Self { group }
    }

    pub fn group(&self) -> &GroupHandle {
        &self.group
    }

    /// Spatial shape of the tiled image
    pub fn shape(&self) -> Result<[usize; 2]> {
        required_attr(&self.group.attrs()?, "shape")
    }

    pub fn tile_shape(&self) -> Result<[usize; 2]> {
        required_attr(&self.group.attrs()?, "tile_shape")
    }

    pub fn halo(&self) -> Result<[usize; 2]> {
        required_attr(&self.group.attrs()?, "halo")
    }

    /// Tile grid the features were computed on
    pub fn blocking(&self) -> Result<Blocking> {
        Blocking::new(self.shape()?, self.tile_shape()?)
    }

    pub fn n_tiles(&self) -> Result<usize> {
        Ok(self.group.children()?.len())
    }

    /// Embeddings of a single tile, read lazily
    pub fn tile(&self, tile_id: usize) -> Result<ImageEmbeddings> {
        let name = tile_id.to_string();
        if !self.group.contains(&name)? {
            return Err(EmbeddingError::TileNotFound(tile_id));
        }
        let array = self.group.array(&name)?;
        let attrs = array.attrs()?;
        Ok(ImageEmbeddings {
            features: Features::Lazy(array),
            input_size: size_attr(&attrs, "input_size")?,
            original_size: size_attr(&attrs, "original_size")?,
        })
    }
}

/// Result of [`precompute_image_embeddings`]
#[derive(Debug, Clone)]
pub struct ImageEmbeddings {
    pub features: Features,
    /// `(h', w')` after the resize transform; `None` when tiled
    pub input_size: Option<(usize, usize)>,
    /// `(h, w)` of the input image; `None` when tiled
    pub original_size: Option<(usize, usize)>,
}

impl ImageEmbeddings {
    pub(crate) fn tiled(group: GroupHandle) -> Self {
        Self {
            features: Features::Tiled(TiledFeatures::new(group)),
            input_size: None,
            original_size: None,
        }
    }

    pub fn is_tiled(&self) -> bool {
        self.features.is_tiled()
    }
}

/// Inputs shared by the four computation paths
pub(super) struct Job<'a, T> {
    input: ArrayViewD<'a, T>,
    container: Container,
    signature: EmbeddingSignature,
    persist: bool,
    lazy_loading: bool,
    batch_size: usize,
}

/// Compute or load the image embeddings of `input`
///
/// Dispatches on the dimensionality and tiling to one of four paths. With a
/// save path the features are written to a persistent store and reloaded on
/// the next call; tiled features always live in a store (in memory when no
/// save path is given). Completed stores are opened read-only, so embeddings
/// returned by an earlier call may keep their lazy or tiled handles alive.
pub fn precompute_image_embeddings<E, T>(
    predictor: &mut SamPredictor<E>,
    input: ArrayViewD<'_, T>,
    options: &PrecomputeOptions,
    progress: &mut dyn ProgressReporter,
) -> Result<ImageEmbeddings>
where
    E: ImageEncoder,
    T: Pixel,
{
    let ndim = options.validate(input.shape())?;
    let tiling = options.tiling();

    let signature = EmbeddingSignature::compute(
        input.view(),
        predictor.identity(),
        tiling.map(|(tile_shape, _)| tile_shape),
        tiling.map(|(_, halo)| halo),
    );
    let container = open_store(options.save_path.as_deref(), &signature)?;

    let job = Job {
        input,
        container,
        signature,
        persist: options.save_path.is_some(),
        lazy_loading: options.lazy_loading,
        batch_size: options.batch_size,
    };

    let result = match (ndim, tiling) {
        (2, None) => untiled::compute_2d(predictor, &job, progress),
        (2, Some((tile_shape, halo))) => {
            tiled::compute_tiled_2d(predictor, &job, tile_shape, halo, progress)
        }
        (3, None) => untiled::compute_3d(predictor, &job, progress),
        (3, Some((tile_shape, halo))) => {
            tiled::compute_tiled_3d(predictor, &job, tile_shape, halo, progress)
        }
        (other, _) => Err(EmbeddingError::UnsupportedDimensionality(other)),
    };

    progress.finish();
    result
}

/// Open the store for a call, checking the signature of an existing one
///
/// An existing store is read without taking its lock first. It is reopened
/// for writing only when its features are incomplete.
fn open_store(save_path: Option<&Path>, signature: &EmbeddingSignature) -> Result<Container> {
    let Some(path) = save_path else {
        return Ok(Container::in_memory());
    };

    if !Container::exists(path) {
        log::info!("Creating embedding store at {}", path.display());
        return Container::open(path);
    }

    let existing = Container::open_read_only(path)?;
    let attrs = existing.attrs("")?;
    match signature.check(&attrs, &path.display().to_string())? {
        SignatureCheck::Empty => log::debug!("Store at {} has no signature yet", path.display()),
        SignatureCheck::Match => log::debug!("Signature of {} matches", path.display()),
        SignatureCheck::SoftMismatch(keys) => log::debug!(
            "Signature of {} differs in soft fields {:?}",
            path.display(),
            keys
        ),
    }
    if is_complete(&attrs) {
        return Ok(existing);
    }

    drop(existing);
    log::info!("Resuming embedding store at {}", path.display());
    Container::open(path)
}

/// Set precomputed features as the working state of `predictor`
///
/// `index` selects the slice of 3D features and must be omitted for 2D
/// features. `tile_id` selects the tile of tiled features.
pub fn set_precomputed<'p, E: ImageEncoder>(
    predictor: &'p mut SamPredictor<E>,
    embeddings: &ImageEmbeddings,
    index: Option<usize>,
    tile_id: Option<usize>,
) -> Result<&'p mut SamPredictor<E>> {
    if let Some(tile_id) = tile_id {
        let tiled = embeddings.features.as_tiled().ok_or_else(|| {
            EmbeddingError::index("A tile id was given but the embeddings are not tiled")
        })?;
        let tile = tiled.tile(tile_id)?;
        return set_precomputed(predictor, &tile, index, None);
    }

    let ndim = embeddings.features.ndim().ok_or_else(|| {
        EmbeddingError::index("The embeddings are tiled so a tile id is needed.")
    })?;

    let features = match (ndim, index) {
        (5, None) => {
            return Err(EmbeddingError::index(
                "The data is 3D so an index i is needed.",
            ))
        }
        (4, Some(_)) => {
            return Err(EmbeddingError::index(
                "The data is 2D so an index is not needed.",
            ))
        }
        (4, None) => embeddings.features.load()?,
        (5, Some(i)) => embeddings.features.item(i)?,
        (other, _) => {
            return Err(EmbeddingError::store(format!(
                "Invalid feature rank {}, expect 4 or 5",
                other
            )))
        }
    };

    predictor.set_state(features, embeddings.original_size, embeddings.input_size);
    Ok(predictor)
}

/// Optional `(h, w)` attribute; missing and null both read as `None`
fn size_attr(attrs: &Attributes, key: &str) -> Result<Option<(usize, usize)>> {
    match attrs.get(key) {
        Some(value) => Ok(serde_json::from_value(value.clone())?),
        None => Ok(None),
    }
}

fn required_attr<T: DeserializeOwned>(attrs: &Attributes, key: &str) -> Result<T> {
    let value = attrs
        .get(key)
        .ok_or_else(|| EmbeddingError::store(format!("Missing attribute '{}'", key)))?;
    Ok(serde_json::from_value(value.clone())?)
}
