//! micro-sam Embeddings
//!
//! Precomputation and caching of Segment Anything image embeddings for 2D
//! images and 3D volumes, with optional tiling.
//!
//! ## Features
//!
//! - **Four computation paths** - untiled and tiled, 2D and 3D, with batched encoder calls
//! - **Signature-checked caching** - stored features are reused only for the same input, model and tiling
//! - **Resumable volumes** - interrupted 3D computations continue with the missing slices
//! - **RocksDB persistence** - chunked feature arrays with lazy, LRU-cached reads
//!
//! ## Example
//!
//! ```ignore
//! use microsam_embeddings::{
//!     precompute_image_embeddings, set_precomputed, LogProgress, PrecomputeOptions, SamPredictor,
//! };
//!
//! let mut predictor = SamPredictor::new(encoder, identity);
//! let options = PrecomputeOptions::new()
//!     .with_save_path("embeddings.store")
//!     .with_tile_shape([512, 512])
//!     .with_halo([64, 64])
//!     .with_batch_size(4);
//!
//! let embeddings = precompute_image_embeddings(
//!     &mut predictor,
//!     image.view().into_dyn(),
//!     &options,
//!     &mut LogProgress::new(),
//! )?;
//! set_precomputed(&mut predictor, &embeddings, None, Some(0))?;
//! ```

pub mod config;
pub mod encoder;
pub mod error;
pub mod normalize;
pub mod precompute;
pub mod progress;
pub mod registry;
pub mod signature;
pub mod store;
pub mod tiling;
pub mod transform;

#[cfg(test)]
pub(crate) mod testing;

// Re-exports for convenience
pub use config::CacheConfig;
pub use encoder::{EncodedBatch, ImageEncoder, ModelIdentity, SamPredictor};
pub use error::{EmbeddingError, Result};
pub use precompute::{
    precompute_image_embeddings, set_precomputed, Features, ImageEmbeddings, PrecomputeOptions,
    TiledFeatures,
};
pub use progress::{CallbackProgress, LogProgress, NoProgress, ProgressReporter};
pub use registry::{compute_file_hash, ModelEntry, ModelRegistry, DEFAULT_MODEL};
pub use signature::{EmbeddingSignature, SignatureCheck};
pub use store::{ArrayHandle, Container, GroupHandle};
pub use tiling::{Block, BlockWithHalo, Blocking};
