//! Error types for microsam-embeddings

use thiserror::Error;

/// Errors that can occur while computing, storing or loading embeddings
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// RocksDB error
    #[error("Storage error: {0}")]
    Storage(#[from] rocksdb::Error),

    /// Serialization error (bincode)
    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Input array or option rejected before any computation
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Only 2 and 3 dimensional data is supported
    #[error("Invalid dimensionality {0}, expect 2 or 3 dim data")]
    UnsupportedDimensionality(usize),

    /// A hard signature field of an existing store does not match the current call
    #[error(
        "Embeddings file {path} is invalid due to mismatch in {key}: {stored} != {expected}. \
         Please recompute embeddings in a new file."
    )]
    StaleCache {
        path: String,
        key: String,
        stored: String,
        expected: String,
    },

    /// The encoder failed or returned an unexpected output
    #[error("Encoder error: {0}")]
    Encoder(String),

    /// Index handling in `set_precomputed`
    #[error("Index error: {0}")]
    Index(String),

    /// Tile id not present in tiled embeddings
    #[error("Tile not found: {0}")]
    TileNotFound(usize),

    /// Malformed or incompatible store layout
    #[error("Store error: {0}")]
    Store(String),

    /// Unknown model or invalid model type
    #[error("Model error: {0}")]
    Model(String),

    /// Model download failed
    #[error("Download error: {0}")]
    Download(String),

    /// Downloaded or local checkpoint does not match its registry hash
    #[error("Hash mismatch for {name}: expected {expected}, got {actual}")]
    HashMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    /// Invalid path
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

impl EmbeddingError {
    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create an encoder error
    pub fn encoder(msg: impl Into<String>) -> Self {
        Self::Encoder(msg.into())
    }

    /// Create an index error
    pub fn index(msg: impl Into<String>) -> Self {
        Self::Index(msg.into())
    }

    /// Create a store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    /// Create a download error
    pub fn download(msg: impl Into<String>) -> Self {
        Self::Download(msg.into())
    }

    /// Create an invalid path error
    pub fn invalid_path(path: impl Into<String>) -> Self {
        Self::InvalidPath(path.into())
    }

    /// Whether this error signals a stale cache that must be recomputed
    pub fn is_stale_cache(&self) -> bool {
        matches!(self, Self::StaleCache { .. })
    }
}

/// Result type for embedding operations
pub type Result<T> = std::result::Result<T, EmbeddingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_cache_message() {
        let err = EmbeddingError::StaleCache {
            path: "/tmp/embeddings".into(),
            key: "halo".into(),
            stored: "[8,8]".into(),
            expected: "[16,16]".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("mismatch in halo"));
        assert!(msg.contains("recompute"));
        assert!(err.is_stale_cache());
    }

    #[test]
    fn test_dimensionality_message() {
        let err = EmbeddingError::UnsupportedDimensionality(4);
        assert_eq!(err.to_string(), "Invalid dimensionality 4, expect 2 or 3 dim data");
        assert!(!err.is_stale_cache());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: EmbeddingError = io_err.into();
        assert!(matches!(err, EmbeddingError::Io(_)));
    }
}
