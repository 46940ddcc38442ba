//! Embedding signatures
//!
//! Metadata stored next to the features that decides whether a store can be
//! reused for a call. Hard fields (input content, tiling, architecture) must
//! match exactly. Soft fields were added to the format later, so a mismatch
//! there only produces a warning and older stores stay usable.

use ndarray::ArrayViewD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::encoder::ModelIdentity;
use crate::error::{EmbeddingError, Result};
use crate::normalize::Pixel;
use crate::store::{Attributes, Container};

/// Version tag written into every store
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Signature keys whose mismatch is tolerated
pub const SOFT_KEYS: [&str; 3] = ["micro_sam_version", "model_hash", "model_name"];

/// Root attribute marking a store whose features are complete
pub const COMPLETE_KEY: &str = "input_size";

/// Content hash of an input array: dtype, shape and little-endian values
pub fn data_signature<T: Pixel>(input: ArrayViewD<'_, T>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(T::DTYPE.as_bytes());
    for dim in input.shape() {
        hasher.update((*dim as u64).to_le_bytes());
    }

    let mut buffer = Vec::with_capacity(64 * 1024);
    for value in input.iter() {
        value.extend_le_bytes(&mut buffer);
        if buffer.len() >= 64 * 1024 {
            hasher.update(&buffer);
            buffer.clear();
        }
    }
    hasher.update(&buffer);

    format!("{:x}", hasher.finalize())
}

/// Whether the root attributes mark the stored features as complete
pub fn is_complete(attrs: &Attributes) -> bool {
    attrs.contains_key(COMPLETE_KEY)
}

/// Outcome of comparing a stored signature with the current call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureCheck {
    /// The store carries no signature yet
    Empty,
    /// All fields match
    Match,
    /// Only soft fields differ; the listed keys were logged as warnings
    SoftMismatch(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingSignature {
    pub data_signature: String,
    pub tile_shape: Option<[usize; 2]>,
    pub halo: Option<[usize; 2]>,
    pub model_type: String,
    pub model_name: String,
    pub micro_sam_version: String,
    pub model_hash: Option<String>,
}

impl EmbeddingSignature {
    pub fn new(
        data_signature: String,
        identity: &ModelIdentity,
        tile_shape: Option<[usize; 2]>,
        halo: Option<[usize; 2]>,
    ) -> Self {
        Self {
            data_signature,
            tile_shape,
            halo,
            model_type: identity.model_type.clone(),
            model_name: identity.model_name.clone(),
            micro_sam_version: VERSION.to_string(),
            model_hash: identity.model_hash.clone(),
        }
    }

    pub fn compute<T: Pixel>(
        input: ArrayViewD<'_, T>,
        identity: &ModelIdentity,
        tile_shape: Option<[usize; 2]>,
        halo: Option<[usize; 2]>,
    ) -> Self {
        Self::new(data_signature(input), identity, tile_shape, halo)
    }

    pub fn to_attributes(&self) -> Result<Attributes> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(EmbeddingError::store(format!(
                "Signature serialized to a non-object value: {}",
                other
            ))),
        }
    }

    /// Write the signature without marking the features complete
    pub fn write_pending(&self, container: &Container) -> Result<()> {
        container.update_attrs("", self.to_attributes()?)
    }

    /// Write the signature together with the image sizes, marking completion
    pub fn write(
        &self,
        container: &Container,
        input_size: Option<(usize, usize)>,
        original_size: Option<(usize, usize)>,
    ) -> Result<()> {
        let mut attrs = self.to_attributes()?;
        attrs.insert(COMPLETE_KEY.to_string(), serde_json::to_value(input_size)?);
        attrs.insert("original_size".to_string(), serde_json::to_value(original_size)?);
        container.update_attrs("", attrs)
    }

    /// Compare against the attributes of an existing store
    ///
    /// Fails with [`EmbeddingError::StaleCache`] on the first hard mismatch.
    pub fn check(&self, stored: &Attributes, path: &str) -> Result<SignatureCheck> {
        let expected = self.to_attributes()?;
        if !expected.keys().any(|key| stored.contains_key(key)) {
            return Ok(SignatureCheck::Empty);
        }

        let mut soft = Vec::new();
        for (key, value) in &expected {
            let stored_value = stored.get(key);
            if stored_value == Some(value) {
                continue;
            }
            let stored_repr = stored_value
                .map(|v| v.to_string())
                .unwrap_or_else(|| "<missing>".to_string());

            if SOFT_KEYS.contains(&key.as_str()) {
                log::warn!(
                    "The signature for {} in embeddings file {} has a mismatch: {} != {}. \
                     Your embeddings are likely correct, but please recompute them if \
                     model predictions don't look as expected.",
                    key,
                    path,
                    stored_repr,
                    value
                );
                soft.push(key.clone());
            } else {
                return Err(EmbeddingError::StaleCache {
                    path: path.to_string(),
                    key: key.clone(),
                    stored: stored_repr,
                    expected: value.to_string(),
                });
            }
        }

        if soft.is_empty() {
            Ok(SignatureCheck::Match)
        } else {
            Ok(SignatureCheck::SoftMismatch(soft))
        }
    }
}
