//! Cache directory configuration
//!
//! Resolution order:
//! 1. `MICROSAM_CACHEDIR` environment variable
//! 2. `$XDG_CACHE_HOME/micro_sam`
//! 3. `~/.cache/micro_sam`

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::{EmbeddingError, Result};

/// Environment variable overriding the cache directory
pub const CACHE_DIR_ENV: &str = "MICROSAM_CACHEDIR";

const CACHE_DIR_NAME: &str = "micro_sam";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    cache_dir: PathBuf,
}

impl CacheConfig {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    /// Resolve the cache directory from the process environment
    pub fn from_env() -> Result<Self> {
        Self::resolve(|key| std::env::var_os(key))
    }

    fn resolve(lookup: impl Fn(&str) -> Option<OsString>) -> Result<Self> {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.is_empty());

        if let Some(dir) = non_empty(CACHE_DIR_ENV) {
            log::debug!("Using {}: {:?}", CACHE_DIR_ENV, dir);
            return Ok(Self::new(dir));
        }

        if let Some(xdg) = non_empty("XDG_CACHE_HOME") {
            return Ok(Self::new(PathBuf::from(xdg).join(CACHE_DIR_NAME)));
        }

        let home = non_empty("HOME")
            .or_else(|| non_empty("USERPROFILE"))
            .ok_or_else(|| {
                EmbeddingError::invalid_path(format!(
                    "Cannot determine home directory; set {} to choose a cache directory",
                    CACHE_DIR_ENV
                ))
            })?;
        Ok(Self::new(
            PathBuf::from(home).join(".cache").join(CACHE_DIR_NAME),
        ))
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Directory holding downloaded checkpoints
    pub fn models_dir(&self) -> PathBuf {
        self.cache_dir.join("models")
    }
}
