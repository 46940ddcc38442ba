//! Key-value backends for the embedding container
//!
//! The container layout is written once against [`Backend`]; RocksDB provides
//! persistence at a save path, a DashMap holds ephemeral embeddings.

use dashmap::DashMap;
use rocksdb::{Direction, IteratorMode, Options, DB};
use std::path::Path;

use crate::error::Result;

/// Minimal byte-oriented key-value interface
pub trait Backend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// All keys starting with `prefix`, in lexicographic order
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Persistent backend stored in a RocksDB directory
pub struct RocksBackend {
    db: DB,
}

impl RocksBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_background_jobs(2);
        opts.set_bytes_per_sync(1048576); // 1MB
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)?;
        log::debug!("RocksDB opened at: {}", path.display());

        Ok(Self { db })
    }

    /// Open an existing database without taking its lock
    ///
    /// Several read-only handles may coexist with one writable handle in the
    /// same process. Writes through this handle fail.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let db = DB::open_for_read_only(&Options::default(), path, false)?;
        log::debug!("RocksDB opened read-only at: {}", path.display());

        Ok(Self { db })
    }

    /// Whether `path` holds a RocksDB database
    pub fn exists(path: impl AsRef<Path>) -> bool {
        path.as_ref().join("CURRENT").is_file()
    }
}

impl Backend for RocksBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key.as_bytes())?)
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db.put(key.as_bytes(), value)?;
        Ok(())
    }

    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.db.get_pinned(key.as_bytes())?.is_some())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// Ephemeral backend, dropped with the last container handle
#[derive(Default)]
pub struct MemoryBackend {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, value: &[u8]) {
        self.entries.insert(key.to_string(), value.to_vec());
    }
}

impl Backend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.insert(key, value);
        Ok(())
    }

    fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.entries.contains_key(key))
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(backend: &dyn Backend) {
        backend.put("node:a", b"1").unwrap();
        backend.put("node:a/b", b"2").unwrap();
        backend.put("node:c", b"3").unwrap();
        backend.put("attrs:a", b"{}").unwrap();

        assert_eq!(backend.get("node:a").unwrap(), Some(b"1".to_vec()));
        assert!(backend.contains("node:c").unwrap());
        assert!(!backend.contains("node:d").unwrap());
        assert_eq!(
            backend.keys_with_prefix("node:a").unwrap(),
            vec!["node:a".to_string(), "node:a/b".to_string()]
        );
        assert!(backend.keys_with_prefix("chunk:").unwrap().is_empty());
        backend.flush().unwrap();
    }

    #[test]
    fn test_memory_backend() {
        exercise(&MemoryBackend::new());
    }

    #[test]
    fn test_rocks_backend() {
        let temp_dir = TempDir::new().unwrap();
        let backend = RocksBackend::open(temp_dir.path().join("store")).unwrap();
        exercise(&backend);
    }

    #[test]
    fn test_rocks_backend_persists() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store");
        {
            let backend = RocksBackend::open(&path).unwrap();
            backend.put("k", b"v").unwrap();
            backend.flush().unwrap();
        }
        let backend = RocksBackend::open(&path).unwrap();
        assert_eq!(backend.get("k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_rocks_read_only_beside_writer() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("store");
        assert!(!RocksBackend::exists(&path));

        let writer = RocksBackend::open(&path).unwrap();
        writer.put("k", b"v").unwrap();
        writer.flush().unwrap();
        assert!(RocksBackend::exists(&path));

        // The writer keeps the lock; a second writable open is refused
        assert!(RocksBackend::open(&path).is_err());

        let reader = RocksBackend::open_read_only(&path).unwrap();
        assert_eq!(reader.get("k").unwrap(), Some(b"v".to_vec()));
        assert!(reader.put("k", b"w").is_err());
    }

    #[test]
    fn test_rocks_read_only_requires_database() {
        let temp_dir = TempDir::new().unwrap();
        assert!(!RocksBackend::exists(temp_dir.path()));
        assert!(RocksBackend::open_read_only(temp_dir.path()).is_err());
    }
}
