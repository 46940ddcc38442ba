//! Hierarchical container for embedding features
//!
//! Groups and float32 arrays addressed by `/`-separated paths, each with a
//! JSON attribute map. Arrays are chunked along their leading axis and every
//! chunk is stored under its own key, so a missing key means "never written".
//!
//! Key layout on the backend:
//!
//! - `_format_version`: little-endian u32
//! - `node:<path>`: JSON [`NodeKind`]
//! - `attrs:<path>`: JSON attribute map (root uses the empty path)
//! - `chunk:<path>:<index>`: bincode `Vec<f32>`

mod array;
mod backend;

pub use array::{ArrayHandle, ArrayMeta};
pub use backend::{Backend, MemoryBackend, RocksBackend};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{EmbeddingError, Result};

/// Attribute map attached to every node
pub type Attributes = serde_json::Map<String, serde_json::Value>;

const FORMAT_VERSION_KEY: &str = "_format_version";
const CURRENT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum NodeKind {
    Group,
    Array(ArrayMeta),
}

/// Handle to an on-disk or in-memory embedding container
///
/// Cloning is cheap; all clones share the same backend.
#[derive(Clone)]
pub struct Container {
    backend: Arc<dyn Backend>,
    location: Option<PathBuf>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("location", &self.location)
            .finish()
    }
}

impl Container {
    /// Open (or create) a persistent container at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let backend = RocksBackend::open(path)?;
        let container = Self {
            backend: Arc::new(backend),
            location: Some(path.to_path_buf()),
        };
        container.check_format_version()?;
        log::info!("Embedding store opened at: {}", path.display());
        Ok(container)
    }

    /// Open an existing persistent container for reading only
    ///
    /// Takes no lock on the store, so handles from an earlier writable open
    /// may stay alive. Nothing is created or written at `path`.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !Self::exists(path) {
            return Err(EmbeddingError::store(format!(
                "No embeddings store at {}",
                path.display()
            )));
        }
        let container = Self {
            backend: Arc::new(RocksBackend::open_read_only(path)?),
            location: Some(path.to_path_buf()),
        };
        if container.format_version()?.is_none() {
            return Err(EmbeddingError::store(format!(
                "{} is not an embeddings store",
                path.display()
            )));
        }
        log::debug!("Embedding store opened read-only at: {}", path.display());
        Ok(container)
    }

    /// Whether a persistent container exists at `path`
    pub fn exists(path: impl AsRef<Path>) -> bool {
        RocksBackend::exists(path)
    }

    /// Create an ephemeral container
    pub fn in_memory() -> Self {
        let backend = MemoryBackend::new();
        backend.insert(FORMAT_VERSION_KEY, &CURRENT_FORMAT_VERSION.to_le_bytes());
        Self {
            backend: Arc::new(backend),
            location: None,
        }
    }

    /// Build a container on a custom backend
    pub fn with_backend(backend: Arc<dyn Backend>) -> Result<Self> {
        let container = Self {
            backend,
            location: None,
        };
        container.check_format_version()?;
        Ok(container)
    }

    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    pub fn is_persistent(&self) -> bool {
        self.location.is_some()
    }

    fn format_version(&self) -> Result<Option<u32>> {
        let Some(bytes) = self.backend.get(FORMAT_VERSION_KEY)? else {
            return Ok(None);
        };
        let version_bytes: [u8; 4] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| EmbeddingError::store("Invalid format version"))?;
        let version = u32::from_le_bytes(version_bytes);
        if version > CURRENT_FORMAT_VERSION {
            return Err(EmbeddingError::store(format!(
                "Store format version {} is newer than supported version {}",
                version, CURRENT_FORMAT_VERSION
            )));
        }
        Ok(Some(version))
    }

    fn check_format_version(&self) -> Result<()> {
        match self.format_version()? {
            Some(_) => Ok(()),
            None => self.put_format_version(),
        }
    }

    fn put_format_version(&self) -> Result<()> {
        self.backend
            .put(FORMAT_VERSION_KEY, &CURRENT_FORMAT_VERSION.to_le_bytes())
    }

    fn node_key(path: &str) -> String {
        format!("node:{}", path)
    }

    fn attrs_key(path: &str) -> String {
        format!("attrs:{}", path)
    }

    pub(crate) fn chunk_key(path: &str, index: usize) -> String {
        format!("chunk:{}:{}", path, index)
    }

    fn node(&self, path: &str) -> Result<Option<NodeKind>> {
        if path.is_empty() {
            return Ok(Some(NodeKind::Group));
        }
        match self.backend.get(&Self::node_key(path))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_node(&self, path: &str, node: &NodeKind) -> Result<()> {
        self.backend
            .put(&Self::node_key(path), &serde_json::to_vec(node)?)
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Whether a group or array exists at `path`
    pub fn contains(&self, path: &str) -> Result<bool> {
        Ok(self.node(path)?.is_some())
    }

    pub fn is_array(&self, path: &str) -> Result<bool> {
        Ok(matches!(self.node(path)?, Some(NodeKind::Array(_))))
    }

    /// Attributes of the node at `path` (empty for the root of a fresh store)
    pub fn attrs(&self, path: &str) -> Result<Attributes> {
        match self.backend.get(&Self::attrs_key(path))? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Attributes::new()),
        }
    }

    /// Merge `attrs` into the attributes of the node at `path`
    pub fn update_attrs(&self, path: &str, attrs: Attributes) -> Result<()> {
        let mut current = self.attrs(path)?;
        current.extend(attrs);
        self.backend
            .put(&Self::attrs_key(path), &serde_json::to_vec(&current)?)
    }

    pub fn set_attr(&self, path: &str, key: &str, value: impl Serialize) -> Result<()> {
        let mut attrs = Attributes::new();
        attrs.insert(key.to_string(), serde_json::to_value(value)?);
        self.update_attrs(path, attrs)
    }

    /// Open the group at `path`, creating it (and its parents) if missing
    pub fn require_group(&self, path: &str) -> Result<GroupHandle> {
        match self.node(path)? {
            Some(NodeKind::Group) => {}
            Some(NodeKind::Array(_)) => {
                return Err(EmbeddingError::store(format!(
                    "Expected a group at '{}', found an array",
                    path
                )))
            }
            None => {
                if let Some((parent, _)) = path.rsplit_once('/') {
                    self.require_group(parent)?;
                }
                self.put_node(path, &NodeKind::Group)?;
            }
        }
        Ok(GroupHandle {
            container: self.clone(),
            path: path.to_string(),
        })
    }

    /// Open an existing group
    pub fn group(&self, path: &str) -> Result<GroupHandle> {
        match self.node(path)? {
            Some(NodeKind::Group) => Ok(GroupHandle {
                container: self.clone(),
                path: path.to_string(),
            }),
            Some(NodeKind::Array(_)) => Err(EmbeddingError::store(format!(
                "Expected a group at '{}', found an array",
                path
            ))),
            None => Err(EmbeddingError::store(format!("No group at '{}'", path))),
        }
    }

    /// Create a new, empty array at `path`
    pub fn create_array(
        &self,
        path: &str,
        shape: Vec<usize>,
        chunks: Vec<usize>,
    ) -> Result<ArrayHandle> {
        if self.contains(path)? {
            return Err(EmbeddingError::store(format!(
                "A node already exists at '{}'",
                path
            )));
        }
        let meta = ArrayMeta::new(shape, chunks)?;
        if let Some((parent, _)) = path.rsplit_once('/') {
            self.require_group(parent)?;
        }
        self.put_node(path, &NodeKind::Array(meta.clone()))?;
        Ok(ArrayHandle::new(self.clone(), path, meta))
    }

    /// Open the array at `path` if it matches `shape`/`chunks`, else create it
    pub fn require_array(
        &self,
        path: &str,
        shape: Vec<usize>,
        chunks: Vec<usize>,
    ) -> Result<ArrayHandle> {
        match self.node(path)? {
            Some(NodeKind::Array(meta)) => {
                if meta.shape != shape || meta.chunks != chunks {
                    return Err(EmbeddingError::store(format!(
                        "Invalid partial features at '{}': stored shape {:?} / chunks {:?}, \
                         expected {:?} / {:?}",
                        path, meta.shape, meta.chunks, shape, chunks
                    )));
                }
                Ok(ArrayHandle::new(self.clone(), path, meta))
            }
            Some(NodeKind::Group) => Err(EmbeddingError::store(format!(
                "Expected an array at '{}', found a group",
                path
            ))),
            None => self.create_array(path, shape, chunks),
        }
    }

    /// Create an array holding `data` as a single chunk
    pub fn create_array_with_data(
        &self,
        path: &str,
        data: ndarray::ArrayViewD<'_, f32>,
    ) -> Result<ArrayHandle> {
        let shape = data.shape().to_vec();
        let array = self.create_array(path, shape.clone(), shape)?;
        array.write_all(data)?;
        Ok(array)
    }

    /// Open an existing array
    pub fn array(&self, path: &str) -> Result<ArrayHandle> {
        match self.node(path)? {
            Some(NodeKind::Array(meta)) => Ok(ArrayHandle::new(self.clone(), path, meta)),
            Some(NodeKind::Group) => Err(EmbeddingError::store(format!(
                "Expected an array at '{}', found a group",
                path
            ))),
            None => Err(EmbeddingError::store(format!("No array at '{}'", path))),
        }
    }

    /// Names of the direct children of the group at `path`
    pub fn children(&self, path: &str) -> Result<Vec<String>> {
        let prefix = if path.is_empty() {
            Self::node_key("")
        } else {
            Self::node_key(&format!("{}/", path))
        };
        Ok(self
            .backend
            .keys_with_prefix(&prefix)?
            .into_iter()
            .filter_map(|key| {
                let name = key.strip_prefix(&prefix)?;
                (!name.is_empty() && !name.contains('/')).then(|| name.to_string())
            })
            .collect())
    }

    pub fn flush(&self) -> Result<()> {
        self.backend.flush()
    }
}

/// Handle to a group inside a container
#[derive(Debug, Clone)]
pub struct GroupHandle {
    container: Container,
    path: String,
}

impl GroupHandle {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    fn child_path(&self, name: &str) -> String {
        if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.path, name)
        }
    }

    pub fn attrs(&self) -> Result<Attributes> {
        self.container.attrs(&self.path)
    }

    pub fn set_attr(&self, key: &str, value: impl Serialize) -> Result<()> {
        self.container.set_attr(&self.path, key, value)
    }

    pub fn contains(&self, name: &str) -> Result<bool> {
        self.container.contains(&self.child_path(name))
    }

    pub fn array(&self, name: &str) -> Result<ArrayHandle> {
        self.container.array(&self.child_path(name))
    }

    pub fn create_array(
        &self,
        name: &str,
        shape: Vec<usize>,
        chunks: Vec<usize>,
    ) -> Result<ArrayHandle> {
        self.container
            .create_array(&self.child_path(name), shape, chunks)
    }

    pub fn require_array(
        &self,
        name: &str,
        shape: Vec<usize>,
        chunks: Vec<usize>,
    ) -> Result<ArrayHandle> {
        self.container
            .require_array(&self.child_path(name), shape, chunks)
    }

    pub fn create_array_with_data(
        &self,
        name: &str,
        data: ndarray::ArrayViewD<'_, f32>,
    ) -> Result<ArrayHandle> {
        self.container
            .create_array_with_data(&self.child_path(name), data)
    }

    pub fn children(&self) -> Result<Vec<String>> {
        self.container.children(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array, IxDyn};
    use tempfile::TempDir;

    #[test]
    fn test_attrs_merge() {
        let container = Container::in_memory();
        assert!(container.attrs("").unwrap().is_empty());

        container.set_attr("", "tile_shape", [256, 256]).unwrap();
        container.set_attr("", "halo", serde_json::Value::Null).unwrap();
        let attrs = container.attrs("").unwrap();
        assert_eq!(attrs["tile_shape"], serde_json::json!([256, 256]));
        assert!(attrs.contains_key("halo"));
        assert!(!attrs.contains_key("input_size"));
    }

    #[test]
    fn test_groups_and_children() {
        let container = Container::in_memory();
        let group = container.require_group("features").unwrap();
        for id in 0..3 {
            group
                .create_array(&id.to_string(), vec![1, 2, 2], vec![1, 2, 2])
                .unwrap();
        }
        container.require_group("features/nested").unwrap();

        let mut children = group.children().unwrap();
        children.sort();
        assert_eq!(children, vec!["0", "1", "2", "nested"]);
        assert_eq!(container.children("").unwrap(), vec!["features"]);

        assert!(container.group("features/0").is_err());
        assert!(container.array("features").is_err());
        assert!(container.require_group("features/1").is_err());
    }

    #[test]
    fn test_create_array_twice_fails() {
        let container = Container::in_memory();
        container.create_array("features", vec![2, 3], vec![1, 3]).unwrap();
        assert!(container.create_array("features", vec![2, 3], vec![1, 3]).is_err());
    }

    #[test]
    fn test_require_array_checks_layout() {
        let container = Container::in_memory();
        container.require_array("features", vec![4, 1, 2], vec![1, 1, 2]).unwrap();
        assert!(container
            .require_array("features", vec![4, 1, 2], vec![1, 1, 2])
            .is_ok());
        let err = container
            .require_array("features", vec![5, 1, 2], vec![1, 1, 2])
            .unwrap_err();
        assert!(err.to_string().contains("Invalid partial features"));
    }

    #[test]
    fn test_persistent_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("embeddings.store");
        let data = Array::from_shape_fn(IxDyn(&[1, 2, 3, 3]), |idx| {
            (idx[1] * 9 + idx[2] * 3 + idx[3]) as f32
        });
        {
            let container = Container::open(&path).unwrap();
            assert!(container.is_persistent());
            container.create_array_with_data("features", data.view()).unwrap();
            container.set_attr("", "original_size", [10, 12]).unwrap();
            container.flush().unwrap();
        }

        let container = Container::open(&path).unwrap();
        let loaded = container.array("features").unwrap().read_all().unwrap();
        assert_eq!(loaded, data);
        assert_eq!(
            container.attrs("").unwrap()["original_size"],
            serde_json::json!([10, 12])
        );
    }

    #[test]
    fn test_newer_format_version_rejected() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .put(FORMAT_VERSION_KEY, &(CURRENT_FORMAT_VERSION + 1).to_le_bytes())
            .unwrap();
        let err = Container::with_backend(backend).unwrap_err();
        assert!(err.to_string().contains("newer than supported"));
    }

    #[test]
    fn test_in_memory_has_format_version() {
        let container = Container::in_memory();
        assert_eq!(container.format_version().unwrap(), Some(CURRENT_FORMAT_VERSION));
        assert!(!container.is_persistent());
    }

    #[test]
    fn test_read_only_while_writer_alive() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("embeddings.store");
        let writer = Container::open(&path).unwrap();
        let data = Array::from_elem(IxDyn(&[2, 3]), 1.5f32);
        let array = writer.create_array_with_data("features", data.view()).unwrap();
        writer.flush().unwrap();

        let reader = Container::open_read_only(&path).unwrap();
        assert!(reader.is_persistent());
        assert_eq!(reader.array("features").unwrap().read_all().unwrap(), data);
        assert!(reader.set_attr("", "halo", [0, 0]).is_err());
        assert_eq!(array.read_all().unwrap(), data);
    }

    #[test]
    fn test_read_only_rejects_plain_directory() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("image.tif"), b"data").unwrap();

        let err = Container::open_read_only(temp_dir.path()).unwrap_err();
        assert!(err.to_string().contains("No embeddings store"));
        let entries: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("image.tif")]);
    }
}
