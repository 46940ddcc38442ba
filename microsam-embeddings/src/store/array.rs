//! Chunked float32 arrays
//!
//! Chunks span the full trailing shape and `chunks[0]` items of the leading
//! axis. Decoded chunks are kept in a small LRU so lazy per-slice access does
//! not hit the backend repeatedly.

use lru::LruCache;
use ndarray::{Array, ArrayD, ArrayViewD, Axis, IxDyn, Slice};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::ops::Range;
use std::sync::Arc;

use super::{Attributes, Container};
use crate::error::{EmbeddingError, Result};

const CHUNK_CACHE_CAPACITY: usize = 8;

/// Shape and chunking of a stored array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayMeta {
    pub shape: Vec<usize>,
    pub chunks: Vec<usize>,
    pub dtype: String,
}

impl ArrayMeta {
    pub fn new(shape: Vec<usize>, chunks: Vec<usize>) -> Result<Self> {
        if shape.is_empty() || shape.len() != chunks.len() {
            return Err(EmbeddingError::store(format!(
                "Invalid array layout: shape {:?}, chunks {:?}",
                shape, chunks
            )));
        }
        if chunks[0] == 0 || chunks[1..] != shape[1..] {
            return Err(EmbeddingError::store(format!(
                "Arrays are chunked along the leading axis only: shape {:?}, chunks {:?}",
                shape, chunks
            )));
        }
        Ok(Self {
            shape,
            chunks,
            dtype: "float32".to_string(),
        })
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of entries along the leading axis
    pub fn len(&self) -> usize {
        self.shape[0]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shape of a single leading-axis item
    pub fn item_shape(&self) -> &[usize] {
        &self.shape[1..]
    }

    fn item_len(&self) -> usize {
        self.item_shape().iter().product()
    }

    pub fn n_chunks(&self) -> usize {
        self.len().div_ceil(self.chunks[0])
    }

    fn chunk_of(&self, index: usize) -> usize {
        index / self.chunks[0]
    }

    /// Leading-axis range covered by `chunk`
    fn chunk_range(&self, chunk: usize) -> Range<usize> {
        let start = chunk * self.chunks[0];
        start..(start + self.chunks[0]).min(self.len())
    }
}

/// Handle to a stored array; reads are lazy and chunk-wise
#[derive(Clone)]
pub struct ArrayHandle {
    container: Container,
    path: String,
    meta: ArrayMeta,
    cache: Arc<Mutex<LruCache<usize, Arc<Vec<f32>>>>>,
}

impl std::fmt::Debug for ArrayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayHandle")
            .field("path", &self.path)
            .field("shape", &self.meta.shape)
            .field("chunks", &self.meta.chunks)
            .finish()
    }
}

impl ArrayHandle {
    pub(crate) fn new(container: Container, path: &str, meta: ArrayMeta) -> Self {
        let capacity = NonZeroUsize::new(CHUNK_CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            container,
            path: path.to_string(),
            meta,
            cache: Arc::new(Mutex::new(LruCache::new(capacity))),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn meta(&self) -> &ArrayMeta {
        &self.meta
    }

    pub fn shape(&self) -> &[usize] {
        &self.meta.shape
    }

    pub fn ndim(&self) -> usize {
        self.meta.ndim()
    }

    pub fn len(&self) -> usize {
        self.meta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meta.is_empty()
    }

    pub fn attrs(&self) -> Result<Attributes> {
        self.container.attrs(&self.path)
    }

    pub fn set_attr(&self, key: &str, value: impl Serialize) -> Result<()> {
        self.container.set_attr(&self.path, key, value)
    }

    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.len() {
            return Err(EmbeddingError::index(format!(
                "Index {} out of range for array '{}' with {} entries",
                index,
                self.path,
                self.len()
            )));
        }
        Ok(())
    }

    fn chunk_len(&self, chunk: usize) -> usize {
        self.meta.chunk_range(chunk).len() * self.meta.item_len()
    }

    fn load_chunk(&self, chunk: usize) -> Result<Option<Arc<Vec<f32>>>> {
        if let Some(cached) = self.cache.lock().get(&chunk) {
            return Ok(Some(cached.clone()));
        }

        let key = Container::chunk_key(&self.path, chunk);
        let Some(bytes) = self.container.backend().get(&key)? else {
            return Ok(None);
        };
        let values: Vec<f32> = bincode::deserialize(&bytes)?;
        if values.len() != self.chunk_len(chunk) {
            return Err(EmbeddingError::store(format!(
                "Corrupt chunk {} of '{}': {} values, expected {}",
                chunk,
                self.path,
                values.len(),
                self.chunk_len(chunk)
            )));
        }

        let values = Arc::new(values);
        self.cache.lock().put(chunk, values.clone());
        Ok(Some(values))
    }

    fn store_chunk(&self, chunk: usize, values: Vec<f32>) -> Result<()> {
        let key = Container::chunk_key(&self.path, chunk);
        self.container
            .backend()
            .put(&key, &bincode::serialize(&values)?)?;
        self.cache.lock().put(chunk, Arc::new(values));
        Ok(())
    }

    /// Whether the chunk holding `index` has been written
    pub fn has_item(&self, index: usize) -> Result<bool> {
        self.check_index(index)?;
        let key = Container::chunk_key(&self.path, self.meta.chunk_of(index));
        self.container.backend().contains(&key)
    }

    /// Read one leading-axis item; unwritten items read as zeros
    pub fn read_item(&self, index: usize) -> Result<ArrayD<f32>> {
        self.check_index(index)?;
        let chunk = self.meta.chunk_of(index);
        let item_len = self.meta.item_len();
        let shape = IxDyn(self.meta.item_shape());

        let values = match self.load_chunk(chunk)? {
            Some(values) => {
                let offset = (index - self.meta.chunk_range(chunk).start) * item_len;
                values[offset..offset + item_len].to_vec()
            }
            None => vec![0.0; item_len],
        };
        Array::from_shape_vec(shape, values).map_err(|e| EmbeddingError::store(e.to_string()))
    }

    /// Write one leading-axis item
    pub fn write_item(&self, index: usize, data: ArrayViewD<'_, f32>) -> Result<()> {
        self.check_index(index)?;
        if data.shape() != self.meta.item_shape() {
            return Err(EmbeddingError::store(format!(
                "Item shape {:?} does not match array '{}' item shape {:?}",
                data.shape(),
                self.path,
                self.meta.item_shape()
            )));
        }

        let chunk = self.meta.chunk_of(index);
        let item_len = self.meta.item_len();
        let mut values = match self.load_chunk(chunk)? {
            Some(values) => values.to_vec(),
            None => vec![0.0; self.chunk_len(chunk)],
        };
        let offset = (index - self.meta.chunk_range(chunk).start) * item_len;
        for (dst, src) in values[offset..offset + item_len].iter_mut().zip(data.iter()) {
            *dst = *src;
        }
        self.store_chunk(chunk, values)
    }

    /// Write the full array, chunk by chunk
    pub fn write_all(&self, data: ArrayViewD<'_, f32>) -> Result<()> {
        if data.shape() != self.shape() {
            return Err(EmbeddingError::store(format!(
                "Data shape {:?} does not match array '{}' shape {:?}",
                data.shape(),
                self.path,
                self.shape()
            )));
        }
        for chunk in 0..self.meta.n_chunks() {
            let range = self.meta.chunk_range(chunk);
            let values: Vec<f32> = data
                .slice_axis(Axis(0), Slice::from(range))
                .iter()
                .copied()
                .collect();
            self.store_chunk(chunk, values)?;
        }
        Ok(())
    }

    /// Materialize the full array; unwritten chunks read as zeros
    pub fn read_all(&self) -> Result<ArrayD<f32>> {
        let total: usize = self.shape().iter().product();
        let mut values = Vec::with_capacity(total);
        for chunk in 0..self.meta.n_chunks() {
            match self.load_chunk(chunk)? {
                Some(chunk_values) => values.extend_from_slice(&chunk_values),
                None => values.resize(values.len() + self.chunk_len(chunk), 0.0),
            }
        }
        Array::from_shape_vec(IxDyn(self.shape()), values)
            .map_err(|e| EmbeddingError::store(e.to_string()))
    }
}
