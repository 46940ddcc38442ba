//! Subcommand implementations
//!
//! Each command returns a serializable report; printing is left to the caller.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::Serialize;

use microsam_embeddings::precompute::FEATURES;
use microsam_embeddings::signature::{is_complete, VERSION};
use microsam_embeddings::store::Attributes;
use microsam_embeddings::{ArrayHandle, CacheConfig, Container, ModelRegistry, DEFAULT_MODEL};

#[derive(Debug, Clone, Serialize)]
pub struct ModelStatus {
    pub name: String,
    pub downloaded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Info {
    pub version: String,
    pub cache_dir: PathBuf,
    pub models_dir: PathBuf,
    pub default_model: String,
    pub models: Vec<ModelStatus>,
}

impl fmt::Display for Info {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "micro-sam {}", self.version)?;
        writeln!(f, "Cache directory: {}", self.cache_dir.display())?;
        writeln!(f, "Models directory: {}", self.models_dir.display())?;
        writeln!(f, "Default model: {}", self.default_model)?;
        writeln!(f, "Available models:")?;
        for model in &self.models {
            let status = if model.downloaded { " (downloaded)" } else { "" };
            writeln!(f, "  {}{}", model.name, status)?;
        }
        Ok(())
    }
}

pub fn info(config: &CacheConfig, registry: &ModelRegistry) -> anyhow::Result<Info> {
    let models = registry
        .encoder_names()
        .into_iter()
        .map(|name| {
            Ok(ModelStatus {
                name: name.to_string(),
                downloaded: registry.is_downloaded(name)?,
            })
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    Ok(Info {
        version: VERSION.to_string(),
        cache_dir: config.cache_dir().to_path_buf(),
        models_dir: config.models_dir(),
        default_model: DEFAULT_MODEL.to_string(),
        models,
    })
}

/// Fetch `models` (every encoder when empty) along with their decoders
///
/// All names are validated before the first download starts.
pub fn download(registry: &ModelRegistry, models: &[String]) -> anyhow::Result<Vec<(String, PathBuf)>> {
    let names: Vec<String> = if models.is_empty() {
        registry
            .encoder_names()
            .into_iter()
            .map(String::from)
            .collect()
    } else {
        models.to_vec()
    };

    for name in &names {
        registry.entry(name)?;
    }

    let mut downloaded = Vec::new();
    for name in &names {
        tracing::info!("Fetching {}", name);
        let (checkpoint, decoder) = registry
            .fetch_with_decoder(name)
            .with_context(|| format!("Failed to fetch {}", name))?;
        downloaded.push((name.clone(), checkpoint));
        if let Some(decoder) = decoder {
            downloaded.push((format!("{}_decoder", name), decoder));
        }
    }
    Ok(downloaded)
}

#[derive(Debug, Clone, Serialize)]
pub struct TileSummary {
    pub tile_id: usize,
    pub shape: Vec<usize>,
    pub written_items: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Layout {
    /// No features written yet
    Empty,
    Array {
        shape: Vec<usize>,
        chunks: Vec<usize>,
        written_items: usize,
    },
    Tiled {
        shape: Option<[usize; 2]>,
        tile_shape: Option<[usize; 2]>,
        halo: Option<[usize; 2]>,
        tiles: Vec<TileSummary>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreSummary {
    pub path: PathBuf,
    pub complete: bool,
    pub attributes: Attributes,
    pub layout: Layout,
}

impl fmt::Display for StoreSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Store: {}", self.path.display())?;
        writeln!(f, "Complete: {}", self.complete)?;
        writeln!(f, "Attributes:")?;
        for (key, value) in &self.attributes {
            writeln!(f, "  {}: {}", key, value)?;
        }
        match &self.layout {
            Layout::Empty => writeln!(f, "Features: none")?,
            Layout::Array {
                shape,
                chunks,
                written_items,
            } => {
                writeln!(f, "Features: array {:?}, chunks {:?}", shape, chunks)?;
                writeln!(f, "  written: {}/{}", written_items, shape.first().copied().unwrap_or(0))?;
            }
            Layout::Tiled {
                shape,
                tile_shape,
                halo,
                tiles,
            } => {
                writeln!(
                    f,
                    "Features: {} tiles, shape {:?}, tile_shape {:?}, halo {:?}",
                    tiles.len(),
                    shape,
                    tile_shape,
                    halo
                )?;
                for tile in tiles {
                    writeln!(
                        f,
                        "  tile {}: {:?} ({} written)",
                        tile.tile_id, tile.shape, tile.written_items
                    )?;
                }
            }
        }
        Ok(())
    }
}

/// Summarize an existing embeddings store
pub fn inspect(path: &Path) -> anyhow::Result<StoreSummary> {
    if !Container::exists(path) {
        bail!("No embeddings store at {}", path.display());
    }
    let container = Container::open_read_only(path)
        .with_context(|| format!("Failed to open embeddings store {}", path.display()))?;
    let attributes = container.attrs("")?;

    let layout = if !container.contains(FEATURES)? {
        Layout::Empty
    } else if container.is_array(FEATURES)? {
        let array = container.array(FEATURES)?;
        Layout::Array {
            shape: array.shape().to_vec(),
            chunks: array.meta().chunks.clone(),
            written_items: written_items(&array)?,
        }
    } else {
        let group = container.group(FEATURES)?;
        let group_attrs = group.attrs()?;
        let mut tile_ids = group
            .children()?
            .into_iter()
            .filter_map(|name| name.parse::<usize>().ok())
            .collect::<Vec<_>>();
        tile_ids.sort_unstable();

        let mut tiles = Vec::with_capacity(tile_ids.len());
        for tile_id in tile_ids {
            let array = group.array(&tile_id.to_string())?;
            tiles.push(TileSummary {
                tile_id,
                shape: array.shape().to_vec(),
                written_items: written_items(&array)?,
            });
        }

        Layout::Tiled {
            shape: optional_attr(&group_attrs, "shape")?,
            tile_shape: optional_attr(&group_attrs, "tile_shape")?,
            halo: optional_attr(&group_attrs, "halo")?,
            tiles,
        }
    };

    Ok(StoreSummary {
        path: path.to_path_buf(),
        complete: is_complete(&attributes),
        attributes,
        layout,
    })
}

fn written_items(array: &ArrayHandle) -> anyhow::Result<usize> {
    let mut written = 0;
    for index in 0..array.len() {
        if array.has_item(index)? {
            written += 1;
        }
    }
    Ok(written)
}

fn optional_attr(attrs: &Attributes, key: &str) -> anyhow::Result<Option<[usize; 2]>> {
    match attrs.get(key) {
        Some(value) => Ok(serde_json::from_value(value.clone())?),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use microsam_embeddings::{EmbeddingSignature, ModelIdentity};
    use ndarray::{Array, IxDyn};
    use tempfile::TempDir;

    #[test]
    fn test_info_lists_encoders() {
        let temp_dir = TempDir::new().unwrap();
        let config = CacheConfig::new(temp_dir.path());
        let registry = ModelRegistry::new(&config);

        let info = info(&config, &registry).unwrap();
        assert_eq!(info.models.len(), registry.encoder_names().len());
        assert!(info.models.iter().all(|m| !m.downloaded));
        assert_eq!(info.default_model, "vit_b_lm");
        assert!(info.to_string().contains("vit_b_lm"));
    }

    #[test]
    fn test_download_rejects_unknown_models() {
        let temp_dir = TempDir::new().unwrap();
        let registry = ModelRegistry::new(&CacheConfig::new(temp_dir.path()));

        let err = download(&registry, &["vit_b_lm".to_string(), "vit_z".to_string()]).unwrap_err();
        assert!(err.to_string().contains("vit_z"));
        // Nothing was fetched before validation failed
        assert!(!registry.models_dir().exists());
    }

    #[test]
    fn test_inspect_missing_store() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("missing.store");
        assert!(inspect(&path).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_inspect_leaves_plain_directory_alone() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("volume.tif"), b"data").unwrap();

        let err = inspect(temp_dir.path()).unwrap_err();
        assert!(err.to_string().contains("No embeddings store"));
        let entries: Vec<_> = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("volume.tif")]);
    }

    #[test]
    fn test_inspect_while_store_in_use() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("embeddings.store");
        let container = Container::open(&path).unwrap();
        container.set_attr("", "data_signature", "abc").unwrap();
        container.flush().unwrap();

        let summary = inspect(&path).unwrap();
        assert!(!summary.complete);
        assert!(matches!(summary.layout, Layout::Empty));
        assert_eq!(summary.attributes["data_signature"], serde_json::json!("abc"));
    }

    #[test]
    fn test_inspect_untiled_store() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("embeddings.store");
        {
            let container = Container::open(&path).unwrap();
            let features = Array::from_elem(IxDyn(&[1, 4, 4, 4]), 1.0f32);
            container
                .create_array_with_data(FEATURES, features.view())
                .unwrap();
            let identity = ModelIdentity::new("vit_b_lm", None).unwrap();
            EmbeddingSignature::new("abc".into(), &identity, None, None)
                .write(&container, Some((1024, 768)), Some((512, 384)))
                .unwrap();
        }

        let summary = inspect(&path).unwrap();
        assert!(summary.complete);
        assert_eq!(summary.attributes["model_type"], serde_json::json!("vit_b"));
        match &summary.layout {
            Layout::Array {
                shape,
                written_items,
                ..
            } => {
                assert_eq!(shape, &vec![1, 4, 4, 4]);
                assert_eq!(*written_items, 1);
            }
            other => panic!("expected an array layout, got {:?}", other),
        }
        assert!(summary.to_string().contains("Complete: true"));
    }

    #[test]
    fn test_inspect_partial_tiled_store() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tiled.store");
        {
            let container = Container::open(&path).unwrap();
            let group = container.require_group(FEATURES).unwrap();
            group.set_attr("shape", [40, 36]).unwrap();
            group.set_attr("tile_shape", [16, 16]).unwrap();
            group.set_attr("halo", [4, 4]).unwrap();
            for tile_id in [10, 2] {
                let array = group
                    .create_array(&tile_id.to_string(), vec![3, 1, 4, 2, 2], vec![1, 1, 4, 2, 2])
                    .unwrap();
                let slice = Array::from_elem(IxDyn(&[1, 4, 2, 2]), 2.0f32);
                array.write_item(1, slice.view()).unwrap();
            }
        }

        let summary = inspect(&path).unwrap();
        assert!(!summary.complete);
        match &summary.layout {
            Layout::Tiled {
                tile_shape,
                halo,
                tiles,
                ..
            } => {
                assert_eq!(*tile_shape, Some([16, 16]));
                assert_eq!(*halo, Some([4, 4]));
                let ids: Vec<usize> = tiles.iter().map(|t| t.tile_id).collect();
                assert_eq!(ids, vec![2, 10]);
                assert!(tiles.iter().all(|t| t.written_items == 1));
            }
            other => panic!("expected a tiled layout, got {:?}", other),
        }

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["layout"]["kind"], "tiled");
    }
}
