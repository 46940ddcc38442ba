//! Registry of pretrained checkpoints
//!
//! Maps model names to an `xxh128:` checkpoint hash and a download URL.
//! Checkpoints are fetched into the models directory of a [`CacheConfig`] on
//! first use and verified against their hash.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use xxhash_rust::xxh3::Xxh3;

use crate::config::CacheConfig;
use crate::encoder::ModelIdentity;
use crate::error::{EmbeddingError, Result};

/// Model used when none is requested
pub const DEFAULT_MODEL: &str = "vit_b_lm";

const DECODER_SUFFIX: &str = "_decoder";

const ENCODERS: &[(&str, &str, &str)] = &[
    // Segment Anything
    (
        "vit_l",
        "xxh128:a82beb3c660661e3dd38d999cc860e9a",
        "https://dl.fbaipublicfiles.com/segment_anything/sam_vit_l_0b3195.pth",
    ),
    (
        "vit_h",
        "xxh128:97698fac30bd929c2e6d8d8cc15933c2",
        "https://dl.fbaipublicfiles.com/segment_anything/sam_vit_h_4b8939.pth",
    ),
    (
        "vit_b",
        "xxh128:6923c33df3637b6a922d7682bfc9a86b",
        "https://dl.fbaipublicfiles.com/segment_anything/sam_vit_b_01ec64.pth",
    ),
    (
        "vit_t",
        "xxh128:8eadbc88aeb9d8c7e0b4b60c3db48bd0",
        "https://owncloud.gwdg.de/index.php/s/TuDzuwVDHd1ZDnQ/download",
    ),
    // Light microscopy
    (
        "vit_l_lm",
        "xxh128:017f20677997d628426dec80a8018f9d",
        "https://uk1s3.embassy.ebi.ac.uk/public-datasets/bioimage.io/idealistic-rat/1.2/files/vit_l.pt",
    ),
    (
        "vit_b_lm",
        "xxh128:fe9252a29f3f4ea53c15a06de471e186",
        "https://uk1s3.embassy.ebi.ac.uk/public-datasets/bioimage.io/diplomatic-bug/1.2/files/vit_b.pt",
    ),
    (
        "vit_t_lm",
        "xxh128:72ec5074774761a6e5c05a08942f981e",
        "https://uk1s3.embassy.ebi.ac.uk/public-datasets/bioimage.io/faithful-chicken/1.1/files/vit_t.pt",
    ),
    // Electron microscopy
    (
        "vit_l_em_organelles",
        "xxh128:810b084b6e51acdbf760a993d8619f2d",
        "https://uk1s3.embassy.ebi.ac.uk/public-datasets/bioimage.io/humorous-crab/1.2/files/vit_l.pt",
    ),
    (
        "vit_b_em_organelles",
        "xxh128:f3bf2ed83d691456bae2c3f9a05fb438",
        "https://uk1s3.embassy.ebi.ac.uk/public-datasets/bioimage.io/noisy-ox/1.2/files/vit_b.pt",
    ),
    (
        "vit_t_em_organelles",
        "xxh128:253474720c497cce605e57c9b1d18fd9",
        "https://uk1s3.embassy.ebi.ac.uk/public-datasets/bioimage.io/greedy-whale/1/files/vit_t.pt",
    ),
    // Histopathology
    (
        "vit_b_histopathology",
        "xxh128:ffd1a2cd84570458b257bd95fdd8f974",
        "https://owncloud.gwdg.de/index.php/s/sBB4H8CTmIoBZsQ/download",
    ),
    (
        "vit_l_histopathology",
        "xxh128:b591833c89754271023e901281dee3f2",
        "https://owncloud.gwdg.de/index.php/s/IZgnn1cpBq2PHod/download",
    ),
    (
        "vit_h_histopathology",
        "xxh128:bd1856dafc156a43fb3aa705f1a6e92e",
        "https://owncloud.gwdg.de/index.php/s/L7AcvVz7DoWJ2RZ/download",
    ),
    // Medical imaging
    (
        "vit_b_medical_imaging",
        "xxh128:5be672f1458263a9edc9fd40d7f56ac1",
        "https://owncloud.gwdg.de/index.php/s/AB69HGhj8wuozXQ/download",
    ),
];

/// Instance segmentation decoders of the fine-tuned models
const DECODERS: &[(&str, &str, &str)] = &[
    (
        "vit_l_lm_decoder",
        "xxh128:2faeafa03819dfe03e7c46a44aaac64a",
        "https://uk1s3.embassy.ebi.ac.uk/public-datasets/bioimage.io/idealistic-rat/1.2/files/vit_l_decoder.pt",
    ),
    (
        "vit_b_lm_decoder",
        "xxh128:708b15ac620e235f90bb38612c4929ba",
        "https://uk1s3.embassy.ebi.ac.uk/public-datasets/bioimage.io/diplomatic-bug/1.2/files/vit_b_decoder.pt",
    ),
    (
        "vit_t_lm_decoder",
        "xxh128:3e914a5f397b0312cdd36813031f8823",
        "https://uk1s3.embassy.ebi.ac.uk/public-datasets/bioimage.io/faithful-chicken/1.1/files/vit_t_decoder.pt",
    ),
    (
        "vit_l_em_organelles_decoder",
        "xxh128:334877640bfdaaabce533e3252a17294",
        "https://uk1s3.embassy.ebi.ac.uk/public-datasets/bioimage.io/humorous-crab/1.2/files/vit_l_decoder.pt",
    ),
    (
        "vit_b_em_organelles_decoder",
        "xxh128:bb6398956a6b0132c26b631c14f95ce2",
        "https://uk1s3.embassy.ebi.ac.uk/public-datasets/bioimage.io/noisy-ox/1.2/files/vit_b_decoder.pt",
    ),
    (
        "vit_t_em_organelles_decoder",
        "xxh128:8f897c7bb93174a4d1638827c4dd6f44",
        "https://uk1s3.embassy.ebi.ac.uk/public-datasets/bioimage.io/greedy-whale/1/files/vit_t_decoder.pt",
    ),
    (
        "vit_b_histopathology_decoder",
        "xxh128:6a66194dcb6e36199cbee2214ecf7213",
        "https://owncloud.gwdg.de/index.php/s/KO9AWqynI7SFOBj/download",
    ),
    (
        "vit_l_histopathology_decoder",
        "xxh128:46aab7765d4400e039772d5a50b55c04",
        "https://owncloud.gwdg.de/index.php/s/oIs6VSmkOp7XrKF/download",
    ),
    (
        "vit_h_histopathology_decoder",
        "xxh128:3ed9f87e46ad5e16935bd8d722c8dc47",
        "https://owncloud.gwdg.de/index.php/s/1qAKxy5H0jgwZvM/download",
    ),
];

/// A downloadable checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelEntry {
    pub name: String,
    /// `xxh128:<hex>`
    pub hash: String,
    pub url: String,
}

impl ModelEntry {
    pub fn new(name: impl Into<String>, hash: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            hash: hash.into(),
            url: url.into(),
        }
    }

    pub fn is_decoder(&self) -> bool {
        self.name.ends_with(DECODER_SUFFIX)
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models_dir: PathBuf,
    entries: BTreeMap<String, ModelEntry>,
}

impl ModelRegistry {
    /// Registry of the published checkpoints, stored under `config.models_dir()`
    pub fn new(config: &CacheConfig) -> Self {
        let entries = ENCODERS
            .iter()
            .chain(DECODERS)
            .map(|(name, hash, url)| ModelEntry::new(*name, *hash, *url));
        Self::with_entries(config.models_dir(), entries)
    }

    pub fn with_entries(
        models_dir: impl Into<PathBuf>,
        entries: impl IntoIterator<Item = ModelEntry>,
    ) -> Self {
        Self {
            models_dir: models_dir.into(),
            entries: entries
                .into_iter()
                .map(|entry| (entry.name.clone(), entry))
                .collect(),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// All registered names, encoders and decoders, sorted
    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Names of the image encoder checkpoints
    pub fn encoder_names(&self) -> Vec<&str> {
        self.entries
            .values()
            .filter(|entry| !entry.is_decoder())
            .map(|entry| entry.name.as_str())
            .collect()
    }

    pub fn entry(&self, name: &str) -> Result<&ModelEntry> {
        self.entries.get(name).ok_or_else(|| {
            EmbeddingError::model(format!(
                "Unknown model '{}'. Available models: {}",
                name,
                self.encoder_names().join(", ")
            ))
        })
    }

    /// Where the checkpoint for `name` is (or will be) stored
    pub fn local_path(&self, name: &str) -> Result<PathBuf> {
        let entry = self.entry(name)?;
        Ok(self.models_dir.join(&entry.name))
    }

    fn marker_path(&self, name: &str) -> PathBuf {
        self.models_dir.join(format!("{}.downloading", name))
    }

    /// Whether a complete download of `name` is present (hash not checked)
    pub fn is_downloaded(&self, name: &str) -> Result<bool> {
        Ok(self.local_path(name)?.exists() && !self.marker_path(name).exists())
    }

    /// Path of a verified local copy of `name`, downloading it if needed
    pub fn fetch(&self, name: &str) -> Result<PathBuf> {
        let entry = self.entry(name)?;
        let path = self.local_path(name)?;
        let marker = self.marker_path(name);

        if path.exists() && !marker.exists() {
            let actual = compute_file_hash(&path)?;
            if actual == entry.hash {
                log::debug!("Model {} already available at: {}", name, path.display());
                return Ok(path);
            }
            log::warn!(
                "Cached checkpoint {} has hash {}, expected {}. Downloading again.",
                path.display(),
                actual,
                entry.hash
            );
        }

        download(entry, &path, &marker)?;

        let actual = compute_file_hash(&path)?;
        if actual != entry.hash {
            let _ = fs::remove_file(&path);
            return Err(EmbeddingError::HashMismatch {
                name: name.to_string(),
                expected: entry.hash.clone(),
                actual,
            });
        }
        Ok(path)
    }

    /// Fetch a checkpoint together with its instance segmentation decoder, if any
    pub fn fetch_with_decoder(&self, name: &str) -> Result<(PathBuf, Option<PathBuf>)> {
        let checkpoint = self.fetch(name)?;
        let decoder_name = format!("{}{}", name, DECODER_SUFFIX);
        let decoder = if self.entries.contains_key(&decoder_name) {
            Some(self.fetch(&decoder_name)?)
        } else {
            None
        };
        Ok((checkpoint, decoder))
    }
}

impl ModelIdentity {
    /// Identity of a registered model, carrying its registry hash
    pub fn from_registry(name: &str, registry: &ModelRegistry) -> Result<Self> {
        let entry = registry.entry(name)?;
        Self::new(entry.name.clone(), Some(entry.hash.clone()))
    }
}

fn download(entry: &ModelEntry, path: &Path, marker: &Path) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| EmbeddingError::invalid_path(path.display().to_string()))?;

    // Clean up partial downloads from a previous interrupted attempt
    if marker.exists() {
        log::warn!("Found partial download of {}, cleaning up...", entry.name);
        if path.exists() {
            fs::remove_file(path)?;
        }
    }

    fs::create_dir_all(dir)?;
    fs::write(marker, "")?;

    log::info!("Downloading {} to {}...", entry.name, path.display());
    let response = ureq::get(&entry.url)
        .call()
        .map_err(|e| EmbeddingError::download(format!("Failed to download {}: {}", entry.name, e)))?;

    let mut file = fs::File::create(path)?;
    let bytes = std::io::copy(&mut response.into_reader(), &mut file)?;
    file.sync_all()?;

    let size_mb = bytes as f64 / (1024.0 * 1024.0);
    log::info!("  {}: {:.1} MB", entry.name, size_mb);

    // Remove marker on success
    let _ = fs::remove_file(marker);
    Ok(())
}

/// Streaming xxh128 hash of a file, as `xxh128:<hex>`
pub fn compute_file_hash(path: impl AsRef<Path>) -> Result<String> {
    let file = fs::File::open(path.as_ref())?;
    let mut reader = BufReader::new(file);
    let mut hasher = Xxh3::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("xxh128:{:032x}", hasher.digest128()))
}
