// Embedding providers and parallel extraction.
//
// The real semantic model (CLIP or similar) runs outside this crate; its
// vectors are read from a precomputed JSON store. The perceptual provider is
// self-contained and good enough for near-duplicate detection, but it has no
// text side.

use image::ImageReader;
use image_hasher::{HashAlg, Hasher, HasherConfig};
use indicatif::ProgressBar;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::organize::content_digest;
use crate::core::record::ImageRecord;

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Embedding store parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("The {provider} provider cannot embed text")]
    TextUnsupported { provider: String },

    #[error("No embedding stored for image {path:?}")]
    MissingImage { path: PathBuf },

    #[error("No embedding stored for text {query:?}")]
    MissingText { query: String },

    #[error("Embedding dimension mismatch for {key}: expected {expected}, found {found}")]
    DimensionMismatch {
        key: String,
        expected: usize,
        found: usize,
    },

    #[error("The precomputed provider needs an embedding store file")]
    MissingStore,
}

/// Maps images and text into one vector space.
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    fn embed_image(&self, path: &Path) -> Result<Vec<f32>, EmbeddingError>;

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    fn supports_text(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Perceptual,
    Precomputed,
}

impl ProviderKind {
    pub fn build(
        self,
        store: Option<&Path>,
        images_root: &Path,
    ) -> Result<Box<dyn EmbeddingProvider>, EmbeddingError> {
        match self {
            ProviderKind::Perceptual => Ok(Box::new(PerceptualEmbedder::new())),
            ProviderKind::Precomputed => {
                let store = store.ok_or(EmbeddingError::MissingStore)?;
                Ok(Box::new(
                    PrecomputedEmbeddings::from_file(store)?.with_root(images_root),
                ))
            }
        }
    }
}

/// A 16x16 mean hash spread into a 256-dimensional +/-1 vector.
///
/// Cosine similarity between two such vectors is `1 - 2 * hamming / 256`.
pub struct PerceptualEmbedder {
    hash_size: u32,
}

impl PerceptualEmbedder {
    pub fn new() -> Self {
        Self { hash_size: 16 }
    }

    pub fn dimension(&self) -> usize {
        (self.hash_size * self.hash_size) as usize
    }

    fn hasher(&self) -> Hasher {
        HasherConfig::new()
            .hash_size(self.hash_size, self.hash_size)
            .hash_alg(HashAlg::Mean)
            .to_hasher()
    }

    pub fn embed_dynamic(&self, image: &image::DynamicImage) -> Vec<f32> {
        let hash = self.hasher().hash_image(image);
        let mut vector = Vec::with_capacity(self.dimension());
        for byte in hash.as_bytes() {
            for bit in 0..8 {
                vector.push(if byte >> bit & 1 == 1 { 1.0 } else { -1.0 });
            }
        }
        vector.truncate(self.dimension());
        vector
    }
}

impl Default for PerceptualEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingProvider for PerceptualEmbedder {
    fn name(&self) -> &str {
        "perceptual"
    }

    fn embed_image(&self, path: &Path) -> Result<Vec<f32>, EmbeddingError> {
        let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
        Ok(self.embed_dynamic(&image))
    }

    fn embed_text(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::TextUnsupported {
            provider: self.name().to_string(),
        })
    }

    fn supports_text(&self) -> bool {
        false
    }
}

/// On-disk layout of a precomputed embedding store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingStoreFile {
    #[serde(default)]
    pub dimension: Option<usize>,
    #[serde(default)]
    pub images: BTreeMap<String, Vec<f32>>,
    #[serde(default)]
    pub texts: BTreeMap<String, Vec<f32>>,
}

/// Vectors produced by an external model and saved as JSON.
pub struct PrecomputedEmbeddings {
    root: Option<PathBuf>,
    dimension: usize,
    images: HashMap<String, Vec<f32>>,
    texts: HashMap<String, Vec<f32>>,
}

impl PrecomputedEmbeddings {
    pub fn from_file(path: &Path) -> Result<Self, EmbeddingError> {
        let contents = fs::read_to_string(path)?;
        let store: EmbeddingStoreFile = serde_json::from_str(&contents)?;
        let embeddings = Self::from_store(store)?;
        log::info!(
            "Loaded {} image and {} text embedding(s) from {}",
            embeddings.images.len(),
            embeddings.texts.len(),
            path.display()
        );
        Ok(embeddings)
    }

    pub fn from_store(store: EmbeddingStoreFile) -> Result<Self, EmbeddingError> {
        let dimension = store
            .dimension
            .or_else(|| store.images.values().next().map(Vec::len))
            .or_else(|| store.texts.values().next().map(Vec::len))
            .unwrap_or(0);

        for (key, vector) in store.images.iter().chain(store.texts.iter()) {
            if vector.len() != dimension {
                return Err(EmbeddingError::DimensionMismatch {
                    key: key.clone(),
                    expected: dimension,
                    found: vector.len(),
                });
            }
        }

        Ok(Self {
            root: None,
            dimension,
            images: store.images.into_iter().collect(),
            texts: store.texts.into_iter().collect(),
        })
    }

    /// Image keys may be relative to `root`.
    pub fn with_root(mut self, root: &Path) -> Self {
        self.root = Some(root.to_path_buf());
        self
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn image_keys(&self, path: &Path) -> Vec<String> {
        let mut keys = vec![path.to_string_lossy().into_owned()];
        if let Some(relative) = self.root.as_ref().and_then(|r| path.strip_prefix(r).ok()) {
            let parts: Vec<_> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            keys.push(parts.join("/"));
        }
        if let Some(name) = path.file_name() {
            keys.push(name.to_string_lossy().into_owned());
        }
        keys
    }
}

impl EmbeddingProvider for PrecomputedEmbeddings {
    fn name(&self) -> &str {
        "precomputed"
    }

    fn embed_image(&self, path: &Path) -> Result<Vec<f32>, EmbeddingError> {
        self.image_keys(path)
            .iter()
            .find_map(|key| self.images.get(key))
            .cloned()
            .ok_or_else(|| EmbeddingError::MissingImage {
                path: path.to_path_buf(),
            })
    }

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if let Some(vector) = self.texts.get(text) {
            return Ok(vector.clone());
        }
        let wanted = text.trim().to_lowercase();
        self.texts
            .iter()
            .find(|(key, _)| key.trim().to_lowercase() == wanted)
            .map(|(_, vector)| vector.clone())
            .ok_or_else(|| EmbeddingError::MissingText {
                query: text.to_string(),
            })
    }

    fn supports_text(&self) -> bool {
        !self.texts.is_empty()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    provider: String,
    entries: HashMap<String, Vec<f32>>,
}

/// Image embeddings keyed by the blake3 digest of the file content, so a
/// renamed or moved file is still a hit.
pub struct EmbeddingCache {
    path: PathBuf,
    provider: String,
    entries: HashMap<String, Vec<f32>>,
    dirty: bool,
}

impl EmbeddingCache {
    /// Open the cache at `path`. A missing, unreadable or foreign cache
    /// starts out empty.
    pub fn load(path: &Path, provider: &str) -> Self {
        let entries = match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<CacheFile>(&contents) {
                Ok(file) if file.provider == provider => file.entries,
                Ok(_) => {
                    log::info!("Embedding cache {} belongs to another provider", path.display());
                    HashMap::new()
                }
                Err(e) => {
                    log::warn!("Ignoring corrupt embedding cache {}: {}", path.display(), e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            path: path.to_path_buf(),
            provider: provider.to_string(),
            entries,
            dirty: false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, digest: &str) -> Option<&Vec<f32>> {
        self.entries.get(digest)
    }

    pub fn insert(&mut self, digest: String, embedding: Vec<f32>) {
        self.entries.insert(digest, embedding);
        self.dirty = true;
    }

    /// Drop entries whose digest is not in `keep`, such as images deleted or
    /// edited since they were cached. Returns how many were dropped.
    pub fn retain(&mut self, keep: &HashSet<String>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|digest, _| keep.contains(digest));
        let dropped = before - self.entries.len();
        if dropped > 0 {
            log::debug!("Pruned {} stale embedding cache entries", dropped);
            self.dirty = true;
        }
        dropped
    }

    /// Write the cache back if anything changed. The file is replaced
    /// atomically.
    pub fn save(&mut self) -> Result<(), EmbeddingError> {
        if !self.dirty {
            return Ok(());
        }
        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&dir)?;

        let file = CacheFile {
            provider: self.provider.clone(),
            entries: std::mem::take(&mut self.entries),
        };
        let result = write_json_atomic(&dir, &self.path, &file);
        self.entries = file.entries;
        result?;

        self.dirty = false;
        Ok(())
    }
}

fn write_json_atomic<T: Serialize>(dir: &Path, path: &Path, value: &T) -> Result<(), EmbeddingError> {
    let temp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(temp.as_file(), value)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Outcome of embedding a batch of images.
#[derive(Debug, Default)]
pub struct Extraction {
    /// Sorted by id.
    pub records: Vec<ImageRecord>,
    pub failures: Vec<(PathBuf, String)>,
    pub cache_hits: usize,
}

/// Embed `paths` in parallel. Undecodable or unknown images are reported in
/// `failures` and left out of `records`. `paths` is taken to be the whole
/// folder: cache entries for content not among them are pruned.
pub fn extract_embeddings(
    provider: &dyn EmbeddingProvider,
    paths: &[PathBuf],
    mut cache: Option<&mut EmbeddingCache>,
    progress: Option<&ProgressBar>,
) -> Extraction {
    let cache_view = cache.as_deref();

    let results: Vec<(PathBuf, Option<String>, bool, Result<Vec<f32>, EmbeddingError>)> = paths
        .par_iter()
        .map(|path| {
            let digest = cache_view.and_then(|_| match content_digest(path) {
                Ok(hash) => Some(hash.to_hex().to_string()),
                Err(e) => {
                    log::debug!("Could not hash {}: {}", path.display(), e);
                    None
                }
            });

            let cached = digest
                .as_ref()
                .and_then(|d| cache_view.and_then(|c| c.get(d)))
                .cloned();

            let result = match cached {
                Some(vector) => (path.clone(), digest, true, Ok(vector)),
                None => (path.clone(), digest, false, provider.embed_image(path)),
            };
            if let Some(progress) = progress {
                progress.inc(1);
            }
            result
        })
        .collect();

    let mut extraction = Extraction::default();
    let mut seen = HashSet::new();
    for (path, digest, hit, result) in results {
        if let Some(digest) = &digest {
            seen.insert(digest.clone());
        }
        match result {
            Ok(vector) => {
                if hit {
                    extraction.cache_hits += 1;
                } else if let (Some(cache), Some(digest)) = (cache.as_deref_mut(), digest) {
                    cache.insert(digest, vector.clone());
                }
                extraction.records.push(ImageRecord::new(path, vector));
            }
            Err(e) => {
                log::warn!("Could not embed {}: {}", path.display(), e);
                extraction.failures.push((path, e.to_string()));
            }
        }
    }

    if let Some(cache) = cache {
        cache.retain(&seen);
    }

    extraction.records.sort_by(|a, b| a.id.cmp(&b.id));
    extraction
}
