use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::organize::FileOperation;
use crate::core::scoring::{AdvancedWeights, ScoringMethod};
use crate::services::embedding::ProviderKind;

pub const CONFIG_FILE: &str = "taggy.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file {path:?} does not exist")]
    Missing { path: PathBuf },

    #[error("Could not read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaggyConfig {
    pub defaults: Defaults,
    pub embedding: EmbeddingConfig,
    pub scoring: AdvancedWeights,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub labels: Vec<String>,
    pub operation: FileOperation,
    pub similarity_threshold: f32,
    pub best_method: ScoringMethod,
    pub face_cascade_path: Option<PathBuf>,
    pub tag_threshold: f32,
    pub top_k: usize,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            labels: vec!["random".to_string(), "general".to_string()],
            operation: FileOperation::Symlink,
            similarity_threshold: 0.9,
            best_method: ScoringMethod::Advanced,
            face_cascade_path: None,
            tag_threshold: 0.3,
            top_k: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: ProviderKind,
    /// Precomputed embedding store (JSON).
    pub store: Option<PathBuf>,
    pub cache: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Perceptual,
            store: None,
            cache: true,
        }
    }
}

/// Load configuration with priority:
/// `explicit` > ./taggy.toml > <config dir>/taggy/config.toml > defaults
pub fn load_config(explicit: Option<&Path>) -> Result<TaggyConfig, ConfigError> {
    if let Some(path) = explicit {
        if !path.exists() {
            return Err(ConfigError::Missing {
                path: path.to_path_buf(),
            });
        }
        return load_config_from_path(path);
    }

    if let Some(config) = try_load_from_path(Path::new(CONFIG_FILE))? {
        return Ok(config);
    }

    if let Some(config_dir) = dirs::config_dir() {
        let user_config = config_dir.join("taggy").join("config.toml");
        if let Some(config) = try_load_from_path(&user_config)? {
            return Ok(config);
        }
    }

    log::debug!("No config file found; using defaults");
    Ok(TaggyConfig::default())
}

pub fn load_config_from_path(path: &Path) -> Result<TaggyConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    log::info!("Loaded config from {}", path.display());
    Ok(config)
}

fn try_load_from_path(path: &Path) -> Result<Option<TaggyConfig>, ConfigError> {
    if path.exists() {
        Ok(Some(load_config_from_path(path)?))
    } else {
        Ok(None)
    }
}

/// Split comma-separated label arguments: `["cat, dog", "car"]` gives three
/// labels.
pub fn split_labels(raw: &[String]) -> Vec<String> {
    raw.iter()
        .flat_map(|entry| entry.split(','))
        .map(str::trim)
        .filter(|label| !label.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = TaggyConfig::default();
        assert_eq!(config.defaults.labels, vec!["random", "general"]);
        assert_eq!(config.defaults.operation, FileOperation::Symlink);
        assert_eq!(config.defaults.similarity_threshold, 0.9);
        assert_eq!(config.scoring, AdvancedWeights::default());
        assert!(config.embedding.cache);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("taggy.toml");
        fs::write(
            &path,
            r#"
[defaults]
operation = "copy"
best_method = "laplacian"
labels = ["cat", "dog"]

[embedding]
provider = "precomputed"
store = "vectors.json"

[scoring]
face_weight = 5.0
"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.defaults.operation, FileOperation::Copy);
        assert_eq!(config.defaults.best_method, ScoringMethod::Laplacian);
        assert_eq!(config.defaults.labels, vec!["cat", "dog"]);
        assert_eq!(config.defaults.top_k, 5);
        assert_eq!(config.embedding.provider, ProviderKind::Precomputed);
        assert_eq!(config.embedding.store, Some(PathBuf::from("vectors.json")));
        assert_eq!(config.scoring.face, 5.0);
        assert_eq!(config.scoring.sharpness, 1.0);
    }

    #[test]
    fn test_explicit_missing_or_invalid_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        assert!(matches!(
            load_config(Some(&temp_dir.path().join("none.toml"))),
            Err(ConfigError::Missing { .. })
        ));

        let bad = temp_dir.path().join("bad.toml");
        fs::write(&bad, "[defaults]\noperation = \"shred\"\n").unwrap();
        assert!(matches!(
            load_config(Some(&bad)),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_split_labels() {
        let raw = vec!["cat, dog".to_string(), " ".to_string(), "car".to_string()];
        assert_eq!(split_labels(&raw), vec!["cat", "dog", "car"]);
    }
}
