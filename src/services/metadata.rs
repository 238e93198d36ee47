use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::services::tagger::TagRecord;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("Could not write metadata {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Could not read metadata {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Metadata serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Write every record into a single JSON array.
pub fn save_tags(records: &[TagRecord], path: &Path) -> Result<(), MetadataError> {
    let json = serde_json::to_string_pretty(records)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| MetadataError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(path, json).map_err(|source| MetadataError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Path of the sidecar written next to `image`: `photo.jpg` -> `photo.jpg.json`.
pub fn sidecar_path(image: &Path) -> PathBuf {
    let mut name = image.as_os_str().to_owned();
    name.push(".json");
    PathBuf::from(name)
}

/// Write one `<image>.json` per record. A sidecar that cannot be written is
/// logged and skipped; returns how many were written.
pub fn save_sidecars(records: &[TagRecord]) -> Result<usize, MetadataError> {
    let mut written = 0;
    for record in records {
        let path = sidecar_path(&record.file);
        let json = serde_json::to_string_pretty(record)?;
        match fs::write(&path, json) {
            Ok(()) => written += 1,
            Err(e) => log::warn!("Could not write {}: {}", path.display(), e),
        }
    }
    Ok(written)
}

pub fn load_tags(path: &Path) -> Result<Vec<TagRecord>, MetadataError> {
    let contents = fs::read_to_string(path).map_err(|source| MetadataError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&contents)?)
}
