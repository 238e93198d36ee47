use indicatif::ProgressBar;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::{DirEntry, WalkDir};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    #[error("Not a directory: {path}")]
    NotADirectory { path: String },
}

pub const SUPPORTED_EXTENSIONS: [&str; 8] =
    ["jpg", "jpeg", "png", "gif", "bmp", "tiff", "tif", "webp"];

/// Folder names never descended into (embedding cache and the like).
const SKIPPED_DIRS: [&str; 1] = [".taggy"];

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| SUPPORTED_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Recursive image discovery.
#[derive(Default)]
pub struct ImageScanner {
    excluded: Vec<PathBuf>,
    progress: Option<ProgressBar>,
}

impl ImageScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip everything under `path`, e.g. an output folder inside the images
    /// folder.
    pub fn exclude(mut self, path: &Path) -> Self {
        if let Ok(canonical) = fs::canonicalize(path) {
            self.excluded.push(canonical);
        }
        self.excluded.push(path.to_path_buf());
        self
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    fn is_excluded(&self, entry: &DirEntry) -> bool {
        if !entry.file_type().is_dir() {
            return false;
        }
        if entry
            .file_name()
            .to_str()
            .is_some_and(|name| SKIPPED_DIRS.contains(&name))
        {
            return true;
        }
        if self.excluded.iter().any(|ex| entry.path().starts_with(ex)) {
            return true;
        }
        match fs::canonicalize(entry.path()) {
            Ok(canonical) => self.excluded.iter().any(|ex| canonical.starts_with(ex)),
            Err(_) => false,
        }
    }

    /// All supported images below `dir`, sorted.
    pub fn scan(&self, dir: &Path) -> Result<Vec<PathBuf>, ScanError> {
        if !dir.exists() {
            return Err(ScanError::InvalidPath {
                path: dir.to_string_lossy().to_string(),
            });
        }
        if !dir.is_dir() {
            return Err(ScanError::NotADirectory {
                path: dir.to_string_lossy().to_string(),
            });
        }

        let mut images = Vec::new();
        let walker = WalkDir::new(dir)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| !self.is_excluded(entry));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if entry.file_type().is_file() && is_supported_image(entry.path()) {
                images.push(entry.into_path());
            }
            if let Some(progress) = &self.progress {
                progress.tick();
            }
        }

        images.sort();
        log::info!("Found {} image(s) in {}", images.len(), dir.display());
        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_finds_supported_images_recursively() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("nested/deeper")).unwrap();
        fs::write(root.join("a.JPG"), b"").unwrap();
        fs::write(root.join("notes.txt"), b"").unwrap();
        fs::write(root.join("nested/b.png"), b"").unwrap();
        fs::write(root.join("nested/deeper/c.webp"), b"").unwrap();

        let images = ImageScanner::new().scan(root).unwrap();
        assert_eq!(
            images,
            vec![
                root.join("a.JPG"),
                root.join("nested/b.png"),
                root.join("nested/deeper/c.webp"),
            ]
        );
    }

    #[test]
    fn test_excludes_output_and_cache_folders() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        let output = root.join("taggy_output/duplicates");
        fs::create_dir_all(&output).unwrap();
        fs::create_dir_all(root.join(".taggy")).unwrap();
        fs::write(root.join("a.jpg"), b"").unwrap();
        fs::write(output.join("a.jpg"), b"").unwrap();
        fs::write(root.join(".taggy/x.png"), b"").unwrap();

        let images = ImageScanner::new().exclude(&output).scan(root).unwrap();
        assert_eq!(images, vec![root.join("a.jpg")]);
    }

    #[test]
    fn test_rejects_missing_or_file_path() {
        let temp_dir = TempDir::new().unwrap();
        let file = temp_dir.path().join("a.jpg");
        fs::write(&file, b"").unwrap();

        assert!(matches!(
            ImageScanner::new().scan(&temp_dir.path().join("missing")),
            Err(ScanError::InvalidPath { .. })
        ));
        assert!(matches!(
            ImageScanner::new().scan(&file),
            Err(ScanError::NotADirectory { .. })
        ));
    }
}
