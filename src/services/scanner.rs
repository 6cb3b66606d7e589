use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Walks directories for image files, returning absolute paths.
pub struct ImageScanner {
    supported_formats: HashSet<String>,
}

impl ImageScanner {
    pub fn new() -> Self {
        let supported_formats = ["png", "jpg", "jpeg", "bmp", "gif", "tiff", "tif", "webp"]
            .iter()
            .map(|ext| ext.to_string())
            .collect();

        Self { supported_formats }
    }

    pub fn is_image(&self, path: &Path) -> bool {
        let by_extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.supported_formats.contains(&ext.to_lowercase()));

        // Names like `photo.jpg.1` still count as JPEGs
        by_extension
            || path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.to_lowercase().contains(".jpg"))
    }

    /// Every image under `dirs`, sorted and de-duplicated.
    pub fn scan(&self, dirs: &[PathBuf]) -> Result<Vec<PathBuf>, ScanError> {
        let mut images = BTreeSet::new();

        for dir in dirs {
            if !dir.is_dir() {
                return Err(ScanError::InvalidPath {
                    path: format!("{} is not a directory", dir.display()),
                });
            }
            let root = dir.canonicalize()?;

            for entry in WalkDir::new(&root) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        log::warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                        continue;
                    }
                };
                if entry.file_type().is_file() && self.is_image(entry.path()) {
                    images.insert(entry.into_path());
                }
            }
        }

        log::debug!("Found {} images in {} directories", images.len(), dirs.len());
        Ok(images.into_iter().collect())
    }
}

impl Default for ImageScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// Absolute form of `path`, resolving symlinks when the file exists.
pub fn absolute_path(path: &Path) -> PathBuf {
    path.canonicalize()
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
