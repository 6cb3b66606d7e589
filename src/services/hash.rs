use crate::core::code::{Code, CodeError, HashMethod};
use image::ImageReader;
use image_hasher::{HashAlg, Hasher, HasherConfig};
use rayon::prelude::*;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("Failed to open {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unreadable image {path}: {source}")]
    UnreadableImage {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("Hash of {path} has {found} bits, expected {expected}")]
    UnexpectedLength {
        path: PathBuf,
        expected: u32,
        found: usize,
    },

    #[error("Invalid hash: {0}")]
    Code(#[from] CodeError),
}

/// Turns an image file into a perceptual hash code.
pub trait HashProvider: Sync {
    fn compute(&self, path: &Path, method: HashMethod, hash_size: u32) -> Result<Code, HashError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct HashProgress {
    pub completed: usize,
    pub total: usize,
    pub current_file: PathBuf,
}

pub type ProgressCallback = Box<dyn Fn(HashProgress) + Send + Sync>;

/// Hash provider backed by `image_hasher`.
pub struct PerceptualHasher;

impl PerceptualHasher {
    pub fn new() -> Self {
        Self
    }

    fn hasher(method: HashMethod, hash_size: u32) -> Hasher {
        let config = HasherConfig::new().hash_size(hash_size, hash_size);
        let config = match method {
            HashMethod::Ahash => config.hash_alg(HashAlg::Mean),
            HashMethod::Dhash => config.hash_alg(HashAlg::Gradient),
            HashMethod::DhashVertical => config.hash_alg(HashAlg::VertGradient),
            HashMethod::Phash => config.hash_alg(HashAlg::Mean).preproc_dct(),
            HashMethod::Blockhash => config.hash_alg(HashAlg::Blockhash),
        };
        config.to_hasher()
    }
}

impl Default for PerceptualHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl HashProvider for PerceptualHasher {
    fn compute(&self, path: &Path, method: HashMethod, hash_size: u32) -> Result<Code, HashError> {
        let io_error = |source| HashError::Io {
            path: path.to_path_buf(),
            source,
        };

        let img = ImageReader::open(path)
            .map_err(io_error)?
            .with_guessed_format()
            .map_err(io_error)?
            .decode()
            .map_err(|source| HashError::UnreadableImage {
                path: path.to_path_buf(),
                source,
            })?;

        let hash = Self::hasher(method, hash_size).hash_image(&img);
        let bytes = hash.as_bytes();
        let expected = method.code_bits(hash_size);
        if bytes.len() * 8 != expected as usize {
            return Err(HashError::UnexpectedLength {
                path: path.to_path_buf(),
                expected,
                found: bytes.len() * 8,
            });
        }

        Ok(Code::new(method, expected, bytes.to_vec())?)
    }
}

/// Hash many files in parallel, keeping input order. Failures are returned per file.
pub fn compute_batch<H: HashProvider + ?Sized>(
    provider: &H,
    paths: &[PathBuf],
    method: HashMethod,
    hash_size: u32,
    progress: Option<&ProgressCallback>,
) -> Vec<(PathBuf, Result<Code, HashError>)> {
    let completed = AtomicUsize::new(0);
    let total = paths.len();

    paths
        .par_iter()
        .map(|path| {
            let result = provider.compute(path, method, hash_size);
            if let Some(callback) = progress {
                callback(HashProgress {
                    completed: completed.fetch_add(1, Ordering::Relaxed) + 1,
                    total,
                    current_file: path.clone(),
                });
            }
            (path.clone(), result)
        })
        .collect()
}
