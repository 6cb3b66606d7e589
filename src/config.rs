use crate::core::cluster::ClusterMode;
use crate::core::code::HashMethod;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to access config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Build,
    Update,
    Search,
    FindDuplicates,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMethod {
    #[default]
    Hamming,
}

impl fmt::Display for DistanceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistanceMethod::Hamming => f.write_str("hamming"),
        }
    }
}

/// The settings a persisted index depends on. An index built under one
/// fingerprint is never reused under another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    pub method: HashMethod,
    /// Code length in bits.
    pub size: u32,
    pub distance_method: DistanceMethod,
}

impl fmt::Display for IndexConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} bits/{}", self.method, self.size, self.distance_method)
    }
}

/// Parameters read from the JSON parameter file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the record store
    pub db_dir: PathBuf,
    /// Image collection to index
    pub img_dirs: Vec<PathBuf>,
    /// Directory holding the persisted BK-tree
    pub index_dir: PathBuf,
    /// Query images for `search`
    pub input_dir: PathBuf,
    pub operation: Operation,
    pub hash_method: HashMethod,
    pub hash_size: u32,
    pub distance_method: DistanceMethod,
    pub distance_threshold: u32,
    /// Tombstone share of the index that triggers a rebuild
    pub rebuild_fraction: f64,
    pub cluster_mode: ClusterMode,
}

impl Default for Config {
    fn default() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            db_dir: cwd.clone(),
            img_dirs: vec![cwd.clone()],
            index_dir: cwd.clone(),
            input_dir: cwd.join("input"),
            operation: Operation::Update,
            hash_method: HashMethod::Dhash,
            hash_size: 8,
            distance_method: DistanceMethod::Hamming,
            distance_threshold: 1,
            rebuild_fraction: 0.25,
            cluster_mode: ClusterMode::Transitive,
        }
    }
}

impl Config {
    pub const STORE_NAME: &'static str = "img.db";
    pub const INDEX_FILE: &'static str = "bk_tree.json";

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load the parameter file, writing one with defaults first if it does not exist.
    pub fn load_or_init<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.is_file() {
            return Self::load(path);
        }

        let config = Config::default();
        config.save(path)?;
        log::info!("Wrote default parameters to {}", path.display());
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(2..=64).contains(&self.hash_size) {
            return Err(ConfigError::Invalid(format!(
                "hash_size must be between 2 and 64, got {}",
                self.hash_size
            )));
        }

        let bits = self.code_bits();
        if self.distance_threshold > bits {
            return Err(ConfigError::Invalid(format!(
                "distance_threshold {} exceeds the {} bit code length",
                self.distance_threshold, bits
            )));
        }

        if !(self.rebuild_fraction > 0.0 && self.rebuild_fraction <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "rebuild_fraction must be in (0, 1], got {}",
                self.rebuild_fraction
            )));
        }

        Ok(())
    }

    pub fn code_bits(&self) -> u32 {
        self.hash_method.code_bits(self.hash_size)
    }

    pub fn index_config(&self) -> IndexConfig {
        IndexConfig {
            method: self.hash_method,
            size: self.code_bits(),
            distance_method: self.distance_method,
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.db_dir.join(Self::STORE_NAME)
    }

    pub fn index_path(&self) -> PathBuf {
        self.index_dir.join(Self::INDEX_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_or_init_writes_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("params.json");

        let config = Config::load_or_init(&path).unwrap();
        assert!(path.is_file());
        assert_eq!(config.operation, Operation::Update);
        assert_eq!(config.hash_method, HashMethod::Dhash);
        assert_eq!(config.hash_size, 8);
        assert_eq!(config.distance_threshold, 1);

        let reloaded = Config::load_or_init(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_missing_keys_fall_back_to_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("params.json");
        fs::write(
            &path,
            r#"{"operation": "find_duplicates", "hash_method": "phash", "distance_threshold": 6}"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.operation, Operation::FindDuplicates);
        assert_eq!(config.hash_method, HashMethod::Phash);
        assert_eq!(config.distance_threshold, 6);
        assert_eq!(config.hash_size, 8);
        assert_eq!(config.distance_method, DistanceMethod::Hamming);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("params.json");

        fs::write(&path, r#"{"hash_size": 1}"#).unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Invalid(_))));

        fs::write(&path, r#"{"distance_threshold": 65}"#).unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Invalid(_))));

        fs::write(&path, r#"{"rebuild_fraction": 0.0}"#).unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Invalid(_))));

        fs::write(&path, r#"{"distance_method": "levenshtein"}"#).unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_index_config_tracks_code_bits() {
        let config = Config {
            hash_method: HashMethod::Ahash,
            hash_size: 5,
            ..Config::default()
        };
        let index_config = config.index_config();
        assert_eq!(index_config.size, 32);
        assert_eq!(index_config.method, HashMethod::Ahash);
        assert!(config.index_path().ends_with("bk_tree.json"));
    }

    #[test]
    fn test_blockhash_threshold_checked_against_rounded_grid() {
        let config = Config {
            hash_method: HashMethod::Blockhash,
            hash_size: 6,
            distance_threshold: 50,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.index_config().size, 64);

        let config = Config {
            distance_threshold: 65,
            ..config
        };
        assert!(config.validate().is_err());
    }
}
