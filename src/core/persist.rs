use super::bktree::{BkTree, Node};
use crate::config::{DistanceMethod, IndexConfig};
use crate::core::code::HashMethod;
use crate::database::RecordId;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Index file was built for {found}, configuration expects {expected}")]
    ConfigMismatch {
        expected: IndexConfig,
        found: IndexConfig,
    },

    #[error("Corrupt index file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Failed to access index file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode index: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexHeader {
    pub format_version: u32,
    pub method: HashMethod,
    pub size: u32,
    pub distance_method: DistanceMethod,
    pub created_at: String,
}

impl IndexHeader {
    fn index_config(&self) -> IndexConfig {
        IndexConfig {
            method: self.method,
            size: self.size,
            distance_method: self.distance_method,
        }
    }
}

#[derive(Serialize)]
struct IndexFileRef<'a> {
    header: IndexHeader,
    tree: TreeRef<'a>,
}

#[derive(Serialize)]
struct TreeRef<'a> {
    nodes: &'a [Node],
    tombstones: &'a BTreeSet<RecordId>,
}

#[derive(Deserialize)]
struct IndexFile {
    header: IndexHeader,
    tree: StoredTree,
}

#[derive(Deserialize)]
struct StoredTree {
    nodes: Vec<Node>,
    tombstones: BTreeSet<RecordId>,
}

/// Write `tree` under a header describing `config`. The file is replaced atomically.
pub fn save(path: &Path, config: &IndexConfig, tree: &BkTree) -> Result<(), PersistError> {
    let io_error = |source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_error)?;
    }

    let file = IndexFileRef {
        header: IndexHeader {
            format_version: FORMAT_VERSION,
            method: config.method,
            size: config.size,
            distance_method: config.distance_method,
            created_at: Utc::now().to_rfc3339(),
        },
        tree: TreeRef {
            nodes: tree.nodes(),
            tombstones: tree.tombstones(),
        },
    };
    let json = serde_json::to_vec(&file)?;

    let staging = path.with_extension("json.tmp");
    fs::write(&staging, json).map_err(io_error)?;
    fs::rename(&staging, path).map_err(io_error)?;
    Ok(())
}

/// Read a persisted tree. Returns `Ok(None)` if no index file exists.
pub fn load(path: &Path, expected: &IndexConfig) -> Result<Option<BkTree>, PersistError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(PersistError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let corrupt = |reason: String| PersistError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    let file: IndexFile = serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;
    if file.header.format_version != FORMAT_VERSION {
        return Err(corrupt(format!(
            "unsupported format version {}",
            file.header.format_version
        )));
    }

    let found = file.header.index_config();
    if found != *expected {
        return Err(PersistError::ConfigMismatch {
            expected: *expected,
            found,
        });
    }

    let tree = BkTree::restore(
        expected.method,
        expected.size,
        file.tree.nodes,
        file.tree.tombstones,
    )
    .map_err(|e| corrupt(e.to_string()))?;
    Ok(Some(tree))
}

/// Delete the index file if present.
pub fn remove(path: &Path) -> Result<(), PersistError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(source) => Err(PersistError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::code::Code;
    use tempfile::TempDir;

    fn config() -> IndexConfig {
        IndexConfig {
            method: HashMethod::Dhash,
            size: 8,
            distance_method: DistanceMethod::Hamming,
        }
    }

    fn sample_tree() -> BkTree {
        let mut tree = BkTree::new(HashMethod::Dhash, 8);
        for (name, value) in [("a", 0u64), ("b", 1), ("c", 0xff), ("d", 3)] {
            tree.insert(
                Code::from_u64(HashMethod::Dhash, 8, value).unwrap(),
                RecordId::new(name),
            )
            .unwrap();
        }
        tree.delete(&RecordId::new("b"));
        tree
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("index").join("bk_tree.json");
        let tree = sample_tree();

        save(&path, &config(), &tree).unwrap();
        let loaded = load(&path, &config()).unwrap().unwrap();

        assert_eq!(loaded.nodes(), tree.nodes());
        assert_eq!(loaded.tombstones(), tree.tombstones());
        assert_eq!(loaded.len(), 3);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_missing_file_loads_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bk_tree.json");
        assert!(load(&path, &config()).unwrap().is_none());
        remove(&path).unwrap();
    }

    #[test]
    fn test_header_mismatch_detected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bk_tree.json");
        save(&path, &config(), &sample_tree()).unwrap();

        let expected = IndexConfig {
            method: HashMethod::Phash,
            ..config()
        };
        assert!(matches!(
            load(&path, &expected),
            Err(PersistError::ConfigMismatch { .. })
        ));
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bk_tree.json");
        fs::write(&path, b"\x80not json").unwrap();

        assert!(matches!(
            load(&path, &config()),
            Err(PersistError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_tampered_edges_are_corrupt() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bk_tree.json");
        save(&path, &config(), &sample_tree()).unwrap();

        let mut json: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        let children = json["tree"]["nodes"][0]["children"].as_object_mut().unwrap();
        let (key, value) = children.iter().next().map(|(k, v)| (k.clone(), v.clone())).unwrap();
        children.remove(&key);
        children.insert("7".to_string(), value);
        fs::write(&path, serde_json::to_vec(&json).unwrap()).unwrap();

        assert!(matches!(
            load(&path, &config()),
            Err(PersistError::Corrupt { .. })
        ));
    }
}
