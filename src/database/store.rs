use super::{Record, RecordId, RecordStore, StoreError};
use crate::core::code::Code;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const RECORDS_TREE: &str = "records";

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    path: PathBuf,
    code: Code,
    tombstoned: bool,
    indexed_at: String,
}

/// Record store on an embedded sled database, keyed by record id.
pub struct SledRecordStore {
    db: sled::Db,
    records: sled::Tree,
}

impl SledRecordStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Store backed by a throwaway database that disappears on drop.
    pub fn temporary() -> Result<Self, StoreError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StoreError> {
        let records = db.open_tree(RECORDS_TREE)?;
        Ok(Self { db, records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn decode(key: &[u8], value: &[u8]) -> Result<Record, StoreError> {
        let id = String::from_utf8_lossy(key).into_owned();
        let stored: StoredRecord =
            serde_json::from_slice(value).map_err(|source| StoreError::CorruptRecord {
                id: id.clone(),
                source,
            })?;

        Ok(Record {
            id: RecordId::new(id),
            path: stored.path,
            code: stored.code,
            tombstoned: stored.tombstoned,
            indexed_at: stored.indexed_at,
        })
    }

    fn write(&self, id: &RecordId, stored: &StoredRecord) -> Result<(), StoreError> {
        let value = serde_json::to_vec(stored)?;
        self.records.insert(id.as_str(), value)?;
        Ok(())
    }
}

impl RecordStore for SledRecordStore {
    fn list_all(&self) -> Result<Vec<Record>, StoreError> {
        self.records
            .iter()
            .map(|entry| {
                let (key, value) = entry?;
                Self::decode(&key, &value)
            })
            .collect()
    }

    fn get(&self, id: &RecordId) -> Result<Option<Record>, StoreError> {
        match self.records.get(id.as_str())? {
            Some(value) => Ok(Some(Self::decode(id.as_str().as_bytes(), &value)?)),
            None => Ok(None),
        }
    }

    fn upsert(&self, id: &RecordId, path: &Path, code: &Code) -> Result<(), StoreError> {
        let stored = StoredRecord {
            path: path.to_path_buf(),
            code: code.clone(),
            tombstoned: false,
            indexed_at: Utc::now().to_rfc3339(),
        };
        self.write(id, &stored)
    }

    fn mark_deleted(&self, id: &RecordId) -> Result<bool, StoreError> {
        let Some(record) = self.get(id)? else {
            return Ok(false);
        };
        if record.tombstoned {
            return Ok(false);
        }

        let stored = StoredRecord {
            path: record.path,
            code: record.code,
            tombstoned: true,
            indexed_at: record.indexed_at,
        };
        self.write(id, &stored)?;
        Ok(true)
    }

    fn exists(&self, id: &RecordId) -> Result<bool, StoreError> {
        Ok(self.get(id)?.is_some_and(|record| record.is_live()))
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.records.clear()?;
        Ok(())
    }

    fn purge_deleted(&self) -> Result<usize, StoreError> {
        let mut purged = 0;
        for record in self.list_all()? {
            if record.tombstoned {
                self.records.remove(record.id.as_str())?;
                purged += 1;
            }
        }
        Ok(purged)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}
