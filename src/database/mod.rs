pub mod models;
pub mod store;

pub use models::{Record, RecordId};
pub use store::SledRecordStore;

use crate::core::code::Code;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record store unavailable: {0}")]
    Unavailable(#[from] sled::Error),

    #[error("Corrupt record {id}: {source}")]
    CorruptRecord {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Authoritative source of image records. The index is always re-derivable from it.
pub trait RecordStore {
    /// Every record in store order, tombstoned ones included.
    fn list_all(&self) -> Result<Vec<Record>, StoreError>;

    fn get(&self, id: &RecordId) -> Result<Option<Record>, StoreError>;

    /// Insert or replace a record. Replacing clears any tombstone.
    fn upsert(&self, id: &RecordId, path: &Path, code: &Code) -> Result<(), StoreError>;

    /// Tombstone a record. Returns false if it was absent or already tombstoned.
    fn mark_deleted(&self, id: &RecordId) -> Result<bool, StoreError>;

    /// True if a live (non-tombstoned) record exists under `id`.
    fn exists(&self, id: &RecordId) -> Result<bool, StoreError>;

    fn clear(&self) -> Result<(), StoreError>;

    /// Physically drop tombstoned records, returning how many were removed.
    fn purge_deleted(&self) -> Result<usize, StoreError>;

    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn live_records(&self) -> Result<Vec<Record>, StoreError> {
        Ok(self
            .list_all()?
            .into_iter()
            .filter(Record::is_live)
            .collect())
    }
}
