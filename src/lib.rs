//! Reverse image search over a perceptual-hash BK-tree.
//!
//! Images are hashed into fixed-length binary codes, recorded in a sled-backed
//! store and indexed by Hamming distance. The index answers radius queries for
//! new images and groups the collection into near-duplicate clusters.

pub mod config;
pub mod core;
pub mod database;
pub mod services;

pub use crate::config::{Config, ConfigError};
pub use crate::core::{Code, HashMethod, IndexError, IndexManager};
pub use crate::database::{RecordStore, SledRecordStore};
