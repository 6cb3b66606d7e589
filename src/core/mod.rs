pub mod bktree;
pub mod cluster;
pub mod code;
pub mod exact;
pub mod manager;
pub mod persist;

pub use bktree::BkTree;
pub use cluster::{ClusterFinder, ClusterMode};
pub use code::{Code, CodeError, HashMethod};
pub use exact::ExactIndex;
pub use manager::{IndexError, IndexManager, IndexState};
pub use persist::PersistError;
