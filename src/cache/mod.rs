//! Versioned response partitions and the strategies that read and write them.
//!
//! This module provides:
//! - Named partitions keyed by a version tag (`tandem-static-v3`)
//! - Garbage collection of partitions from other versions
//! - Cache-first and network-first executors
//! - SQLite-backed persistent storage

mod layer;
mod partition;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use partition::{Partition, PartitionManager, PartitionNames};
pub use storage::SqliteStorage;
pub use traits::{CacheStorage, CachedEntry, ResponseSource, Served};
