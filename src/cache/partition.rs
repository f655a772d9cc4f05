//! Versioned partition naming and garbage collection.

use color_eyre::Result;
use std::sync::Arc;
use tracing::info;

use super::traits::CacheStorage;

/// Logical partitions that exist side by side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
  /// Immutable shell assets (entry HTML, manifest, icons)
  Static,
  /// Same-origin pages and third-party fonts
  Dynamic,
  /// JSON responses from data endpoints
  Api,
}

impl Partition {
  pub const ALL: [Partition; 3] = [Partition::Static, Partition::Dynamic, Partition::Api];

  pub fn as_str(&self) -> &'static str {
    match self {
      Partition::Static => "static",
      Partition::Dynamic => "dynamic",
      Partition::Api => "api",
    }
  }
}

impl std::fmt::Display for Partition {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Builds partition names of the form `{prefix}-{partition}-{version}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionNames {
  prefix: String,
  version: String,
}

impl PartitionNames {
  pub fn new(prefix: &str, version: &str) -> Self {
    Self {
      prefix: prefix.to_string(),
      version: version.to_string(),
    }
  }

  pub fn name(&self, partition: Partition) -> String {
    format!("{}-{}-{}", self.prefix, partition, self.version)
  }

  /// A partition is current when one of its dash-separated segments is the
  /// active version tag. Everything else is stale.
  pub fn is_current(&self, name: &str) -> bool {
    name.split('-').any(|segment| segment == self.version)
  }
}

/// Owns the versioned partitions for one worker generation.
pub struct PartitionManager<S: CacheStorage> {
  storage: Arc<S>,
  names: PartitionNames,
}

impl<S: CacheStorage> PartitionManager<S> {
  pub fn new(storage: Arc<S>, names: PartitionNames) -> Self {
    Self { storage, names }
  }

  pub fn storage(&self) -> &Arc<S> {
    &self.storage
  }

  pub fn names(&self) -> &PartitionNames {
    &self.names
  }

  /// Open the current-version partition, creating it lazily. Returns its name.
  pub fn open(&self, partition: Partition) -> Result<String> {
    let name = self.names.name(partition);
    self.storage.open(&name)?;
    Ok(name)
  }

  /// Whether the current-version partition exists yet.
  pub fn exists(&self, partition: Partition) -> Result<bool> {
    self.storage.has(&self.names.name(partition))
  }

  /// Delete every partition that does not carry the active version tag.
  ///
  /// Returns the names of deleted partitions. Never creates partitions.
  pub fn collect_garbage(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();

    for name in self.storage.keys()? {
      if self.names.is_current(&name) {
        continue;
      }
      if self.storage.delete(&name)? {
        info!(partition = %name, version = %self.names.version, "Deleted stale partition");
        deleted.push(name);
      }
    }

    Ok(deleted)
  }
}

impl<S: CacheStorage> Clone for PartitionManager<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      names: self.names.clone(),
    }
  }
}
