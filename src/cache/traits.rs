//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use color_eyre::Result;

use crate::http::{RequestKey, Response};

/// A stored response together with when it was written.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: Response,
  pub cached_at: DateTime<Utc>,
}

/// Trait for partition storage backends.
///
/// A partition is a named key-value store mapping a request identity to a
/// full response snapshot. Single puts are atomic; nothing else is.
pub trait CacheStorage: Send + Sync {
  /// Open a partition, creating it if absent.
  fn open(&self, partition: &str) -> Result<()>;

  /// Whether a partition with this exact name exists.
  fn has(&self, partition: &str) -> Result<bool>;

  /// Names of all existing partitions, oldest first.
  fn keys(&self) -> Result<Vec<String>>;

  /// Delete a partition and everything in it. Returns false if it did not exist.
  fn delete(&self, partition: &str) -> Result<bool>;

  /// Look up the entry stored for a request.
  fn lookup(&self, partition: &str, key: &RequestKey) -> Result<Option<CachedEntry>>;

  /// Store a response, overwriting any previous entry for the key.
  fn put(&self, partition: &str, key: &RequestKey, response: Response) -> Result<()>;

  /// Store a batch of responses. Either all of them land or none do.
  fn put_all(&self, partition: &str, entries: Vec<(RequestKey, Response)>) -> Result<()>;

  /// Request identities stored in a partition, in insertion order.
  fn entries(&self, partition: &str) -> Result<Vec<String>>;
}

/// A response plus where it came from.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: ResponseSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl Served {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Network,
      cached_at: None,
    }
  }

  pub fn from_cache(entry: CachedEntry) -> Self {
    Self {
      response: entry.response,
      source: ResponseSource::Cache,
      cached_at: Some(entry.cached_at),
    }
  }

  /// Network failed, serving the last stored copy.
  pub fn fallback(entry: CachedEntry) -> Self {
    Self {
      response: entry.response,
      source: ResponseSource::Fallback,
      cached_at: Some(entry.cached_at),
    }
  }

  pub fn offline_shell(entry: CachedEntry) -> Self {
    Self {
      response: entry.response,
      source: ResponseSource::OfflineShell,
      cached_at: Some(entry.cached_at),
    }
  }

  pub fn synthesized(response: Response) -> Self {
    Self {
      response,
      source: ResponseSource::Synthesized,
      cached_at: None,
    }
  }
}

/// Indicates where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh from network
  Network,
  /// Cache hit, no network call made
  Cache,
  /// Network failed, last stored copy served instead
  Fallback,
  /// Navigation failed, cached root document served
  OfflineShell,
  /// Nothing available, minimal response generated locally
  Synthesized,
}

impl std::fmt::Display for ResponseSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ResponseSource::Network => write!(f, "network"),
      ResponseSource::Cache => write!(f, "cache"),
      ResponseSource::Fallback => write!(f, "cache (network failed)"),
      ResponseSource::OfflineShell => write!(f, "offline shell"),
      ResponseSource::Synthesized => write!(f, "synthesized"),
    }
  }
}
