//! Cache layer that orchestrates caching strategies with network fetching.

use color_eyre::Result;
use std::future::Future;
use tracing::{debug, warn};

use super::partition::{Partition, PartitionManager};
use super::traits::{CacheStorage, Served};
use crate::http::{Request, Response};

/// Executes cache-first and network-first strategies against the
/// partitions of one worker generation.
///
/// Concurrent first access to the same key is not coalesced: both callers
/// fetch and the last write wins.
pub struct CacheLayer<S: CacheStorage> {
  partitions: PartitionManager<S>,
}

impl<S: CacheStorage> CacheLayer<S> {
  pub fn new(partitions: PartitionManager<S>) -> Self {
    Self { partitions }
  }

  pub fn partitions(&self) -> &PartitionManager<S> {
    &self.partitions
  }

  /// Serve from the partition when present, otherwise fetch and store.
  ///
  /// 1. Look up the request - a hit returns immediately, no freshness check
  /// 2. On a miss, fetch from network
  /// 3. Store a clone of successful responses before returning the original
  /// 4. A network failure on a miss propagates to the caller
  pub async fn cache_first<F, Fut>(
    &self,
    partition: Partition,
    request: &Request,
    fetcher: F,
  ) -> Result<Served>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    let name = self.partitions.open(partition)?;
    let key = request.key();
    let storage = self.partitions.storage();

    if let Some(entry) = storage.lookup(&name, &key)? {
      debug!(partition = %name, request = %key, "Cache hit");
      return Ok(Served::from_cache(entry));
    }

    debug!(partition = %name, request = %key, "Cache miss, fetching");
    let response = fetcher().await?;
    if response.is_ok() {
      storage.put(&name, &key, response.clone())?;
    }
    Ok(Served::from_network(response))
  }

  /// Prefer the network, falling back to the last stored copy.
  ///
  /// 1. Fetch from network
  /// 2. On success, store a clone of 2xx responses and return the original
  /// 3. On failure, serve the stored entry if there is one
  /// 4. Otherwise the network error propagates
  pub async fn network_first<F, Fut>(
    &self,
    partition: Partition,
    request: &Request,
    fetcher: F,
  ) -> Result<Served>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Response>>,
  {
    let name = self.partitions.open(partition)?;
    let key = request.key();
    let storage = self.partitions.storage();

    match fetcher().await {
      Ok(response) => {
        if response.is_ok() {
          storage.put(&name, &key, response.clone())?;
        }
        Ok(Served::from_network(response))
      }
      Err(err) => match storage.lookup(&name, &key)? {
        Some(entry) => {
          warn!(partition = %name, request = %key, error = %err, "Network failed, serving stored copy");
          Ok(Served::fallback(entry))
        }
        None => Err(err),
      },
    }
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      partitions: self.partitions.clone(),
    }
  }
}
