//! The request-interception and cache-orchestration worker.
//!
//! One `ServiceWorker` is one code generation, identified by its version
//! tag. Every handler is an async fn; the event it serves is finished exactly
//! when the returned future resolves, cache writes included.

use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::background::{BackgroundChannels, NoopQueue, OfflineQueue};
use crate::cache::{CacheLayer, CacheStorage, Partition, PartitionManager, Served};
use crate::config::Config;
use crate::host::{ClientHost, Notification};
use crate::http::{Request, Response};
use crate::network::Fetcher;
use crate::strategy::{Route, Strategy, StrategySelector};

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Uninstalled,
  Installing,
  /// Installed and ready to activate immediately (waiting is skipped)
  Installed,
  Activating,
  /// Controlling clients and intercepting fetches
  Active,
}

impl std::fmt::Display for WorkerState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      WorkerState::Uninstalled => write!(f, "uninstalled"),
      WorkerState::Installing => write!(f, "installing"),
      WorkerState::Installed => write!(f, "installed"),
      WorkerState::Activating => write!(f, "activating"),
      WorkerState::Active => write!(f, "active"),
    }
  }
}

/// Result of a fetch event.
#[derive(Debug)]
pub enum FetchOutcome {
  /// The worker stayed out of the way; the request goes straight to the network
  NotIntercepted,
  Responded(Served),
}

/// Shared collaborators, reused across worker generations.
pub struct Collaborators<S, F, H, Q = NoopQueue> {
  pub storage: Arc<S>,
  pub fetcher: Arc<F>,
  pub host: Arc<H>,
  pub queue: Arc<Q>,
}

impl<S, F, H, Q> Clone for Collaborators<S, F, H, Q> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      fetcher: Arc::clone(&self.fetcher),
      host: Arc::clone(&self.host),
      queue: Arc::clone(&self.queue),
    }
  }
}

pub struct ServiceWorker<S, F, H, Q = NoopQueue>
where
  S: CacheStorage,
  F: Fetcher,
  H: ClientHost,
  Q: OfflineQueue,
{
  config: Config,
  state: Mutex<WorkerState>,
  selector: StrategySelector,
  cache: CacheLayer<S>,
  fetcher: Arc<F>,
  host: Arc<H>,
  background: BackgroundChannels<Q>,
}

impl<S, F, H, Q> ServiceWorker<S, F, H, Q>
where
  S: CacheStorage,
  F: Fetcher,
  H: ClientHost,
  Q: OfflineQueue,
{
  pub fn new(config: Config, collaborators: Collaborators<S, F, H, Q>) -> Self {
    let partitions = PartitionManager::new(collaborators.storage, config.partition_names());
    Self {
      selector: StrategySelector::new(&config),
      cache: CacheLayer::new(partitions),
      fetcher: collaborators.fetcher,
      host: collaborators.host,
      background: BackgroundChannels::new(config.clone(), collaborators.queue),
      state: Mutex::new(WorkerState::Uninstalled),
      config,
    }
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn version(&self) -> &str {
    &self.config.version
  }

  pub fn state(&self) -> Result<WorkerState> {
    let state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(*state)
  }

  fn set_state(&self, next: WorkerState) -> Result<()> {
    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    debug!(version = %self.config.version, from = %*state, to = %next, "Worker state change");
    *state = next;
    Ok(())
  }

  /// Move from `expected` to `next`, failing if the worker is elsewhere.
  fn transition(&self, expected: WorkerState, next: WorkerState) -> Result<()> {
    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if *state != expected {
      return Err(eyre!(
        "Invalid worker state: expected {}, got {}",
        expected,
        *state
      ));
    }
    *state = next;
    Ok(())
  }

  pub fn partitions(&self) -> &PartitionManager<S> {
    self.cache.partitions()
  }

  /// Requests for every precache path, resolved against the origin.
  fn precache_requests(&self) -> Result<Vec<Request>> {
    self
      .config
      .precache
      .iter()
      .map(|path| Request::get(self.config.resolve(path)?.as_str()))
      .collect()
  }

  /// Adopt an install that completed in an earlier run.
  ///
  /// Returns true when the current static partition already holds every
  /// precache entry, in which case the worker moves straight to `Installed`.
  pub fn resume(&self) -> Result<bool> {
    if self.state()? != WorkerState::Uninstalled || !self.partitions().exists(Partition::Static)? {
      return Ok(false);
    }

    let name = self.partitions().names().name(Partition::Static);
    let storage = self.partitions().storage();
    for request in self.precache_requests()? {
      if storage.lookup(&name, &request.key())?.is_none() {
        return Ok(false);
      }
    }

    self.transition(WorkerState::Uninstalled, WorkerState::Installed)?;
    info!(version = %self.config.version, "Resumed installed worker");
    Ok(true)
  }

  /// Populate the static partition with the precache list.
  ///
  /// All or nothing: every asset is fetched before any is stored, and a
  /// network failure or non-2xx status fails the whole install.
  pub async fn on_install(&self) -> Result<()> {
    self.transition(WorkerState::Uninstalled, WorkerState::Installing)?;
    info!(version = %self.config.version, "Installing");

    let existed = self.partitions().exists(Partition::Static)?;
    match self.precache().await {
      Ok(count) => {
        self.set_state(WorkerState::Installed)?;
        info!(version = %self.config.version, assets = count, "Installed, skipping wait");
        Ok(())
      }
      Err(err) => {
        if !existed {
          let name = self.partitions().names().name(Partition::Static);
          if let Err(e) = self.partitions().storage().delete(&name) {
            warn!(partition = %name, error = %e, "Failed to discard partial partition");
          }
        }
        self.set_state(WorkerState::Uninstalled)?;
        warn!(version = %self.config.version, error = %err, "Install failed");
        Err(err)
      }
    }
  }

  async fn precache(&self) -> Result<usize> {
    let name = self.partitions().open(Partition::Static)?;
    let requests = self.precache_requests()?;

    let responses = try_join_all(requests.iter().map(|r| self.fetcher.fetch(r))).await?;

    let mut entries = Vec::with_capacity(requests.len());
    for (request, response) in requests.iter().zip(responses) {
      if !response.is_ok() {
        return Err(eyre!(
          "Failed to precache {}: status {}",
          request.url,
          response.status
        ));
      }
      entries.push((request.key(), response));
    }

    let count = entries.len();
    self.partitions().storage().put_all(&name, entries)?;
    Ok(count)
  }

  /// Delete partitions from other versions and take control of all clients.
  ///
  /// Returns the names of deleted partitions. Never creates partitions.
  pub async fn on_activate(&self) -> Result<Vec<String>> {
    self.transition(WorkerState::Installed, WorkerState::Activating)?;
    info!(version = %self.config.version, "Activating");

    let result = async {
      let deleted = self.partitions().collect_garbage()?;
      self.host.claim().await?;
      Ok::<_, color_eyre::Report>(deleted)
    }
    .await;

    match result {
      Ok(deleted) => {
        self.set_state(WorkerState::Active)?;
        info!(
          version = %self.config.version,
          deleted = deleted.len(),
          "Active, controlling all clients"
        );
        Ok(deleted)
      }
      Err(err) => {
        self.set_state(WorkerState::Installed)?;
        Err(err)
      }
    }
  }

  /// Route a request and run its strategy.
  ///
  /// Failed navigations are answered with the cached root document, or a
  /// minimal "Offline" page. Any other failure propagates to the caller.
  pub async fn on_fetch(&self, request: Request) -> Result<FetchOutcome> {
    if self.state()? != WorkerState::Active {
      return Ok(FetchOutcome::NotIntercepted);
    }

    let route = self.selector.classify(&request);
    debug!(method = %request.method, url = %request.url, ?route, "Routed request");

    let result = self.execute(route, &request).await;
    match result {
      Ok(Some(served)) => Ok(FetchOutcome::Responded(served)),
      Ok(None) => Ok(FetchOutcome::NotIntercepted),
      Err(err) if request.is_navigation() => {
        warn!(url = %request.url, error = %err, "Navigation failed, serving offline shell");
        Ok(FetchOutcome::Responded(self.offline_shell()))
      }
      Err(err) => Err(err),
    }
  }

  async fn execute(&self, route: Route, request: &Request) -> Result<Option<Served>> {
    let fetch = || self.fetcher.fetch(request);

    let served = match route.strategy() {
      Strategy::NotIntercepted => return Ok(None),
      Strategy::CacheFirst(partition) => self.cache.cache_first(partition, request, fetch).await?,
      Strategy::NetworkFirst(partition) => {
        self.cache.network_first(partition, request, fetch).await?
      }
      Strategy::Network => Served::from_network(fetch().await?),
    };

    Ok(Some(served))
  }

  /// The cached root document, or a synthesized "Offline" page.
  fn offline_shell(&self) -> Served {
    match self.lookup_root() {
      Ok(Some(served)) => served,
      Ok(None) => Served::synthesized(Response::offline()),
      Err(err) => {
        warn!(error = %err, "Failed to read offline shell");
        Served::synthesized(Response::offline())
      }
    }
  }

  fn lookup_root(&self) -> Result<Option<Served>> {
    let root = Request::get(self.config.resolve("/")?.as_str())?;
    let key = root.key();
    let storage = self.partitions().storage();

    for partition in [Partition::Static, Partition::Dynamic] {
      let name = self.partitions().names().name(partition);
      if let Some(entry) = storage.lookup(&name, &key)? {
        return Ok(Some(Served::offline_shell(entry)));
      }
    }
    Ok(None)
  }

  pub async fn on_sync(&self, tag: &str) -> Result<bool> {
    self.background.on_sync(tag).await
  }

  pub async fn on_push(&self, payload: &[u8]) -> Result<Notification> {
    self.background.on_push(self.host.as_ref(), payload).await
  }

  pub async fn on_notification_click(&self, tag: &str) -> Result<u64> {
    self
      .background
      .on_notification_click(self.host.as_ref(), tag)
      .await
  }
}
