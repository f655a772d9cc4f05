//! Worker registration at the origin root and update polling.

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock as AsyncRwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::background::{NoopQueue, OfflineQueue};
use crate::cache::{CacheStorage, Served};
use crate::config::Config;
use crate::host::ClientHost;
use crate::http::Request;
use crate::network::Fetcher;
use crate::worker::{Collaborators, FetchOutcome, ServiceWorker};

/// Scope every worker is registered for.
pub const ROOT_SCOPE: &str = "/";

/// Produces the configuration the next update check compares against.
pub type ConfigLoader = Box<dyn Fn() -> Result<Config> + Send + Sync>;

/// Announced to listeners as new versions roll out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
  /// A new version finished installing
  UpdateFound { from: String, to: String },
  /// The new version now controls all clients
  Activated { version: String },
}

pub struct Registration<S, F, H, Q = NoopQueue>
where
  S: CacheStorage,
  F: Fetcher,
  H: ClientHost,
  Q: OfflineQueue,
{
  collaborators: Collaborators<S, F, H, Q>,
  loader: ConfigLoader,
  active: RwLock<Arc<ServiceWorker<S, F, H, Q>>>,
  updates: broadcast::Sender<UpdateEvent>,
  /// Serializes update checks
  updating: Mutex<()>,
  /// Fetches hold a read guard; activation of a new version holds the write
  /// guard from the swap until the new worker is `Active`
  serving: AsyncRwLock<()>,
}

impl<S, F, H, Q> Registration<S, F, H, Q>
where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
  H: ClientHost + 'static,
  Q: OfflineQueue + 'static,
{
  /// Register at the root scope and bring the worker to `Active`.
  ///
  /// An install that already completed in an earlier run is adopted instead
  /// of being repeated.
  pub async fn register(
    config: Config,
    collaborators: Collaborators<S, F, H, Q>,
    loader: ConfigLoader,
  ) -> Result<Self> {
    let worker = ServiceWorker::new(config, collaborators.clone());
    if !worker.resume()? {
      worker.on_install().await?;
    }
    worker.on_activate().await?;
    info!(scope = ROOT_SCOPE, version = worker.version(), "Registered");

    let (updates, _) = broadcast::channel(16);
    Ok(Self {
      collaborators,
      loader,
      active: RwLock::new(Arc::new(worker)),
      updates,
      updating: Mutex::new(()),
      serving: AsyncRwLock::new(()),
    })
  }

  pub fn scope(&self) -> &str {
    ROOT_SCOPE
  }

  /// The worker currently controlling clients.
  pub fn active(&self) -> Result<Arc<ServiceWorker<S, F, H, Q>>> {
    let active = self
      .active
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(Arc::clone(&active))
  }

  fn replace_active(
    &self,
    worker: Arc<ServiceWorker<S, F, H, Q>>,
  ) -> Result<Arc<ServiceWorker<S, F, H, Q>>> {
    let mut active = self
      .active
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(std::mem::replace(&mut *active, worker))
  }

  /// Serve a request through the active worker.
  ///
  /// Waits while a new version is activating, so a retired worker never
  /// serves a request once garbage collection has started. Requests the
  /// worker does not intercept go straight to the network.
  pub async fn fetch(&self, request: Request) -> Result<Served> {
    let _serving = self.serving.read().await;
    let worker = self.active()?;
    match worker.on_fetch(request.clone()).await? {
      FetchOutcome::Responded(served) => Ok(served),
      FetchOutcome::NotIntercepted => self
        .collaborators
        .fetcher
        .fetch(&request)
        .await
        .map(Served::from_network),
    }
  }

  pub fn collaborators(&self) -> &Collaborators<S, F, H, Q> {
    &self.collaborators
  }

  /// Listen for update availability.
  pub fn subscribe(&self) -> broadcast::Receiver<UpdateEvent> {
    self.updates.subscribe()
  }

  /// Reload configuration and roll out a new version if the tag changed.
  ///
  /// Returns the new version when one was activated. If the new version
  /// fails to install, the current worker stays in control.
  pub async fn check_for_update(&self) -> Result<Option<String>> {
    let _guard = self.updating.lock().await;

    let config = (self.loader)()?;
    let current = self.active()?;
    if config.version == current.version() {
      return Ok(None);
    }

    let from = current.version().to_string();
    let to = config.version.clone();
    info!(from = %from, to = %to, "New version available");

    let next = ServiceWorker::new(config, self.collaborators.clone());
    if !next.resume()? {
      next.on_install().await?;
    }
    let _ = self.updates.send(UpdateEvent::UpdateFound {
      from,
      to: to.clone(),
    });

    // Drain in-flight fetches, then hand control over before cleanup starts
    let serving = self.serving.write().await;
    let next = Arc::new(next);
    let previous = self.replace_active(Arc::clone(&next))?;
    if let Err(err) = next.on_activate().await {
      self.replace_active(previous)?;
      warn!(version = %to, error = %err, "Activation failed, keeping current worker");
      return Err(err);
    }
    drop(serving);

    let _ = self.updates.send(UpdateEvent::Activated {
      version: to.clone(),
    });

    Ok(Some(to))
  }

  /// Check for updates on a fixed interval until the handle is aborted.
  pub fn poll_updates(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
    let registration = Arc::clone(self);
    tokio::spawn(async move {
      let mut interval = tokio::time::interval(period);
      // The first tick completes immediately
      interval.tick().await;
      loop {
        interval.tick().await;
        if let Err(e) = registration.check_for_update().await {
          warn!(error = %e, "Update check failed");
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::http::Response;
  use crate::runtime::WorkerRuntime;
  use crate::testing::{RecordingHost, StubFetcher};
  use crate::worker::WorkerState;
  use std::sync::Mutex as StdMutex;

  type TestRegistration = Registration<SqliteStorage, StubFetcher, RecordingHost>;

  fn config(version: &str) -> Config {
    Config::from_yaml(&format!(
      "origin: https://tandem.app\nversion: {}\nprecache: [\"/\"]\n",
      version
    ))
    .unwrap()
  }

  fn collaborators() -> Collaborators<SqliteStorage, StubFetcher, RecordingHost> {
    let fetcher = StubFetcher::default();
    fetcher.respond("https://tandem.app/", Response::new(200, "shell"));
    Collaborators {
      storage: Arc::new(SqliteStorage::in_memory().unwrap()),
      fetcher: Arc::new(fetcher),
      host: Arc::new(RecordingHost::default()),
      queue: Arc::new(NoopQueue),
    }
  }

  async fn register(current: Arc<StdMutex<Config>>) -> TestRegistration {
    let initial = current.lock().unwrap().clone();
    let loader: ConfigLoader = Box::new(move || Ok(current.lock().unwrap().clone()));
    Registration::register(initial, collaborators(), loader)
      .await
      .unwrap()
  }

  #[tokio::test]
  async fn test_register_activates() {
    let registration = register(Arc::new(StdMutex::new(config("v1")))).await;
    let worker = registration.active().unwrap();
    assert_eq!(worker.state().unwrap(), WorkerState::Active);
    assert_eq!(registration.scope(), "/");
  }

  #[tokio::test]
  async fn test_register_skips_completed_install() {
    let collaborators = collaborators();
    let loader = || -> ConfigLoader { Box::new(|| Ok(config("v1"))) };

    Registration::register(config("v1"), collaborators.clone(), loader())
      .await
      .unwrap();
    collaborators.fetcher.set_offline(true);

    // Offline, but the static partition is complete
    let again = Registration::register(config("v1"), collaborators.clone(), loader())
      .await
      .unwrap();
    assert_eq!(
      again.active().unwrap().state().unwrap(),
      WorkerState::Active
    );
  }

  #[tokio::test]
  async fn test_no_update_when_version_unchanged() {
    let registration = register(Arc::new(StdMutex::new(config("v1")))).await;
    assert_eq!(registration.check_for_update().await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_update_rolls_out_new_version() {
    let current = Arc::new(StdMutex::new(config("v1")));
    let registration = register(current.clone()).await;
    let mut events = registration.subscribe();

    *current.lock().unwrap() = config("v2");
    let updated = registration.check_for_update().await.unwrap();

    assert_eq!(updated.as_deref(), Some("v2"));
    assert_eq!(registration.active().unwrap().version(), "v2");
    assert_eq!(
      events.recv().await.unwrap(),
      UpdateEvent::UpdateFound {
        from: "v1".to_string(),
        to: "v2".to_string()
      }
    );
    assert_eq!(
      events.recv().await.unwrap(),
      UpdateEvent::Activated {
        version: "v2".to_string()
      }
    );
    assert_eq!(
      registration.collaborators().storage.keys().unwrap(),
      vec!["tandem-static-v2"]
    );
  }

  #[tokio::test]
  async fn test_failed_update_keeps_current_worker() {
    let current = Arc::new(StdMutex::new(config("v1")));
    let registration = register(current.clone()).await;

    registration.collaborators().fetcher.set_offline(true);
    *current.lock().unwrap() = config("v2");

    assert!(registration.check_for_update().await.is_err());
    assert_eq!(registration.active().unwrap().version(), "v1");
    assert_eq!(
      registration.collaborators().storage.keys().unwrap(),
      vec!["tandem-static-v1"]
    );
  }

  #[tokio::test]
  async fn test_fetch_during_activation_is_served_by_new_version() {
    let current = Arc::new(StdMutex::new(config("v1")));
    let registration = Arc::new(register(current.clone()).await);
    let collaborators = registration.collaborators().clone();
    collaborators
      .fetcher
      .respond("https://tandem.app/api/expenses", Response::new(200, "[]"));
    let runtime = WorkerRuntime::start(Arc::clone(&registration));

    *current.lock().unwrap() = config("v2");
    collaborators.host.hold_claims();
    let update = tokio::spawn({
      let registration = Arc::clone(&registration);
      async move { registration.check_for_update().await }
    });
    collaborators.host.claim_started().await;

    // v1 partitions are already gone while v2 is still claiming clients
    let request = Request::get("https://tandem.app/api/expenses").unwrap();
    let (served, _) = tokio::join!(runtime.fetch(request), async {
      tokio::time::sleep(Duration::from_millis(20)).await;
      collaborators.host.release_claims();
    });

    assert_eq!(served.unwrap().response.status, 200);
    assert_eq!(update.await.unwrap().unwrap().as_deref(), Some("v2"));

    let mut keys = collaborators.storage.keys().unwrap();
    keys.sort();
    assert_eq!(keys, vec!["tandem-api-v2", "tandem-static-v2"]);
    runtime.shutdown().await.unwrap();
  }

  #[tokio::test]
  async fn test_fetch_falls_through_to_network_when_not_intercepted() {
    let registration = register(Arc::new(StdMutex::new(config("v1")))).await;
    registration
      .collaborators()
      .fetcher
      .respond("https://tandem.app/api/expenses", Response::new(201, "created"));

    let request = Request::new("POST", "https://tandem.app/api/expenses").unwrap();
    let served = registration.fetch(request).await.unwrap();
    assert_eq!(served.response.status, 201);
    assert_eq!(
      registration.collaborators().storage.keys().unwrap(),
      vec!["tandem-static-v1"]
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_poll_updates_on_interval() {
    let current = Arc::new(StdMutex::new(config("v1")));
    let registration = Arc::new(register(current.clone()).await);
    let mut events = registration.subscribe();

    let poller = registration.poll_updates(Duration::from_secs(3600));
    *current.lock().unwrap() = config("v2");

    tokio::time::sleep(Duration::from_secs(3601)).await;
    assert!(matches!(
      events.recv().await.unwrap(),
      UpdateEvent::UpdateFound { .. }
    ));
    poller.abort();
  }
}
