//! Event loop that feeds the registration's active worker.
//!
//! Every event runs as its own task. The runtime keeps each one alive until
//! its future settles, and `shutdown` waits for all of them, so no pending
//! cache write is dropped when the loop stops.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::background::OfflineQueue;
use crate::cache::{CacheStorage, Served};
use crate::host::{ClientHost, Notification};
use crate::http::Request;
use crate::network::Fetcher;
use crate::registration::Registration;

/// Events delivered to the worker.
#[derive(Debug)]
pub enum WorkerEvent {
  Fetch {
    request: Request,
    respond: oneshot::Sender<Result<Served>>,
  },
  Sync {
    tag: String,
    done: oneshot::Sender<Result<bool>>,
  },
  Push {
    payload: Vec<u8>,
    done: oneshot::Sender<Result<Notification>>,
  },
  NotificationClick {
    tag: String,
    done: oneshot::Sender<Result<u64>>,
  },
}

/// Handle to a running event loop.
pub struct WorkerRuntime {
  tx: mpsc::UnboundedSender<WorkerEvent>,
  task: JoinHandle<()>,
}

impl WorkerRuntime {
  pub fn start<S, F, H, Q>(registration: Arc<Registration<S, F, H, Q>>) -> Self
  where
    S: CacheStorage + 'static,
    F: Fetcher + 'static,
    H: ClientHost + 'static,
    Q: OfflineQueue + 'static,
  {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run_loop(registration, rx));
    Self { tx, task }
  }

  async fn dispatch<T>(&self, event: WorkerEvent, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
    self
      .tx
      .send(event)
      .map_err(|_| eyre!("Worker event loop is not running"))?;
    rx.await
      .map_err(|_| eyre!("Worker dropped the event before settling it"))?
  }

  /// Issue a request through the worker.
  pub async fn fetch(&self, request: Request) -> Result<Served> {
    let (respond, rx) = oneshot::channel();
    self
      .dispatch(WorkerEvent::Fetch { request, respond }, rx)
      .await
  }

  pub async fn sync(&self, tag: &str) -> Result<bool> {
    let (done, rx) = oneshot::channel();
    let tag = tag.to_string();
    self.dispatch(WorkerEvent::Sync { tag, done }, rx).await
  }

  pub async fn push(&self, payload: Vec<u8>) -> Result<Notification> {
    let (done, rx) = oneshot::channel();
    self.dispatch(WorkerEvent::Push { payload, done }, rx).await
  }

  pub async fn notification_click(&self, tag: &str) -> Result<u64> {
    let (done, rx) = oneshot::channel();
    let tag = tag.to_string();
    self
      .dispatch(WorkerEvent::NotificationClick { tag, done }, rx)
      .await
  }

  /// Stop accepting events and wait for in-flight ones to finish.
  pub async fn shutdown(self) -> Result<()> {
    drop(self.tx);
    self
      .task
      .await
      .map_err(|e| eyre!("Worker event loop failed: {}", e))
  }
}

async fn run_loop<S, F, H, Q>(
  registration: Arc<Registration<S, F, H, Q>>,
  mut rx: mpsc::UnboundedReceiver<WorkerEvent>,
) where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
  H: ClientHost + 'static,
  Q: OfflineQueue + 'static,
{
  let mut in_flight = JoinSet::new();

  loop {
    tokio::select! {
      event = rx.recv() => {
        let Some(event) = event else { break };
        in_flight.spawn(handle_event(Arc::clone(&registration), event));
      }
      Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
        if let Err(e) = joined {
          warn!(error = %e, "Worker event task failed");
        }
      }
    }
  }

  debug!(pending = in_flight.len(), "Draining in-flight events");
  while let Some(joined) = in_flight.join_next().await {
    if let Err(e) = joined {
      warn!(error = %e, "Worker event task failed");
    }
  }
}

async fn handle_event<S, F, H, Q>(registration: Arc<Registration<S, F, H, Q>>, event: WorkerEvent)
where
  S: CacheStorage + 'static,
  F: Fetcher + 'static,
  H: ClientHost + 'static,
  Q: OfflineQueue + 'static,
{
  // A send error only means the caller stopped waiting
  match event {
    WorkerEvent::Fetch { request, respond } => {
      let _ = respond.send(registration.fetch(request).await);
    }
    WorkerEvent::Sync { tag, done } => {
      let result = async { registration.active()?.on_sync(&tag).await };
      let _ = done.send(result.await);
    }
    WorkerEvent::Push { payload, done } => {
      let result = async { registration.active()?.on_push(&payload).await };
      let _ = done.send(result.await);
    }
    WorkerEvent::NotificationClick { tag, done } => {
      let result = async { registration.active()?.on_notification_click(&tag).await };
      let _ = done.send(result.await);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::background::NoopQueue;
  use crate::cache::{ResponseSource, SqliteStorage};
  use crate::config::Config;
  use crate::http::Response;
  use crate::registration::ConfigLoader;
  use crate::testing::{RecordingHost, StubFetcher};
  use crate::worker::Collaborators;

  async fn runtime() -> (WorkerRuntime, Arc<StubFetcher>, Arc<SqliteStorage>) {
    let config = Config::from_yaml("origin: https://tandem.app\nprecache: [\"/\"]\n").unwrap();
    let fetcher = Arc::new(StubFetcher::default());
    fetcher.respond("https://tandem.app/", Response::new(200, "shell"));
    let storage = Arc::new(SqliteStorage::in_memory().unwrap());

    let loader_config = config.clone();
    let loader: ConfigLoader = Box::new(move || Ok(loader_config.clone()));
    let registration = Registration::register(
      config,
      Collaborators {
        storage: storage.clone(),
        fetcher: fetcher.clone(),
        host: Arc::new(RecordingHost::default()),
        queue: Arc::new(NoopQueue),
      },
      loader,
    )
    .await
    .unwrap();

    (
      WorkerRuntime::start(Arc::new(registration)),
      fetcher,
      storage,
    )
  }

  #[tokio::test]
  async fn test_fetch_through_runtime() {
    let (runtime, fetcher, _) = runtime().await;
    fetcher.respond("https://tandem.app/api/expenses", Response::new(200, "[]"));

    let served = runtime
      .fetch(Request::get("https://tandem.app/api/expenses").unwrap())
      .await
      .unwrap();
    assert_eq!(served.source, ResponseSource::Network);
    runtime.shutdown().await.unwrap();
  }

  #[tokio::test]
  async fn test_non_intercepted_goes_to_network() {
    let (runtime, fetcher, storage) = runtime().await;
    fetcher.respond("https://tandem.app/api/expenses", Response::new(201, "created"));

    let request = Request::new("POST", "https://tandem.app/api/expenses").unwrap();
    let served = runtime.fetch(request).await.unwrap();
    assert_eq!(served.response.status, 201);
    assert_eq!(storage.keys().unwrap(), vec!["tandem-static-v1"]);
    runtime.shutdown().await.unwrap();
  }

  #[tokio::test]
  async fn test_failed_fetch_reaches_caller() {
    let (runtime, fetcher, _) = runtime().await;
    fetcher.set_offline(true);

    let result = runtime
      .fetch(Request::get("https://tandem.app/api/children").unwrap())
      .await;
    assert!(result.is_err());
    runtime.shutdown().await.unwrap();
  }

  #[tokio::test]
  async fn test_concurrent_first_access_is_not_coalesced() {
    let (runtime, fetcher, storage) = runtime().await;
    let url = "https://tandem.app/icon-512.png";
    fetcher.respond(url, Response::new(200, vec![1, 2]));

    let (a, b) = tokio::join!(
      runtime.fetch(Request::get(url).unwrap()),
      runtime.fetch(Request::get(url).unwrap())
    );
    a.unwrap();
    b.unwrap();

    // Both callers miss before either stores: one network fetch each
    assert_eq!(fetcher.calls_to(url), 2);
    assert_eq!(storage.entries("tandem-static-v1").unwrap().len(), 2);
    runtime.shutdown().await.unwrap();
  }

  #[tokio::test]
  async fn test_background_events() {
    let (runtime, _, _) = runtime().await;

    assert!(runtime.sync("sync-data").await.unwrap());
    let notification = runtime.push(b"{}".to_vec()).await.unwrap();
    assert_eq!(notification.title, "Tandem");
    runtime.notification_click(&notification.tag).await.unwrap();
    runtime.shutdown().await.unwrap();
  }
}
