//! Scripted collaborators for tests.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

use crate::host::{Client, ClientHost, Notification};
use crate::http::{Request, Response};
use crate::network::Fetcher;

/// Fetcher with per-URL responses and an offline switch.
///
/// Unknown URLs answer 404.
#[derive(Default)]
pub struct StubFetcher {
  responses: Mutex<HashMap<String, Response>>,
  calls: Mutex<Vec<String>>,
  offline: AtomicBool,
}

impl StubFetcher {
  pub fn respond(&self, url: &str, response: Response) {
    self
      .responses
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  pub fn calls_to(&self, url: &str) -> usize {
    self.calls().iter().filter(|c| c.as_str() == url).count()
  }
}

impl Fetcher for StubFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let url = request.url.to_string();
    self.calls.lock().unwrap().push(url.clone());
    // Let concurrent callers interleave like a real network round trip
    tokio::task::yield_now().await;

    if self.offline.load(Ordering::SeqCst) {
      return Err(eyre!("Failed to fetch {}: network unreachable", url));
    }

    let response = self.responses.lock().unwrap().get(&url).cloned();
    Ok(response.unwrap_or_else(|| Response::new(404, "Not Found")))
  }
}

#[derive(Default)]
struct HostLog {
  clients: Vec<Client>,
  next_id: u64,
  claims: usize,
  opened: Vec<String>,
  focused: Vec<u64>,
  closed: Vec<String>,
  notifications: Vec<Notification>,
}

/// Host that records every call. Claims can be held open to pause activation.
#[derive(Default)]
pub struct RecordingHost {
  log: Mutex<HostLog>,
  hold_claims: AtomicBool,
  claim_started: Notify,
  claim_released: Notify,
}

impl RecordingHost {
  pub fn add_client(&self, url: &str) -> u64 {
    let mut log = self.log.lock().unwrap();
    log.next_id += 1;
    let id = log.next_id;
    log.clients.push(Client {
      id,
      url: url.to_string(),
      focused: false,
    });
    id
  }

  /// Make the next claim wait until `release_claims`.
  pub fn hold_claims(&self) {
    self.hold_claims.store(true, Ordering::SeqCst);
  }

  /// Resolves once a held claim has started.
  pub async fn claim_started(&self) {
    self.claim_started.notified().await;
  }

  pub fn release_claims(&self) {
    self.hold_claims.store(false, Ordering::SeqCst);
    self.claim_released.notify_one();
  }

  pub fn claims(&self) -> usize {
    self.log.lock().unwrap().claims
  }

  pub fn opened(&self) -> Vec<String> {
    self.log.lock().unwrap().opened.clone()
  }

  pub fn focused(&self) -> Vec<u64> {
    self.log.lock().unwrap().focused.clone()
  }

  pub fn closed(&self) -> Vec<String> {
    self.log.lock().unwrap().closed.clone()
  }

  pub fn notifications(&self) -> Vec<Notification> {
    self.log.lock().unwrap().notifications.clone()
  }
}

impl ClientHost for RecordingHost {
  async fn claim(&self) -> Result<()> {
    self.log.lock().unwrap().claims += 1;
    if self.hold_claims.load(Ordering::SeqCst) {
      self.claim_started.notify_one();
      self.claim_released.notified().await;
    }
    Ok(())
  }

  async fn match_clients(&self) -> Result<Vec<Client>> {
    Ok(self.log.lock().unwrap().clients.clone())
  }

  async fn focus(&self, client_id: u64) -> Result<()> {
    self.log.lock().unwrap().focused.push(client_id);
    Ok(())
  }

  async fn open_window(&self, url: &str) -> Result<Client> {
    let id = self.add_client(url);
    self.log.lock().unwrap().opened.push(url.to_string());
    Ok(Client {
      id,
      url: url.to_string(),
      focused: true,
    })
  }

  async fn show_notification(&self, notification: Notification) -> Result<()> {
    self.log.lock().unwrap().notifications.push(notification);
    Ok(())
  }

  async fn close_notification(&self, tag: &str) -> Result<()> {
    self.log.lock().unwrap().closed.push(tag.to_string());
    Ok(())
  }
}
