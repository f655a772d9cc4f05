//! The runtime side of the worker: open clients and system notifications.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::future::Future;
use std::sync::Mutex;
use tracing::info;

/// An open window controlled (or controllable) by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
  pub id: u64,
  pub url: String,
  pub focused: bool,
}

/// A system notification request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub tag: String,
  pub icon: String,
  pub badge: String,
  /// Opaque application data
  pub data: serde_json::Value,
}

/// Operations the hosting runtime performs for the worker.
pub trait ClientHost: Send + Sync {
  /// Take control of every open client without waiting for navigation.
  fn claim(&self) -> impl Future<Output = Result<()>> + Send;

  /// Open window clients, most recently focused first.
  fn match_clients(&self) -> impl Future<Output = Result<Vec<Client>>> + Send;

  fn focus(&self, client_id: u64) -> impl Future<Output = Result<()>> + Send;

  fn open_window(&self, url: &str) -> impl Future<Output = Result<Client>> + Send;

  fn show_notification(&self, notification: Notification)
    -> impl Future<Output = Result<()>> + Send;

  fn close_notification(&self, tag: &str) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Default)]
struct ConsoleState {
  clients: Vec<Client>,
  notifications: Vec<Notification>,
  next_id: u64,
  claimed: bool,
}

/// Host for the command line: windows are tracked in memory and
/// notifications are printed.
#[derive(Debug, Default)]
pub struct ConsoleHost {
  state: Mutex<ConsoleState>,
}

impl ConsoleHost {
  pub fn new() -> Self {
    Self::default()
  }

  fn with_state<T>(&self, f: impl FnOnce(&mut ConsoleState) -> T) -> Result<T> {
    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(f(&mut state))
  }
}

impl ClientHost for ConsoleHost {
  async fn claim(&self) -> Result<()> {
    let count = self.with_state(|s| {
      s.claimed = true;
      s.clients.len()
    })?;
    info!(clients = count, "Claimed clients");
    Ok(())
  }

  async fn match_clients(&self) -> Result<Vec<Client>> {
    self.with_state(|s| {
      let mut clients = s.clients.clone();
      clients.sort_by_key(|c| !c.focused);
      clients
    })
  }

  async fn focus(&self, client_id: u64) -> Result<()> {
    let found = self.with_state(|s| {
      let mut found = false;
      for client in &mut s.clients {
        client.focused = client.id == client_id;
        found |= client.focused;
      }
      found
    })?;
    if !found {
      return Err(eyre!("No client with id {}", client_id));
    }
    info!(client = client_id, "Focused client");
    Ok(())
  }

  async fn open_window(&self, url: &str) -> Result<Client> {
    let client = self.with_state(|s| {
      s.next_id += 1;
      for c in &mut s.clients {
        c.focused = false;
      }
      let client = Client {
        id: s.next_id,
        url: url.to_string(),
        focused: true,
      };
      s.clients.push(client.clone());
      client
    })?;
    info!(client = client.id, url, "Opened window");
    Ok(client)
  }

  async fn show_notification(&self, notification: Notification) -> Result<()> {
    println!(
      "[{}] {}: {}",
      notification.tag, notification.title, notification.body
    );
    self.with_state(|s| {
      s.notifications.retain(|n| n.tag != notification.tag);
      s.notifications.push(notification);
    })
  }

  async fn close_notification(&self, tag: &str) -> Result<()> {
    self.with_state(|s| s.notifications.retain(|n| n.tag != tag))
  }
}
