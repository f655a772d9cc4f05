//! Out-of-band events: background sync, push delivery, notification clicks.

use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::host::{ClientHost, Notification};

/// Extension point for deferred work queued while offline.
///
/// The queue itself belongs to the application; the worker only tells it
/// when to flush.
pub trait OfflineQueue: Send + Sync {
  fn flush(&self) -> impl Future<Output = Result<()>> + Send;
}

/// Queue that holds nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopQueue;

impl OfflineQueue for NoopQueue {
  async fn flush(&self) -> Result<()> {
    debug!("Offline queue is empty, nothing to sync");
    Ok(())
  }
}

/// Push message body. Every field is optional.
#[derive(Debug, Default)]
pub struct PushPayload {
  pub title: Option<String>,
  pub body: Option<String>,
  pub tag: Option<String>,
  pub data: serde_json::Value,
}

impl PushPayload {
  /// Parse a raw push message.
  ///
  /// An empty message yields all defaults; a message that is not a JSON
  /// object is shown as the notification body. Fields of the wrong type
  /// fall back to their defaults one by one.
  pub fn parse(raw: &[u8]) -> Self {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.is_empty() {
      return Self::default();
    }

    let mut object = match serde_json::from_str(text) {
      Ok(serde_json::Value::Object(object)) => object,
      Ok(_) => {
        warn!("Push payload is not a JSON object, using it as text");
        return Self::as_text(text);
      }
      Err(e) => {
        warn!(error = %e, "Push payload is not JSON, using it as text");
        return Self::as_text(text);
      }
    };

    let mut field = |name: &str| match object.remove(name) {
      Some(serde_json::Value::String(value)) => Some(value),
      Some(serde_json::Value::Null) | None => None,
      Some(other) => {
        warn!(field = name, value = %other, "Ignoring push field that is not a string");
        None
      }
    };

    Self {
      title: field("title"),
      body: field("body"),
      tag: field("tag"),
      data: object.remove("data").unwrap_or_default(),
    }
  }

  fn as_text(text: &str) -> Self {
    Self {
      body: Some(text.to_string()),
      ..Self::default()
    }
  }

  /// Fill in missing fields from configuration.
  pub fn into_notification(self, config: &Config) -> Notification {
    let defaults = &config.notification;
    Notification {
      title: self.title.unwrap_or_else(|| config.app_name.clone()),
      body: self.body.unwrap_or_else(|| defaults.default_body.clone()),
      tag: self.tag.unwrap_or_else(|| defaults.default_tag.clone()),
      icon: defaults.icon.clone(),
      badge: defaults.badge.clone(),
      data: self.data,
    }
  }
}

/// Handlers decoupled from the request path.
pub struct BackgroundChannels<Q: OfflineQueue> {
  config: Config,
  queue: Arc<Q>,
}

impl<Q: OfflineQueue> BackgroundChannels<Q> {
  pub fn new(config: Config, queue: Arc<Q>) -> Self {
    Self { config, queue }
  }

  /// Returns whether the tag was recognized.
  pub async fn on_sync(&self, tag: &str) -> Result<bool> {
    if tag != self.config.sync_tag {
      debug!(tag, "Ignoring unknown sync tag");
      return Ok(false);
    }
    info!(tag, "Background sync fired");
    self.queue.flush().await?;
    Ok(true)
  }

  pub async fn on_push<H: ClientHost>(&self, host: &H, raw: &[u8]) -> Result<Notification> {
    let notification = PushPayload::parse(raw).into_notification(&self.config);
    info!(tag = %notification.tag, title = %notification.title, "Push received");
    host.show_notification(notification.clone()).await?;
    Ok(notification)
  }

  /// Close the notification, then focus an open window or open one at the root.
  ///
  /// Returns the id of the client that ends up focused.
  pub async fn on_notification_click<H: ClientHost>(&self, host: &H, tag: &str) -> Result<u64> {
    host.close_notification(tag).await?;

    let clients = host.match_clients().await?;
    let root = self.config.resolve("/")?;
    let existing = clients
      .iter()
      .find(|c| c.url == "/" || c.url == root.as_str())
      .or_else(|| clients.first());

    match existing {
      Some(client) => {
        host.focus(client.id).await?;
        Ok(client.id)
      }
      None => Ok(host.open_window("/").await?.id),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::RecordingHost;
  use std::sync::atomic::{AtomicU32, Ordering};

  #[derive(Default, Clone)]
  struct CountingQueue(Arc<AtomicU32>);

  impl OfflineQueue for CountingQueue {
    async fn flush(&self) -> Result<()> {
      self.0.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
  }

  fn channels() -> BackgroundChannels<NoopQueue> {
    BackgroundChannels::new(Config::default(), Arc::new(NoopQueue))
  }

  #[test]
  fn test_parse_full_payload() {
    let payload = PushPayload::parse(
      br#"{"title":"Expense added","body":"Groceries $42","tag":"expense","data":{"id":7}}"#,
    );
    let notification = payload.into_notification(&Config::default());
    assert_eq!(notification.title, "Expense added");
    assert_eq!(notification.body, "Groceries $42");
    assert_eq!(notification.tag, "expense");
    assert_eq!(notification.data["id"], 7);
  }

  #[test]
  fn test_parse_applies_defaults() {
    let notification = PushPayload::parse(b"{}").into_notification(&Config::default());
    assert_eq!(notification.title, "Tandem");
    assert_eq!(notification.tag, "tandem-notification");
    assert_eq!(notification.icon, "/icon-192.png");
    assert!(notification.data.is_null());

    let empty = PushPayload::parse(b"").into_notification(&Config::default());
    assert_eq!(empty.title, "Tandem");
  }

  #[test]
  fn test_parse_plain_text() {
    let notification = PushPayload::parse(b"Pickup at 5").into_notification(&Config::default());
    assert_eq!(notification.body, "Pickup at 5");
    assert_eq!(notification.title, "Tandem");
  }

  #[test]
  fn test_parse_keeps_valid_fields_beside_bad_ones() {
    let notification =
      PushPayload::parse(br#"{"title":5,"body":"Pickup moved to 6"}"#).into_notification(&Config::default());
    assert_eq!(notification.title, "Tandem");
    assert_eq!(notification.body, "Pickup moved to 6");
    assert_eq!(notification.tag, "tandem-notification");
  }

  #[test]
  fn test_parse_json_scalar_is_text() {
    let notification = PushPayload::parse(b"42").into_notification(&Config::default());
    assert_eq!(notification.body, "42");
  }

  #[tokio::test]
  async fn test_sync_flushes_on_known_tag() {
    let queue = CountingQueue::default();
    let channels = BackgroundChannels::new(Config::default(), Arc::new(queue.clone()));

    assert!(channels.on_sync("sync-data").await.unwrap());
    assert!(!channels.on_sync("other").await.unwrap());
    assert_eq!(queue.0.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_push_shows_notification() {
    let host = RecordingHost::default();
    channels()
      .on_push(&host, br#"{"title":"Hi"}"#)
      .await
      .unwrap();

    let shown = host.notifications();
    assert_eq!(shown.len(), 1);
    assert_eq!(shown[0].title, "Hi");
  }

  #[tokio::test]
  async fn test_click_opens_root_when_no_window() {
    let host = RecordingHost::default();
    channels().on_notification_click(&host, "t").await.unwrap();

    assert_eq!(host.closed(), vec!["t"]);
    assert_eq!(host.opened(), vec!["/"]);
  }

  #[tokio::test]
  async fn test_click_focuses_existing_window() {
    let host = RecordingHost::default();
    host.add_client("http://localhost:3000/expenses");
    let root = host.add_client("http://localhost:3000/");

    let focused = channels().on_notification_click(&host, "t").await.unwrap();
    assert_eq!(focused, root);
    assert!(host.opened().is_empty());
    assert_eq!(host.focused(), vec![root]);
  }
}
