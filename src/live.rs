//! Live notification channel to UI subscribers.
//!
//! Each subscriber owns an outbound queue drained by a dedicated writer
//! task, so fan-out never blocks on a slow peer while the membership lock
//! is held. Any read or write failure evicts the subscriber.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Messages travel as already-encoded JSON text frames.
pub type Frame = String;

/// Mutex-guarded set of live subscribers.
#[derive(Default)]
pub struct LiveChannel {
  subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<Frame>>>,
  next_id: AtomicU64,
}

impl LiveChannel {
  /// Create an empty channel.
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a subscriber; the returned receiver feeds its socket writer.
  pub fn subscribe(&self) -> (u64, mpsc::UnboundedReceiver<Frame>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    self
      .subscribers
      .lock()
      .unwrap_or_else(std::sync::PoisonError::into_inner)
      .insert(id, tx);
    tracing::debug!(subscriber = id, "live subscriber connected");
    (id, rx)
  }

  /// Drop a subscriber after its socket closed or failed.
  pub fn unsubscribe(&self, id: u64) {
    if self
      .subscribers
      .lock()
      .unwrap_or_else(std::sync::PoisonError::into_inner)
      .remove(&id)
      .is_some()
    {
      tracing::debug!(subscriber = id, "live subscriber disconnected");
    }
  }

  /// Number of currently connected subscribers.
  pub fn len(&self) -> usize {
    self
      .subscribers
      .lock()
      .unwrap_or_else(std::sync::PoisonError::into_inner)
      .len()
  }

  /// Whether nobody is listening.
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Fan a JSON value out to every subscriber, evicting the dead ones.
  pub fn broadcast<T: serde::Serialize>(&self, message: &T) {
    let frame = match serde_json::to_string(message) {
      Ok(frame) => frame,
      Err(e) => {
        tracing::error!("failed to encode live message: {e}");
        return;
      }
    };
    let mut subscribers = self
      .subscribers
      .lock()
      .unwrap_or_else(std::sync::PoisonError::into_inner);
    subscribers.retain(|id, tx| {
      let alive = tx.send(frame.clone()).is_ok();
      if !alive {
        tracing::debug!(subscriber = id, "evicting dead live subscriber");
      }
      alive
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn broadcast_reaches_every_subscriber() {
    let channel = LiveChannel::new();
    let (_a, mut rx_a) = channel.subscribe();
    let (_b, mut rx_b) = channel.subscribe();

    channel.broadcast(&json!({ "last_record_id": 7 }));

    assert_eq!(rx_a.recv().await.unwrap(), r#"{"last_record_id":7}"#);
    assert_eq!(rx_b.recv().await.unwrap(), r#"{"last_record_id":7}"#);
  }

  #[tokio::test]
  async fn dead_subscribers_are_evicted() {
    let channel = LiveChannel::new();
    let (_a, rx_a) = channel.subscribe();
    let (_b, _rx_b) = channel.subscribe();
    assert_eq!(channel.len(), 2);

    drop(rx_a);
    channel.broadcast(&json!({ "last_record_id": 1 }));
    assert_eq!(channel.len(), 1);
  }

  #[tokio::test]
  async fn unsubscribe_removes_membership() {
    let channel = LiveChannel::new();
    let (id, _rx) = channel.subscribe();
    channel.unsubscribe(id);
    assert!(channel.is_empty());
  }
}
