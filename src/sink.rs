//! Consumer side of the capture pipeline.
//!
//! Takes finished records off the builder channel, inserts them into the
//! store and announces each successful insert on the live channel. Inserts
//! run on their own tasks so a slow disk never stalls the channel.

use crate::capture::Record;
use crate::live::LiveChannel;
use crate::store::RecordStore;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Drain `rx` until every capture producer is gone.
///
/// Insert failures are logged and drop the record; the broadcast for that
/// record is suppressed.
pub async fn run(mut rx: mpsc::Receiver<Record>, store: RecordStore, live: Arc<LiveChannel>) {
  while let Some(record) = rx.recv().await {
    let store = store.clone();
    let live = live.clone();
    tokio::spawn(async move {
      let url = record.meta.url.clone();
      match store.insert(record).await {
        Ok(id) => {
          live.broadcast(&json!({ "last_record_id": id }));
        }
        Err(e) => {
          tracing::error!(url = %url, "failed to store capture record: {e}");
        }
      }
    });
  }
}
