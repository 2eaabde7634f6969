//! Capture records and the body sink that produces them.
//!
//! A [`RecordBuilder`] accumulates the response bytes that stream to the
//! client and, on close, assembles exactly one immutable [`Record`] and
//! sends it down a bounded channel. A full channel blocks the producing
//! handler task instead of dropping records.

pub mod keywords;

use crate::errors::{Error, Result};
use crate::hooks::{BodySink, BodyWriter, Exchange};
use crate::sniff;
use bytes::Bytes;
use http::HeaderMap;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::OffsetDateTime;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Capacity of the record channel between builders and the store consumer.
pub const RECORD_CHANNEL_CAPACITY: usize = 256;

/// Header multimap that round-trips through JSON as `{name: [values...]}`.
#[derive(Clone, Debug, Default)]
pub struct Headers(pub HeaderMap);

impl Headers {
  /// Whether the map carries no headers at all.
  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl Serialize for Headers {
  fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(None)?;
    for name in self.0.keys() {
      let values: Vec<&str> = self
        .0
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
      map.serialize_entry(name.as_str(), &values)?;
    }
    map.end()
  }
}

impl<'de> Deserialize<'de> for Headers {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
    struct HeadersVisitor;

    impl<'de> Visitor<'de> for HeadersVisitor {
      type Value = Headers;

      fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("a map of header names to lists of values")
      }

      fn visit_map<A: MapAccess<'de>>(
        self,
        mut access: A,
      ) -> std::result::Result<Self::Value, A::Error> {
        let mut headers = HeaderMap::new();
        while let Some((name, values)) = access.next_entry::<String, Vec<String>>()? {
          let name: http::HeaderName = name.parse().map_err(serde::de::Error::custom)?;
          for value in values {
            let value: http::HeaderValue = value.parse().map_err(serde::de::Error::custom)?;
            headers.append(name.clone(), value);
          }
        }
        Ok(Headers(headers))
      }
    }

    deserializer.deserialize_map(HeadersVisitor)
  }
}

fn id_is_unassigned(id: &u64) -> bool {
  *id == 0
}

/// The metadata half of a capture record, everything except the blobs.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordMeta {
  /// Store row id, assigned on insert; 0 until then.
  #[serde(default, skip_serializing_if = "id_is_unassigned")]
  pub id: u64,
  /// External primary key, chosen at construction.
  pub uuid: Uuid,
  /// Remote socket address of the client.
  pub origin: String,
  /// Request method.
  pub method: String,
  /// Response status code.
  pub status: u16,
  /// Content type sniffed from the response body prefix. Deliberately
  /// independent of the `Content-Type` header, which often lies.
  pub content_type: String,
  /// Observed byte count of the response body.
  pub content_length: u64,
  /// Host of the forwarded request.
  pub host: String,
  /// Full request URL.
  pub url: String,
  /// URL path.
  pub path: String,
  /// Request scheme.
  pub scheme: String,
  /// When the outbound request was sent.
  #[serde(with = "time::serde::rfc3339")]
  pub date_start: OffsetDateTime,
  /// When the response body finished streaming.
  #[serde(with = "time::serde::rfc3339")]
  pub date_end: OffsetDateTime,
  /// Nanoseconds between `date_start` and `date_end`.
  pub time_taken: i64,
  /// Response headers. Empty in metadata-only projections.
  #[serde(default, skip_serializing_if = "Headers::is_empty")]
  pub header: Headers,
  /// Request headers. Empty in metadata-only projections.
  #[serde(default, skip_serializing_if = "Headers::is_empty")]
  pub request_header: Headers,
}

/// A complete capture record, immutable once delivered to the sink.
#[derive(Clone, Debug)]
pub struct Record {
  /// Metadata columns.
  pub meta: RecordMeta,
  /// Derived search keyword blob.
  pub keywords: Vec<u8>,
  /// Raw request body octets, possibly compressed as received.
  pub request_body: Bytes,
  /// Raw response body octets, possibly compressed as received.
  pub body: Bytes,
}

/// The body writer plugged into the proxy by the capture pipeline.
///
/// Each response gets its own [`RecordBuilder`] writing into the shared
/// record channel.
pub struct Capture {
  tx: mpsc::Sender<Record>,
}

impl Capture {
  /// Create the capture hook and the receiving end of its record channel.
  pub fn channel() -> (Self, mpsc::Receiver<Record>) {
    let (tx, rx) = mpsc::channel(RECORD_CHANNEL_CAPACITY);
    (Capture { tx }, rx)
  }
}

#[cfg(test)]
impl Capture {
  pub(crate) async fn send_for_test(&self, record: Record) {
    self.tx.send(record).await.expect("record channel open");
  }
}

impl BodyWriter for Capture {
  fn new_write_closer(&self, exchange: &Exchange) -> Result<Box<dyn BodySink>> {
    Ok(Box::new(RecordBuilder {
      exchange: exchange.clone(),
      buffer: Vec::new(),
      tx: self.tx.clone(),
    }))
  }
}

/// Accumulates one response body and emits one record on close.
pub struct RecordBuilder {
  exchange: Exchange,
  buffer: Vec<u8>,
  tx: mpsc::Sender<Record>,
}

impl RecordBuilder {
  fn into_record(self) -> Record {
    let request = &self.exchange.request;
    let request_body = request.body().cloned().unwrap_or_default();
    let date_end = OffsetDateTime::now_utc();
    let date_start = self.exchange.started_at;

    let keywords = keywords::extract(&[&self.buffer, &request_body]);
    let content_type = sniff::detect_content_type(&self.buffer).to_string();

    Record {
      meta: RecordMeta {
        id: 0,
        uuid: Uuid::new_v4(),
        origin: self.exchange.origin.to_string(),
        method: request.method().to_string(),
        status: self.exchange.status.as_u16(),
        content_type,
        content_length: self.buffer.len() as u64,
        host: request.host(),
        url: request.uri().to_string(),
        path: request.uri().path().to_string(),
        scheme: request.scheme().to_string(),
        date_start,
        date_end,
        time_taken: ((date_end - date_start).whole_nanoseconds()) as i64,
        header: Headers(self.exchange.response_headers.clone()),
        request_header: Headers(request.headers().clone()),
      },
      keywords,
      request_body,
      body: Bytes::from(self.buffer),
    }
  }
}

#[async_trait::async_trait]
impl BodySink for RecordBuilder {
  fn write(&mut self, buf: &[u8]) -> Result<()> {
    self.buffer.extend_from_slice(buf);
    Ok(())
  }

  async fn close(self: Box<Self>) -> Result<()> {
    let tx = self.tx.clone();
    let record = self.into_record();
    tx.send(record).await.map_err(|_| Error::ChannelClosed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::message::Request;
  use http::StatusCode;
  use std::net::SocketAddr;

  fn sample_exchange() -> Exchange {
    let mut request = Request::default();
    request.set_method(http::Method::GET);
    request.set_uri("http://example.test/".parse().unwrap());
    let mut response_headers = HeaderMap::new();
    response_headers.insert("content-type", "text/html".parse().unwrap());
    Exchange {
      origin: "127.0.0.1:5000".parse::<SocketAddr>().unwrap(),
      request,
      status: StatusCode::OK,
      response_headers,
      started_at: OffsetDateTime::now_utc(),
    }
  }

  #[tokio::test]
  async fn close_emits_exactly_one_record() {
    let (capture, mut rx) = Capture::channel();
    let exchange = sample_exchange();
    let mut sink = capture.new_write_closer(&exchange).unwrap();
    sink.write(b"hel").unwrap();
    sink.write(b"lo").unwrap();
    sink.close().await.unwrap();

    let record = rx.recv().await.unwrap();
    assert_eq!(record.body.as_ref(), b"hello");
    assert_eq!(record.meta.content_length, 5);
    assert_eq!(record.meta.status, 200);
    assert_eq!(record.meta.method, "GET");
    assert_eq!(record.meta.scheme, "http");
    assert_eq!(record.meta.host, "example.test");
    assert_eq!(record.meta.path, "/");
    assert_eq!(record.meta.content_type, "text/plain; charset=utf-8");
    assert!(record.meta.time_taken >= 0);
    // Exactly one record per close.
    assert!(rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn dropped_builder_emits_nothing() {
    let (capture, mut rx) = Capture::channel();
    let exchange = sample_exchange();
    let mut sink = capture.new_write_closer(&exchange).unwrap();
    sink.write(b"partial").unwrap();
    drop(sink);
    assert!(rx.try_recv().is_err());
  }

  #[tokio::test]
  async fn uuids_are_unique_across_records() {
    let (capture, mut rx) = Capture::channel();
    let exchange = sample_exchange();
    let mut seen = std::collections::HashSet::new();
    for _ in 0..1000 {
      let sink = capture.new_write_closer(&exchange).unwrap();
      sink.close().await.unwrap();
      let record = rx.recv().await.unwrap();
      assert!(seen.insert(record.meta.uuid));
    }
  }

  #[test]
  fn headers_round_trip_through_json() {
    let mut map = HeaderMap::new();
    map.append("set-cookie", "a=1".parse().unwrap());
    map.append("set-cookie", "b=2".parse().unwrap());
    map.insert("content-type", "text/plain".parse().unwrap());
    let json = serde_json::to_string(&Headers(map)).unwrap();
    let back: Headers = serde_json::from_str(&json).unwrap();
    let cookies: Vec<_> = back.0.get_all("set-cookie").iter().collect();
    assert_eq!(cookies.len(), 2);
    assert_eq!(back.0.get("content-type").unwrap(), "text/plain");
  }

  #[test]
  fn meta_json_hides_unassigned_id() {
    let exchange = sample_exchange();
    let record = RecordBuilder {
      exchange,
      buffer: b"x".to_vec(),
      tx: Capture::channel().0.tx,
    }
    .into_record();
    let json = serde_json::to_value(&record.meta).unwrap();
    assert!(json.get("id").is_none());
    assert!(json.get("uuid").is_some());
  }
}
