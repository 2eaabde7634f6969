//! Hook interfaces on the forwarding path.
//!
//! Four hook kinds run around every proxied transaction, in this order
//! relative to the request lifecycle:
//!
//! ```text
//! client -> Director -> origin
//! origin -> Interceptor -> (BodyWriter sinks) -> client -> Logger
//! ```
//!
//! Registries are append-only and populated before the listeners start, so
//! steady-state reads need no synchronization.

use crate::errors::Result;
use crate::message::Request;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use std::net::SocketAddr;
use time::OffsetDateTime;

/// A director may mutate the outgoing request before it is sent to the
/// origin server: headers, URI, method or body.
#[async_trait::async_trait]
pub trait Director: Send + Sync {
  /// Inspect and possibly rewrite the outbound request.
  async fn direct(&self, request: &mut Request) -> Result<()>;
}

/// Head of the origin response as presented to interceptors.
///
/// Interceptors may rewrite the status and headers in place and substitute
/// the body with [`InterceptedResponse::set_body`].
pub struct InterceptedResponse {
  /// Response status code.
  pub status: StatusCode,
  /// Response headers.
  pub headers: HeaderMap,
  /// A replacement body, when an interceptor chose to substitute one.
  pub body_override: Option<Bytes>,
}

impl InterceptedResponse {
  /// Substitute the response body. The original origin body is discarded
  /// and the replacement is what the client and the capture see.
  pub fn set_body<B: Into<Bytes>>(&mut self, body: B) {
    self.body_override = Some(body.into());
  }
}

/// An interceptor may mutate the received response before it reaches the
/// client.
#[async_trait::async_trait]
pub trait Interceptor: Send + Sync {
  /// Inspect and possibly rewrite the response head or substitute its body.
  async fn intercept(&self, response: &mut InterceptedResponse) -> Result<()>;
}

/// Everything a sink or logger may need to know about one transaction.
///
/// The exchange is assembled after interceptors ran and before the body
/// starts streaming; `started_at` is the instant the outbound request was
/// handed to the transport, not the instant the body ended.
#[derive(Clone)]
pub struct Exchange {
  /// Remote socket address of the client.
  pub origin: SocketAddr,
  /// The outbound request, after directors, with its retained body.
  pub request: Request,
  /// Response status after interceptors.
  pub status: StatusCode,
  /// Response headers after interceptors.
  pub response_headers: HeaderMap,
  /// When the round trip started.
  pub started_at: OffsetDateTime,
}

/// A write-and-close sink receiving a copy of the response body.
///
/// `close` is the signal that the body finished streaming; a sink whose
/// stream errored out is dropped without being closed.
#[async_trait::async_trait]
pub trait BodySink: Send {
  /// Append body bytes to the sink.
  fn write(&mut self, buf: &[u8]) -> Result<()>;
  /// Finalize the sink once the body reached EOF.
  async fn close(self: Box<Self>) -> Result<()>;
}

/// Factory producing one [`BodySink`] per response.
pub trait BodyWriter: Send + Sync {
  /// Supply the sink that will receive a copy of this response body.
  /// An error skips this sink only; the other writers still run.
  fn new_write_closer(&self, exchange: &Exchange) -> Result<Box<dyn BodySink>>;
}

/// A logger observes the completed exchange after the client was served.
/// It must not mutate anything.
#[async_trait::async_trait]
pub trait HookLogger: Send + Sync {
  /// Record the completed exchange.
  async fn log(&self, exchange: &Exchange) -> Result<()>;
}

/// A logger that emits one access line per transaction through `tracing`.
pub struct AccessLogger;

#[async_trait::async_trait]
impl HookLogger for AccessLogger {
  async fn log(&self, exchange: &Exchange) -> Result<()> {
    tracing::info!(
      origin = %exchange.origin,
      method = %exchange.request.method(),
      url = %exchange.request.uri(),
      status = exchange.status.as_u16(),
      "proxied"
    );
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct RewriteDirector;

  #[async_trait::async_trait]
  impl Director for RewriteDirector {
    async fn direct(&self, request: &mut Request) -> Result<()> {
      request.set_uri("https://rewritten.test/".parse().expect("static uri"));
      Ok(())
    }
  }

  #[tokio::test]
  async fn director_can_rewrite_uri() {
    let mut request = Request::default();
    request.set_uri("http://anything.test/foo".parse().unwrap());
    RewriteDirector.direct(&mut request).await.unwrap();
    assert_eq!(request.uri().to_string(), "https://rewritten.test/");
    assert_eq!(request.scheme(), "https");
  }

  struct FailureInterceptor;

  #[async_trait::async_trait]
  impl Interceptor for FailureInterceptor {
    async fn intercept(&self, response: &mut InterceptedResponse) -> Result<()> {
      response.status = StatusCode::INTERNAL_SERVER_ERROR;
      response.set_body("substituted");
      Ok(())
    }
  }

  #[tokio::test]
  async fn interceptor_can_substitute_body() {
    let mut response = InterceptedResponse {
      status: StatusCode::OK,
      headers: HeaderMap::new(),
      body_override: None,
    };
    FailureInterceptor.intercept(&mut response).await.unwrap();
    assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response.body_override.as_deref(), Some(b"substituted".as_ref()));
  }
}
