//! Proxy runtime: accept loops and the per-request forwarding path.
//!
//! Every inbound connection gets its own task. A request travels through
//! the directors, out to the origin, back through the interceptors and is
//! streamed to the client while each registered body writer receives a copy
//! of the bytes. Hook registries are populated before the listeners start
//! and are read-only afterwards.

use crate::ca::CertAuthority;
use crate::connector::Connector;
use crate::errors::{Error, Result};
use crate::hooks::{
  BodySink, BodyWriter, Director, Exchange, HookLogger, InterceptedResponse, Interceptor,
};
use crate::message::{self, BodyReader, Request};
use bytes::Bytes;
use http::uri::Authority;
use http::{HeaderValue, StatusCode, Uri, Version};
use std::net::SocketAddr;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_rustls::LazyConfigAcceptor;

const STREAM_BUF_SIZE: usize = 16 * 1024;

/// Headers that must not travel from the client connection to the origin.
const HOP_BY_HOP: &[http::HeaderName] = &[
  http::header::CONNECTION,
  http::header::TE,
  http::header::TRAILER,
  http::header::TRANSFER_ENCODING,
  http::header::UPGRADE,
];

/// The interception engine shared by all listeners.
///
/// Hooks are appended during startup; there is no remove operation.
pub struct Proxy {
  connector: Connector,
  directors: Vec<Box<dyn Director>>,
  interceptors: Vec<Box<dyn Interceptor>>,
  writers: Vec<Box<dyn BodyWriter>>,
  loggers: Vec<Box<dyn HookLogger>>,
}

impl Proxy {
  /// Create a proxy forwarding through `connector`.
  pub fn new(connector: Connector) -> Self {
    Proxy {
      connector,
      directors: Vec::new(),
      interceptors: Vec::new(),
      writers: Vec::new(),
      loggers: Vec::new(),
    }
  }

  /// Append a director to the request chain.
  pub fn add_director(&mut self, director: Box<dyn Director>) {
    self.directors.push(director);
  }

  /// Append an interceptor to the response chain.
  pub fn add_interceptor(&mut self, interceptor: Box<dyn Interceptor>) {
    self.interceptors.push(interceptor);
  }

  /// Append a body writer; its sinks receive a copy of every response body.
  pub fn add_body_writer(&mut self, writer: Box<dyn BodyWriter>) {
    self.writers.push(writer);
  }

  /// Append a logger observing completed exchanges.
  pub fn add_logger(&mut self, logger: Box<dyn HookLogger>) {
    self.loggers.push(logger);
  }

  /// Accept plaintext HTTP connections until the listener fails or closes.
  pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "listening for HTTP requests");
    loop {
      let (stream, peer) = listener.accept().await?;
      let proxy = self.clone();
      tokio::spawn(async move {
        if let Err(e) = proxy.handle_connection(stream, peer, "http").await {
          tracing::debug!(peer = %peer, "connection ended: {e}");
        }
      });
    }
  }

  /// Accept TLS connections, minting a leaf for each SNI via `authority`.
  pub async fn serve_tls(
    self: Arc<Self>,
    listener: TcpListener,
    authority: Arc<CertAuthority>,
  ) -> Result<()> {
    tracing::info!(
      addr = %listener.local_addr()?,
      "listening for HTTP requests (SSL/TLS mode)"
    );
    loop {
      let (stream, peer) = listener.accept().await?;
      let proxy = self.clone();
      let authority = authority.clone();
      tokio::spawn(async move {
        if let Err(e) = proxy.handle_tls_connection(stream, peer, authority).await {
          tracing::debug!(peer = %peer, "tls connection ended: {e}");
        }
      });
    }
  }

  async fn handle_tls_connection(
    self: Arc<Self>,
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    authority: Arc<CertAuthority>,
  ) -> Result<()> {
    let acceptor = LazyConfigAcceptor::new(
      tokio_rustls::rustls::server::Acceptor::default(),
      stream,
    );
    let start = acceptor.await?;
    let sni = start
      .client_hello()
      .server_name()
      .ok_or_else(|| Error::invalid_request("client hello carries no server name"))?
      .to_string();

    // A failed mint aborts this handshake only.
    let leaf = authority.get_or_create(&sni).await?;
    let config = leaf.server_config()?;
    let tls_stream = start.into_stream(Arc::new(config)).await?;

    self.handle_connection(tls_stream, peer, "https").await
  }

  /// Serve sequential keep-alive requests off one client connection.
  async fn handle_connection<S>(
    self: Arc<Self>,
    stream: S,
    peer: SocketAddr,
    scheme: &'static str,
  ) -> Result<()>
  where
    S: AsyncRead + AsyncWrite + Send + Unpin,
  {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    loop {
      let request = match message::read_request(&mut reader).await {
        Ok(Some(request)) => request,
        Ok(None) => break,
        Err(e) => {
          tracing::debug!(peer = %peer, "unreadable request: {e}");
          let _ = write_empty_response(&mut write_half, StatusCode::BAD_REQUEST).await;
          break;
        }
      };
      let keep_alive = message::wants_keep_alive(&request);
      let must_close = self
        .proxy_request(&mut write_half, request, peer, scheme)
        .await?;
      if must_close || !keep_alive {
        break;
      }
    }
    Ok(())
  }

  /// Forward one request and fan out its side effects.
  ///
  /// Returns whether the client connection has to close afterwards, either
  /// because the response body was delimited by EOF or because the client
  /// copy failed.
  async fn proxy_request<W>(
    &self,
    client: &mut W,
    mut request: Request,
    peer: SocketAddr,
    scheme: &'static str,
  ) -> Result<bool>
  where
    W: AsyncWrite + Send + Unpin,
  {
    if let Err(e) = prepare_outbound(&mut request, scheme) {
      tracing::debug!(peer = %peer, "rejecting request: {e}");
      write_empty_response(client, StatusCode::BAD_REQUEST).await?;
      return Ok(true);
    }

    for director in &self.directors {
      if let Err(e) = director.direct(&mut request).await {
        tracing::warn!("director: {e}");
      }
    }

    // Directors may have replaced the body; the framing headers follow it.
    sync_body_headers(&mut request);

    let started_at = OffsetDateTime::now_utc();
    let response = match self.connector.round_trip(&request).await {
      Ok(response) => response,
      Err(e) => {
        tracing::warn!(url = %request.uri(), "round trip: {e}");
        write_empty_response(client, StatusCode::INTERNAL_SERVER_ERROR).await?;
        return Ok(false);
      }
    };

    let (status, headers, body) = response.into_parts();
    let mut intercepted = InterceptedResponse {
      status,
      headers,
      body_override: None,
    };
    for interceptor in &self.interceptors {
      if let Err(e) = interceptor.intercept(&mut intercepted).await {
        tracing::warn!("interceptor: {e}");
      }
    }

    let InterceptedResponse {
      status,
      mut headers,
      body_override,
    } = intercepted;

    // Settle on the byte source and fix the framing headers accordingly.
    let mut must_close = false;
    let source = match body_override {
      Some(bytes) => {
        headers.remove(http::header::TRANSFER_ENCODING);
        headers.insert(
          http::header::CONTENT_LENGTH,
          HeaderValue::from_str(&bytes.len().to_string())?,
        );
        Source::Full(bytes)
      }
      None => {
        if body.is_close_delimited() {
          // The de-framed copy has no length marker, the connection close
          // delimits it for the client.
          headers.remove(http::header::TRANSFER_ENCODING);
          headers.remove(http::header::CONTENT_LENGTH);
          headers.insert(http::header::CONNECTION, HeaderValue::from_static("close"));
          must_close = true;
        }
        Source::Stream(body)
      }
    };

    message::write_response_head(client, status, &headers).await?;

    let exchange = Exchange {
      origin: peer,
      request,
      status,
      response_headers: headers,
      started_at,
    };

    let mut sinks: Vec<Box<dyn BodySink>> = Vec::with_capacity(self.writers.len());
    for writer in &self.writers {
      match writer.new_write_closer(&exchange) {
        Ok(sink) => sinks.push(sink),
        Err(e) => tracing::warn!("body writer: {e}"),
      }
    }

    let mut client_ok = true;
    match source {
      Source::Full(bytes) => {
        if let Err(e) = client.write_all(&bytes).await {
          tracing::debug!("client write: {e}");
          client_ok = false;
        }
        sinks.retain_mut(|sink| match sink.write(&bytes) {
          Ok(()) => true,
          Err(e) => {
            tracing::warn!("sink write: {e}");
            false
          }
        });
      }
      Source::Stream(mut reader) => {
        let mut buf = vec![0u8; STREAM_BUF_SIZE];
        loop {
          let n = match reader.next_chunk(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
              // The body never completed; no sink may emit a record for
              // this transaction, so they are dropped unclosed.
              tracing::warn!(url = %exchange.request.uri(), "origin body: {e}");
              drop(sinks);
              let _ = client.flush().await;
              return Ok(true);
            }
          };
          if client_ok {
            if let Err(e) = client.write_all(&buf[..n]).await {
              tracing::debug!("client write: {e}");
              client_ok = false;
            }
          }
          sinks.retain_mut(|sink| match sink.write(&buf[..n]) {
            Ok(()) => true,
            Err(e) => {
              tracing::warn!("sink write: {e}");
              false
            }
          });
        }
      }
    }
    if client_ok {
      client.flush().await?;
    } else {
      must_close = true;
    }

    // Closing is the signal that turns buffered bytes into a record.
    for sink in sinks {
      if let Err(e) = sink.close().await {
        tracing::warn!("sink close: {e}");
      }
    }

    for logger in &self.loggers {
      if let Err(e) = logger.log(&exchange).await {
        tracing::warn!("logger: {e}");
      }
    }

    Ok(must_close)
  }
}

enum Source<R> {
  Full(Bytes),
  Stream(BodyReader<R>),
}

/// Turn the inbound request into the outbound one: absolute URI with the
/// listener scheme, HTTP/1.1, a matching `Host` header and no hop-by-hop
/// headers.
fn prepare_outbound(request: &mut Request, scheme: &'static str) -> Result<()> {
  let authority: Authority = match request.uri().authority() {
    Some(authority) => authority.clone(),
    None => request
      .headers()
      .get(http::header::HOST)
      .and_then(|v| v.to_str().ok())
      .and_then(|v| v.parse().ok())
      .ok_or_else(|| Error::invalid_request("request without host"))?,
  };

  let path_and_query = request
    .uri()
    .path_and_query()
    .map(|pq| pq.as_str())
    .unwrap_or("/")
    .to_string();
  let uri = Uri::builder()
    .scheme(scheme)
    .authority(authority.as_str())
    .path_and_query(path_and_query)
    .build()?;
  request.set_uri(uri);
  request.set_version(Version::HTTP_11);

  for name in HOP_BY_HOP {
    request.headers_mut().remove(name);
  }
  request.headers_mut().insert(
    http::header::HOST,
    HeaderValue::from_str(authority.as_str())?,
  );
  Ok(())
}

/// Keep the outbound framing headers in line with the buffered body.
fn sync_body_headers(request: &mut Request) {
  match request.body() {
    Some(body) => {
      let len = body.len().to_string();
      if let Ok(value) = HeaderValue::from_str(&len) {
        request.headers_mut().insert(http::header::CONTENT_LENGTH, value);
      }
    }
    None => {
      request.headers_mut().remove(http::header::CONTENT_LENGTH);
    }
  }
}

async fn write_empty_response<W: AsyncWrite + Unpin>(
  writer: &mut W,
  status: StatusCode,
) -> Result<()> {
  let mut headers = http::HeaderMap::new();
  headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from_static("0"));
  message::write_response_head(writer, status, &headers).await?;
  writer.flush().await?;
  Ok(())
}
