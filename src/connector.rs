//! Outbound round trips to origin servers.
//!
//! The connector dials a fresh TCP connection per request, upgrades it to
//! TLS for `https` URIs and hands back the parsed response head together
//! with a streaming body reader still attached to the socket.

use crate::dns::DnsResolver;
use crate::errors::{Error, Result};
use crate::message::{self, Request, Response};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

/// A plain or TLS wrapped origin connection.
pub enum OriginStream {
  /// Cleartext TCP connection.
  Plain(TcpStream),
  /// TLS session on top of TCP.
  Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for OriginStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      OriginStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
      OriginStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for OriginStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    match self.get_mut() {
      OriginStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
      OriginStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      OriginStream::Plain(s) => Pin::new(s).poll_flush(cx),
      OriginStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      OriginStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
      OriginStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
    }
  }
}

/// Dials origin servers and performs HTTP/1.1 round trips.
#[derive(Clone)]
pub struct Connector {
  tls: TlsConnector,
  resolver: Option<DnsResolver>,
}

impl Connector {
  /// Build a connector trusting the platform certificate store.
  pub fn new(resolver: Option<DnsResolver>) -> Self {
    let mut roots = RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs().certs;
    for cert in certs {
      let _ = roots.add(cert);
    }
    let config = ClientConfig::builder()
      .with_root_certificates(roots)
      .with_no_client_auth();
    Connector {
      tls: TlsConnector::from(Arc::new(config)),
      resolver,
    }
  }

  /// Send `request` to its origin and parse the response head.
  ///
  /// The returned response carries a streaming body reader over the origin
  /// socket; the caller decides how to drain it.
  pub async fn round_trip(&self, request: &Request) -> Result<Response<BufReader<OriginStream>>> {
    let uri = request.uri();
    let host = uri
      .host()
      .ok_or_else(|| Error::proxy("outbound request without a host"))?
      .to_string();
    let https = request.scheme() == "https";
    let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

    let stream = self.dial(&host, port).await?;
    let mut stream = if https {
      let server_name = ServerName::try_from(host.clone())
        .map_err(|_| Error::proxy(format!("invalid server name: {host}")))?;
      let tls_stream = self
        .tls
        .connect(server_name, stream)
        .await
        .map_err(|e| Error::proxy(format!("tls handshake with {host}:{port} failed: {e}")))?;
      OriginStream::Tls(Box::new(tls_stream))
    } else {
      OriginStream::Plain(stream)
    };

    stream.write_all(&request.to_wire()).await?;
    stream.flush().await?;

    message::read_response(BufReader::new(stream), request.method()).await
  }

  async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
    // IP literals and the default resolver go straight to the OS.
    if let Some(resolver) = &self.resolver {
      if host.parse::<std::net::IpAddr>().is_err() {
        let addr = resolver.resolve_one(host, port).await?;
        return TcpStream::connect(addr)
          .await
          .map_err(|e| Error::proxy(format!("connect to {addr} failed: {e}")));
      }
    }
    TcpStream::connect((host, port))
      .await
      .map_err(|e| Error::proxy(format!("connect to {host}:{port} failed: {e}")))
  }
}
