//! Error types for the proxy, the certificate authority and the capture store.

use std::io;
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `hyperfox::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur while proxying, minting certificates or talking
/// to the capture store.
#[derive(ThisError, Debug)]
pub enum Error {
  /// IO error
  #[error(transparent)]
  Io(#[from] io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// TLS error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// SQLite error
  #[error(transparent)]
  Db(#[from] rusqlite::Error),
  /// Certificate minting or loading error
  #[error("certificate error: {0}")]
  Certificate(String),
  /// Configuration error (bad flags, missing root CA, unusable addresses)
  #[error("configuration error: {0}")]
  Config(String),
  /// Malformed inbound request
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  /// Forwarding error on the path to the origin server
  #[error("proxy error: {0}")]
  Proxy(String),
  /// The capture channel is closed, no record can be delivered
  #[error("capture channel closed")]
  ChannelClosed,
}

impl Error {
  /// Create a certificate error and log it.
  pub fn certificate<S: Into<String>>(msg: S) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create a configuration error and log it.
  pub fn config<S: Into<String>>(msg: S) -> Self {
    let error = Error::Config(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Create an invalid request error and log it.
  pub fn invalid_request<S: Into<String>>(msg: S) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a proxy error and log it.
  pub fn proxy<S: Into<String>>(msg: S) -> Self {
    let error = Error::Proxy(msg.into());
    tracing::warn!("{}", error);
    error
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::header::InvalidHeaderName> for Error {
  fn from(value: http::header::InvalidHeaderName) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::status::InvalidStatusCode> for Error {
  fn from(value: http::status::InvalidStatusCode) -> Self {
    Error::Http(http::Error::from(value))
  }
}

pub(crate) fn new_io_error(kind: io::ErrorKind, msg: &str) -> Error {
  Error::Io(io::Error::new(kind, msg))
}
