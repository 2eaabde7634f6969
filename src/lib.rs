#![deny(missing_docs)]

//! # hyperfox
//!
//! An intercepting HTTP/HTTPS proxy that sits between clients and origin
//! servers, captures every exchanged request/response pair, persists it to
//! a searchable local store and streams new captures to live subscribers.
//!
//! TLS interception is transparent: for each inbound TLS connection the
//! proxy mints a host-specific leaf certificate signed by an
//! operator-supplied root CA, so unmodified clients trusting that root can
//! be observed end-to-end.
//!
//! ## Building a proxy
//!
//! ```rust,no_run
//! use hyperfox::capture::Capture;
//! use hyperfox::connector::Connector;
//! use hyperfox::proxy::Proxy;
//! use std::sync::Arc;
//!
//! # async fn run() -> hyperfox::Result<()> {
//! let (capture, records) = Capture::channel();
//! let mut proxy = Proxy::new(Connector::new(None));
//! proxy.add_body_writer(Box::new(capture));
//! let proxy = Arc::new(proxy);
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:1080").await?;
//! proxy.serve(listener).await?;
//! # Ok(())
//! # }
//! ```
//!
//! The pieces compose around four hook kinds on the forwarding path:
//! directors mutate outgoing requests, interceptors mutate received
//! responses, body writers receive a copy of every response body and
//! loggers observe finished exchanges. The capture pipeline is just a body
//! writer whose sinks emit immutable records into a bounded channel.

/// HTTP API over the capture store and the live channel.
pub mod api;
/// On-the-fly certificate authority.
pub mod ca;
/// Capture records, the record builder and keyword extraction.
pub mod capture;
/// Outbound dialing and round trips.
pub mod connector;
/// Custom DNS resolution for the outbound dialer.
pub mod dns;
/// Crate error types.
pub mod errors;
/// Hook interfaces on the forwarding path.
pub mod hooks;
/// Live notification channel to UI subscribers.
pub mod live;
/// HTTP/1.1 message types and wire codec.
pub mod message;
/// Proxy runtime and listeners.
pub mod proxy;
/// Capture pipeline consumer.
pub mod sink;
/// Content type sniffing.
pub mod sniff;
/// Durable record store.
pub mod store;
/// Placeholder UI server.
pub mod ui;

pub use errors::{Error, Result};
