//! Custom DNS resolution for the outbound dialer.
//!
//! When the operator supplies a resolver address, origin hostnames are
//! looked up against that server instead of the OS configuration. TLS SNI
//! and the `Host` header keep using the original hostname either way.

use crate::errors::{new_io_error, Result};
use hickory_resolver::config::{NameServerConfig, NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::TokioResolver;
use std::net::SocketAddr;
use std::sync::Arc;

const DEFAULT_DNS_PORT: u16 = 53;

/// A resolver pinned to an operator-chosen DNS server.
#[derive(Clone)]
pub struct DnsResolver {
  inner: Arc<TokioResolver>,
}

impl DnsResolver {
  /// Create a resolver for `server`, given as `host` or `host:port`.
  /// The port defaults to 53 when absent.
  pub fn new(server: &str) -> Result<Self> {
    if server.is_empty() {
      return Err(new_io_error(
        std::io::ErrorKind::InvalidInput,
        "dns server is empty",
      ));
    }
    let addr: SocketAddr = match server.parse() {
      Ok(addr) => addr,
      Err(_) => {
        let with_port = format!("{server}:{DEFAULT_DNS_PORT}");
        with_port.parse().map_err(|_| {
          new_io_error(
            std::io::ErrorKind::InvalidInput,
            &format!("invalid dns server address: {server}"),
          )
        })?
      }
    };

    let name_servers = vec![NameServerConfig::new(addr, Protocol::Udp)];
    let group = NameServerConfigGroup::from(name_servers);
    let config = ResolverConfig::from_parts(None, vec![], group);
    let resolver =
      TokioResolver::builder_with_config(config, TokioConnectionProvider::default()).build();

    Ok(Self {
      inner: Arc::new(resolver),
    })
  }

  /// Resolve `host` and return the first answer as a socket address.
  pub async fn resolve_one(&self, host: &str, port: u16) -> Result<SocketAddr> {
    let lookup = self
      .inner
      .lookup_ip(host)
      .await
      .map_err(|e| new_io_error(std::io::ErrorKind::Other, &e.to_string()))?;
    lookup
      .iter()
      .next()
      .map(|ip| SocketAddr::new(ip, port))
      .ok_or_else(|| {
        new_io_error(
          std::io::ErrorKind::NotFound,
          &format!("no addresses found for host: {host}"),
        )
      })
  }
}

impl std::fmt::Debug for DnsResolver {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DnsResolver").finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn appends_default_port() {
    assert!(DnsResolver::new("1.1.1.1").is_ok());
    assert!(DnsResolver::new("1.1.1.1:5353").is_ok());
  }

  #[test]
  fn rejects_garbage() {
    assert!(DnsResolver::new("").is_err());
    assert!(DnsResolver::new("not an address").is_err());
  }
}
