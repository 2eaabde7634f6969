//! On-the-fly certificate authority.
//!
//! For every hostname seen at SNI time the authority mints a leaf
//! certificate signed by the operator-supplied root CA, persists the pair
//! under `certs/<hostname>/` and caches the parsed material for the rest of
//! the process lifetime. Clients that trust the root CA out-of-band see a
//! valid chain for any intercepted host.

use crate::errors::{Error, Result};
use moka::future::Cache;
use rcgen::{
  CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
  KeyUsagePurpose, SanType, SerialNumber,
};
use rand::RngCore;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio::sync::Mutex;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;

/// Leaf certificates are valid from one week in the past, which absorbs
/// client clock skew.
const NOT_BEFORE_BACKDATE_DAYS: i64 = 7;
/// And for two years from that point.
const VALIDITY_DAYS: i64 = 730;

const CERT_FILE: &str = "cert.pem";
const KEY_FILE: &str = "key.pem";

/// A minted or loaded leaf certificate for one hostname.
pub struct LeafCert {
  /// Where the PEM encoded certificate lives on disk.
  pub cert_path: PathBuf,
  /// Where the PEM encoded private key lives on disk.
  pub key_path: PathBuf,
  /// Parsed chain presented to clients: leaf first, then the root.
  pub chain: Vec<CertificateDer<'static>>,
  /// Parsed private key matching the leaf.
  pub key: PrivateKeyDer<'static>,
}

impl LeafCert {
  /// Build a rustls server configuration presenting this leaf.
  pub fn server_config(&self) -> Result<ServerConfig> {
    let config = ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(self.chain.clone(), self.key.clone_key())?;
    Ok(config)
  }
}

/// Authority minting leaves for arbitrary hostnames, backed by the
/// operator's root CA.
pub struct CertAuthority {
  issuer: Issuer<'static, KeyPair>,
  root_cert_der: CertificateDer<'static>,
  cert_dir: PathBuf,
  /// Parsed leaves by normalized hostname; entries live for the whole
  /// process, nothing is evicted.
  cache: Cache<String, Arc<LeafCert>>,
  /// Serializes every mint-or-load path. Two concurrent SNI lookups for the
  /// same hostname must not race to write the same files.
  mint_lock: Mutex<()>,
}

impl CertAuthority {
  /// Load the root CA pair from PEM files and prepare the authority.
  ///
  /// A missing or unreadable root is fatal, interception cannot work
  /// without it.
  pub async fn from_files(
    root_cert_path: impl AsRef<Path>,
    root_key_path: impl AsRef<Path>,
    cert_dir: impl AsRef<Path>,
  ) -> Result<Self> {
    let cert_pem = fs::read_to_string(root_cert_path.as_ref())
      .await
      .map_err(|e| {
        Error::certificate(format!(
          "failed to read root CA certificate {}: {e}",
          root_cert_path.as_ref().display()
        ))
      })?;
    let key_pem = fs::read_to_string(root_key_path.as_ref()).await.map_err(|e| {
      Error::certificate(format!(
        "failed to read root CA key {}: {e}",
        root_key_path.as_ref().display()
      ))
    })?;

    let key_pair = KeyPair::from_pem(&key_pem)
      .map_err(|e| Error::certificate(format!("failed to parse root CA key: {e}")))?;
    let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
      .map_err(|e| Error::certificate(format!("failed to parse root CA certificate: {e}")))?;

    let root_cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
      .next()
      .ok_or_else(|| Error::certificate("no certificate found in root CA PEM"))?
      .map_err(|e| Error::certificate(format!("failed to decode root CA PEM: {e}")))?;

    Ok(Self {
      issuer,
      root_cert_der,
      cert_dir: cert_dir.as_ref().to_path_buf(),
      cache: Cache::builder().build(),
      mint_lock: Mutex::new(()),
    })
  }

  /// Return the leaf for `hostname`, minting and persisting one if neither
  /// the cache nor the disk has it yet.
  pub async fn get_or_create(&self, hostname: &str) -> Result<Arc<LeafCert>> {
    let name = normalize_hostname(hostname)?;

    if let Some(leaf) = self.cache.get(&name).await {
      return Ok(leaf);
    }

    let _guard = self.mint_lock.lock().await;
    // Another lookup may have minted while this one waited for the lock.
    if let Some(leaf) = self.cache.get(&name).await {
      return Ok(leaf);
    }

    let dir = self.cert_dir.join(&name);
    let cert_path = dir.join(CERT_FILE);
    let key_path = dir.join(KEY_FILE);

    let leaf = if fs::try_exists(&cert_path).await.unwrap_or(false)
      && fs::try_exists(&key_path).await.unwrap_or(false)
    {
      self.load_leaf(cert_path, key_path).await?
    } else {
      self.mint_leaf(&name, &dir, cert_path, key_path).await?
    };

    let leaf = Arc::new(leaf);
    self.cache.insert(name, leaf.clone()).await;
    Ok(leaf)
  }

  async fn load_leaf(&self, cert_path: PathBuf, key_path: PathBuf) -> Result<LeafCert> {
    let cert_pem = fs::read(&cert_path).await?;
    let key_pem = fs::read(&key_path).await?;

    let leaf_der = rustls_pemfile::certs(&mut cert_pem.as_slice())
      .next()
      .ok_or_else(|| Error::certificate("no certificate found in cached leaf PEM"))?
      .map_err(|e| Error::certificate(format!("failed to decode cached leaf PEM: {e}")))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
      .map_err(|e| Error::certificate(format!("failed to decode cached leaf key: {e}")))?
      .ok_or_else(|| Error::certificate("no private key found in cached leaf PEM"))?;

    Ok(LeafCert {
      cert_path,
      key_path,
      chain: vec![leaf_der, self.root_cert_der.clone()],
      key,
    })
  }

  async fn mint_leaf(
    &self,
    name: &str,
    dir: &Path,
    cert_path: PathBuf,
    key_path: PathBuf,
  ) -> Result<LeafCert> {
    let mut params = CertificateParams::default();

    let mut serial = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut serial);
    params.serial_number = Some(SerialNumber::from_slice(&serial));

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "Hyperfox Fake Certificates");
    dn.push(DnType::CommonName, name);
    params.distinguished_name = dn;

    params.subject_alt_names = if let Ok(ip) = name.parse::<IpAddr>() {
      vec![SanType::IpAddress(ip)]
    } else {
      vec![SanType::DnsName(name.try_into().map_err(|_| {
        Error::certificate(format!("hostname not usable as dNSName: {name}"))
      })?)]
    };

    let not_before = OffsetDateTime::now_utc() - Duration::days(NOT_BEFORE_BACKDATE_DAYS);
    params.not_before = not_before;
    params.not_after = not_before + Duration::days(VALIDITY_DAYS);

    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
      ExtendedKeyUsagePurpose::ServerAuth,
      ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.is_ca = IsCa::ExplicitNoCa;
    params.use_authority_key_identifier_extension = true;

    let key_pair = KeyPair::generate()
      .map_err(|e| Error::certificate(format!("failed to generate leaf key pair: {e}")))?;
    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::certificate(format!("failed to sign leaf for {name}: {e}")))?;

    persist_pair(dir, &cert_path, &key_path, &cert.pem(), &key_pair.serialize_pem()).await?;

    let leaf_der = CertificateDer::from(cert.der().to_vec());
    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::certificate("failed to serialize leaf key"))?;

    tracing::debug!(host = name, cert = %cert_path.display(), "minted leaf certificate");

    Ok(LeafCert {
      cert_path,
      key_path,
      chain: vec![leaf_der, self.root_cert_der.clone()],
      key,
    })
  }
}

/// Normalize a hostname the way leaves are keyed: IDNA-to-ASCII, lowercase.
/// IP literals pass through untouched.
pub fn normalize_hostname(hostname: &str) -> Result<String> {
  if hostname.parse::<IpAddr>().is_ok() {
    return Ok(hostname.to_string());
  }
  let ascii = idna::domain_to_ascii(hostname)
    .map_err(|e| Error::certificate(format!("invalid hostname {hostname}: {e}")))?;
  Ok(ascii.to_lowercase())
}

async fn persist_pair(
  dir: &Path,
  cert_path: &Path,
  key_path: &Path,
  cert_pem: &str,
  key_pem: &str,
) -> Result<()> {
  fs::create_dir_all(dir).await?;
  set_mode(dir, 0o755).await?;

  fs::write(cert_path, cert_pem.as_bytes()).await?;
  set_mode(cert_path, 0o644).await?;

  fs::write(key_path, key_pem.as_bytes()).await?;
  set_mode(key_path, 0o600).await?;

  Ok(())
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
  use std::os::unix::fs::PermissionsExt;
  fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
  Ok(())
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hostname_normalization() {
    assert_eq!(normalize_hostname("Example.TEST").unwrap(), "example.test");
    assert_eq!(normalize_hostname("127.0.0.1").unwrap(), "127.0.0.1");
    assert_eq!(normalize_hostname("bücher.test").unwrap(), "xn--bcher-kva.test");
  }
}
