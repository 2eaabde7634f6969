//! Hyperfox command line entry point.
//!
//! Wires the listeners, the capture pipeline, the store and the API
//! together from command line flags.

use clap::Parser;
use hyperfox::api::{self, ApiState};
use hyperfox::ca::CertAuthority;
use hyperfox::capture::Capture;
use hyperfox::connector::Connector;
use hyperfox::dns::DnsResolver;
use hyperfox::errors::{Error, Result};
use hyperfox::hooks::AccessLogger;
use hyperfox::live::LiveChannel;
use hyperfox::proxy::Proxy;
use hyperfox::store::{self, RecordStore};
use hyperfox::{sink, ui};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Directory where minted leaf certificates are persisted.
const CERT_DIR: &str = "certs";

#[derive(Parser, Debug)]
#[command(name = "hyperfox")]
#[command(about = "Intercepting HTTP/HTTPS proxy with a searchable capture store", long_about = None)]
#[command(version)]
struct Cli {
  /// Address to bind the proxy listeners to.
  #[arg(long, default_value = "127.0.0.1")]
  addr: String,

  /// Plaintext HTTP port. 0 disables the plaintext listener.
  #[arg(long, default_value_t = 1080)]
  http: u16,

  /// TLS port. 0 disables the TLS listener.
  #[arg(long, default_value_t = 10443)]
  https: u16,

  /// Root CA certificate (PEM). Required when the TLS listener is enabled.
  #[arg(long, env = "HYPERFOX_TLS_CERT")]
  ca_cert: Option<PathBuf>,

  /// Root CA private key (PEM). Required when the TLS listener is enabled.
  #[arg(long, env = "HYPERFOX_TLS_KEY")]
  ca_key: Option<PathBuf>,

  /// Capture database file. Defaults to the first unused hyperfox-00000.db slot.
  #[arg(long)]
  db: Option<PathBuf>,

  /// Serve the web UI.
  #[arg(long)]
  ui: bool,

  /// Serve the record API.
  #[arg(long)]
  api: bool,

  /// UI server address.
  #[arg(long, default_value = "127.0.0.1:1984")]
  ui_addr: String,

  /// API server address.
  #[arg(long, default_value = "0.0.0.0:4891")]
  api_addr: String,

  /// Disable the API access token check.
  #[arg(long)]
  disable_api_auth: bool,

  /// Custom DNS resolver (host or host:port) bypassing the OS resolver.
  #[arg(long)]
  dns: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "hyperfox=info".into()),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let cli = Cli::parse();

  if cli.http == 0 && cli.https == 0 {
    return Err(Error::config("both listeners are disabled, nothing to do"));
  }
  if cli.https > 0 && (cli.ca_cert.is_none() || cli.ca_key.is_none()) {
    return Err(Error::config(
      "the TLS listener requires --ca-cert and --ca-key (or HYPERFOX_TLS_CERT / HYPERFOX_TLS_KEY)",
    ));
  }

  let db_path = store::pick_database_path(cli.db.clone());
  let store = RecordStore::open(db_path).await?;
  tracing::info!(db = %store.path().display(), "capture store ready");

  let live = Arc::new(LiveChannel::new());
  let (capture, records) = Capture::channel();
  tokio::spawn(sink::run(records, store.clone(), live.clone()));

  let resolver = match &cli.dns {
    Some(server) => Some(DnsResolver::new(server)?),
    None => None,
  };

  let mut proxy = Proxy::new(Connector::new(resolver));
  proxy.add_body_writer(Box::new(capture));
  proxy.add_logger(Box::new(AccessLogger));
  let proxy = Arc::new(proxy);

  if cli.api {
    let auth_token = if cli.disable_api_auth {
      None
    } else {
      let token = api::generate_auth_token();
      tracing::info!(token = %token, "API access token generated");
      Some(Arc::from(token.as_str()))
    };
    let state = ApiState {
      store: store.clone(),
      live: live.clone(),
      auth_token,
    };
    let listener = TcpListener::bind(&cli.api_addr)
      .await
      .map_err(|e| Error::config(format!("failed to bind API server at {}: {e}", cli.api_addr)))?;
    tracing::info!(addr = %cli.api_addr, "API server started");
    tokio::spawn(async move {
      if let Err(e) = axum::serve(listener, api::router(state)).await {
        tracing::error!("API server: {e}");
      }
    });
  }

  if cli.ui {
    let listener = TcpListener::bind(&cli.ui_addr)
      .await
      .map_err(|e| Error::config(format!("failed to bind UI server at {}: {e}", cli.ui_addr)))?;
    tracing::info!(addr = %cli.ui_addr, "UI server started");
    let ui_router = ui::router(cli.api_addr.clone());
    tokio::spawn(async move {
      if let Err(e) = axum::serve(listener, ui_router).await {
        tracing::error!("UI server: {e}");
      }
    });
  }

  let mut listeners = Vec::new();

  if cli.http > 0 {
    let addr = format!("{}:{}", cli.addr, cli.http);
    let listener = TcpListener::bind(&addr)
      .await
      .map_err(|e| Error::config(format!("failed to bind {addr}: {e}")))?;
    let proxy = proxy.clone();
    listeners.push(tokio::spawn(proxy.serve(listener)));
  }

  if cli.https > 0 {
    let (Some(ca_cert), Some(ca_key)) = (cli.ca_cert.clone(), cli.ca_key.clone()) else {
      return Err(Error::config("missing root CA material"));
    };
    let authority = Arc::new(CertAuthority::from_files(ca_cert, ca_key, CERT_DIR).await?);
    let addr = format!("{}:{}", cli.addr, cli.https);
    let listener = TcpListener::bind(&addr)
      .await
      .map_err(|e| Error::config(format!("failed to bind {addr}: {e}")))?;
    let proxy = proxy.clone();
    listeners.push(tokio::spawn(proxy.serve_tls(listener, authority)));
  }

  // The listeners run until a bind-level failure; the first one to fail
  // takes the process down with a non-zero exit.
  for handle in listeners {
    match handle.await {
      Ok(result) => result?,
      Err(e) => return Err(Error::Proxy(format!("listener task failed: {e}"))),
    }
  }

  Ok(())
}
