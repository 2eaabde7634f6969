//! End-to-end tests: real sockets on both sides of the proxy, a real
//! SQLite store behind the capture pipeline and a real TLS handshake
//! against the minting authority.

use bytes::Bytes;
use hyperfox::ca::CertAuthority;
use hyperfox::capture::Capture;
use hyperfox::connector::Connector;
use hyperfox::errors::Result;
use hyperfox::hooks::{Director, InterceptedResponse, Interceptor};
use hyperfox::live::LiveChannel;
use hyperfox::message::Request;
use hyperfox::proxy::Proxy;
use hyperfox::sink;
use hyperfox::store::RecordStore;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Serve one canned HTTP response per accepted connection.
async fn spawn_origin(response: &'static [u8]) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    loop {
      let Ok((mut stream, _)) = listener.accept().await else {
        break;
      };
      tokio::spawn(async move {
        // Drain the request head before answering.
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
          match stream.read(&mut chunk).await {
            Ok(0) => return,
            Ok(n) => {
              buf.extend_from_slice(&chunk[..n]);
              if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
              }
            }
            Err(_) => return,
          }
        }
        let _ = stream.write_all(response).await;
        let _ = stream.flush().await;
      });
    }
  });
  addr
}

async fn spawn_proxy(proxy: Arc<Proxy>) -> SocketAddr {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    let _ = proxy.serve(listener).await;
  });
  addr
}

/// One plaintext request through the proxy; returns the raw response bytes.
async fn roundtrip(proxy_addr: SocketAddr, request: &[u8]) -> Vec<u8> {
  let mut stream = TcpStream::connect(proxy_addr).await.unwrap();
  stream.write_all(request).await.unwrap();
  stream.flush().await.unwrap();
  let mut out = Vec::new();
  stream.read_to_end(&mut out).await.unwrap();
  out
}

fn temp_store_path(name: &str) -> PathBuf {
  let path = std::env::temp_dir().join(format!("hyperfox-e2e-{name}.db"));
  let _ = std::fs::remove_file(&path);
  path
}

struct Pipeline {
  proxy_addr: SocketAddr,
  store: RecordStore,
  live: Arc<LiveChannel>,
}

/// Proxy + capture + store + live channel, fully wired.
async fn spawn_pipeline(name: &str, configure: impl FnOnce(&mut Proxy)) -> Pipeline {
  let store = RecordStore::open(temp_store_path(name)).await.unwrap();
  let live = Arc::new(LiveChannel::new());
  let (capture, records) = Capture::channel();
  tokio::spawn(sink::run(records, store.clone(), live.clone()));

  let mut proxy = Proxy::new(Connector::new(None));
  proxy.add_body_writer(Box::new(capture));
  configure(&mut proxy);
  let proxy_addr = spawn_proxy(Arc::new(proxy)).await;

  Pipeline {
    proxy_addr,
    store,
    live,
  }
}

#[tokio::test]
async fn proxied_request_is_served_and_captured() {
  let origin = spawn_origin(b"HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 5\r\n\r\nhello").await;
  let pipeline = spawn_pipeline("basic", |_| {}).await;
  let (_sub, mut frames) = pipeline.live.subscribe();

  let request = format!("GET / HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n");
  let response = roundtrip(pipeline.proxy_addr, request.as_bytes()).await;
  let text = String::from_utf8_lossy(&response);
  assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
  assert!(text.ends_with("hello"), "{text}");

  // The live frame confirms the insert finished.
  let frame = frames.recv().await.unwrap();
  let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
  let id = value["last_record_id"].as_u64().unwrap();
  assert!(id >= 1);

  let page = pipeline.store.search("", 1, 10).await.unwrap();
  assert_eq!(page.records.len(), 1);
  let meta = &page.records[0];
  assert_eq!(meta.id, id);
  assert_eq!(meta.status, 200);
  assert_eq!(meta.method, "GET");
  assert_eq!(meta.scheme, "http");
  assert_eq!(meta.host, origin.to_string());
  assert_eq!(meta.path, "/");
  assert_eq!(meta.content_length, 5);
  // Sniffed from the body, not copied from the header.
  assert_eq!(meta.content_type, "text/plain; charset=utf-8");

  let record = pipeline
    .store
    .find_by_uuid(meta.uuid)
    .await
    .unwrap()
    .unwrap();
  assert_eq!(record.body.as_ref(), b"hello");
  assert_eq!(
    record.meta.header.0.get("content-type").unwrap(),
    "text/html"
  );
}

#[tokio::test]
async fn search_finds_the_captured_record() {
  let origin = spawn_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 13\r\n\r\nhello capture").await;
  let pipeline = spawn_pipeline("search", |_| {}).await;
  let (_sub, mut frames) = pipeline.live.subscribe();

  let request = format!("GET /findme HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n");
  roundtrip(pipeline.proxy_addr, request.as_bytes()).await;
  frames.recv().await.unwrap();

  // Path substring, keyword substring and exact status, ANDed.
  let page = pipeline.store.search("findme 200", 1, 10).await.unwrap();
  assert_eq!(page.records.len(), 1);
  let page = pipeline.store.search("capture", 1, 10).await.unwrap();
  assert_eq!(page.records.len(), 1);
  let page = pipeline.store.search("findme nosuchterm", 1, 10).await.unwrap();
  assert_eq!(page.records.len(), 0);
}

#[tokio::test]
async fn chunked_bodies_reach_client_and_record_byte_for_byte() {
  let origin = spawn_origin(
    b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n6\r\nchunk1\r\n6\r\nchunk2\r\n0\r\n\r\n",
  )
  .await;
  let pipeline = spawn_pipeline("chunked", |_| {}).await;
  let (_sub, mut frames) = pipeline.live.subscribe();

  let request = format!("GET /c HTTP/1.1\r\nHost: {origin}\r\n\r\n");
  let response = roundtrip(pipeline.proxy_addr, request.as_bytes()).await;
  let text = String::from_utf8_lossy(&response);
  // De-framed copy, delimited by connection close.
  assert!(text.contains("connection: close\r\n") || text.contains("Connection: close\r\n"));
  assert!(text.ends_with("chunk1chunk2"), "{text}");

  frames.recv().await.unwrap();
  let page = pipeline.store.search("", 1, 10).await.unwrap();
  let record = pipeline
    .store
    .find_by_uuid(page.records[0].uuid)
    .await
    .unwrap()
    .unwrap();
  assert_eq!(record.body.as_ref(), b"chunk1chunk2");
  assert_eq!(record.meta.content_length, 12);
}

#[tokio::test]
async fn request_bodies_are_teed_into_the_record() {
  let origin = spawn_origin(b"HTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok").await;
  let pipeline = spawn_pipeline("reqbody", |_| {}).await;
  let (_sub, mut frames) = pipeline.live.subscribe();

  let request = format!(
    "POST /submit HTTP/1.1\r\nHost: {origin}\r\nContent-Length: 7\r\nConnection: close\r\n\r\npayload"
  );
  roundtrip(pipeline.proxy_addr, request.as_bytes()).await;
  frames.recv().await.unwrap();

  let page = pipeline.store.search("", 1, 10).await.unwrap();
  let record = pipeline
    .store
    .find_by_uuid(page.records[0].uuid)
    .await
    .unwrap()
    .unwrap();
  assert_eq!(record.meta.method, "POST");
  assert_eq!(record.meta.status, 201);
  assert_eq!(record.request_body.as_ref(), b"payload");
}

struct RewriteDirector {
  target: String,
}

#[async_trait::async_trait]
impl Director for RewriteDirector {
  async fn direct(&self, request: &mut Request) -> Result<()> {
    request.set_uri(self.target.parse().expect("test uri"));
    Ok(())
  }
}

#[tokio::test]
async fn director_rewrite_redirects_the_origin_call() {
  let origin = spawn_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 9\r\n\r\nrewritten").await;
  let target = format!("http://{origin}/landing");
  let pipeline = {
    let target = target.clone();
    spawn_pipeline("director", move |proxy| {
      proxy.add_director(Box::new(RewriteDirector { target }));
    })
    .await
  };
  let (_sub, mut frames) = pipeline.live.subscribe();

  // The original target does not resolve anywhere; only the rewrite works.
  let request = "GET http://anything.test/foo HTTP/1.1\r\nHost: anything.test\r\nConnection: close\r\n\r\n";
  let response = roundtrip(pipeline.proxy_addr, request.as_bytes()).await;
  assert!(String::from_utf8_lossy(&response).ends_with("rewritten"));

  frames.recv().await.unwrap();
  let page = pipeline.store.search("", 1, 10).await.unwrap();
  assert_eq!(page.records[0].url, target);
}

struct FailingInterceptor;

#[async_trait::async_trait]
impl Interceptor for FailingInterceptor {
  async fn intercept(&self, response: &mut InterceptedResponse) -> Result<()> {
    response.status = http::StatusCode::INTERNAL_SERVER_ERROR;
    response.set_body("substituted body");
    Ok(())
  }
}

#[tokio::test]
async fn interceptor_substitution_reaches_client_and_record() {
  let origin = spawn_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 8\r\n\r\noriginal").await;
  let pipeline = spawn_pipeline("interceptor", |proxy| {
    proxy.add_interceptor(Box::new(FailingInterceptor));
  })
  .await;
  let (_sub, mut frames) = pipeline.live.subscribe();

  let request = format!("GET / HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n");
  let response = roundtrip(pipeline.proxy_addr, request.as_bytes()).await;
  let text = String::from_utf8_lossy(&response);
  assert!(text.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{text}");
  assert!(text.ends_with("substituted body"), "{text}");

  frames.recv().await.unwrap();
  let page = pipeline.store.search("", 1, 10).await.unwrap();
  let record = pipeline
    .store
    .find_by_uuid(page.records[0].uuid)
    .await
    .unwrap()
    .unwrap();
  assert_eq!(record.meta.status, 500);
  assert_eq!(record.body.as_ref(), b"substituted body");
}

#[tokio::test]
async fn unreachable_origin_answers_500_and_stores_nothing() {
  let pipeline = spawn_pipeline("unreachable", |_| {}).await;

  // A port nobody listens on.
  let request = "GET / HTTP/1.1\r\nHost: 127.0.0.1:1\r\nConnection: close\r\n\r\n";
  let response = roundtrip(pipeline.proxy_addr, request.as_bytes()).await;
  assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 500 "));

  // Give the (absent) pipeline a moment, then confirm emptiness.
  tokio::time::sleep(std::time::Duration::from_millis(100)).await;
  let page = pipeline.store.search("", 1, 10).await.unwrap();
  assert!(page.records.is_empty());
}

#[tokio::test]
async fn concurrent_requests_produce_distinct_uuids() {
  const CONCURRENCY: usize = 50;
  let origin = spawn_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nbody").await;
  let pipeline = spawn_pipeline("uuids", |_| {}).await;
  let (_sub, mut frames) = pipeline.live.subscribe();

  let mut tasks = Vec::new();
  for i in 0..CONCURRENCY {
    let proxy_addr = pipeline.proxy_addr;
    let request = format!("GET /{i} HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n");
    tasks.push(tokio::spawn(async move {
      roundtrip(proxy_addr, request.as_bytes()).await
    }));
  }
  for task in tasks {
    let response = task.await.unwrap();
    assert!(String::from_utf8_lossy(&response).ends_with("body"));
  }
  for _ in 0..CONCURRENCY {
    frames.recv().await.unwrap();
  }

  let page = pipeline.store.search("", 1, CONCURRENCY as u64 + 1).await.unwrap();
  assert_eq!(page.records.len(), CONCURRENCY);
  let mut uuids: Vec<_> = page.records.iter().map(|r| r.uuid).collect();
  uuids.sort();
  uuids.dedup();
  assert_eq!(uuids.len(), CONCURRENCY);
}

#[tokio::test]
async fn both_live_subscribers_hear_about_the_insert() {
  let origin = spawn_origin(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi").await;
  let pipeline = spawn_pipeline("live", |_| {}).await;
  let (_a, mut frames_a) = pipeline.live.subscribe();
  let (_b, mut frames_b) = pipeline.live.subscribe();

  let request = format!("GET / HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n");
  roundtrip(pipeline.proxy_addr, request.as_bytes()).await;

  for frames in [&mut frames_a, &mut frames_b] {
    let frame = frames.recv().await.unwrap();
    let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert!(value["last_record_id"].as_u64().unwrap() >= 1);
  }
}

#[tokio::test]
async fn large_bodies_survive_byte_for_byte() {
  // 2 MiB of patterned data behind a content-length.
  const SIZE: usize = 2 * 1024 * 1024;
  let mut payload = Vec::with_capacity(SIZE);
  while payload.len() < SIZE {
    payload.extend_from_slice(b"0123456789abcdef");
  }
  payload.truncate(SIZE);
  let mut response = format!("HTTP/1.1 200 OK\r\nContent-Length: {SIZE}\r\n\r\n").into_bytes();
  response.extend_from_slice(&payload);
  let response: &'static [u8] = Box::leak(response.into_boxed_slice());

  let origin = spawn_origin(response).await;
  let pipeline = spawn_pipeline("large", |_| {}).await;
  let (_sub, mut frames) = pipeline.live.subscribe();

  let request = format!("GET /big HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n");
  let client_bytes = roundtrip(pipeline.proxy_addr, request.as_bytes()).await;
  let body_start = client_bytes
    .windows(4)
    .position(|w| w == b"\r\n\r\n")
    .unwrap()
    + 4;
  assert_eq!(&client_bytes[body_start..], payload.as_slice());

  frames.recv().await.unwrap();
  let page = pipeline.store.search("", 1, 10).await.unwrap();
  let record = pipeline
    .store
    .find_by_uuid(page.records[0].uuid)
    .await
    .unwrap()
    .unwrap();
  assert_eq!(record.meta.content_length as usize, SIZE);
  assert_eq!(record.body, Bytes::from(payload));
}

// ---------------------------------------------------------------------------
// Certificate authority
// ---------------------------------------------------------------------------

/// Write a fresh self-signed root CA pair into `dir`.
fn write_test_root_ca(dir: &std::path::Path) -> (PathBuf, PathBuf) {
  use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
  };

  std::fs::create_dir_all(dir).unwrap();
  let mut params = CertificateParams::default();
  let mut dn = DistinguishedName::new();
  dn.push(DnType::CommonName, "Hyperfox Test Root CA");
  params.distinguished_name = dn;
  params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
  params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];

  let key_pair = KeyPair::generate().unwrap();
  let cert = params.self_signed(&key_pair).unwrap();

  let cert_path = dir.join("rootCA.crt");
  let key_path = dir.join("rootCA.key");
  std::fs::write(&cert_path, cert.pem()).unwrap();
  std::fs::write(&key_path, key_pair.serialize_pem()).unwrap();
  (cert_path, key_path)
}

fn test_ca_dir(name: &str) -> PathBuf {
  let dir = std::env::temp_dir().join(format!("hyperfox-ca-test-{name}"));
  let _ = std::fs::remove_dir_all(&dir);
  dir
}

#[tokio::test]
async fn minted_leaf_has_expected_subject_and_validity() {
  use x509_parser::prelude::*;

  let dir = test_ca_dir("subject");
  let (cert_path, key_path) = write_test_root_ca(&dir);
  let authority = CertAuthority::from_files(&cert_path, &key_path, dir.join("certs"))
    .await
    .unwrap();

  let leaf = authority.get_or_create("alpha.test").await.unwrap();
  assert!(leaf.cert_path.exists());
  assert!(leaf.key_path.exists());
  assert_eq!(leaf.chain.len(), 2, "leaf plus root");

  let (_, parsed) = X509Certificate::from_der(leaf.chain[0].as_ref()).unwrap();
  let cn = parsed
    .subject()
    .iter_common_name()
    .next()
    .unwrap()
    .as_str()
    .unwrap();
  assert_eq!(cn, "alpha.test");
  let issuer_cn = parsed
    .issuer()
    .iter_common_name()
    .next()
    .unwrap()
    .as_str()
    .unwrap();
  assert_eq!(issuer_cn, "Hyperfox Test Root CA");
  assert!(parsed.validity().is_valid(), "validity window contains now");
  assert!(!parsed.is_ca());

  let san = parsed
    .subject_alternative_name()
    .unwrap()
    .expect("leaf carries a SAN extension");
  let has_dns = san.value.general_names.iter().any(|name| {
    matches!(name, GeneralName::DNSName(dns) if *dns == "alpha.test")
  });
  assert!(has_dns, "SAN lists the hostname");

  // TLS material is usable as a server identity.
  assert!(leaf.server_config().is_ok());
}

#[tokio::test]
async fn repeated_lookups_return_the_same_material() {
  let dir = test_ca_dir("repeat");
  let (cert_path, key_path) = write_test_root_ca(&dir);
  let authority = CertAuthority::from_files(&cert_path, &key_path, dir.join("certs"))
    .await
    .unwrap();

  let first = authority.get_or_create("beta.test").await.unwrap();
  let second = authority.get_or_create("beta.test").await.unwrap();
  assert_eq!(first.chain[0].as_ref(), second.chain[0].as_ref());

  // Case and IDNA normalization collapse onto the same entry.
  let third = authority.get_or_create("BETA.test").await.unwrap();
  assert_eq!(first.chain[0].as_ref(), third.chain[0].as_ref());
}

#[tokio::test]
async fn leaf_survives_an_authority_restart() {
  let dir = test_ca_dir("restart");
  let (cert_path, key_path) = write_test_root_ca(&dir);

  let first = {
    let authority = CertAuthority::from_files(&cert_path, &key_path, dir.join("certs"))
      .await
      .unwrap();
    authority.get_or_create("gamma.test").await.unwrap().chain[0].clone()
  };

  let authority = CertAuthority::from_files(&cert_path, &key_path, dir.join("certs"))
    .await
    .unwrap();
  let second = authority.get_or_create("gamma.test").await.unwrap();
  assert_eq!(first.as_ref(), second.chain[0].as_ref());
}

#[tokio::test]
async fn concurrent_minting_writes_one_file_per_hostname() {
  const LOOKUPS: usize = 200;
  let dir = test_ca_dir("concurrent");
  let (cert_path, key_path) = write_test_root_ca(&dir);
  let authority = Arc::new(
    CertAuthority::from_files(&cert_path, &key_path, dir.join("certs"))
      .await
      .unwrap(),
  );

  let mut tasks = Vec::new();
  for _ in 0..LOOKUPS {
    let authority = authority.clone();
    tasks.push(tokio::spawn(async move {
      authority.get_or_create("delta.test").await.unwrap().chain[0].clone()
    }));
  }
  let mut certs = Vec::new();
  for task in tasks {
    certs.push(task.await.unwrap());
  }
  for cert in &certs {
    assert_eq!(cert.as_ref(), certs[0].as_ref());
  }

  let host_dir = dir.join("certs").join("delta.test");
  let entries: Vec<_> = std::fs::read_dir(&host_dir)
    .unwrap()
    .map(|e| e.unwrap().file_name().into_string().unwrap())
    .collect();
  let mut sorted = entries.clone();
  sorted.sort();
  assert_eq!(sorted, vec!["cert.pem".to_string(), "key.pem".to_string()]);
}

#[tokio::test]
async fn missing_root_ca_is_fatal() {
  let dir = test_ca_dir("missing");
  let result = CertAuthority::from_files(
    dir.join("nope.crt"),
    dir.join("nope.key"),
    dir.join("certs"),
  )
  .await;
  assert!(result.is_err());
}

// ---------------------------------------------------------------------------
// TLS listener
// ---------------------------------------------------------------------------

#[tokio::test]
async fn tls_listener_presents_a_minted_leaf_for_the_sni() {
  use tokio_rustls::rustls::pki_types::ServerName;
  use tokio_rustls::rustls::{ClientConfig, RootCertStore};
  use x509_parser::prelude::*;

  let dir = test_ca_dir("sni");
  let (cert_path, key_path) = write_test_root_ca(&dir);
  let authority = Arc::new(
    CertAuthority::from_files(&cert_path, &key_path, dir.join("certs"))
      .await
      .unwrap(),
  );

  let proxy = Arc::new(Proxy::new(Connector::new(None)));
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    let _ = proxy.serve_tls(listener, authority).await;
  });

  // A client trusting only the test root must accept the minted chain.
  let root_pem = std::fs::read(&cert_path).unwrap();
  let root_der = rustls_pemfile::certs(&mut root_pem.as_slice())
    .next()
    .unwrap()
    .unwrap();
  let mut roots = RootCertStore::empty();
  roots.add(root_der).unwrap();
  let config = ClientConfig::builder()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

  let tcp = TcpStream::connect(addr).await.unwrap();
  let server_name = ServerName::try_from("alpha.test").unwrap();
  let tls = connector.connect(server_name, tcp).await.unwrap();

  let (_, session) = tls.get_ref();
  let peer_certs = session.peer_certificates().unwrap();
  let (_, leaf) = X509Certificate::from_der(peer_certs[0].as_ref()).unwrap();
  let cn = leaf
    .subject()
    .iter_common_name()
    .next()
    .unwrap()
    .as_str()
    .unwrap();
  assert_eq!(cn, "alpha.test");
  assert!(leaf.validity().is_valid());
}
