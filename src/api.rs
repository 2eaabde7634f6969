//! HTTP API serving captured records and the live notification channel.
//!
//! The UI talks to these endpoints with a bearer token that is generated at
//! startup and accepted either in the `Authorization` header or as an
//! `auth` query parameter.

use crate::capture::{Record, RecordMeta};
use crate::live::LiveChannel;
use crate::store::RecordStore;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use flate2::read::MultiGzDecoder;
use futures_util::{SinkExt, StreamExt};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

const DEFAULT_PAGE_SIZE: u64 = 10;

/// Shared state behind every API handler.
#[derive(Clone)]
pub struct ApiState {
  /// Capture store queried by the record endpoints.
  pub store: RecordStore,
  /// Live channel the WebSocket endpoint subscribes clients to.
  pub live: Arc<LiveChannel>,
  /// Expected bearer token; `None` disables authentication.
  pub auth_token: Option<Arc<str>>,
}

/// Generate the startup access token: eight random bytes, hex encoded.
pub fn generate_auth_token() -> String {
  let mut cookie = [0u8; 8];
  rand::thread_rng().fill_bytes(&mut cookie);
  hex::encode(cookie)
}

/// Build the API router.
pub fn router(state: ApiState) -> Router {
  let cors = CorsLayer::new()
    .allow_origin(Any)
    .allow_methods(Any)
    .allow_headers(Any);

  Router::new()
    .route("/records", get(records_handler))
    .route("/records/{uuid}", get(record_meta_handler))
    .route("/records/{uuid}/request", get(request_content_handler))
    .route("/records/{uuid}/request/raw", get(request_wire_handler))
    .route("/records/{uuid}/request/embed", get(request_embed_handler))
    .route("/records/{uuid}/response", get(response_content_handler))
    .route("/records/{uuid}/response/raw", get(response_wire_handler))
    .route("/records/{uuid}/response/embed", get(response_embed_handler))
    .route("/live", get(live_handler))
    .layer(middleware::from_fn_with_state(state.clone(), require_auth))
    .layer(cors)
    .with_state(state)
}

/// Token middleware. The token arrives in the `Authorization` header (last
/// space separated chunk, so `Bearer <token>` and a bare token both work)
/// or as the `auth` query parameter.
async fn require_auth(
  State(state): State<ApiState>,
  request: axum::extract::Request,
  next: Next,
) -> Response {
  let Some(expected) = state.auth_token.as_deref() else {
    return next.run(request).await;
  };

  let presented = request
    .headers()
    .get(header::AUTHORIZATION)
    .and_then(|v| v.to_str().ok())
    .map(str::to_string)
    .or_else(|| query_param(request.uri().query(), "auth"));

  if let Some(presented) = presented {
    let token = presented.rsplit(' ').next().unwrap_or_default();
    if token == expected {
      return next.run(request).await;
    }
  }
  StatusCode::FORBIDDEN.into_response()
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
  query?
    .split('&')
    .filter_map(|pair| pair.split_once('='))
    .find(|(key, _)| *key == name)
    .map(|(_, value)| value.to_string())
}

#[derive(Debug, Deserialize)]
struct RecordsQuery {
  #[serde(default)]
  q: String,
  page: Option<u64>,
  page_size: Option<u64>,
}

#[derive(Debug, Serialize)]
struct PullResponse {
  records: Vec<RecordMeta>,
  pages: u64,
  page: u64,
}

async fn records_handler(
  State(state): State<ApiState>,
  Query(query): Query<RecordsQuery>,
) -> Response {
  let page = query.page.unwrap_or(1);
  let page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
  match state.store.search(&query.q, page, page_size).await {
    Ok(result) => Json(PullResponse {
      records: result.records,
      pages: result.pages,
      page: result.page,
    })
    .into_response(),
    Err(e) => {
      tracing::error!("search: {e}");
      StatusCode::INTERNAL_SERVER_ERROR.into_response()
    }
  }
}

async fn fetch_record(state: &ApiState, uuid: Uuid) -> Result<Record, Response> {
  match state.store.find_by_uuid(uuid).await {
    Ok(Some(record)) => Ok(record),
    Ok(None) => Err(StatusCode::NOT_FOUND.into_response()),
    Err(e) => {
      tracing::error!("find record {uuid}: {e}");
      Err(StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
  }
}

async fn record_meta_handler(
  State(state): State<ApiState>,
  Path(uuid): Path<Uuid>,
) -> Response {
  match fetch_record(&state, uuid).await {
    Ok(record) => Json(record.meta).into_response(),
    Err(response) => response,
  }
}

/// Which half of the exchange a body endpoint serves.
#[derive(Clone, Copy)]
enum Direction {
  Request,
  Response,
}

/// How the body is rendered back to the caller.
#[derive(Clone, Copy)]
enum RenderMode {
  /// Bare body as a download attachment.
  Content,
  /// Header block, blank line, then the body, as it looked on the wire.
  Wire,
  /// Inline with a benign content type, gzip decoded when applicable.
  Embed,
}

async fn render_record(
  state: ApiState,
  uuid: Uuid,
  direction: Direction,
  mode: RenderMode,
) -> Response {
  let record = match fetch_record(&state, uuid).await {
    Ok(record) => record,
    Err(response) => return response,
  };

  let (headers, body) = match direction {
    Direction::Request => (&record.meta.request_header, &record.request_body),
    Direction::Response => (&record.meta.header, &record.body),
  };

  let mut payload = Vec::new();
  if matches!(mode, RenderMode::Wire) {
    for (name, value) in headers.0.iter() {
      payload.extend_from_slice(name.as_str().as_bytes());
      payload.extend_from_slice(b": ");
      payload.extend_from_slice(value.as_bytes());
      payload.extend_from_slice(b"\r\n");
    }
    payload.extend_from_slice(b"\r\n");
  }
  payload.extend_from_slice(body);

  match mode {
    RenderMode::Embed => {
      let declared = headers
        .0
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
      let embed_type = if declared.starts_with("image/") {
        declared.to_string()
      } else {
        "text/plain; charset=utf-8".to_string()
      };
      let payload = gunzip_if_needed(payload);
      (
        [(header::CONTENT_TYPE, embed_type)],
        payload,
      )
        .into_response()
    }
    RenderMode::Content | RenderMode::Wire => {
      let filename = download_filename(&record.meta.url, matches!(mode, RenderMode::Wire));
      let disposition = format!("attachment; filename=\"{filename}\"");
      let mut response = payload.into_response();
      response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
      );
      if let Ok(value) = HeaderValue::from_str(&disposition) {
        response
          .headers_mut()
          .insert(header::CONTENT_DISPOSITION, value);
      }
      response
    }
  }
}

/// Inflate the payload when it opens with the gzip magic, otherwise pass
/// it through untouched.
fn gunzip_if_needed(payload: Vec<u8>) -> Vec<u8> {
  if !payload.starts_with(&[0x1f, 0x8b]) {
    return payload;
  }
  let mut decoder = MultiGzDecoder::new(payload.as_slice());
  let mut out = Vec::new();
  match decoder.read_to_end(&mut out) {
    Ok(_) => out,
    Err(_) => payload,
  }
}

/// Derive the download filename from the record URL:
/// `<host>-<basename>`, unsafe characters replaced by dashes, dash runs
/// collapsed and trimmed, extension taken from the path or `.txt`.
fn download_filename(url: &str, wire: bool) -> String {
  let uri: Option<http::Uri> = url.parse().ok();
  let (host, path) = match &uri {
    Some(uri) => (
      uri.host().unwrap_or_default().to_string(),
      uri.path().to_string(),
    ),
    None => (String::new(), String::new()),
  };
  let base = path.rsplit('/').next().unwrap_or_default();
  let ext = match base.rsplit_once('.') {
    Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => format!(".{ext}"),
    _ => ".txt".to_string(),
  };

  let raw = format!("{host}-{base}");
  let mut cleaned = String::with_capacity(raw.len());
  let mut last_dash = false;
  for c in raw.chars() {
    let keep = c.is_ascii_alphanumeric() || c == '_';
    if keep {
      cleaned.push(c);
      last_dash = false;
    } else if !last_dash {
      cleaned.push('-');
      last_dash = true;
    }
  }
  let mut name = cleaned.trim_matches('-').to_string();
  // The extension was folded into the cleaned name; strip it before the
  // suffix decision so `-raw` lands between stem and extension.
  if ext != ".txt" {
    let suffix = format!("-{}", &ext[1..]);
    if name.ends_with(&suffix) {
      name.truncate(name.len() - suffix.len());
    }
  }
  if wire {
    name.push_str("-raw");
  }
  name.push_str(&ext);
  name
}

async fn request_content_handler(State(state): State<ApiState>, Path(uuid): Path<Uuid>) -> Response {
  render_record(state, uuid, Direction::Request, RenderMode::Content).await
}

async fn request_wire_handler(State(state): State<ApiState>, Path(uuid): Path<Uuid>) -> Response {
  render_record(state, uuid, Direction::Request, RenderMode::Wire).await
}

async fn request_embed_handler(State(state): State<ApiState>, Path(uuid): Path<Uuid>) -> Response {
  render_record(state, uuid, Direction::Request, RenderMode::Embed).await
}

async fn response_content_handler(State(state): State<ApiState>, Path(uuid): Path<Uuid>) -> Response {
  render_record(state, uuid, Direction::Response, RenderMode::Content).await
}

async fn response_wire_handler(State(state): State<ApiState>, Path(uuid): Path<Uuid>) -> Response {
  render_record(state, uuid, Direction::Response, RenderMode::Wire).await
}

async fn response_embed_handler(State(state): State<ApiState>, Path(uuid): Path<Uuid>) -> Response {
  render_record(state, uuid, Direction::Response, RenderMode::Embed).await
}

async fn live_handler(State(state): State<ApiState>, ws: WebSocketUpgrade) -> Response {
  ws.on_upgrade(move |socket| handle_live_socket(socket, state.live))
}

async fn handle_live_socket(socket: WebSocket, live: Arc<LiveChannel>) {
  let (mut sender, mut receiver) = socket.split();
  let (id, mut frames) = live.subscribe();

  // Connect-time hello so the UI knows the channel is up.
  if sender.send(Message::Text("null".into())).await.is_err() {
    live.unsubscribe(id);
    return;
  }

  let mut send_task = tokio::spawn(async move {
    while let Some(frame) = frames.recv().await {
      if sender.send(Message::Text(frame.into())).await.is_err() {
        break;
      }
    }
  });

  // Inbound frames are discarded, the read loop only detects peer close.
  let mut recv_task = tokio::spawn(async move {
    while let Some(Ok(message)) = receiver.next().await {
      if matches!(message, Message::Close(_)) {
        break;
      }
    }
  });

  tokio::select! {
    _ = &mut send_task => recv_task.abort(),
    _ = &mut recv_task => send_task.abort(),
  }
  live.unsubscribe(id);
}
