//! HTTP/1.1 message types and wire codec.
//!
//! Inbound requests are parsed straight off the client socket and outbound
//! requests are serialized back to origin-form on the origin socket. Origin
//! responses are split into a head, parsed eagerly, and a framed body reader
//! that is drained incrementally so large responses never have to fit in
//! memory twice.

use crate::errors::{new_io_error, Error, Result};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version};
use std::io::ErrorKind;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub(crate) const CR_LF: &[u8] = b"\r\n";
pub(crate) const COLON_SPACE: &[u8] = b": ";

/// Upper bound for a request line.
const MAX_REQUEST_LINE: usize = 8192;
/// Upper bound for a header block.
const MAX_HEADER_BLOCK: usize = 64 * 1024;

/// An HTTP request flowing through the proxy.
///
/// The body, when present, is always fully buffered so it can be replayed
/// into the capture record after the round trip consumed it.
#[derive(Clone, Debug, Default)]
pub struct Request {
  method: Method,
  uri: Uri,
  version: Version,
  headers: HeaderMap,
  body: Option<Bytes>,
}

impl Request {
  /// Get the method.
  pub fn method(&self) -> &Method {
    &self.method
  }

  /// Set the method.
  pub fn set_method(&mut self, method: Method) {
    self.method = method;
  }

  /// Get the request URI.
  pub fn uri(&self) -> &Uri {
    &self.uri
  }

  /// Replace the request URI. Directors use this to redirect traffic.
  pub fn set_uri(&mut self, uri: Uri) {
    self.uri = uri;
  }

  /// Get the HTTP version.
  pub fn version(&self) -> Version {
    self.version
  }

  /// Force the HTTP version.
  pub fn set_version(&mut self, version: Version) {
    self.version = version;
  }

  /// Get the headers.
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }

  /// Get a mutable reference to the headers.
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }

  /// Get the buffered body, if any.
  pub fn body(&self) -> Option<&Bytes> {
    self.body.as_ref()
  }

  /// Replace the body.
  pub fn set_body<B: Into<Bytes>>(&mut self, body: B) {
    let body = body.into();
    self.body = if body.is_empty() { None } else { Some(body) };
  }

  /// Scheme of the request URI, defaulting to `http`.
  pub fn scheme(&self) -> &str {
    self.uri.scheme_str().unwrap_or("http")
  }

  /// Host (with port when explicit) taken from the URI authority.
  pub fn host(&self) -> String {
    self
      .uri
      .authority()
      .map(|a| a.to_string())
      .unwrap_or_default()
  }

  /// Serialize to origin-form wire format, the shape origin servers expect.
  pub fn to_wire(&self) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(self.method.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(self.uri.path().as_bytes());
    if let Some(q) = self.uri.query() {
      out.push(b'?');
      out.extend_from_slice(q.as_bytes());
    }
    out.push(b' ');
    out.extend_from_slice(format!("{:?}", self.version).as_bytes());
    out.extend_from_slice(CR_LF);
    // The Host header goes first when the parsed headers lack one.
    if !self.headers.contains_key(http::header::HOST) {
      if let Some(authority) = self.uri.authority() {
        out.extend_from_slice(http::header::HOST.as_str().as_bytes());
        out.extend_from_slice(COLON_SPACE);
        out.extend_from_slice(authority.as_str().as_bytes());
        out.extend_from_slice(CR_LF);
      }
    }
    for (name, value) in self.headers.iter() {
      out.extend_from_slice(name.as_str().as_bytes());
      out.extend_from_slice(COLON_SPACE);
      out.extend_from_slice(value.as_bytes());
      out.extend_from_slice(CR_LF);
    }
    out.extend_from_slice(CR_LF);
    if let Some(body) = &self.body {
      out.extend_from_slice(body);
    }
    out
  }
}

impl<T> From<http::Request<T>> for Request
where
  T: Into<Bytes>,
{
  fn from(value: http::Request<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body: Bytes = body.into();
    Self {
      method: parts.method,
      uri: parts.uri,
      version: parts.version,
      headers: parts.headers,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

/// How the remaining response body is delimited on the wire.
#[derive(Debug)]
enum Framing {
  /// No body follows the head.
  None,
  /// A `Content-Length` body with this many bytes left.
  Length(u64),
  /// A `Transfer-Encoding: chunked` body.
  Chunked(ChunkState),
  /// Body runs until the origin closes the connection.
  Eof,
}

#[derive(Debug)]
enum ChunkState {
  /// Positioned at a chunk-size line.
  Boundary,
  /// Inside a chunk with this many payload bytes left.
  Data(u64),
  /// All chunks and trailers consumed.
  Done,
}

/// Incrementally drains a framed response body from a buffered socket.
pub struct BodyReader<R> {
  reader: R,
  framing: Framing,
}

impl<R: AsyncBufRead + Unpin> BodyReader<R> {
  fn new(reader: R, framing: Framing) -> Self {
    BodyReader { reader, framing }
  }

  /// Whether the client copy of this body must be delimited by closing the
  /// connection (no usable `Content-Length` on the wire).
  pub fn is_close_delimited(&self) -> bool {
    matches!(self.framing, Framing::Chunked(_) | Framing::Eof)
  }

  /// Read the next slice of decoded body bytes into `buf`.
  ///
  /// Returns `Ok(0)` once the body is fully drained. Chunk framing is
  /// removed, callers only ever see payload bytes.
  pub async fn next_chunk(&mut self, buf: &mut [u8]) -> Result<usize> {
    match &mut self.framing {
      Framing::None => Ok(0),
      Framing::Length(remaining) => {
        if *remaining == 0 {
          return Ok(0);
        }
        let want = (*remaining).min(buf.len() as u64) as usize;
        let n = self.reader.read(&mut buf[..want]).await?;
        if n == 0 {
          return Err(new_io_error(
            ErrorKind::UnexpectedEof,
            "origin closed before content-length was satisfied",
          ));
        }
        *remaining -= n as u64;
        Ok(n)
      }
      Framing::Chunked(state) => loop {
        match state {
          ChunkState::Done => return Ok(0),
          ChunkState::Data(remaining) => {
            let want = (*remaining).min(buf.len() as u64) as usize;
            let n = self.reader.read(&mut buf[..want]).await?;
            if n == 0 {
              return Err(new_io_error(
                ErrorKind::UnexpectedEof,
                "origin closed inside a chunk",
              ));
            }
            *remaining -= n as u64;
            if *remaining == 0 {
              read_crlf(&mut self.reader).await?;
              *state = ChunkState::Boundary;
            }
            return Ok(n);
          }
          ChunkState::Boundary => {
            let size = read_chunk_size(&mut self.reader).await?;
            if size == 0 {
              // Trailer section runs until a blank line.
              loop {
                let mut line = Vec::new();
                let n = self.reader.read_until(b'\n', &mut line).await?;
                if n == 0 || line == b"\r\n" || line == b"\n" {
                  break;
                }
              }
              *state = ChunkState::Done;
              return Ok(0);
            }
            *state = ChunkState::Data(size);
          }
        }
      },
      Framing::Eof => {
        let n = self.reader.read(buf).await?;
        Ok(n)
      }
    }
  }

  /// Drain the remaining body into a single buffer.
  pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
      let n = self.next_chunk(&mut buf).await?;
      if n == 0 {
        break;
      }
      out.extend_from_slice(&buf[..n]);
    }
    Ok(out)
  }
}

async fn read_crlf<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<()> {
  let mut sep = [0u8; 2];
  reader.read_exact(&mut sep).await?;
  if &sep != CR_LF {
    return Err(new_io_error(ErrorKind::InvalidData, "missing chunk separator"));
  }
  Ok(())
}

async fn read_chunk_size<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<u64> {
  let mut line = Vec::new();
  let n = reader.read_until(b'\n', &mut line).await?;
  if n == 0 {
    return Err(new_io_error(
      ErrorKind::UnexpectedEof,
      "origin closed before a chunk size line",
    ));
  }
  let line = String::from_utf8_lossy(&line);
  // Chunk extensions after ';' are ignored.
  let size_part = line.trim().split(';').next().unwrap_or_default();
  u64::from_str_radix(size_part, 16)
    .map_err(|_| new_io_error(ErrorKind::InvalidData, "invalid chunk size"))
}

/// An HTTP response flowing back through the proxy: an eagerly parsed head
/// plus the framed body reader still attached to the origin socket.
pub struct Response<R> {
  version: Version,
  status: StatusCode,
  headers: HeaderMap,
  body: BodyReader<R>,
}

impl<R: AsyncBufRead + Unpin> Response<R> {
  /// Get the status code.
  pub fn status(&self) -> StatusCode {
    self.status
  }

  /// Get the HTTP version the origin answered with.
  pub fn version(&self) -> Version {
    self.version
  }

  /// Get the headers.
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }

  /// Take the body out of the response.
  pub fn into_body(self) -> BodyReader<R> {
    self.body
  }

  /// Split into head fields and body.
  pub fn into_parts(self) -> (StatusCode, HeaderMap, BodyReader<R>) {
    (self.status, self.headers, self.body)
  }
}

/// Parse a response head off the origin socket and hand back the framed
/// body reader for the remainder.
pub async fn read_response<R: AsyncBufRead + Unpin>(
  mut reader: R,
  request_method: &Method,
) -> Result<Response<R>> {
  let (version, status) = read_status_line(&mut reader).await?;
  let headers = read_header_block(&mut reader).await?;
  let framing = response_framing(request_method, status, &headers);
  Ok(Response {
    version,
    status,
    headers,
    body: BodyReader::new(reader, framing),
  })
}

async fn read_status_line<R: AsyncBufRead + Unpin>(
  reader: &mut R,
) -> Result<(Version, StatusCode)> {
  let mut line = Vec::new();
  let n = reader.read_until(b'\n', &mut line).await?;
  if n == 0 {
    return Err(new_io_error(
      ErrorKind::UnexpectedEof,
      "origin closed before sending a status line",
    ));
  }
  let mut parts = line.splitn(3, |b| *b == b' ');
  let version = match parts.next() {
    Some(b"HTTP/1.0") => Version::HTTP_10,
    Some(b"HTTP/1.1") => Version::HTTP_11,
    Some(_) | None => {
      return Err(new_io_error(ErrorKind::InvalidData, "invalid http version"));
    }
  };
  let status = parts
    .next()
    .map(|code| StatusCode::try_from(std::str::from_utf8(code).unwrap_or_default().trim()))
    .ok_or_else(|| new_io_error(ErrorKind::InvalidData, "missing status code"))??;
  Ok((version, status))
}

async fn read_header_block<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<HeaderMap> {
  let mut headers = HeaderMap::new();
  let mut line = Vec::new();
  let mut total = 0usize;
  loop {
    line.clear();
    let n = reader.read_until(b'\n', &mut line).await?;
    if n == 0 || line == b"\r\n" || line == b"\n" {
      break;
    }
    total += n;
    if total > MAX_HEADER_BLOCK {
      return Err(Error::invalid_request("header block exceeds maximum size"));
    }
    if let Some((name, value)) = split_header_line(&line) {
      let name = HeaderName::from_bytes(name.as_bytes())?;
      let value = HeaderValue::from_str(&value)?;
      headers.append(name, value);
    }
  }
  Ok(headers)
}

fn split_header_line(line: &[u8]) -> Option<(String, String)> {
  let text = String::from_utf8_lossy(line);
  let text = text.trim_end_matches(['\r', '\n']);
  let idx = text.find(':')?;
  let (name, value) = text.split_at(idx);
  Some((name.trim().to_string(), value[1..].trim().to_string()))
}

fn response_framing(method: &Method, status: StatusCode, headers: &HeaderMap) -> Framing {
  if method == Method::HEAD
    || status.is_informational()
    || status == StatusCode::NO_CONTENT
    || status == StatusCode::NOT_MODIFIED
  {
    return Framing::None;
  }
  if let Some(te) = headers.get(http::header::TRANSFER_ENCODING) {
    if te
      .to_str()
      .map(|v| v.eq_ignore_ascii_case("chunked"))
      .unwrap_or(false)
    {
      return Framing::Chunked(ChunkState::Boundary);
    }
  }
  if let Some(len) = content_length(headers) {
    return Framing::Length(len);
  }
  Framing::Eof
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
  headers
    .get(http::header::CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok()?.trim().parse().ok())
}

/// Parse one inbound request off a client socket.
///
/// `Ok(None)` means the peer closed the connection cleanly between requests.
/// The body is buffered in full so it can be teed into the capture record
/// before the round trip consumes it.
pub async fn read_request<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Request>> {
  let mut line = Vec::new();
  let n = reader.read_until(b'\n', &mut line).await?;
  if n == 0 {
    return Ok(None);
  }
  if line.len() > MAX_REQUEST_LINE {
    return Err(Error::invalid_request("request line too long"));
  }
  let text = String::from_utf8_lossy(&line);
  let mut parts = text.split_whitespace();
  let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
    (Some(m), Some(t), Some(v)) => (m, t, v),
    _ => return Err(Error::invalid_request("invalid request line")),
  };
  let method = Method::from_bytes(method.as_bytes())
    .map_err(|_| Error::invalid_request("invalid request method"))?;
  let version = match version {
    "HTTP/1.0" => Version::HTTP_10,
    "HTTP/1.1" => Version::HTTP_11,
    other => return Err(Error::invalid_request(format!("unsupported version {other}"))),
  };
  let uri: Uri = target
    .parse()
    .map_err(|_| Error::invalid_request("invalid request target"))?;

  let headers = read_header_block(reader).await?;

  // Inbound bodies are delimited the same way response bodies are.
  let body = if let Some(te) = headers.get(http::header::TRANSFER_ENCODING) {
    if te
      .to_str()
      .map(|v| v.eq_ignore_ascii_case("chunked"))
      .unwrap_or(false)
    {
      let mut body_reader = BodyReader::new(&mut *reader, Framing::Chunked(ChunkState::Boundary));
      Some(Bytes::from(body_reader.read_to_end().await?))
    } else {
      return Err(Error::invalid_request("unsupported transfer encoding"));
    }
  } else if let Some(len) = content_length(&headers) {
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Some(Bytes::from(buf))
  } else {
    None
  };

  Ok(Some(Request {
    method,
    uri,
    version,
    headers,
    body: body.filter(|b| !b.is_empty()),
  }))
}

/// Whether the client connection stays open after this request.
pub fn wants_keep_alive(request: &Request) -> bool {
  let connection = request
    .headers()
    .get(http::header::CONNECTION)
    .and_then(|v| v.to_str().ok())
    .unwrap_or_default();
  match request.version() {
    Version::HTTP_10 => connection.eq_ignore_ascii_case("keep-alive"),
    _ => !connection.eq_ignore_ascii_case("close"),
  }
}

/// Write a response status line plus header block to the client.
pub async fn write_response_head<W: AsyncWrite + Unpin>(
  writer: &mut W,
  status: StatusCode,
  headers: &HeaderMap,
) -> Result<()> {
  let mut out = Vec::new();
  out.extend_from_slice(
    format!(
      "HTTP/1.1 {} {}\r\n",
      status.as_u16(),
      status.canonical_reason().unwrap_or("Unknown")
    )
    .as_bytes(),
  );
  for (name, value) in headers.iter() {
    out.extend_from_slice(name.as_str().as_bytes());
    out.extend_from_slice(COLON_SPACE);
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(CR_LF);
  }
  out.extend_from_slice(CR_LF);
  writer.write_all(&out).await?;
  Ok(())
}
