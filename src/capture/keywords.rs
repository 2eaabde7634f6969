//! Search keyword extraction from captured bodies.
//!
//! Bodies are peeked up to a fixed budget, gzip payloads are inflated first,
//! and the result is reduced to lowercase tokens suitable for LIKE matching.

use flate2::read::MultiGzDecoder;
use std::io::Read;

/// Upper bound on how much of each body is examined (10 MiB).
const PEEK_LENGTH: usize = 1024 * 1024 * 10;
/// Tokens shorter than this carry no search value.
const MIN_WORD_LENGTH: usize = 3;

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];

/// Peek up to [`PEEK_LENGTH`] bytes of `body`, inflating gzip content when
/// the magic bytes announce it.
fn peek(body: &[u8]) -> Vec<u8> {
  if body.starts_with(GZIP_MAGIC) {
    let mut out = vec![0u8; PEEK_LENGTH];
    let mut decoder = MultiGzDecoder::new(body);
    let mut filled = 0;
    // A short or broken stream yields whatever inflated so far.
    while filled < out.len() {
      match decoder.read(&mut out[filled..]) {
        Ok(0) => break,
        Ok(n) => filled += n,
        Err(_) => break,
      }
    }
    out.truncate(filled);
    out
  } else {
    body[..body.len().min(PEEK_LENGTH)].to_vec()
  }
}

/// Replace every byte outside `[0-9a-zA-Z\s.]` with a space and collapse
/// whitespace runs into single spaces.
pub fn sanitize(input: &str) -> String {
  let mut out = String::with_capacity(input.len());
  let mut pending_space = false;
  for c in input.chars() {
    let mapped = if c.is_ascii_alphanumeric() || c == '.' {
      Some(c)
    } else {
      None
    };
    match mapped {
      Some(c) => {
        if pending_space && !out.is_empty() {
          out.push(' ');
        }
        pending_space = false;
        out.push(c);
      }
      None => pending_space = true,
    }
  }
  out
}

/// Derive the keyword blob for a record from its bodies.
///
/// The result is lowercased, stripped of unsafe characters and reduced to
/// whitespace separated tokens of length at least three.
pub fn extract(bodies: &[&[u8]]) -> Vec<u8> {
  let mut text = Vec::new();
  for body in bodies {
    text.extend_from_slice(&peek(body));
    text.push(b' ');
  }
  let lowered: String = String::from_utf8_lossy(&text).to_lowercase();
  let cleaned = sanitize(&lowered);
  let mut keywords = Vec::new();
  for word in cleaned.split_whitespace() {
    if word.len() >= MIN_WORD_LENGTH {
      if !keywords.is_empty() {
        keywords.push(b' ');
      }
      keywords.extend_from_slice(word.as_bytes());
    }
  }
  keywords
}
