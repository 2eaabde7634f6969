//! Content type detection from the leading bytes of a response body.
//!
//! Many origins mislabel what they serve, so captured records carry a
//! sniffed content type next to the declared `Content-Type` header. The
//! detection looks at up to the first 512 bytes.

const SNIFF_LEN: usize = 512;

struct MagicSig {
  prefix: &'static [u8],
  content_type: &'static str,
}

const MAGIC_SIGS: &[MagicSig] = &[
  MagicSig { prefix: b"%PDF-", content_type: "application/pdf" },
  MagicSig { prefix: b"%!PS-Adobe-", content_type: "application/postscript" },
  MagicSig { prefix: b"GIF87a", content_type: "image/gif" },
  MagicSig { prefix: b"GIF89a", content_type: "image/gif" },
  MagicSig { prefix: b"\x89PNG\r\n\x1a\n", content_type: "image/png" },
  MagicSig { prefix: b"\xff\xd8\xff", content_type: "image/jpeg" },
  MagicSig { prefix: b"BM", content_type: "image/bmp" },
  MagicSig { prefix: b"\x00\x00\x01\x00", content_type: "image/x-icon" },
  MagicSig { prefix: b"\x1f\x8b\x08", content_type: "application/x-gzip" },
  MagicSig { prefix: b"PK\x03\x04", content_type: "application/zip" },
  MagicSig { prefix: b"Rar!\x1a\x07\x00", content_type: "application/x-rar-compressed" },
  MagicSig { prefix: b"\x00asm", content_type: "application/wasm" },
  MagicSig { prefix: b"OggS\x00", content_type: "application/ogg" },
  MagicSig { prefix: b"ID3", content_type: "audio/mpeg" },
  MagicSig { prefix: b"fLaC", content_type: "audio/x-flac" },
  MagicSig { prefix: b"\x1aE\xdf\xa3", content_type: "video/webm" },
];

/// HTML openers, matched case-insensitively after leading whitespace.
const HTML_SIGS: &[&[u8]] = &[
  b"<!DOCTYPE HTML",
  b"<HTML",
  b"<HEAD",
  b"<SCRIPT",
  b"<IFRAME",
  b"<H1",
  b"<DIV",
  b"<FONT",
  b"<TABLE",
  b"<A",
  b"<STYLE",
  b"<TITLE",
  b"<B",
  b"<BODY",
  b"<BR",
  b"<P",
  b"<!--",
];

/// Detect the content type of `data` from its leading bytes.
///
/// An empty or undecidable-but-textual buffer yields
/// `text/plain; charset=utf-8`; anything that looks binary without a known
/// signature yields `application/octet-stream`.
pub fn detect_content_type(data: &[u8]) -> &'static str {
  let data = &data[..data.len().min(SNIFF_LEN)];

  // Byte order marks decide the charset outright.
  if data.starts_with(&[0xef, 0xbb, 0xbf]) {
    return "text/plain; charset=utf-8";
  }
  if data.starts_with(&[0xfe, 0xff]) {
    return "text/plain; charset=utf-16be";
  }
  if data.starts_with(&[0xff, 0xfe]) {
    return "text/plain; charset=utf-16le";
  }

  let trimmed = trim_leading_whitespace(data);
  for sig in HTML_SIGS {
    if matches_html_sig(trimmed, sig) {
      return "text/html; charset=utf-8";
    }
  }
  if trimmed.starts_with(b"<?xml") {
    return "text/xml; charset=utf-8";
  }

  for sig in MAGIC_SIGS {
    if data.starts_with(sig.prefix) {
      return sig.content_type;
    }
  }

  // RIFF containers share a prefix, the format tag sits at offset 8.
  if data.starts_with(b"RIFF") && data.len() >= 12 {
    match &data[8..12] {
      b"WEBP" => return "image/webp",
      b"WAVE" => return "audio/wave",
      _ => {}
    }
  }
  if data.len() >= 12 && &data[4..8] == b"ftyp" {
    return "video/mp4";
  }

  if data.iter().any(|b| is_binary_byte(*b)) {
    return "application/octet-stream";
  }
  "text/plain; charset=utf-8"
}

fn trim_leading_whitespace(data: &[u8]) -> &[u8] {
  let start = data
    .iter()
    .position(|b| !matches!(b, b'\t' | b'\n' | b'\x0c' | b'\r' | b' '))
    .unwrap_or(data.len());
  &data[start..]
}

/// An HTML opener must be followed by a tag-terminating byte to count.
fn matches_html_sig(data: &[u8], sig: &[u8]) -> bool {
  if data.len() < sig.len() + 1 {
    return false;
  }
  for (b, s) in data.iter().zip(sig.iter()) {
    if !b.eq_ignore_ascii_case(s) {
      return false;
    }
  }
  matches!(data[sig.len()], b' ' | b'>')
}

fn is_binary_byte(b: u8) -> bool {
  matches!(b, 0x00..=0x08 | 0x0b | 0x0e..=0x1a | 0x1c..=0x1f)
}
