//! Length-prefixed framing.
//!
//! Every message on a stream is a 4-byte big-endian length header followed
//! by a JSON body. Payloads that are not strict JSON (trailing commas,
//! markdown code fences) get one relaxed parse before failing.

use crate::error::WireError;
use bytes::{Buf, Bytes, BytesMut};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// Maximum single frame size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Length of the frame header.
pub const HEADER_LEN: usize = 4;

/// Characters of an unparseable payload quoted in the error.
const PREVIEW_CHARS: usize = 200;

/// Encode a message to bytes (4-byte big-endian length + JSON).
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Bytes, WireError> {
    let json = serde_json::to_vec(msg)?;
    if json.len() > MAX_FRAME_SIZE as usize {
        return Err(WireError::MessageTooLarge {
            size: json.len() as u32,
            max: MAX_FRAME_SIZE,
        });
    }
    let len = json.len() as u32;
    let mut bytes = BytesMut::with_capacity(HEADER_LEN + json.len());
    bytes.extend_from_slice(&len.to_be_bytes());
    bytes.extend_from_slice(&json);
    Ok(bytes.freeze())
}

/// Decode the length prefix from a 4-byte header.
pub fn decode_length(header: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*header)
}

/// Reassembles frames from arbitrarily chunked reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the stream.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Bytes buffered but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Pop the next complete frame body, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, WireError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.buf[..HEADER_LEN]);
        let len = decode_length(&header);
        if len > MAX_FRAME_SIZE {
            return Err(WireError::MessageTooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }
        let total = HEADER_LEN + len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        self.buf.advance(HEADER_LEN);
        Ok(Some(self.buf.split_to(len as usize).freeze()))
    }
}

/// Parse a frame body as JSON, falling back to a relaxed parse.
pub fn decode_payload(body: &[u8]) -> Result<Value, WireError> {
    let strict_err = match serde_json::from_slice::<Value>(body) {
        Ok(v) => return Ok(v),
        Err(e) => e,
    };

    let text = String::from_utf8_lossy(body);
    let cleaned = strip_code_fences(text.trim());
    match json5::from_str::<Value>(cleaned) {
        Ok(v) => {
            debug!(error = %strict_err, "Frame accepted by relaxed JSON parse");
            Ok(v)
        }
        Err(relaxed_err) => Err(WireError::Parse {
            reason: format!("{strict_err}; relaxed parse: {relaxed_err}"),
            preview: preview(&text),
        }),
    }
}

/// Remove a surrounding markdown code fence (```json ... ```).
fn strip_code_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop the info string (e.g. "json") up to the first newline.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(PREVIEW_CHARS).collect();
    if text.chars().count() > PREVIEW_CHARS {
        out.push_str("...");
    }
    out
}
