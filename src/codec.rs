//! Newline-delimited JSON-RPC framing
//!
//! snapserver writes one JSON object per line, terminated with `\r\n`. The
//! decoder tolerates messages split across reads and several messages in a
//! single read; each `decode` call yields at most one message and leaves the
//! remainder in the buffer.

use crate::error::{Result, SnapError};
use crate::protocol::{Incoming, Method, Request};
use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

/// Longest line accepted before the stream is considered corrupt
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Codec for JSON-RPC messages over a raw TCP stream
#[derive(Debug, Default)]
pub struct JsonRpcCodec {
    /// Bytes already scanned for a newline in the current buffer
    scanned: usize,
}

impl JsonRpcCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Encode a single request as one newline-terminated line
pub fn encode_request(method: Method, params: Option<Value>, id: u64) -> Result<Bytes> {
    let request = match params {
        Some(params) => Request::new(id, method).with_params(params),
        None => Request::new(id, method),
    };

    let mut buf = BytesMut::new();
    JsonRpcCodec::new().encode(request, &mut buf)?;
    Ok(buf.freeze())
}

impl Decoder for JsonRpcCodec {
    type Item = Incoming;
    type Error = SnapError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Incoming>> {
        loop {
            let Some(offset) = buf[self.scanned..].iter().position(|b| *b == b'\n') else {
                if buf.len() > MAX_FRAME_LEN {
                    return Err(SnapError::Protocol(format!(
                        "frame exceeds {} bytes without a delimiter",
                        MAX_FRAME_LEN
                    )));
                }
                self.scanned = buf.len();
                return Ok(None);
            };

            let end = self.scanned + offset;
            self.scanned = 0;
            if end > MAX_FRAME_LEN {
                return Err(SnapError::Protocol(format!(
                    "frame of {} bytes exceeds {} bytes",
                    end, MAX_FRAME_LEN
                )));
            }
            let frame = buf.split_to(end + 1);
            let line = &frame[..end];
            let line = line.strip_suffix(b"\r").unwrap_or(line);

            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let value: Value = serde_json::from_slice(line)
                .map_err(|e| SnapError::Protocol(format!("malformed JSON: {}", e)))?;
            return Incoming::from_value(value).map(Some);
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Incoming>> {
        if let Some(message) = self.decode(buf)? {
            return Ok(Some(message));
        }
        if buf.iter().all(u8::is_ascii_whitespace) {
            buf.clear();
            Ok(None)
        } else {
            Err(SnapError::Protocol(
                "stream ended in the middle of a message".to_string(),
            ))
        }
    }
}

impl Encoder<Request> for JsonRpcCodec {
    type Error = SnapError;

    fn encode(&mut self, request: Request, buf: &mut BytesMut) -> Result<()> {
        let json = serde_json::to_vec(&request)?;
        buf.reserve(json.len() + 1);
        buf.put_slice(&json);
        buf.put_u8(b'\n');
        Ok(())
    }
}
