//! Framed protocol between the execution host and a JS worker.
//!
//! ## Wire Format
//!
//! ```text
//! [4-byte length][1-byte type][4-byte seq][payload]
//! ```
//!
//! - **length**: big-endian u32, size of (type + seq + payload)
//! - **type**: u8 message type
//! - **seq**: big-endian u32, sequence number (0 for unsolicited messages)
//! - **payload**: type-specific data
//!
//! ## Message Types
//!
//! | Type | Direction | Name         | Payload |
//! |------|-----------|--------------|---------|
//! | 0x00 | W→H       | ready        | (empty) |
//! | 0x01 | H→W       | ping         | (empty) |
//! | 0x02 | W→H       | pong         | (empty) |
//! | 0x03 | H→W       | exec         | JSON `ExecutionRequest` |
//! | 0x04 | W→H       | exec_result  | JSON `ExecutionResult` |
//! | 0x0A | H→W       | shutdown     | (empty) |
//! | 0x0B | W→H       | shutdown_ack | (empty) |
//! | 0xFF | W→H       | error        | `[2B error_len][error]` |

use sandbox::{ExecutionRequest, ExecutionResult};

/// Header size (4-byte length prefix).
pub const HEADER_SIZE: usize = 4;

/// Maximum message body size (16 MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Minimum body size: type (1) + seq (4).
pub const MIN_BODY_SIZE: usize = 5;

// Message type constants.
pub const MSG_READY: u8 = 0x00;
pub const MSG_PING: u8 = 0x01;
pub const MSG_PONG: u8 = 0x02;
pub const MSG_EXEC: u8 = 0x03;
pub const MSG_EXEC_RESULT: u8 = 0x04;
pub const MSG_SHUTDOWN: u8 = 0x0A;
pub const MSG_SHUTDOWN_ACK: u8 = 0x0B;
pub const MSG_ERROR: u8 = 0xFF;

/// Protocol error.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    MessageTooLarge(usize),
    MessageTooSmall(usize),
    InvalidPayload(&'static str),
    Json(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MessageTooLarge(size) => write!(f, "message too large: {size}"),
            Self::MessageTooSmall(size) => write!(f, "message too small: {size}"),
            Self::InvalidPayload(msg) => write!(f, "invalid payload: {msg}"),
            Self::Json(msg) => write!(f, "invalid JSON payload: {msg}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// A raw decoded message.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub msg_type: u8,
    pub seq: u32,
    pub payload: Vec<u8>,
}

/// Human-readable name of a message type, for logs.
pub fn type_name(msg_type: u8) -> &'static str {
    match msg_type {
        MSG_READY => "ready",
        MSG_PING => "ping",
        MSG_PONG => "pong",
        MSG_EXEC => "exec",
        MSG_EXEC_RESULT => "exec_result",
        MSG_SHUTDOWN => "shutdown",
        MSG_SHUTDOWN_ACK => "shutdown_ack",
        MSG_ERROR => "error",
        _ => "unknown",
    }
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Encode a raw message: `[4-byte length][1-byte type][4-byte seq][payload]`.
pub fn encode(msg_type: u8, seq: u32, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let body_len = 1 + 4 + payload.len();
    if body_len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(body_len));
    }
    let mut buf = Vec::with_capacity(HEADER_SIZE + body_len);
    buf.extend_from_slice(&(body_len as u32).to_be_bytes());
    buf.push(msg_type);
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Encode exec payload as JSON.
pub fn encode_exec(request: &ExecutionRequest) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(request).map_err(|e| ProtocolError::Json(e.to_string()))
}

/// Encode exec_result payload as JSON.
pub fn encode_exec_result(result: &ExecutionResult) -> Result<Vec<u8>, ProtocolError> {
    serde_json::to_vec(result).map_err(|e| ProtocolError::Json(e.to_string()))
}

/// Encode error payload: `[2B error_len][error]`.
///
/// Error message is truncated to 65535 bytes if longer, on a UTF-8 boundary.
pub fn encode_error(message: &str) -> Vec<u8> {
    let mut end = message.len().min(u16::MAX as usize);
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    let msg = message.get(..end).unwrap_or_default().as_bytes();
    let mut p = Vec::with_capacity(2 + msg.len());
    p.extend_from_slice(&(msg.len() as u16).to_be_bytes());
    p.extend_from_slice(msg);
    p
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Decode exec payload.
pub fn decode_exec(payload: &[u8]) -> Result<ExecutionRequest, ProtocolError> {
    serde_json::from_slice(payload).map_err(|e| ProtocolError::Json(e.to_string()))
}

/// Decode exec_result payload.
pub fn decode_exec_result(payload: &[u8]) -> Result<ExecutionResult, ProtocolError> {
    serde_json::from_slice(payload).map_err(|e| ProtocolError::Json(e.to_string()))
}

/// Decode error payload. Returns the error message.
pub fn decode_error(payload: &[u8]) -> Result<&str, ProtocolError> {
    let msg_len = payload
        .first_chunk::<2>()
        .map(|len| u16::from_be_bytes(*len) as usize)
        .ok_or(ProtocolError::InvalidPayload("error payload too short"))?;
    std::str::from_utf8(
        payload
            .get(2..2 + msg_len)
            .ok_or(ProtocolError::InvalidPayload("error message truncated"))?,
    )
    .map_err(|_| ProtocolError::InvalidPayload("invalid UTF-8 in error"))
}

// ---------------------------------------------------------------------------
// Decoder (buffered, handles partial reads)
// ---------------------------------------------------------------------------

/// Split one complete frame off the front of `buf`.
///
/// Returns the message and the number of bytes it occupied, or `None` when
/// `buf` does not hold a whole frame yet.
fn split_frame(buf: &[u8]) -> Result<Option<(RawMessage, usize)>, ProtocolError> {
    let Some(prefix) = buf.first_chunk::<HEADER_SIZE>() else {
        return Ok(None);
    };
    let body_len = u32::from_be_bytes(*prefix) as usize;
    if body_len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge(body_len));
    }
    if body_len < MIN_BODY_SIZE {
        return Err(ProtocolError::MessageTooSmall(body_len));
    }
    let Some(body) = buf.get(HEADER_SIZE..HEADER_SIZE + body_len) else {
        return Ok(None);
    };
    let (head, payload) = body.split_at(MIN_BODY_SIZE);
    let [msg_type, s0, s1, s2, s3] = *head else {
        return Err(ProtocolError::InvalidPayload("frame header truncated"));
    };
    let message = RawMessage {
        msg_type,
        seq: u32::from_be_bytes([s0, s1, s2, s3]),
        payload: payload.to_vec(),
    };
    Ok(Some((message, HEADER_SIZE + body_len)))
}

/// Buffered frame decoder for a byte stream such as a worker's stdout.
pub struct Decoder {
    pending: Vec<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            pending: Vec::with_capacity(64 * 1024),
        }
    }

    /// Append `data` and return every frame that is now complete.
    ///
    /// A bad length prefix poisons the stream: buffered bytes are dropped
    /// and the error is returned.
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<RawMessage>, ProtocolError> {
        self.pending.extend_from_slice(data);
        let mut messages = Vec::new();
        let mut consumed = 0;
        loop {
            let rest = self.pending.get(consumed..).unwrap_or_default();
            match split_frame(rest) {
                Ok(Some((message, used))) => {
                    messages.push(message);
                    consumed += used;
                }
                Ok(None) => break,
                Err(e) => {
                    self.pending.clear();
                    return Err(e);
                }
            }
        }
        self.pending.drain(..consumed);
        Ok(messages)
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
