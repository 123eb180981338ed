//! Relay reply framing.
//!
//! Two framings are supported:
//!
//! - [`Framing::Legacy`]: a value is exactly 4 native-endian bytes of an
//!   IEEE-754 `f32`; an error is bare text. The client can only tell them
//!   apart by length, so a 4-byte error text is indistinguishable from a
//!   value. Kept for clients that already speak it.
//! - [`Framing::Framed`]: `status: u8`, `length: u32` (big-endian), then
//!   `length` payload bytes. A value payload is a little-endian `f32`; error
//!   payloads are UTF-8 text.
//!
//! ```text
//! +--------+----------------+------------------+
//! | status | length (u32 BE)| payload          |
//! +--------+----------------+------------------+
//!     1            4           length bytes
//! ```

use crate::error::{RelayError, RelayResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Size of a packed `f32`.
pub const VALUE_SIZE: usize = 4;

/// Size of the framed header (status + length).
pub const HEADER_SIZE: usize = 5;

/// Reply framing spoken by a relay and its clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    Legacy,
    #[default]
    Framed,
}

/// Status byte of a framed reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyStatus {
    Ok = 0,
    Unrecognized = 1,
    DeviceFault = 2,
    Timeout = 3,
    InvalidArgument = 4,
}

impl TryFrom<u8> for ReplyStatus {
    type Error = RelayError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ReplyStatus::Ok),
            1 => Ok(ReplyStatus::Unrecognized),
            2 => Ok(ReplyStatus::DeviceFault),
            3 => Ok(ReplyStatus::Timeout),
            4 => Ok(ReplyStatus::InvalidArgument),
            other => Err(RelayError::Protocol(format!("unknown status byte {other}"))),
        }
    }
}

/// A relay reply before framing.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Value(f32),
    Error { status: ReplyStatus, message: String },
}

impl Reply {
    /// Map a dispatcher result onto a reply.
    pub fn from_result(result: &RelayResult<f32>) -> Self {
        match result {
            Ok(value) => Reply::Value(*value),
            Err(err) => {
                let status = match err {
                    RelayError::Unrecognized(_) => ReplyStatus::Unrecognized,
                    RelayError::InvalidArgument(_) => ReplyStatus::InvalidArgument,
                    RelayError::Timeout(_) => ReplyStatus::Timeout,
                    _ => ReplyStatus::DeviceFault,
                };
                Reply::Error {
                    status,
                    message: legacy_error_text(err),
                }
            }
        }
    }

    /// Encode this reply for the wire.
    pub fn encode(&self, framing: Framing) -> Bytes {
        match (framing, self) {
            (Framing::Legacy, Reply::Value(value)) => Bytes::copy_from_slice(&pack_f32(*value)),
            (Framing::Legacy, Reply::Error { message, .. }) => {
                Bytes::copy_from_slice(message.as_bytes())
            }
            (Framing::Framed, Reply::Value(value)) => {
                let mut buf = BytesMut::with_capacity(HEADER_SIZE + VALUE_SIZE);
                buf.put_u8(ReplyStatus::Ok as u8);
                buf.put_u32(VALUE_SIZE as u32);
                buf.put_f32_le(*value);
                buf.freeze()
            }
            (Framing::Framed, Reply::Error { status, message }) => {
                let mut buf = BytesMut::with_capacity(HEADER_SIZE + message.len());
                buf.put_u8(*status as u8);
                buf.put_u32(message.len() as u32);
                buf.put_slice(message.as_bytes());
                buf.freeze()
            }
        }
    }

    /// Turn a decoded reply back into a result for the caller.
    pub fn into_result(self) -> RelayResult<f32> {
        match self {
            Reply::Value(value) => Ok(value),
            Reply::Error { status, message } => Err(match status {
                ReplyStatus::Unrecognized => RelayError::Unrecognized(message),
                ReplyStatus::InvalidArgument => RelayError::InvalidArgument(message),
                ReplyStatus::Timeout => RelayError::Timeout(message),
                ReplyStatus::DeviceFault | ReplyStatus::Ok => RelayError::DeviceFault(message),
            }),
        }
    }
}

const LEGACY_UNRECOGNIZED: &str = "ERROR: unrecognized command";

/// Text sent in place of a value on the error path.
pub fn legacy_error_text(err: &RelayError) -> String {
    match err {
        RelayError::Unrecognized(text) => format!("{LEGACY_UNRECOGNIZED} '{text}'"),
        other => format!("ERROR: {other}"),
    }
}

/// Pack a float into the legacy 4-byte wire format.
pub fn pack_f32(value: f32) -> [u8; VALUE_SIZE] {
    value.to_ne_bytes()
}

/// Unpack a float from the legacy 4-byte wire format.
pub fn unpack_f32(bytes: &[u8]) -> RelayResult<f32> {
    let raw: [u8; VALUE_SIZE] = bytes.try_into().map_err(|_| {
        RelayError::Protocol(format!(
            "expected {VALUE_SIZE} bytes for a value, got {}",
            bytes.len()
        ))
    })?;
    Ok(f32::from_ne_bytes(raw))
}

/// Decode a legacy reply.
///
/// Exactly 4 bytes are a value; nothing is an empty reply; anything else is
/// treated as error text.
pub fn decode_legacy(bytes: &[u8]) -> RelayResult<Reply> {
    match bytes.len() {
        0 => Err(RelayError::EmptyReply),
        VALUE_SIZE => Ok(Reply::Value(unpack_f32(bytes)?)),
        _ => {
            let message = String::from_utf8_lossy(bytes).trim().to_string();
            let status = if message.starts_with(LEGACY_UNRECOGNIZED) {
                ReplyStatus::Unrecognized
            } else {
                ReplyStatus::DeviceFault
            };
            Ok(Reply::Error { status, message })
        }
    }
}

/// Parse a framed header, returning the status and payload length.
pub fn decode_header(header: &[u8]) -> RelayResult<(ReplyStatus, usize)> {
    if header.len() < HEADER_SIZE {
        return Err(RelayError::Protocol(format!(
            "header needs {HEADER_SIZE} bytes, got {}",
            header.len()
        )));
    }
    let mut cursor = header;
    let status = ReplyStatus::try_from(cursor.get_u8())?;
    let length = cursor.get_u32() as usize;
    Ok((status, length))
}

/// Decode a complete framed reply (header + payload).
pub fn decode_framed(bytes: &[u8]) -> RelayResult<Reply> {
    if bytes.is_empty() {
        return Err(RelayError::EmptyReply);
    }
    let (status, length) = decode_header(bytes)?;
    let payload = &bytes[HEADER_SIZE..];
    if payload.len() != length {
        return Err(RelayError::Protocol(format!(
            "payload length {} does not match header length {length}",
            payload.len()
        )));
    }
    decode_payload(status, payload)
}

/// Interpret a framed payload once its header has been read.
pub fn decode_payload(status: ReplyStatus, mut payload: &[u8]) -> RelayResult<Reply> {
    match status {
        ReplyStatus::Ok => {
            if payload.len() != VALUE_SIZE {
                return Err(RelayError::Protocol(format!(
                    "value payload must be {VALUE_SIZE} bytes, got {}",
                    payload.len()
                )));
            }
            Ok(Reply::Value(payload.get_f32_le()))
        }
        status => Ok(Reply::Error {
            status,
            message: String::from_utf8_lossy(payload).into_owned(),
        }),
    }
}

/// Decode a whole reply in the given framing.
pub fn decode_reply(bytes: &[u8], framing: Framing) -> RelayResult<Reply> {
    match framing {
        Framing::Legacy => decode_legacy(bytes),
        Framing::Framed => decode_framed(bytes),
    }
}
