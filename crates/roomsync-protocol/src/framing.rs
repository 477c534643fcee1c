//! Frame encoding.
//!
//! Datagram-style channels carry one JSON frame per message
//! ([`encode_frame`] / [`decode_frame`]). Byte-stream channels prefix each
//! frame with its length:
//!
//! ```text
//! +----------------+------------------+
//! | length (4 BE)  |  JSON frame      |
//! +----------------+------------------+
//! ```

use serde::{Serialize, de::DeserializeOwned};

use crate::MAX_MESSAGE_SIZE;
use crate::error::{ProtocolError, ProtocolResult};
use crate::frame::Frame;

/// Serializes a single frame to JSON bytes.
pub fn encode_frame(frame: &Frame) -> ProtocolResult<Vec<u8>> {
    let json = serde_json::to_vec(frame)?;
    check_size(json.len())?;
    Ok(json)
}

/// Parses a single JSON frame.
///
/// Unknown kinds and malformed payloads are reported as
/// [`ProtocolError::Serialization`].
pub fn decode_frame(data: &[u8]) -> ProtocolResult<Frame> {
    check_size(data.len())?;
    Ok(serde_json::from_slice(data)?)
}

/// Prepends the 4-byte big-endian length to an encoded payload.
pub fn length_prefixed(payload: &[u8]) -> ProtocolResult<Vec<u8>> {
    let len = check_size(payload.len())?;
    let mut buffer = Vec::with_capacity(4 + payload.len());
    buffer.extend_from_slice(&len.to_be_bytes());
    buffer.extend_from_slice(payload);
    Ok(buffer)
}

/// Validates a length prefix read from a stream and returns the payload size.
pub fn payload_len(prefix: [u8; 4]) -> ProtocolResult<usize> {
    let len = u32::from_be_bytes(prefix);
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    if len == 0 {
        return Err(ProtocolError::EmptyMessage);
    }
    Ok(len as usize)
}

/// Encodes any message with a length prefix.
pub fn encode_message<T: Serialize>(message: &T) -> ProtocolResult<Vec<u8>> {
    let json = serde_json::to_vec(message)?;
    length_prefixed(&json)
}

/// Decodes a complete length-prefixed message.
pub fn decode_message<T: DeserializeOwned>(data: &[u8]) -> ProtocolResult<T> {
    let Some(prefix) = data.first_chunk::<4>() else {
        return Err(ProtocolError::IncompleteMessage {
            expected: 4,
            received: data.len(),
        });
    };
    let len = payload_len(*prefix)?;
    let Some(json) = data.get(4..4 + len) else {
        return Err(ProtocolError::IncompleteMessage {
            expected: 4 + len,
            received: data.len(),
        });
    };
    Ok(serde_json::from_slice(json)?)
}

fn check_size(len: usize) -> ProtocolResult<u32> {
    match u32::try_from(len) {
        Ok(len) if len <= MAX_MESSAGE_SIZE => Ok(len),
        _ => Err(ProtocolError::MessageTooLarge {
            size: u32::try_from(len).unwrap_or(u32::MAX),
            max: MAX_MESSAGE_SIZE,
        }),
    }
}
