//! Wire envelope, frame kinds and room data model for roomsync.
//!
//! # Envelope
//!
//! Every message is a [`Frame`]: the envelope fields (`sequence`,
//! `timestamp`, optional `messageId` and `roomId`) sit next to a `kind` tag
//! and the fields of that kind. The set of kinds is closed; anything else
//! fails to decode.
//!
//! # Example
//!
//! ```rust
//! use roomsync_protocol::{decode_frame, encode_frame, Frame, FrameBody, FrameKind};
//!
//! let frame = Frame::new(FrameBody::join_room("AB12")).with_message_id("join_1");
//! let bytes = encode_frame(&frame).unwrap();
//! let decoded = decode_frame(&bytes).unwrap();
//! assert_eq!(decoded.kind(), FrameKind::JoinRoom);
//! ```

mod error;
mod frame;
mod framing;
mod room;

pub use error::{ProtocolError, ProtocolResult};
pub use frame::{ErrorCode, Frame, FrameBody, FrameKind};
pub use framing::{
    decode_frame, decode_message, encode_frame, encode_message, length_prefixed, payload_len,
};
pub use room::{LeaderChangeReason, Member, RoomInfo, RoomOptions, RoomState, Visibility};

/// Maximum encoded frame size (1 MiB).
pub const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;
