//! The wire envelope and its closed set of frame kinds.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::room::{LeaderChangeReason, Member, RoomInfo, RoomOptions};

/// The atomic unit of wire communication.
///
/// ```text
/// { "kind": "...", "sequence": 7, "timestamp": 1700000000000,
///   "messageId"?: "...", "roomId"?: "...", ...kind fields }
/// ```
///
/// `sequence` and `timestamp` are stamped by the transport at send time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    /// Per-connection sequence number, strictly increasing on the sending side.
    #[serde(default)]
    pub sequence: u64,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
    /// Caller-assigned id correlating a request with its reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Room the frame belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    /// Kind tag and kind-specific fields.
    #[serde(flatten)]
    pub body: FrameBody,
}

impl Frame {
    /// Creates an unsequenced frame.
    pub fn new(body: FrameBody) -> Self {
        Self {
            sequence: 0,
            timestamp: 0,
            message_id: None,
            room_id: None,
            body,
        }
    }

    /// Builder: set the correlation id.
    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Builder: set the room id.
    pub fn with_room_id(mut self, room_id: impl Into<String>) -> Self {
        self.room_id = Some(room_id.into());
        self
    }

    /// Builder: set the sequence number.
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Returns the kind of this frame.
    pub fn kind(&self) -> FrameKind {
        self.body.kind()
    }

    /// True when the frame targets `room_id` or names no room at all.
    pub fn is_for_room(&self, room_id: &str) -> bool {
        self.room_id.as_deref().is_none_or(|id| id == room_id)
    }
}

/// Frame kinds and their payloads.
///
/// Unknown kinds fail to decode; there is no catch-all variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum FrameBody {
    /// Ask the host to create a room.
    CreateRoom { game_id: String, options: RoomOptions },
    /// Reply to `createRoom`.
    RoomCreated { room: RoomInfo },
    /// Ask to join a room by code.
    JoinRoom { join_code: String },
    /// Reply to `joinRoom` and `quickPlay`.
    RoomJoined { room: RoomInfo },
    /// Ask to be matched into any public room for a game.
    QuickPlay { game_id: String },
    /// Ask to leave the room named in the envelope.
    LeaveRoom,
    /// Reply to `leaveRoom`.
    RoomLeft,
    /// Failure reply to any room request.
    Error {
        #[serde(default)]
        code: ErrorCode,
        #[serde(default, alias = "error")]
        message: String,
    },
    /// Ask for a TTL-bounded lock.
    LockAcquire { key: String, ttl: u64, lock_id: String },
    /// The lock was granted.
    LockAcquired { key: String, lock_id: String },
    /// The lock is held by someone else.
    LockDenied {
        key: String,
        lock_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        holder: Option<String>,
    },
    /// Give a lock back.
    LockRelease { key: String, lock_id: String },
    /// Reply to `lockRelease`.
    LockReleased { key: String, lock_id: String },
    /// The host dropped a lock whose TTL ran out.
    LockExpired { key: String, lock_id: String },
    /// Local register write, broadcast by the host to the other members.
    RegisterSet { key: String, value: Value, version: u64 },
    /// Register write made by another member.
    RegisterUpdate {
        key: String,
        value: Value,
        version: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        updated_by: Option<String>,
    },
    /// Application broadcast.
    Event {
        event_type: String,
        #[serde(default)]
        payload: Value,
    },
    /// A member joined; carries the new member list.
    MemberJoined {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        member: Option<Member>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        member_count: Option<u32>,
        #[serde(default)]
        members: Vec<Member>,
    },
    /// A member left; carries the new member list.
    MemberLeft {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        member_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        member_count: Option<u32>,
        #[serde(default)]
        members: Vec<Member>,
    },
    /// The host moved leadership.
    LeaderChanged {
        new_leader_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_leader_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<LeaderChangeReason>,
    },
    /// Partial or full room snapshot pushed by the host.
    #[serde(rename = "roomState")]
    RoomSnapshot { room: RoomInfo },
    /// Acknowledges receipt of the frame with `ack_sequence`.
    Ack { ack_sequence: u64 },
    /// Liveness probe; never retransmitted.
    Heartbeat,
}

impl FrameBody {
    /// Creates a `createRoom` body.
    pub fn create_room(game_id: impl Into<String>, options: RoomOptions) -> Self {
        Self::CreateRoom {
            game_id: game_id.into(),
            options,
        }
    }

    /// Creates a `joinRoom` body.
    pub fn join_room(join_code: impl Into<String>) -> Self {
        Self::JoinRoom {
            join_code: join_code.into(),
        }
    }

    /// Creates a `quickPlay` body.
    pub fn quick_play(game_id: impl Into<String>) -> Self {
        Self::QuickPlay {
            game_id: game_id.into(),
        }
    }

    /// Creates an `error` body.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Creates an `event` body.
    pub fn event(event_type: impl Into<String>, payload: Value) -> Self {
        Self::Event {
            event_type: event_type.into(),
            payload,
        }
    }

    /// Returns the kind tag.
    pub fn kind(&self) -> FrameKind {
        match self {
            Self::CreateRoom { .. } => FrameKind::CreateRoom,
            Self::RoomCreated { .. } => FrameKind::RoomCreated,
            Self::JoinRoom { .. } => FrameKind::JoinRoom,
            Self::RoomJoined { .. } => FrameKind::RoomJoined,
            Self::QuickPlay { .. } => FrameKind::QuickPlay,
            Self::LeaveRoom => FrameKind::LeaveRoom,
            Self::RoomLeft => FrameKind::RoomLeft,
            Self::Error { .. } => FrameKind::Error,
            Self::LockAcquire { .. } => FrameKind::LockAcquire,
            Self::LockAcquired { .. } => FrameKind::LockAcquired,
            Self::LockDenied { .. } => FrameKind::LockDenied,
            Self::LockRelease { .. } => FrameKind::LockRelease,
            Self::LockReleased { .. } => FrameKind::LockReleased,
            Self::LockExpired { .. } => FrameKind::LockExpired,
            Self::RegisterSet { .. } => FrameKind::RegisterSet,
            Self::RegisterUpdate { .. } => FrameKind::RegisterUpdate,
            Self::Event { .. } => FrameKind::Event,
            Self::MemberJoined { .. } => FrameKind::MemberJoined,
            Self::MemberLeft { .. } => FrameKind::MemberLeft,
            Self::LeaderChanged { .. } => FrameKind::LeaderChanged,
            Self::RoomSnapshot { .. } => FrameKind::RoomState,
            Self::Ack { .. } => FrameKind::Ack,
            Self::Heartbeat => FrameKind::Heartbeat,
        }
    }
}

/// Payload-free kind tag, cheap to copy into logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    CreateRoom,
    RoomCreated,
    JoinRoom,
    RoomJoined,
    QuickPlay,
    LeaveRoom,
    RoomLeft,
    Error,
    LockAcquire,
    LockAcquired,
    LockDenied,
    LockRelease,
    LockReleased,
    LockExpired,
    RegisterSet,
    RegisterUpdate,
    Event,
    MemberJoined,
    MemberLeft,
    LeaderChanged,
    RoomState,
    Ack,
    Heartbeat,
}

impl FrameKind {
    /// The `kind` string used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateRoom => "createRoom",
            Self::RoomCreated => "roomCreated",
            Self::JoinRoom => "joinRoom",
            Self::RoomJoined => "roomJoined",
            Self::QuickPlay => "quickPlay",
            Self::LeaveRoom => "leaveRoom",
            Self::RoomLeft => "roomLeft",
            Self::Error => "error",
            Self::LockAcquire => "lockAcquire",
            Self::LockAcquired => "lockAcquired",
            Self::LockDenied => "lockDenied",
            Self::LockRelease => "lockRelease",
            Self::LockReleased => "lockReleased",
            Self::LockExpired => "lockExpired",
            Self::RegisterSet => "registerSet",
            Self::RegisterUpdate => "registerUpdate",
            Self::Event => "event",
            Self::MemberJoined => "memberJoined",
            Self::MemberLeft => "memberLeft",
            Self::LeaderChanged => "leaderChanged",
            Self::RoomState => "roomState",
            Self::Ack => "ack",
            Self::Heartbeat => "heartbeat",
        }
    }

    /// Heartbeats are exempt from retransmission tracking.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Self::Heartbeat)
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error codes carried by `error` frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// No room matches the code or id.
    RoomNotFound,
    /// The room has no free slot.
    RoomFull,
    /// The request was malformed.
    InvalidRequest,
    /// The sender is not a member of the room.
    NotInRoom,
    /// The host failed internally.
    InternalError,
    /// Any code this client does not know.
    #[default]
    #[serde(other)]
    Unknown,
}

impl ErrorCode {
    /// Returns a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            Self::RoomNotFound => "Room not found",
            Self::RoomFull => "Room is full",
            Self::InvalidRequest => "The request was invalid",
            Self::NotInRoom => "Not a member of the room",
            Self::InternalError => "The host failed internally",
            Self::Unknown => "Unknown error",
        }
    }
}
