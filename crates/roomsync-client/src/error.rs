//! Client error types.

use std::io;
use std::time::Duration;

use roomsync_protocol::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors that can occur in the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Reconnect attempts ran out; the transport will not retry again.
    #[error("transport exhausted after {attempts} reconnect attempts")]
    TransportExhausted { attempts: u32 },

    /// The transport was shut down.
    #[error("transport is shut down")]
    TransportClosed,

    /// A room request got no reply in time.
    #[error("room {operation} timed out after {}ms", .timeout.as_millis())]
    RoomTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The host rejected a room request.
    #[error("room {operation} failed: {message}")]
    RoomError {
        operation: &'static str,
        code: ErrorCode,
        message: String,
    },

    /// A room is already active on this client.
    #[error("already in room {room_id}")]
    AlreadyInRoom { room_id: String },

    /// Another room request is still awaiting its reply.
    #[error("a room request is already in flight")]
    RoomBusy,

    /// The operation needs an active room.
    #[error("not in a room")]
    NoActiveRoom,

    /// The host denied the lock.
    #[error("failed to acquire lock {key}")]
    LockAcquisitionFailed {
        key: String,
        holder: Option<String>,
    },

    /// A lock request got no reply in time.
    #[error("lock {key} timed out after {}ms", .timeout.as_millis())]
    LockTimeout { key: String, timeout: Duration },

    /// This client already holds or is acquiring the lock.
    #[error("lock {key} is already held by this client")]
    LockAlreadyHeld { key: String },

    /// Release without a held lock.
    #[error("no active lock for key {key}")]
    NoActiveLock { key: String },

    /// A release for the key is already on its way.
    #[error("release of lock {key} already in flight")]
    ReleaseInFlight { key: String },

    /// Encoding or decoding failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// IO error on the physical channel.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ClientError {
    /// Creates a room timeout error.
    pub fn room_timeout(operation: &'static str, timeout: Duration) -> Self {
        Self::RoomTimeout { operation, timeout }
    }

    /// Creates a room error from a host `error` frame.
    pub fn room_error(operation: &'static str, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::RoomError {
            operation,
            code,
            message: message.into(),
        }
    }

    /// Creates a lock timeout error.
    pub fn lock_timeout(key: impl Into<String>, timeout: Duration) -> Self {
        Self::LockTimeout {
            key: key.into(),
            timeout,
        }
    }

    /// Creates a no-active-lock error.
    pub fn no_active_lock(key: impl Into<String>) -> Self {
        Self::NoActiveLock { key: key.into() }
    }

    /// True for failures the caller may simply retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::RoomTimeout { .. }
                | Self::RoomError { .. }
                | Self::RoomBusy
                | Self::LockAcquisitionFailed { .. }
                | Self::LockTimeout { .. }
                | Self::LockAlreadyHeld { .. }
                | Self::ReleaseInFlight { .. }
        )
    }

    /// True when a lock could not be obtained, whether denied or timed out.
    pub fn is_lock_acquisition_failure(&self) -> bool {
        matches!(
            self,
            Self::LockAcquisitionFailed { .. } | Self::LockTimeout { .. } | Self::LockAlreadyHeld { .. }
        )
    }
}
