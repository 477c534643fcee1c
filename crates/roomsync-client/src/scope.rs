//! The id of the room this client is currently in.
//!
//! Written only by the room session; the register store and the mutex
//! client read it to address their frames.

use std::sync::{Arc, RwLock};

use crate::error::{ClientError, ClientResult};

/// Shared, read-mostly handle on the current room id.
#[derive(Debug, Clone, Default)]
pub struct CurrentRoom {
    room_id: Arc<RwLock<Option<String>>>,
}

impl CurrentRoom {
    /// Returns the current room id, if any.
    pub fn room_id(&self) -> Option<String> {
        match self.room_id.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Returns the current room id or `NoActiveRoom`.
    pub fn require(&self) -> ClientResult<String> {
        self.room_id().ok_or(ClientError::NoActiveRoom)
    }

    /// True if `room_id` is the current room.
    pub fn is_current(&self, room_id: &str) -> bool {
        self.room_id().as_deref() == Some(room_id)
    }

    pub(crate) fn set(&self, room_id: Option<String>) {
        match self.room_id.write() {
            Ok(mut guard) => *guard = room_id,
            Err(poisoned) => *poisoned.into_inner() = room_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn require_without_room() {
        let room = CurrentRoom::default();
        assert!(matches!(room.require(), Err(ClientError::NoActiveRoom)));
    }

    #[test]
    fn clones_share_state() {
        let room = CurrentRoom::default();
        let view = room.clone();
        room.set(Some("r1".into()));
        assert_eq!(view.require().unwrap(), "r1");
        assert!(view.is_current("r1"));

        room.set(None);
        assert!(view.room_id().is_none());
    }
}
