//! Shared register store: last-writer-wins key/value state per room.
//!
//! Every key carries a version. Local writes bump it and broadcast; remote
//! updates only apply when their version is newer than the local one.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use roomsync_protocol::{Frame, FrameBody, ProtocolError};

use crate::error::ClientResult;
use crate::isolate::{invoke_isolated, lock};
use crate::scope::CurrentRoom;
use crate::transport::Transport;

/// A register value and the version it was written at.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterEntry {
    pub key: String,
    pub value: Value,
    pub version: u64,
    /// Member that wrote it, when the host said so.
    pub updated_by: Option<String>,
}

/// Identifies a watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

type Watcher = Arc<dyn Fn(&Value, &str) + Send + Sync>;

#[derive(Default)]
struct StoreState {
    entries: HashMap<String, RegisterEntry>,
    watchers: HashMap<String, Vec<(WatchId, Watcher)>>,
    next_id: u64,
}

impl StoreState {
    fn watchers_of(&self, key: &str) -> Vec<Watcher> {
        self.watchers
            .get(key)
            .map(|list| list.iter().map(|(_, w)| w.clone()).collect())
            .unwrap_or_default()
    }
}

/// Register store for the current room.
#[derive(Clone)]
pub struct RegisterStore {
    state: Arc<Mutex<StoreState>>,
    transport: Transport,
    room: CurrentRoom,
}

impl RegisterStore {
    pub(crate) fn new(transport: Transport, room: CurrentRoom) -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
            transport,
            room,
        }
    }

    /// Local value of `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        lock(&self.state).entries.get(key).map(|e| e.value.clone())
    }

    /// Local value of `key`, deserialized. `None` if absent or of another shape.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(key, error = %e, "register value has unexpected shape");
                None
            }
        }
    }

    /// Versioned snapshot of `key`.
    pub fn entry(&self, key: &str) -> Option<RegisterEntry> {
        lock(&self.state).entries.get(key).cloned()
    }

    /// Keys with a local value.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.state).entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Writes `value`, broadcasts it to the room and notifies watchers.
    ///
    /// Returns the new version. Fails with `NoActiveRoom` outside a room.
    pub fn set(&self, key: &str, value: impl Serialize) -> ClientResult<u64> {
        let room_id = self.room.require()?;
        let value = serde_json::to_value(value).map_err(ProtocolError::from)?;

        let (version, watchers) = {
            let mut state = lock(&self.state);
            let version = state.entries.get(key).map_or(0, |e| e.version) + 1;
            state.entries.insert(
                key.to_string(),
                RegisterEntry {
                    key: key.to_string(),
                    value: value.clone(),
                    version,
                    updated_by: None,
                },
            );
            (version, state.watchers_of(key))
        };

        let sent = self.transport.send(
            Frame::new(FrameBody::RegisterSet {
                key: key.to_string(),
                value: value.clone(),
                version,
            })
            .with_room_id(room_id),
        );
        if let Err(e) = &sent {
            warn!(key, version, error = %e, "register broadcast failed");
        }

        notify(&watchers, &value, key);
        sent.map(|_| version)
    }

    /// Calls `callback(value, key)` after every change of `key`.
    pub fn watch(&self, key: &str, callback: impl Fn(&Value, &str) + Send + Sync + 'static) -> WatchId {
        let mut state = lock(&self.state);
        state.next_id += 1;
        let id = WatchId(state.next_id);
        state
            .watchers
            .entry(key.to_string())
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Removes a watcher. Returns false if it was not registered on `key`.
    pub fn unwatch(&self, key: &str, id: WatchId) -> bool {
        let mut state = lock(&self.state);
        let Some(list) = state.watchers.get_mut(key) else {
            return false;
        };
        let before = list.len();
        list.retain(|(w, _)| *w != id);
        let removed = list.len() != before;
        if list.is_empty() {
            state.watchers.remove(key);
        }
        removed
    }

    /// Applies an update from another member. Returns whether it was newer.
    pub(crate) fn apply_remote(
        &self,
        key: String,
        value: Value,
        version: u64,
        updated_by: Option<String>,
    ) -> bool {
        let watchers = {
            let mut state = lock(&self.state);
            let local = state.entries.get(&key).map_or(0, |e| e.version);
            if version <= local {
                debug!(key = %key, version, local, "stale register update ignored");
                return false;
            }
            state.entries.insert(
                key.clone(),
                RegisterEntry {
                    key: key.clone(),
                    value: value.clone(),
                    version,
                    updated_by,
                },
            );
            state.watchers_of(&key)
        };

        debug!(key = %key, version, "register updated");
        notify(&watchers, &value, &key);
        true
    }

    /// Drops every entry. Watchers stay registered.
    pub fn clear(&self) {
        lock(&self.state).entries.clear();
    }
}

fn notify(watchers: &[Watcher], value: &Value, key: &str) {
    for watcher in watchers {
        invoke_isolated("register watcher", || watcher(value, key));
    }
}

impl fmt::Debug for RegisterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterStore")
            .field("keys", &self.keys())
            .finish_non_exhaustive()
    }
}
