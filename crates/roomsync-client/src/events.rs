//! Application events broadcast between room members.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::isolate::{invoke_isolated, lock};

/// Event type that matches every event.
pub const ANY_EVENT: &str = "*";

/// An application event received from the room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomEvent {
    pub room_id: Option<String>,
    pub event_type: String,
    pub payload: Value,
}

impl RoomEvent {
    /// Deserializes the payload.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.payload.clone()).ok()
    }
}

/// Identifies an event handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandlerId(u64);

type EventHandler = Arc<dyn Fn(&RoomEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: Vec<(EventHandlerId, String, EventHandler)>,
}

/// Handlers keyed by event type.
#[derive(Clone, Default)]
pub(crate) struct EventHandlers {
    registry: Arc<Mutex<Registry>>,
}

impl EventHandlers {
    pub(crate) fn on(
        &self,
        event_type: &str,
        handler: impl Fn(&RoomEvent) + Send + Sync + 'static,
    ) -> EventHandlerId {
        let mut registry = lock(&self.registry);
        registry.next_id += 1;
        let id = EventHandlerId(registry.next_id);
        registry
            .handlers
            .push((id, event_type.to_string(), Arc::new(handler)));
        id
    }

    pub(crate) fn off(&self, id: EventHandlerId) -> bool {
        let mut registry = lock(&self.registry);
        let before = registry.handlers.len();
        registry.handlers.retain(|(h, _, _)| *h != id);
        before != registry.handlers.len()
    }

    /// Runs matching handlers in registration order. Returns how many ran.
    pub(crate) fn dispatch(&self, event: &RoomEvent) -> usize {
        let matching: Vec<EventHandler> = lock(&self.registry)
            .handlers
            .iter()
            .filter(|(_, ty, _)| ty == ANY_EVENT || *ty == event.event_type)
            .map(|(_, _, h)| h.clone())
            .collect();
        for handler in &matching {
            invoke_isolated("event handler", || handler(event));
        }
        matching.len()
    }
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("handlers", &lock(&self.registry).handlers.len())
            .finish()
    }
}
