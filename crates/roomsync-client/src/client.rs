//! The client context: one transport and everything built on it.

use std::fmt;
use std::sync::{Arc, Weak};

use serde::Serialize;
use tracing::{debug, info, warn};

use roomsync_protocol::{Frame, FrameBody, ProtocolError, RoomState};

use crate::config::{ClientConfig, HostOptions};
use crate::correlate::Correlator;
use crate::error::{ClientError, ClientResult};
use crate::events::{EventHandlerId, EventHandlers, RoomEvent};
use crate::leader::LeaderElection;
use crate::mutex::MutexClient;
use crate::scope::CurrentRoom;
use crate::session::{RoomSession, SessionPhase};
use crate::store::RegisterStore;
use crate::transport::{Channel, ConnectionState, StreamChannel, Transport};

/// A room client. Each instance owns its own connection and room state.
///
/// Dropping the client shuts its transport down.
pub struct RoomClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: Arc<ClientConfig>,
    transport: Transport,
    correlator: Correlator,
    current: CurrentRoom,
    session: RoomSession,
    store: RegisterStore,
    mutex: MutexClient,
    leader: LeaderElection,
    events: EventHandlers,
}

impl RoomClient {
    /// Creates a client for the configured endpoint.
    pub fn new(config: ClientConfig) -> Self {
        let channel = Arc::new(StreamChannel::new(config.endpoint.clone()));
        Self::with_channel(config, channel)
    }

    /// Creates a client over an explicit channel.
    pub fn with_channel(config: ClientConfig, channel: Arc<dyn Channel>) -> Self {
        let config = Arc::new(config);
        let transport = Transport::with_channel(&config, channel);
        let correlator = Correlator::new();
        let current = CurrentRoom::default();
        let store = RegisterStore::new(transport.clone(), current.clone());
        let mutex = MutexClient::new(
            transport.clone(),
            correlator.clone(),
            current.clone(),
            config.lock_margin,
            config.release_timeout,
        );
        let leader = LeaderElection::new();
        let session = RoomSession::new(
            config.clone(),
            transport.clone(),
            correlator.clone(),
            current.clone(),
            store.clone(),
            mutex.clone(),
            leader.clone(),
        );

        let inner = Arc::new(ClientInner {
            config,
            transport,
            correlator,
            current,
            session,
            store,
            mutex,
            leader,
            events: EventHandlers::default(),
        });

        let weak: Weak<ClientInner> = Arc::downgrade(&inner);
        inner.transport.on_message(move |frame| {
            if let Some(inner) = weak.upgrade() {
                inner.dispatch(frame.clone());
            }
        });
        let weak = Arc::downgrade(&inner);
        inner.transport.on_state_change(move |state| {
            if let Some(inner) = weak.upgrade() {
                inner.connection_changed(state);
            }
        });

        debug!(client_id = %inner.config.client_id, channel = inner.transport.channel_name(), "client created");
        Self { inner }
    }

    /// Connects the transport.
    pub async fn connect(&self) -> ClientResult<()> {
        self.inner.transport.connect().await
    }

    /// Creates a room and enters it.
    pub async fn host(&self, game_id: &str, options: HostOptions) -> ClientResult<RoomState> {
        self.inner.session.host(game_id, options).await
    }

    /// Joins a room by code.
    pub async fn join(&self, join_code: &str) -> ClientResult<RoomState> {
        self.inner.session.join(join_code).await
    }

    /// Enters any room for `game_id`.
    pub async fn quick_play(&self, game_id: &str) -> ClientResult<RoomState> {
        self.inner.session.quick_play(game_id).await
    }

    /// Leaves the current room.
    pub async fn leave(&self) -> ClientResult<()> {
        self.inner.session.leave().await
    }

    /// Broadcasts an application event to the room. Returns its sequence.
    pub fn emit(&self, event_type: &str, payload: impl Serialize) -> ClientResult<u64> {
        let room_id = self.inner.current.require()?;
        let payload = serde_json::to_value(payload).map_err(ProtocolError::from)?;
        self.inner
            .transport
            .send(Frame::new(FrameBody::event(event_type, payload)).with_room_id(room_id))
    }

    /// Handles inbound events of `event_type`; `"*"` receives every event.
    pub fn on_event(
        &self,
        event_type: &str,
        handler: impl Fn(&RoomEvent) + Send + Sync + 'static,
    ) -> EventHandlerId {
        self.inner.events.on(event_type, handler)
    }

    /// Removes an event handler.
    pub fn off_event(&self, id: EventHandlerId) -> bool {
        self.inner.events.off(id)
    }

    /// Snapshot of the current room.
    pub fn state(&self) -> Option<RoomState> {
        self.inner.session.state()
    }

    /// Session phase.
    pub fn phase(&self) -> SessionPhase {
        self.inner.session.phase()
    }

    /// True if this client leads its room.
    pub fn is_leader(&self) -> bool {
        self.inner.leader.is_leader()
    }

    /// This client's id in the room, or the configured id outside one.
    pub fn self_id(&self) -> String {
        self.state()
            .map(|room| room.self_id)
            .unwrap_or_else(|| self.inner.config.client_id.clone())
    }

    /// Configuration in use.
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    pub fn store(&self) -> &RegisterStore {
        &self.inner.store
    }

    pub fn mutex(&self) -> &MutexClient {
        &self.inner.mutex
    }

    pub fn leader(&self) -> &LeaderElection {
        &self.inner.leader
    }

    /// Shuts the transport down.
    pub fn shutdown(&self) {
        self.inner.transport.shutdown();
    }
}

impl Drop for RoomClient {
    fn drop(&mut self) {
        self.inner.transport.shutdown();
    }
}

impl fmt::Debug for RoomClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoomClient")
            .field("client_id", &self.inner.config.client_id)
            .field("transport", &self.inner.transport)
            .field("session", &self.inner.session)
            .finish_non_exhaustive()
    }
}

impl ClientInner {
    fn dispatch(&self, frame: Frame) {
        // the room must be in place before the next frame is dispatched
        self.session.accept_room_reply(&frame);
        let Some(frame) = self.correlator.resolve(frame) else {
            return;
        };

        let in_room = match self.current.room_id() {
            Some(room_id) => frame.is_for_room(&room_id),
            None => false,
        };

        match frame.body {
            FrameBody::RegisterUpdate {
                key,
                value,
                version,
                updated_by,
            } if in_room => {
                self.store.apply_remote(key, value, version, updated_by);
            }
            FrameBody::LockExpired { key, lock_id } if in_room => {
                if let Some(room_id) = self.current.room_id() {
                    self.mutex.expire(&room_id, &key, &lock_id);
                }
            }
            FrameBody::Event {
                event_type,
                payload,
            } if in_room => {
                let event = RoomEvent {
                    room_id: frame.room_id,
                    event_type,
                    payload,
                };
                let handled = self.events.dispatch(&event);
                debug!(event_type = %event.event_type, handled, "event received");
            }
            body @ (FrameBody::MemberJoined { .. }
            | FrameBody::MemberLeft { .. }
            | FrameBody::LeaderChanged { .. }
            | FrameBody::RoomSnapshot { .. })
                if in_room =>
            {
                self.session.apply_push(Frame { body, ..frame });
            }
            FrameBody::Error { code, message } => {
                warn!(code = ?code, message = %message, "host reported an error");
            }
            FrameBody::Heartbeat => {}
            body => debug!(
                kind = %body.kind(),
                room_id = frame.room_id.as_deref().unwrap_or(""),
                "ignoring frame"
            ),
        }
    }

    fn connection_changed(&self, state: ConnectionState) {
        match state {
            ConnectionState::Exhausted => {
                let attempts = self.config.reconnect.max_attempts;
                self.correlator
                    .fail_all(|| ClientError::TransportExhausted { attempts });
                if self.current.room_id().is_some() {
                    warn!("transport exhausted, dropping room");
                    self.session.teardown(SessionPhase::Left);
                }
            }
            ConnectionState::Closed => {
                self.correlator.fail_all(|| ClientError::TransportClosed);
            }
            ConnectionState::Connected => info!("connected"),
            _ => {}
        }
    }
}
