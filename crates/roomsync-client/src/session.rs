//! Room session: host, join, quick play and leave, plus membership and
//! leadership pushes for the current room.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use roomsync_core::ids;
use roomsync_protocol::{ErrorCode, Frame, FrameBody, Member, RoomInfo, RoomState};

use crate::config::{ClientConfig, HostOptions};
use crate::correlate::{Correlator, ReplyOutcome};
use crate::error::{ClientError, ClientResult};
use crate::isolate::lock;
use crate::leader::{LeaderChange, LeaderElection};
use crate::mutex::MutexClient;
use crate::scope::CurrentRoom;
use crate::store::RegisterStore;
use crate::transport::Transport;

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPhase {
    #[default]
    Idle,
    Connecting,
    AwaitingRoomResponse,
    Active,
    Left,
}

impl SessionPhase {
    fn is_busy(self) -> bool {
        matches!(self, Self::Connecting | Self::AwaitingRoomResponse)
    }
}

#[derive(Debug, Default)]
struct SessionState {
    phase: SessionPhase,
    room: Option<RoomState>,
    /// `messageId` of the room request awaiting its reply.
    awaiting: Option<String>,
}

type Shared = Arc<Mutex<SessionState>>;

/// Room membership for one client.
#[derive(Clone)]
pub struct RoomSession {
    state: Shared,
    config: Arc<ClientConfig>,
    transport: Transport,
    correlator: Correlator,
    current: CurrentRoom,
    store: RegisterStore,
    mutex: MutexClient,
    leader: LeaderElection,
}

/// Puts the phase back if a room request does not complete.
struct PhaseGuard<'a> {
    state: &'a Shared,
    previous: SessionPhase,
    armed: bool,
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = lock(self.state);
        state.awaiting = None;
        if state.phase.is_busy() {
            state.phase = self.previous;
        }
    }
}

impl RoomSession {
    pub(crate) fn new(
        config: Arc<ClientConfig>,
        transport: Transport,
        correlator: Correlator,
        current: CurrentRoom,
        store: RegisterStore,
        mutex: MutexClient,
        leader: LeaderElection,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(SessionState::default())),
            config,
            transport,
            correlator,
            current,
            store,
            mutex,
            leader,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase {
        lock(&self.state).phase
    }

    /// Snapshot of the current room.
    pub fn state(&self) -> Option<RoomState> {
        lock(&self.state).room.clone()
    }

    /// True if this client leads the current room.
    pub fn is_leader(&self) -> bool {
        lock(&self.state)
            .room
            .as_ref()
            .is_some_and(|room| room.is_leader)
    }

    /// Creates a room. Unset options come from the configured defaults.
    pub async fn host(&self, game_id: &str, options: HostOptions) -> ClientResult<RoomState> {
        let options = options.resolve(&self.config.room_defaults);
        self.request_room("host", FrameBody::create_room(game_id, options))
            .await
    }

    /// Joins a room by its code.
    pub async fn join(&self, join_code: &str) -> ClientResult<RoomState> {
        self.request_room("join", FrameBody::join_room(join_code))
            .await
    }

    /// Lets the host pick or create a room for `game_id`.
    pub async fn quick_play(&self, game_id: &str) -> ClientResult<RoomState> {
        self.request_room("quick_play", FrameBody::quick_play(game_id))
            .await
    }

    /// Leaves the current room.
    ///
    /// Local room state is cleared whatever the host answers; the result
    /// only reports the confirmation.
    pub async fn leave(&self) -> ClientResult<()> {
        let room_id = lock(&self.state)
            .room
            .as_ref()
            .map(|room| room.room_id.clone())
            .ok_or(ClientError::NoActiveRoom)?;

        let message_id = ids::message_id("leave");
        let pending = self.correlator.register(&message_id);
        let sent = self.transport.send(
            Frame::new(FrameBody::LeaveRoom)
                .with_message_id(message_id)
                .with_room_id(room_id.clone()),
        );

        let timeout = self.config.leave_timeout;
        let outcome = match sent {
            Ok(_) => match pending.wait(timeout).await {
                ReplyOutcome::Reply(frame) => match frame.body {
                    FrameBody::RoomLeft => Ok(()),
                    FrameBody::Error { code, message } => {
                        Err(ClientError::room_error("leave", code, message))
                    }
                    other => Err(unexpected_reply("leave", &other)),
                },
                ReplyOutcome::TimedOut => Err(ClientError::room_timeout("leave", timeout)),
                ReplyOutcome::Failed(e) => Err(e),
            },
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            warn!(room_id = %room_id, error = %e, "leave not confirmed");
        }
        self.teardown(SessionPhase::Left);
        info!(room_id = %room_id, "left room");
        outcome
    }

    async fn request_room(
        &self,
        operation: &'static str,
        body: FrameBody,
    ) -> ClientResult<RoomState> {
        let previous = {
            let mut state = lock(&self.state);
            if let Some(room) = &state.room {
                return Err(ClientError::AlreadyInRoom {
                    room_id: room.room_id.clone(),
                });
            }
            if state.phase.is_busy() {
                return Err(ClientError::RoomBusy);
            }
            std::mem::replace(&mut state.phase, SessionPhase::Connecting)
        };
        let mut guard = PhaseGuard {
            state: &self.state,
            previous,
            armed: true,
        };

        let result = self.exchange(operation, body).await;
        if result.is_ok() {
            guard.armed = false;
        }
        result
    }

    async fn exchange(&self, operation: &'static str, body: FrameBody) -> ClientResult<RoomState> {
        self.transport.connect().await?;

        let message_id = ids::message_id(operation);
        let pending = self.correlator.register(&message_id);
        {
            let mut state = lock(&self.state);
            state.phase = SessionPhase::AwaitingRoomResponse;
            state.awaiting = Some(message_id.clone());
        }
        self.transport
            .send(Frame::new(body).with_message_id(message_id.clone()))?;
        debug!(operation, message_id = %message_id, "room request sent");

        let timeout = self.config.room_timeout;
        match pending.wait(timeout).await {
            ReplyOutcome::Reply(frame) => {
                let envelope_room = frame.room_id.clone();
                match frame.body {
                    FrameBody::RoomCreated { room } | FrameBody::RoomJoined { room } => {
                        self.settle_room_reply(&message_id, room, envelope_room.as_deref())
                    }
                    FrameBody::Error { code, message } => {
                        warn!(operation, code = ?code, message = %message, "room request rejected");
                        Err(ClientError::room_error(operation, code, message))
                    }
                    other => Err(unexpected_reply(operation, &other)),
                }
            }
            ReplyOutcome::TimedOut => {
                warn!(operation, timeout_ms = timeout.as_millis() as u64, "room request timed out");
                Err(ClientError::room_timeout(operation, timeout))
            }
            ReplyOutcome::Failed(e) => Err(e),
        }
    }

    /// Activates the room for a `roomCreated`/`roomJoined` reply to the
    /// outstanding request.
    ///
    /// Runs on the dispatch path before the reply reaches the waiting caller,
    /// so pushes that follow the reply already find the room in place.
    pub(crate) fn accept_room_reply(&self, frame: &Frame) {
        let (FrameBody::RoomCreated { room: info } | FrameBody::RoomJoined { room: info }) =
            &frame.body
        else {
            return;
        };
        let Some(message_id) = frame.message_id.as_deref() else {
            return;
        };
        let room = {
            let mut state = lock(&self.state);
            if state.awaiting.as_deref() != Some(message_id) {
                return;
            }
            // a bad snapshot is reported by the caller
            let Ok(room) =
                RoomState::from_info(info.clone(), frame.room_id.as_deref(), &self.config.client_id)
            else {
                return;
            };
            state.awaiting = None;
            state.phase = SessionPhase::Active;
            state.room = Some(room.clone());
            room
        };
        self.install(room);
    }

    /// Finishes a room request the caller saw succeed.
    fn settle_room_reply(
        &self,
        message_id: &str,
        info: RoomInfo,
        envelope_room: Option<&str>,
    ) -> ClientResult<RoomState> {
        {
            let mut state = lock(&self.state);
            if state.awaiting.as_deref() != Some(message_id) {
                // already activated on dispatch, unless torn down since
                return state.room.clone().ok_or(ClientError::NoActiveRoom);
            }
            state.awaiting = None;
        }
        let room = RoomState::from_info(info, envelope_room, &self.config.client_id)?;
        {
            let mut state = lock(&self.state);
            state.phase = SessionPhase::Active;
            state.room = Some(room.clone());
        }
        self.install(room.clone());
        Ok(room)
    }

    fn install(&self, room: RoomState) {
        self.current.set(Some(room.room_id.clone()));
        info!(
            room_id = %room.room_id,
            join_code = %room.join_code,
            members = room.member_count,
            is_leader = room.is_leader,
            "room active"
        );

        if room.leader_id.is_some() {
            self.leader.transition(LeaderChange {
                previous_leader_id: None,
                new_leader_id: room.leader_id.clone(),
                is_leader_now: room.is_leader,
                reason: None,
            });
        }
    }

    /// Drops everything scoped to the room.
    pub(crate) fn teardown(&self, phase: SessionPhase) {
        {
            let mut state = lock(&self.state);
            state.room = None;
            state.awaiting = None;
            state.phase = phase;
        }
        self.current.set(None);
        self.store.clear();
        self.mutex.clear();
        self.leader.reset();
    }

    /// Applies a membership, leadership or snapshot push for the current room.
    pub(crate) fn apply_push(&self, frame: Frame) {
        match frame.body {
            FrameBody::MemberJoined {
                member,
                member_count,
                members,
            } => self.update_members(member_count, members, |list| {
                if let Some(member) = member {
                    debug!(member_id = %member.id, "member joined");
                    list.retain(|m| m.id != member.id);
                    list.push(member);
                }
            }),
            FrameBody::MemberLeft {
                member_id,
                member_count,
                members,
            } => self.update_members(member_count, members, |list| {
                if let Some(id) = member_id {
                    debug!(member_id = %id, "member left");
                    list.retain(|m| m.id != id);
                }
            }),
            FrameBody::LeaderChanged {
                new_leader_id,
                previous_leader_id,
                reason,
            } => {
                let change = {
                    let mut state = lock(&self.state);
                    let Some(room) = state.room.as_mut() else {
                        return;
                    };
                    let local_previous = room.leader_id.clone();
                    if local_previous.as_deref() == Some(new_leader_id.as_str()) {
                        return;
                    }
                    room.set_leader(Some(new_leader_id));
                    LeaderChange {
                        previous_leader_id: previous_leader_id.or(local_previous),
                        new_leader_id: room.leader_id.clone(),
                        is_leader_now: room.is_leader,
                        reason,
                    }
                };
                self.leader.transition(change);
            }
            FrameBody::RoomSnapshot { room: info } => {
                let change = {
                    let mut state = lock(&self.state);
                    let Some(room) = state.room.as_mut() else {
                        return;
                    };
                    let previous = room.leader_id.clone();
                    room.merge(info);
                    (previous != room.leader_id || room.is_leader != self.leader.is_leader())
                        .then(|| LeaderChange {
                            previous_leader_id: previous,
                            new_leader_id: room.leader_id.clone(),
                            is_leader_now: room.is_leader,
                            reason: None,
                        })
                };
                debug!("room state merged");
                if let Some(change) = change {
                    self.leader.transition(change);
                }
            }
            other => debug!(kind = %other.kind(), "not a session push"),
        }
    }

    fn update_members(
        &self,
        member_count: Option<u32>,
        members: Vec<Member>,
        apply_delta: impl FnOnce(&mut Vec<Member>),
    ) {
        let mut state = lock(&self.state);
        let Some(room) = state.room.as_mut() else {
            return;
        };
        if members.is_empty() {
            let mut list = std::mem::take(&mut room.members);
            apply_delta(&mut list);
            room.set_members(list, member_count);
        } else {
            room.set_members(members, member_count);
        }
    }
}

fn unexpected_reply(operation: &'static str, body: &FrameBody) -> ClientError {
    ClientError::room_error(
        operation,
        ErrorCode::Unknown,
        format!("unexpected reply {}", body.kind()),
    )
}

impl fmt::Debug for RoomSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("RoomSession")
            .field("phase", &state.phase)
            .field("room_id", &state.room.as_ref().map(|r| r.room_id.as_str()))
            .finish_non_exhaustive()
    }
}
