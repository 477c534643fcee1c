//! Reliable, ordered frame delivery over a reconnecting channel.
//!
//! A [`Transport`] numbers every outbound frame, keeps it until the host
//! acknowledges the sequence and replays the unacknowledged ones, in order,
//! whenever a link is (re)established. One driver task per transport owns
//! the link, the reconnect loop and inbound dispatch.

mod channel;
mod stream;

pub use channel::{Channel, Link};
pub use stream::{StreamChannel, spawn_link};

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Notify, mpsc, watch};
use tokio::time::{Instant, Interval};
use tracing::{debug, error, info, warn};

use roomsync_protocol::{Frame, FrameBody, decode_frame, encode_frame};

use crate::config::{ClientConfig, ReconnectPolicy};
use crate::error::{ClientError, ClientResult};
use crate::isolate::{invoke_isolated, lock};

/// Callback for decoded inbound frames.
pub type MessageHandler = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Callback for connection state changes.
pub type StateHandler = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Identifies a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected.
    Disconnected,
    /// First connection in progress.
    Connecting,
    /// Link established; pending frames have been replayed.
    Connected,
    /// Link lost; retrying with backoff.
    Reconnecting,
    /// Retries ran out. Only an explicit `connect()` starts over.
    Exhausted,
    /// Shut down.
    Closed,
}

impl ConnectionState {
    /// Returns the state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Exhausted => "exhausted",
            Self::Closed => "closed",
        }
    }

    /// True once the transport has stopped trying.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exhausted | Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle on a transport. Clones share the same connection.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

struct Inner {
    channel: Arc<dyn Channel>,
    policy: ReconnectPolicy,
    heartbeat_interval: Option<Duration>,
    outbox: Mutex<Outbox>,
    handlers: Mutex<Handlers>,
    state: watch::Sender<ConnectionState>,
    shutdown: Notify,
}

#[derive(Default)]
struct Outbox {
    last_sequence: u64,
    /// Encoded frames awaiting an ack, by sequence.
    pending: BTreeMap<u64, Vec<u8>>,
    writer: Option<mpsc::UnboundedSender<Vec<u8>>>,
    driver_running: bool,
    closed: bool,
}

#[derive(Default)]
struct Handlers {
    next_id: u64,
    message: Vec<(HandlerId, MessageHandler)>,
    state: Vec<(HandlerId, StateHandler)>,
}

impl Handlers {
    fn next_id(&mut self) -> HandlerId {
        self.next_id += 1;
        HandlerId(self.next_id)
    }
}

impl Transport {
    /// Creates a transport for the configured endpoint.
    pub fn new(config: &ClientConfig) -> Self {
        Self::with_channel(config, Arc::new(StreamChannel::new(config.endpoint.clone())))
    }

    /// Creates a transport over an explicit channel.
    pub fn with_channel(config: &ClientConfig, channel: Arc<dyn Channel>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                channel,
                policy: config.reconnect.clone(),
                heartbeat_interval: config.heartbeat_interval,
                outbox: Mutex::new(Outbox::default()),
                handlers: Mutex::new(Handlers::default()),
                state,
                shutdown: Notify::new(),
            }),
        }
    }

    /// Name of the underlying channel.
    pub fn channel_name(&self) -> &'static str {
        self.inner.channel.name()
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Subscribes to connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Sequences sent but not yet acknowledged, in order.
    pub fn pending_sequences(&self) -> Vec<u64> {
        self.inner.outbox().pending.keys().copied().collect()
    }

    /// Connects, starting the driver if it is not running.
    ///
    /// Resolves once connected. Fails with `TransportExhausted` when the
    /// driver gives up and with `TransportClosed` after [`shutdown`](Self::shutdown).
    pub async fn connect(&self) -> ClientResult<()> {
        let mut state_rx = self.inner.state.subscribe();
        let started = {
            let mut outbox = self.inner.outbox();
            if outbox.closed {
                return Err(ClientError::TransportClosed);
            }
            if outbox.driver_running {
                None
            } else {
                outbox.driver_running = true;
                Some(self.inner.state.send_replace(ConnectionState::Connecting))
            }
        };

        if let Some(previous) = started {
            self.inner.announce(previous, ConnectionState::Connecting);
            info!(channel = self.inner.channel.name(), "starting transport");
            tokio::spawn(drive(self.inner.clone()));
        }

        loop {
            let state = *state_rx.borrow_and_update();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Exhausted => return Err(self.inner.exhausted()),
                ConnectionState::Closed => return Err(ClientError::TransportClosed),
                _ => {}
            }
            if state_rx.changed().await.is_err() {
                return Err(ClientError::TransportClosed);
            }
        }
    }

    /// Queues a frame for delivery and returns its sequence.
    ///
    /// The frame is written at once when connected; otherwise it waits in
    /// the pending table. Heartbeats are never recorded and are dropped
    /// while disconnected.
    pub fn send(&self, frame: Frame) -> ClientResult<u64> {
        self.inner.send(frame)
    }

    /// Registers a handler for inbound frames.
    pub fn on_message(&self, handler: impl Fn(&Frame) + Send + Sync + 'static) -> HandlerId {
        let mut handlers = lock(&self.inner.handlers);
        let id = handlers.next_id();
        handlers.message.push((id, Arc::new(handler)));
        id
    }

    /// Registers a handler for connection state changes.
    pub fn on_state_change(
        &self,
        handler: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> HandlerId {
        let mut handlers = lock(&self.inner.handlers);
        let id = handlers.next_id();
        handlers.state.push((id, Arc::new(handler)));
        id
    }

    /// Removes a handler. Returns false if it was not registered.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut handlers = lock(&self.inner.handlers);
        let before = handlers.message.len() + handlers.state.len();
        handlers.message.retain(|(h, _)| *h != id);
        handlers.state.retain(|(h, _)| *h != id);
        before != handlers.message.len() + handlers.state.len()
    }

    /// Stops the driver. Pending frames stay recorded.
    pub fn shutdown(&self) {
        let idle = {
            let mut outbox = self.inner.outbox();
            outbox.closed = true;
            (!outbox.driver_running).then(|| self.inner.state.send_replace(ConnectionState::Closed))
        };
        match idle {
            Some(previous) => self.inner.announce(previous, ConnectionState::Closed),
            None => self.inner.shutdown.notify_one(),
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("channel", &self.inner.channel.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn outbox(&self) -> MutexGuard<'_, Outbox> {
        lock(&self.outbox)
    }

    fn exhausted(&self) -> ClientError {
        ClientError::TransportExhausted {
            attempts: self.policy.max_attempts,
        }
    }

    fn send(&self, mut frame: Frame) -> ClientResult<u64> {
        let heartbeat = frame.kind().is_heartbeat();
        let mut outbox = self.outbox();
        if outbox.closed {
            return Err(ClientError::TransportClosed);
        }
        if *self.state.borrow() == ConnectionState::Exhausted {
            return Err(self.exhausted());
        }

        let sequence = outbox.last_sequence + 1;
        frame.sequence = sequence;
        frame.timestamp = roomsync_core::now_millis();
        let bytes = encode_frame(&frame)?;
        outbox.last_sequence = sequence;

        let written = match &outbox.writer {
            Some(writer) => writer.send(bytes.clone()).is_ok(),
            None => false,
        };
        if !heartbeat {
            outbox.pending.insert(sequence, bytes);
        }

        debug!(
            sequence,
            kind = %frame.kind(),
            message_id = frame.message_id.as_deref().unwrap_or(""),
            written,
            "frame queued"
        );
        Ok(sequence)
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        self.announce(previous, next);
    }

    /// Runs state handlers for a transition that already happened.
    fn announce(&self, previous: ConnectionState, next: ConnectionState) {
        if previous == next {
            return;
        }
        debug!(from = %previous, to = %next, "connection state changed");

        let handlers: Vec<StateHandler> = lock(&self.handlers)
            .state
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            invoke_isolated("connection state handler", || handler(next));
        }
    }

    /// Opens a link, retrying with backoff. `None` once attempts run out.
    async fn establish(&self, immediate: bool) -> Option<Link> {
        if immediate {
            match self.channel.open().await {
                Ok(link) => return Some(link),
                Err(e) => warn!(channel = self.channel.name(), error = %e, "connect failed"),
            }
        }

        for attempt in 1..=self.policy.max_attempts {
            let delay = self.policy.delay_for(attempt);
            debug!(attempt, delay_ms = delay.as_millis() as u64, "waiting before reconnect");
            tokio::time::sleep(delay).await;

            match self.channel.open().await {
                Ok(link) => return Some(link),
                Err(e) => warn!(
                    channel = self.channel.name(),
                    attempt,
                    error = %e,
                    "reconnect attempt failed"
                ),
            }
        }
        None
    }

    /// Replays pending frames in order, then publishes the writer.
    fn install(&self, writer: mpsc::UnboundedSender<Vec<u8>>) {
        let resent = {
            let mut outbox = self.outbox();
            let mut resent = 0usize;
            for bytes in outbox.pending.values() {
                if writer.send(bytes.clone()).is_err() {
                    break;
                }
                resent += 1;
            }
            outbox.writer = Some(writer);
            resent
        };
        info!(channel = self.channel.name(), resent, "transport connected");
        self.set_state(ConnectionState::Connected);
    }

    /// Reads the link until it is lost (`true`) or shutdown is requested (`false`).
    async fn pump(&self, inbound: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> bool {
        let mut heartbeat = self
            .heartbeat_interval
            .map(|every| tokio::time::interval_at(Instant::now() + every, every));

        loop {
            tokio::select! {
                received = inbound.recv() => match received {
                    Some(bytes) => self.deliver(&bytes),
                    None => return true,
                },
                () = self.shutdown.notified() => return false,
                () = tick(&mut heartbeat) => {
                    if let Err(e) = self.send(Frame::new(FrameBody::Heartbeat)) {
                        debug!(error = %e, "heartbeat not sent");
                    }
                }
            }
        }
    }

    fn deliver(&self, bytes: &[u8]) {
        let frame = match decode_frame(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, len = bytes.len(), "dropping undecodable frame");
                return;
            }
        };

        if let FrameBody::Ack { ack_sequence } = frame.body {
            let removed = self.outbox().pending.remove(&ack_sequence).is_some();
            debug!(sequence = ack_sequence, removed, "ack received");
            return;
        }

        debug!(
            sequence = frame.sequence,
            kind = %frame.kind(),
            room_id = frame.room_id.as_deref().unwrap_or(""),
            "frame received"
        );

        let handlers: Vec<MessageHandler> = lock(&self.handlers)
            .message
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            invoke_isolated("message handler", || handler(&frame));
        }
    }

    fn stop(&self, state: ConnectionState) {
        let previous = {
            let mut outbox = self.outbox();
            outbox.writer = None;
            outbox.driver_running = false;
            self.state.send_replace(state)
        };
        self.announce(previous, state);
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn drive(inner: Arc<Inner>) {
    let mut immediate = true;
    loop {
        let opened = tokio::select! {
            link = inner.establish(immediate) => link,
            () = inner.shutdown.notified() => {
                info!("transport shut down");
                inner.stop(ConnectionState::Closed);
                return;
            }
        };

        let Some(Link {
            outbound,
            mut inbound,
        }) = opened
        else {
            error!(
                channel = inner.channel.name(),
                attempts = inner.policy.max_attempts,
                "reconnect attempts exhausted"
            );
            inner.stop(ConnectionState::Exhausted);
            return;
        };
        immediate = false;

        inner.install(outbound);
        let lost = inner.pump(&mut inbound).await;
        inner.outbox().writer = None;

        if !lost {
            info!("transport shut down");
            inner.stop(ConnectionState::Closed);
            return;
        }
        warn!(channel = inner.channel.name(), "link lost");
        inner.set_state(ConnectionState::Reconnecting);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Hands out pre-built links; fails when none are left.
    struct Links {
        links: Mutex<Vec<Link>>,
        opens: AtomicU32,
    }

    impl Links {
        fn new(links: Vec<Link>) -> Arc<Self> {
            Arc::new(Self {
                links: Mutex::new(links),
                opens: AtomicU32::new(0),
            })
        }
    }

    impl Channel for Links {
        fn name(&self) -> &'static str {
            "test"
        }

        fn open(&self) -> BoxFuture<'_, io::Result<Link>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let link = self.links.lock().unwrap().pop();
            Box::pin(async move {
                link.ok_or_else(|| io::Error::new(io::ErrorKind::ConnectionRefused, "no link"))
            })
        }
    }

    fn config() -> ClientConfig {
        ClientConfig::default().with_reconnect(ReconnectPolicy::new(Duration::from_millis(100), 3))
    }

    fn decode(bytes: Vec<u8>) -> Frame {
        decode_frame(&bytes).unwrap()
    }

    #[tokio::test]
    async fn sequences_start_at_one_and_increase() {
        let transport = Transport::with_channel(&config(), Links::new(vec![]));
        let a = transport.send(Frame::new(FrameBody::LeaveRoom)).unwrap();
        let b = transport.send(Frame::new(FrameBody::LeaveRoom)).unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(transport.pending_sequences(), vec![1, 2]);
    }

    #[tokio::test]
    async fn heartbeats_are_not_recorded() {
        let transport = Transport::with_channel(&config(), Links::new(vec![]));
        transport.send(Frame::new(FrameBody::Heartbeat)).unwrap();
        assert!(transport.pending_sequences().is_empty());
    }

    #[tokio::test]
    async fn connect_replays_pending_then_acks_clear() {
        let (client, mut host) = Link::pair();
        let transport = Transport::with_channel(&config(), Links::new(vec![client]));

        transport.send(Frame::new(FrameBody::join_room("AB12"))).unwrap();
        transport.connect().await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Connected);

        let replayed = decode(host.inbound.recv().await.unwrap());
        assert_eq!(replayed.sequence, 1);

        let ack = encode_frame(&Frame::new(FrameBody::Ack { ack_sequence: 1 })).unwrap();
        host.outbound.send(ack).unwrap();
        let marker = encode_frame(&Frame::new(FrameBody::RoomLeft)).unwrap();

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        transport.on_message(move |frame| {
            let _ = seen_tx.send(frame.kind());
        });
        host.outbound.send(marker).unwrap();

        // the ack is consumed, only the marker is dispatched
        assert_eq!(
            seen_rx.recv().await.unwrap(),
            roomsync_protocol::FrameKind::RoomLeft
        );
        assert!(transport.pending_sequences().is_empty());
    }

    #[tokio::test]
    async fn undecodable_frames_are_dropped() {
        let (client, host) = Link::pair();
        let transport = Transport::with_channel(&config(), Links::new(vec![client]));
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        transport.on_message(move |frame| {
            let _ = seen_tx.send(frame.kind());
        });
        transport.connect().await.unwrap();

        host.outbound.send(b"{\"kind\":\"bogus\"}".to_vec()).unwrap();
        host.outbound
            .send(encode_frame(&Frame::new(FrameBody::RoomLeft)).unwrap())
            .unwrap();

        assert_eq!(
            seen_rx.recv().await.unwrap(),
            roomsync_protocol::FrameKind::RoomLeft
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_after_max_attempts() {
        let channel = Links::new(vec![]);
        let transport = Transport::with_channel(&config(), channel.clone());

        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::TransportExhausted { attempts: 3 }));
        assert_eq!(transport.state(), ConnectionState::Exhausted);
        // one immediate attempt plus three retries
        assert_eq!(channel.opens.load(Ordering::SeqCst), 4);

        assert!(matches!(
            transport.send(Frame::new(FrameBody::LeaveRoom)),
            Err(ClientError::TransportExhausted { .. })
        ));
    }

    #[tokio::test]
    async fn state_handlers_see_transitions() {
        let (client, _host) = Link::pair();
        let transport = Transport::with_channel(&config(), Links::new(vec![client]));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        transport.on_state_change(move |state| sink.lock().unwrap().push(state));

        transport.connect().await.unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
    }

    #[tokio::test]
    async fn shutdown_closes() {
        let (client, _host) = Link::pair();
        let transport = Transport::with_channel(&config(), Links::new(vec![client]));
        transport.connect().await.unwrap();

        let mut state = transport.subscribe_state();
        transport.shutdown();
        state
            .wait_for(|s| *s == ConnectionState::Closed)
            .await
            .unwrap();

        assert!(matches!(
            transport.connect().await,
            Err(ClientError::TransportClosed)
        ));
    }

    #[test]
    fn remove_handler_reports_presence() {
        let transport = Transport::with_channel(&config(), Links::new(vec![]));
        let id = transport.on_message(|_| {});
        assert!(transport.remove_handler(id));
        assert!(!transport.remove_handler(id));
    }
}
