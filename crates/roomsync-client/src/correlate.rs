//! Request/reply correlation by `messageId`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use roomsync_protocol::Frame;

use crate::error::ClientError;
use crate::isolate::lock;

type Waiter = oneshot::Sender<Result<Frame, ClientError>>;

/// Table of requests awaiting a correlated reply.
#[derive(Clone, Default)]
pub struct Correlator {
    waiters: Arc<Mutex<HashMap<String, Waiter>>>,
}

/// How a wait for a reply ended.
#[derive(Debug)]
pub enum ReplyOutcome {
    /// The correlated frame arrived.
    Reply(Frame),
    /// Nothing arrived in time.
    TimedOut,
    /// Every pending request was failed, e.g. on transport exhaustion.
    Failed(ClientError),
}

impl Correlator {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter. Do this before sending the request.
    pub fn register(&self, message_id: impl Into<String>) -> PendingReply {
        let message_id = message_id.into();
        let (tx, rx) = oneshot::channel();
        lock(&self.waiters).insert(message_id.clone(), tx);
        PendingReply {
            message_id,
            rx,
            waiters: self.waiters.clone(),
        }
    }

    /// Hands `frame` to its waiter. Returns the frame if nobody claimed it.
    pub fn resolve(&self, frame: Frame) -> Option<Frame> {
        let waiter = match frame.message_id.as_deref() {
            Some(id) => lock(&self.waiters).remove(id),
            None => None,
        };
        match waiter {
            Some(waiter) => {
                debug!(
                    message_id = frame.message_id.as_deref().unwrap_or(""),
                    kind = %frame.kind(),
                    "reply correlated"
                );
                // A dropped receiver means the caller stopped waiting.
                let _ = waiter.send(Ok(frame));
                None
            }
            None => Some(frame),
        }
    }

    /// Fails every pending request with the error `make` builds.
    pub fn fail_all(&self, make: impl Fn() -> ClientError) {
        let waiters: Vec<Waiter> = lock(&self.waiters).drain().map(|(_, w)| w).collect();
        if !waiters.is_empty() {
            debug!(count = waiters.len(), "failing pending requests");
        }
        for waiter in waiters {
            let _ = waiter.send(Err(make()));
        }
    }

    /// Number of requests awaiting a reply.
    pub fn pending(&self) -> usize {
        lock(&self.waiters).len()
    }
}

impl fmt::Debug for Correlator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.pending())
            .finish()
    }
}

/// A registered request. Dropping it unregisters the waiter.
#[derive(Debug)]
pub struct PendingReply {
    message_id: String,
    rx: oneshot::Receiver<Result<Frame, ClientError>>,
    waiters: Arc<Mutex<HashMap<String, Waiter>>>,
}

impl PendingReply {
    /// The correlation id to put on the request.
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Waits up to `timeout` for the reply.
    pub async fn wait(mut self, timeout: Duration) -> ReplyOutcome {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(Ok(frame))) => ReplyOutcome::Reply(frame),
            Ok(Ok(Err(e))) => ReplyOutcome::Failed(e),
            // sender dropped without a reply
            Ok(Err(_)) => ReplyOutcome::Failed(ClientError::TransportClosed),
            Err(_) => ReplyOutcome::TimedOut,
        }
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        lock(&self.waiters).remove(&self.message_id);
    }
}
