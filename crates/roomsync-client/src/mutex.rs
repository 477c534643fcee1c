//! Remote mutex: host-arbitrated locks with a TTL.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use roomsync_core::ids;
use roomsync_protocol::{Frame, FrameBody};

use crate::correlate::{Correlator, ReplyOutcome};
use crate::error::{ClientError, ClientResult};
use crate::isolate::{lock, panic_message};
use crate::scope::CurrentRoom;
use crate::transport::Transport;

/// A lock held by this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lock {
    pub room_id: String,
    pub key: String,
    pub lock_id: String,
    pub ttl: Duration,
    pub acquired_at: Instant,
}

#[derive(Debug)]
enum Slot {
    Acquiring { lock_id: String },
    Held(Lock),
    Releasing(Lock),
}

impl Slot {
    fn lock_id(&self) -> &str {
        match self {
            Slot::Acquiring { lock_id } => lock_id,
            Slot::Held(lock) | Slot::Releasing(lock) => &lock.lock_id,
        }
    }
}

/// `(room_id, key)`
type SlotKey = (String, String);
type Table = Arc<Mutex<HashMap<SlotKey, Slot>>>;

/// Client side of the host's lock service.
#[derive(Clone)]
pub struct MutexClient {
    table: Table,
    transport: Transport,
    correlator: Correlator,
    room: CurrentRoom,
    lock_margin: Duration,
    release_timeout: Duration,
}

/// Removes an `Acquiring` slot unless the acquire settled.
struct AcquireGuard<'a> {
    table: &'a Table,
    slot: SlotKey,
    lock_id: String,
    armed: bool,
}

impl AcquireGuard<'_> {
    fn settle(mut self, granted: Option<Lock>) {
        self.armed = false;
        let mut table = lock(self.table);
        let ours = table
            .get(&self.slot)
            .is_some_and(|slot| slot.lock_id() == self.lock_id);
        if !ours {
            return;
        }
        match granted {
            Some(held) => {
                table.insert(self.slot.clone(), Slot::Held(held));
            }
            None => {
                table.remove(&self.slot);
            }
        }
    }
}

impl Drop for AcquireGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut table = lock(self.table);
        if table
            .get(&self.slot)
            .is_some_and(|slot| slot.lock_id() == self.lock_id)
        {
            table.remove(&self.slot);
        }
    }
}

/// Releases an `exec` lock if the `exec` future is dropped mid-work.
struct ExecGuard<'a> {
    client: &'a MutexClient,
    held: Lock,
    armed: bool,
}

impl Drop for ExecGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(key = %self.held.key, lock_id = %self.held.lock_id, "exec cancelled under lock");
        let slot_key = (self.held.room_id.clone(), self.held.key.clone());
        let in_flight = matches!(
            lock(&self.client.table).get(&slot_key),
            Some(Slot::Releasing(l)) if l.lock_id == self.held.lock_id
        );
        if !in_flight {
            self.client
                .release_unconfirmed(&self.held.room_id, &self.held.key, &self.held.lock_id);
            self.client
                .forget(&self.held.room_id, &self.held.key, &self.held.lock_id);
        }
    }
}

/// Drops a local hold once its release settles or is abandoned.
struct ForgetOnDrop<'a> {
    client: &'a MutexClient,
    held: &'a Lock,
}

impl Drop for ForgetOnDrop<'_> {
    fn drop(&mut self) {
        self.client
            .forget(&self.held.room_id, &self.held.key, &self.held.lock_id);
    }
}

impl MutexClient {
    pub(crate) fn new(
        transport: Transport,
        correlator: Correlator,
        room: CurrentRoom,
        lock_margin: Duration,
        release_timeout: Duration,
    ) -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            transport,
            correlator,
            room,
            lock_margin,
            release_timeout,
        }
    }

    /// Asks the host for `key`, waiting up to `ttl` plus the lock margin.
    pub async fn acquire(&self, key: &str, ttl: Duration) -> ClientResult<Lock> {
        let room_id = self.room.require()?;
        let slot_key = (room_id.clone(), key.to_string());
        let lock_id = ids::lock_id();

        {
            let mut table = lock(&self.table);
            if table.contains_key(&slot_key) {
                return Err(ClientError::LockAlreadyHeld {
                    key: key.to_string(),
                });
            }
            table.insert(
                slot_key.clone(),
                Slot::Acquiring {
                    lock_id: lock_id.clone(),
                },
            );
        }
        let guard = AcquireGuard {
            table: &self.table,
            slot: slot_key,
            lock_id: lock_id.clone(),
            armed: true,
        };

        let message_id = ids::message_id("lock");
        let pending = self.correlator.register(&message_id);
        self.transport.send(
            Frame::new(FrameBody::LockAcquire {
                key: key.to_string(),
                ttl: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
                lock_id: lock_id.clone(),
            })
            .with_message_id(message_id)
            .with_room_id(room_id.clone()),
        )?;
        debug!(key, lock_id = %lock_id, ttl_ms = ttl.as_millis() as u64, "lock requested");

        let wait = ttl + self.lock_margin;
        match pending.wait(wait).await {
            ReplyOutcome::Reply(frame) => match frame.body {
                FrameBody::LockAcquired {
                    lock_id: granted, ..
                } if granted == lock_id => {
                    let held = Lock {
                        room_id,
                        key: key.to_string(),
                        lock_id,
                        ttl,
                        acquired_at: Instant::now(),
                    };
                    guard.settle(Some(held.clone()));
                    info!(key, lock_id = %held.lock_id, "lock acquired");
                    Ok(held)
                }
                FrameBody::LockAcquired {
                    lock_id: granted, ..
                } => {
                    guard.settle(None);
                    warn!(key, expected = %lock_id, granted = %granted, "lock granted under another id");
                    self.release_unconfirmed(&room_id, key, &granted);
                    Err(ClientError::LockAcquisitionFailed {
                        key: key.to_string(),
                        holder: None,
                    })
                }
                FrameBody::LockDenied { holder, .. } => {
                    guard.settle(None);
                    debug!(key, holder = holder.as_deref().unwrap_or(""), "lock denied");
                    Err(ClientError::LockAcquisitionFailed {
                        key: key.to_string(),
                        holder,
                    })
                }
                other => {
                    guard.settle(None);
                    warn!(key, kind = %other.kind(), "unexpected reply to lock request");
                    Err(ClientError::LockAcquisitionFailed {
                        key: key.to_string(),
                        holder: None,
                    })
                }
            },
            ReplyOutcome::TimedOut => {
                guard.settle(None);
                warn!(key, timeout_ms = wait.as_millis() as u64, "lock request timed out");
                Err(ClientError::lock_timeout(key, wait))
            }
            ReplyOutcome::Failed(e) => {
                guard.settle(None);
                Err(e)
            }
        }
    }

    /// Releases a lock held on `key`.
    ///
    /// The local hold is dropped on confirmation or after the release
    /// timeout, which is reported as `LockTimeout`.
    pub async fn release(&self, key: &str) -> ClientResult<()> {
        let room_id = self.room.require()?;
        let slot_key = (room_id, key.to_string());
        let held = {
            let mut table = lock(&self.table);
            match table.get(&slot_key) {
                Some(Slot::Held(held)) => {
                    let held = held.clone();
                    table.insert(slot_key, Slot::Releasing(held.clone()));
                    held
                }
                Some(Slot::Releasing(_)) => {
                    return Err(ClientError::ReleaseInFlight {
                        key: key.to_string(),
                    });
                }
                Some(Slot::Acquiring { .. }) | None => {
                    return Err(ClientError::no_active_lock(key));
                }
            }
        };
        self.send_release(&held).await
    }

    /// Acquires `key`, runs `work` once and releases, whatever `work` does.
    ///
    /// Returns `work`'s result. A panic in `work` is resumed after the
    /// release was sent. `work` is never run if the lock is not obtained.
    pub async fn exec<T, E, F, Fut>(&self, key: &str, ttl: Duration, work: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ClientError>,
    {
        let held = self.acquire(key, ttl).await?;
        let mut guard = ExecGuard {
            client: self,
            held: held.clone(),
            armed: true,
        };

        let outcome = match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
            Err(payload) => Err(payload),
        };
        if let Err(payload) = &outcome {
            warn!(key, panic = panic_message(payload.as_ref()), "work panicked under lock");
        }

        guard.armed = false;
        if let Err(e) = self.release_after_exec(&held).await {
            warn!(key, error = %e, "release after exec failed");
        }

        match outcome {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Sends the release for an `exec` lock unless another caller already did.
    async fn release_after_exec(&self, held: &Lock) -> ClientResult<()> {
        let slot_key = (held.room_id.clone(), held.key.clone());
        {
            let mut table = lock(&self.table);
            match table.get(&slot_key) {
                Some(Slot::Releasing(l)) if l.lock_id == held.lock_id => return Ok(()),
                Some(Slot::Held(l)) if l.lock_id == held.lock_id => {
                    table.insert(slot_key, Slot::Releasing(held.clone()));
                }
                // expired or cleared: the host still gets told
                _ => {}
            }
        }
        self.send_release(held).await
    }

    async fn send_release(&self, held: &Lock) -> ClientResult<()> {
        let message_id = ids::message_id("unlock");
        let pending = self.correlator.register(&message_id);
        let sent = self.transport.send(
            Frame::new(FrameBody::LockRelease {
                key: held.key.clone(),
                lock_id: held.lock_id.clone(),
            })
            .with_message_id(message_id)
            .with_room_id(held.room_id.clone()),
        );

        let forget = ForgetOnDrop { client: self, held };
        let outcome = match sent {
            Ok(_) => pending.wait(self.release_timeout).await,
            Err(e) => ReplyOutcome::Failed(e),
        };
        drop(forget);

        match outcome {
            ReplyOutcome::Reply(frame) => {
                if !matches!(frame.body, FrameBody::LockReleased { .. }) {
                    warn!(key = %held.key, kind = %frame.kind(), "unexpected reply to release");
                }
                info!(key = %held.key, lock_id = %held.lock_id, "lock released");
                Ok(())
            }
            ReplyOutcome::TimedOut => {
                warn!(key = %held.key, "release confirmation timed out");
                Err(ClientError::lock_timeout(held.key.clone(), self.release_timeout))
            }
            ReplyOutcome::Failed(e) => Err(e),
        }
    }

    /// Sends a release nobody waits for. The host's reply goes uncorrelated.
    fn release_unconfirmed(&self, room_id: &str, key: &str, lock_id: &str) {
        let sent = self.transport.send(
            Frame::new(FrameBody::LockRelease {
                key: key.to_string(),
                lock_id: lock_id.to_string(),
            })
            .with_room_id(room_id),
        );
        match sent {
            Ok(_) => debug!(key, lock_id, "release sent"),
            Err(e) => warn!(key, lock_id, error = %e, "could not send release"),
        }
    }

    /// The lock held on `key` in the current room, if any.
    pub fn held(&self, key: &str) -> Option<Lock> {
        let room_id = self.room.room_id()?;
        match lock(&self.table).get(&(room_id, key.to_string())) {
            Some(Slot::Held(held)) => Some(held.clone()),
            _ => None,
        }
    }

    /// Drops the local hold the host reported as expired.
    pub(crate) fn expire(&self, room_id: &str, key: &str, lock_id: &str) {
        if self.forget(room_id, key, lock_id) {
            warn!(key, lock_id, "lock expired");
        }
    }

    /// Forgets every lock.
    pub fn clear(&self) {
        lock(&self.table).clear();
    }

    fn forget(&self, room_id: &str, key: &str, lock_id: &str) -> bool {
        let mut table = lock(&self.table);
        let slot_key = (room_id.to_string(), key.to_string());
        let matches = table
            .get(&slot_key)
            .is_some_and(|slot| slot.lock_id() == lock_id);
        if matches {
            table.remove(&slot_key);
        }
        matches
    }
}

impl fmt::Debug for MutexClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutexClient")
            .field("locks", &lock(&self.table).len())
            .finish_non_exhaustive()
    }
}
