//! Leader election helper.
//!
//! The host decides who leads; this tracks whether this client does and
//! runs callbacks on transitions. A leadership *term* starts on every
//! non-leader to leader transition; `if_leader` callbacks run at most once
//! per term.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::info;

use roomsync_protocol::LeaderChangeReason;

use crate::isolate::{invoke_isolated, lock};

/// A change of leader id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderChange {
    pub previous_leader_id: Option<String>,
    pub new_leader_id: Option<String>,
    /// Whether this client leads after the change.
    pub is_leader_now: bool,
    pub reason: Option<LeaderChangeReason>,
}

/// Identifies a registered leader callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

type LeaderCallback = Arc<dyn Fn() + Send + Sync>;
type ChangeCallback = Arc<dyn Fn(&LeaderChange) + Send + Sync>;

struct LeaderTask {
    id: CallbackId,
    callback: LeaderCallback,
    last_term: Option<u64>,
}

#[derive(Default)]
struct LeaderState {
    is_leader: bool,
    term: u64,
    next_id: u64,
    tasks: Vec<LeaderTask>,
    observers: Vec<(CallbackId, ChangeCallback)>,
}

impl LeaderState {
    fn next_id(&mut self) -> CallbackId {
        self.next_id += 1;
        CallbackId(self.next_id)
    }
}

/// Leadership tracking and callbacks for one client.
#[derive(Clone, Default)]
pub struct LeaderElection {
    state: Arc<Mutex<LeaderState>>,
}

impl LeaderElection {
    /// Creates a helper for a client that does not lead.
    pub fn new() -> Self {
        Self::default()
    }

    /// True if this client currently leads its room.
    pub fn is_leader(&self) -> bool {
        lock(&self.state).is_leader
    }

    /// Runs `callback` every time this client becomes leader.
    ///
    /// If it already leads, `callback` runs now and counts as having run
    /// for the current term.
    pub fn if_leader(&self, callback: impl Fn() + Send + Sync + 'static) -> CallbackId {
        let callback: LeaderCallback = Arc::new(callback);
        let (id, run_now) = {
            let mut state = lock(&self.state);
            let id = state.next_id();
            let last_term = state.is_leader.then_some(state.term);
            state.tasks.push(LeaderTask {
                id,
                callback: callback.clone(),
                last_term,
            });
            (id, last_term.is_some())
        };
        if run_now {
            invoke_isolated("if_leader", || callback());
        }
        id
    }

    /// Runs `callback` on every change of leader id.
    pub fn on_leader_change(
        &self,
        callback: impl Fn(&LeaderChange) + Send + Sync + 'static,
    ) -> CallbackId {
        let mut state = lock(&self.state);
        let id = state.next_id();
        state.observers.push((id, Arc::new(callback)));
        id
    }

    /// Unregisters a callback. Returns false if it was not registered.
    pub fn remove(&self, id: CallbackId) -> bool {
        let mut state = lock(&self.state);
        let before = state.tasks.len() + state.observers.len();
        state.tasks.retain(|t| t.id != id);
        state.observers.retain(|(o, _)| *o != id);
        before != state.tasks.len() + state.observers.len()
    }

    /// Applies a leadership update from the room session.
    pub(crate) fn transition(&self, change: LeaderChange) {
        let (tasks, observers) = {
            let mut state = lock(&self.state);
            let became_leader = !state.is_leader && change.is_leader_now;
            state.is_leader = change.is_leader_now;

            let mut tasks = Vec::new();
            if became_leader {
                state.term += 1;
                let term = state.term;
                for task in &mut state.tasks {
                    if task.last_term != Some(term) {
                        task.last_term = Some(term);
                        tasks.push(task.callback.clone());
                    }
                }
            }

            let observers: Vec<ChangeCallback> =
                if change.previous_leader_id != change.new_leader_id {
                    state.observers.iter().map(|(_, cb)| cb.clone()).collect()
                } else {
                    Vec::new()
                };
            (tasks, observers)
        };

        if change.previous_leader_id != change.new_leader_id {
            info!(
                previous = change.previous_leader_id.as_deref().unwrap_or(""),
                leader = change.new_leader_id.as_deref().unwrap_or(""),
                is_leader = change.is_leader_now,
                "leader changed"
            );
        }

        for task in tasks {
            invoke_isolated("if_leader", || task());
        }
        for observer in observers {
            invoke_isolated("on_leader_change", || observer(&change));
        }
    }

    /// Forgets leadership when the room is gone. Fires nothing.
    pub(crate) fn reset(&self) {
        lock(&self.state).is_leader = false;
    }
}

impl fmt::Debug for LeaderElection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("LeaderElection")
            .field("is_leader", &state.is_leader)
            .field("term", &state.term)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn change(previous: Option<&str>, new: Option<&str>, is_leader_now: bool) -> LeaderChange {
        LeaderChange {
            previous_leader_id: previous.map(str::to_string),
            new_leader_id: new.map(str::to_string),
            is_leader_now,
            reason: None,
        }
    }

    fn counter() -> (Arc<AtomicU32>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicU32::new(0));
        let inner = count.clone();
        (count, move || {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn if_leader_fires_on_each_term() {
        let leader = LeaderElection::new();
        let (count, callback) = counter();
        leader.if_leader(callback);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        leader.transition(change(Some("b"), Some("me"), true));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        leader.transition(change(Some("me"), Some("b"), false));
        leader.transition(change(Some("b"), Some("me"), true));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn registering_while_leader_runs_once_for_the_term() {
        let leader = LeaderElection::new();
        leader.transition(change(None, Some("me"), true));

        let (count, callback) = counter();
        leader.if_leader(callback);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // same leader again is not a new term
        leader.transition(change(Some("me"), Some("me"), true));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unchanged_leader_fires_no_observer() {
        let leader = LeaderElection::new();
        let (count, _) = counter();
        let seen = count.clone();
        leader.on_leader_change(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        leader.transition(change(Some("a"), Some("a"), false));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        leader.transition(change(Some("a"), Some("b"), false));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn observer_receives_details() {
        let leader = LeaderElection::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        leader.on_leader_change(move |c| sink.lock().unwrap().push(c.clone()));

        let mut update = change(Some("a"), Some("me"), true);
        update.reason = Some(LeaderChangeReason::Disconnected);
        leader.transition(update.clone());

        assert_eq!(*seen.lock().unwrap(), vec![update]);
        assert!(leader.is_leader());
    }

    #[test]
    fn panicking_callback_does_not_stop_others() {
        let leader = LeaderElection::new();
        leader.if_leader(|| panic!("first"));
        let (count, callback) = counter();
        leader.if_leader(callback);

        leader.transition(change(None, Some("me"), true));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_callbacks_do_not_fire() {
        let leader = LeaderElection::new();
        let (count, callback) = counter();
        let id = leader.if_leader(callback);
        assert!(leader.remove(id));

        leader.transition(change(None, Some("me"), true));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reset_starts_a_new_term_later() {
        let leader = LeaderElection::new();
        let (count, callback) = counter();
        leader.if_leader(callback);

        leader.transition(change(None, Some("me"), true));
        leader.reset();
        assert!(!leader.is_leader());
        leader.transition(change(None, Some("me"), true));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
