//! Panic isolation for user callbacks and poison-tolerant locking.
//!
//! Callbacks run while component state is consistent and unlocked; a
//! panicking callback is logged and the remaining callbacks still run.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::warn;

/// Runs `f`, containing any panic. Returns false if it panicked.
pub(crate) fn invoke_isolated<F: FnOnce()>(what: &'static str, f: F) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(()) => true,
        Err(payload) => {
            warn!(
                callback = what,
                panic = panic_message(payload.as_ref()),
                "callback panicked"
            );
            false
        }
    }
}

/// Locks `mutex`, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
