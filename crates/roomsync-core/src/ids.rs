//! Identifier generation for correlated requests and lock tokens.

use uuid::Uuid;

/// Returns a fresh message id such as `join_6f1c...`.
///
/// The prefix only aids reading logs; uniqueness comes from the UUID.
pub fn message_id(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

/// Returns a fresh lock token.
pub fn lock_id() -> String {
    message_id("mutex")
}

/// Returns a fresh client identity.
pub fn client_id() -> String {
    Uuid::new_v4().to_string()
}
