//! Core helpers shared by the roomsync crates: tracing setup, identifiers
//! and timestamps.

pub mod clock;
pub mod ids;
pub mod tracing;

pub use clock::now_millis;
pub use self::tracing::{init_tracing, TracingConfig, TracingError, TracingOutputFormat};
