//! Client side of a room-based multiplayer session.
//!
//! A [`RoomClient`] owns one [`Transport`] to the host and the components
//! built on it:
//!
//! - [`RoomSession`]: host, join, quick play and leave a room
//! - [`RegisterStore`]: versioned last-writer-wins key/value state
//! - [`MutexClient`]: host-arbitrated locks with a TTL
//! - [`LeaderElection`]: leadership tracking and callbacks
//!
//! ```no_run
//! use roomsync_client::{ClientConfig, HostOptions, RoomClient};
//!
//! # async fn demo() -> roomsync_client::ClientResult<()> {
//! let client = RoomClient::new(ClientConfig::default());
//! let room = client.host("chess", HostOptions::default().max(2)).await?;
//! println!("join code: {}", room.join_code);
//!
//! client.store().set("board", "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR")?;
//! client.leader().if_leader(|| println!("we lead now"));
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod correlate;
pub mod error;
pub mod events;
mod isolate;
pub mod leader;
pub mod mutex;
pub mod scope;
pub mod session;
pub mod store;
pub mod transport;

pub use client::RoomClient;
pub use config::{ClientConfig, Endpoint, HostOptions, ReconnectPolicy, RoomDefaults};
pub use correlate::{Correlator, PendingReply, ReplyOutcome};
pub use error::{ClientError, ClientResult};
pub use events::{ANY_EVENT, EventHandlerId, RoomEvent};
pub use leader::{CallbackId, LeaderChange, LeaderElection};
pub use mutex::{Lock, MutexClient};
pub use scope::CurrentRoom;
pub use session::{RoomSession, SessionPhase};
pub use store::{RegisterEntry, RegisterStore, WatchId};
pub use transport::{Channel, ConnectionState, HandlerId, Link, StreamChannel, Transport};
