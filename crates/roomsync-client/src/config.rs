//! Client configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use roomsync_protocol::{RoomOptions, Visibility};

/// Where the host can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP socket.
    Tcp(SocketAddr),
    /// Unix domain socket.
    Unix(PathBuf),
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::Tcp(SocketAddr::from(([127, 0, 0, 1], 7420)))
    }
}

/// Reconnect schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry; doubles on every further attempt.
    pub base_delay: Duration,
    /// Attempts made before the transport gives up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Creates a policy.
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
        }
    }

    /// Delay before retry `attempt` (1-based): `base * 2^(attempt-1)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// Defaults merged into `host` options the caller leaves unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomDefaults {
    /// Maximum members.
    pub max: u32,
    /// Visibility.
    pub visibility: Visibility,
}

impl Default for RoomDefaults {
    fn default() -> Self {
        Self {
            max: 4,
            visibility: Visibility::Public,
        }
    }
}

/// Caller-side options for `host`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostOptions {
    /// Maximum members; the configured default when unset.
    pub max: Option<u32>,
    /// Visibility; the configured default when unset.
    pub visibility: Option<Visibility>,
}

impl HostOptions {
    /// Builder: set the member cap.
    pub fn max(mut self, max: u32) -> Self {
        self.max = Some(max);
        self
    }

    /// Builder: set visibility.
    pub fn visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = Some(visibility);
        self
    }

    /// Fills unset fields from `defaults`.
    pub fn resolve(&self, defaults: &RoomDefaults) -> RoomOptions {
        RoomOptions {
            max: self.max.unwrap_or(defaults.max),
            visibility: self.visibility.unwrap_or(defaults.visibility),
        }
    }
}

/// Configuration for a [`RoomClient`](crate::RoomClient).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Identity used as `selfId` when the host does not assign one.
    pub client_id: String,
    /// Host address.
    pub endpoint: Endpoint,
    /// Reconnect schedule.
    pub reconnect: ReconnectPolicy,
    /// Heartbeat cadence while connected; none when unset.
    pub heartbeat_interval: Option<Duration>,
    /// Ceiling for host/join/quick play replies.
    pub room_timeout: Duration,
    /// Ceiling for the leave confirmation.
    pub leave_timeout: Duration,
    /// Added to a lock's TTL to bound the acquire wait.
    pub lock_margin: Duration,
    /// Ceiling for the release confirmation.
    pub release_timeout: Duration,
    /// Defaults for `host`.
    pub room_defaults: RoomDefaults,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: roomsync_core::ids::client_id(),
            endpoint: Endpoint::default(),
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: None,
            room_timeout: Duration::from_secs(10),
            leave_timeout: Duration::from_secs(5),
            lock_margin: Duration::from_secs(1),
            release_timeout: Duration::from_secs(5),
            room_defaults: RoomDefaults::default(),
        }
    }
}

impl ClientConfig {
    /// Creates a configuration for the given endpoint.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ..Default::default()
        }
    }

    /// Builder: set the client id.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Builder: set the reconnect schedule.
    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Builder: enable heartbeats.
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Builder: set the room request timeout.
    pub fn with_room_timeout(mut self, timeout: Duration) -> Self {
        self.room_timeout = timeout;
        self
    }

    /// Builder: set the leave timeout.
    pub fn with_leave_timeout(mut self, timeout: Duration) -> Self {
        self.leave_timeout = timeout;
        self
    }

    /// Builder: set the lock margin.
    pub fn with_lock_margin(mut self, margin: Duration) -> Self {
        self.lock_margin = margin;
        self
    }

    /// Builder: set the release timeout.
    pub fn with_release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = timeout;
        self
    }

    /// Builder: set host defaults.
    pub fn with_room_defaults(mut self, defaults: RoomDefaults) -> Self {
        self.room_defaults = defaults;
        self
    }
}
