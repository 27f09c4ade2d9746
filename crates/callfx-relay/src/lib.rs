#![forbid(unsafe_code)]

//! callfx relay - the signaling rendezvous between two call participants.
//!
//! Every participant owns one slot. Peers write envelopes into the slot of the
//! participant they talk to and subscribe to their own. A slot holds only the
//! last value written; subscribers get a push for every change.

pub mod server;
pub mod store;

use std::net::SocketAddr;
use std::time::Duration;

use callfx_common::MAX_RELAY_VALUE_BYTES;

pub use server::{router, serve, serve_with_shutdown, RelayState, RelayStats, StatsSnapshot};
pub use store::{Outbox, RelayError, SlotStore, DEFAULT_SLOT_IDLE_TIMEOUT};

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8787";
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    pub bind: SocketAddr,
    /// Largest slot value accepted from a WRITE.
    pub max_value_bytes: usize,
    /// Frame limit for a whole request. Must leave room for the JSON wrapper
    /// around an oversize value so it can be rejected with an ERROR push
    /// instead of a dropped socket.
    pub max_message_bytes: usize,
    /// Unobserved slots idle for longer than this are dropped.
    pub slot_idle_timeout: Duration,
    pub cleanup_interval: Duration,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8787)),
            max_value_bytes: MAX_RELAY_VALUE_BYTES,
            max_message_bytes: 4 * MAX_RELAY_VALUE_BYTES,
            slot_idle_timeout: DEFAULT_SLOT_IDLE_TIMEOUT,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}
