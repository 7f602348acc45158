//! Live Feed Shared Protocol Types
//!
//! This crate provides the wire envelope, codec and connection state machine
//! used by the live feed client. Nothing in here touches the network; the
//! runtime crate feeds events in and carries the resulting effects out.

pub mod codec;
pub mod envelope;
pub mod state_machine;
pub mod updates;

pub use envelope::{Inbound, Outbound};
pub use state_machine::{
    CloseInfo, ConnectionMachine, ConnectionStatus, Effect, Lifecycle, MachineEvent, SessionId,
};
pub use updates::PendingUpdates;

use std::time::Duration;

/// Timing and retry parameters for the connection
pub mod policy {
    /// Interval between heartbeat pings in milliseconds
    pub const HEARTBEAT_INTERVAL_MS: u64 = 30_000;

    /// Consecutive unanswered pings before the grace window opens
    pub const MAX_MISSED_HEARTBEATS: u32 = 5;

    /// Grace window after heartbeat failure, in milliseconds
    pub const GRACE_PERIOD_MS: u64 = 15_000;

    /// First reconnect delay; doubles per attempt
    pub const RECONNECT_BASE_DELAY_MS: u64 = 3_000;

    /// Upper bound on any reconnect delay
    pub const RECONNECT_MAX_DELAY_MS: u64 = 5_000;

    /// Default ceiling on reconnect attempts
    pub const DEFAULT_MAX_RETRIES: u32 = 5;

    /// Close code sent by the server when the origin is not permitted
    pub const CLOSE_ORIGIN_REJECTED: u16 = 4003;

    /// Close code for an abnormal termination with no close frame
    pub const CLOSE_ABNORMAL: u16 = 1006;
}

/// Runtime-tunable copy of the [`policy`] constants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub heartbeat_interval: Duration,
    pub max_missed_heartbeats: u32,
    pub grace_period: Duration,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub max_retries: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(policy::HEARTBEAT_INTERVAL_MS),
            max_missed_heartbeats: policy::MAX_MISSED_HEARTBEATS,
            grace_period: Duration::from_millis(policy::GRACE_PERIOD_MS),
            base_backoff: Duration::from_millis(policy::RECONNECT_BASE_DELAY_MS),
            max_backoff: Duration::from_millis(policy::RECONNECT_MAX_DELAY_MS),
            max_retries: policy::DEFAULT_MAX_RETRIES,
        }
    }
}

impl Policy {
    /// Delay before reconnect number `attempt` (zero based): `min(max, base * 2^attempt)`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}
