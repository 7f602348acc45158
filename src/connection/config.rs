//! Connection configuration

use anyhow::{Context, Result};
use feed_shared::{policy, Policy};
use std::time::Duration;

/// Environment variable holding the server address
pub const ENV_ADDRESS: &str = "FEED_WS_URL";

/// Environment variable holding the reconnect ceiling
pub const ENV_MAX_RETRIES: &str = "FEED_MAX_RETRIES";

/// Configuration for connection manager
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server endpoint (scheme + host + path); fixed for the manager's lifetime
    pub address: String,
    /// Reconnect attempts before giving up
    pub max_retries: u32,
    /// Interval between pings
    pub heartbeat_interval: Duration,
    /// Unanswered pings tolerated before the grace window
    pub max_missed_heartbeats: u32,
    /// Window in which a late pong still saves the connection
    pub grace_period: Duration,
    /// First reconnect delay
    pub base_backoff: Duration,
    /// Maximum reconnect delay
    pub max_backoff: Duration,
    /// How long a closing session may wait for the peer's close frame
    pub close_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            address: "ws://localhost:5000".into(),
            max_retries: policy::DEFAULT_MAX_RETRIES,
            heartbeat_interval: Duration::from_millis(policy::HEARTBEAT_INTERVAL_MS),
            max_missed_heartbeats: policy::MAX_MISSED_HEARTBEATS,
            grace_period: Duration::from_millis(policy::GRACE_PERIOD_MS),
            base_backoff: Duration::from_millis(policy::RECONNECT_BASE_DELAY_MS),
            max_backoff: Duration::from_millis(policy::RECONNECT_MAX_DELAY_MS),
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl ConnectionConfig {
    /// Defaults overridden by `FEED_WS_URL` and `FEED_MAX_RETRIES`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(address) = lookup(ENV_ADDRESS) {
            config.address = address;
        }
        if let Some(retries) = lookup(ENV_MAX_RETRIES) {
            config.max_retries = retries
                .trim()
                .parse()
                .with_context(|| {
                    format!(
                        "{} must be a non-negative integer, got {:?}",
                        ENV_MAX_RETRIES, retries
                    )
                })?;
        }

        Ok(config)
    }

    /// Timing policy handed to the state machine
    pub fn policy(&self) -> Policy {
        Policy {
            heartbeat_interval: self.heartbeat_interval,
            max_missed_heartbeats: self.max_missed_heartbeats,
            grace_period: self.grace_period,
            base_backoff: self.base_backoff,
            max_backoff: self.max_backoff,
            max_retries: self.max_retries,
        }
    }
}
