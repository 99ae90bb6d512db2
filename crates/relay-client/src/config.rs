//! Client configuration.
//!
//! Every field has a default, so an empty TOML table or `{}` is a valid
//! config. `url` and `api_key` fall back to `RELAY_URL` and `RELAY_API_KEY`.

use crate::error::RealtimeError;
use relay_protocol::{codec::MAX_FRAME_SIZE, websocket_url};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay policy between reconnect attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Same delay before every attempt.
    Fixed {
        #[serde(default = "default_reconnect_delay")]
        delay_ms: u64,
    },
    /// Delay doubles per attempt, starting at `base_ms`, capped at `max_ms`.
    Exponential { base_ms: u64, max_ms: u64 },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed {
            delay_ms: default_reconnect_delay(),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            ReconnectPolicy::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            ReconnectPolicy::Exponential { base_ms, max_ms } => {
                let factor = 1u64
                    .checked_shl(attempt.saturating_sub(1))
                    .unwrap_or(u64::MAX);
                Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
            }
        }
    }
}

/// Realtime client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Project URL; `http(s)://` and `ws(s)://` are both accepted.
    #[serde(default = "default_url")]
    pub url: String,

    /// API key sent as the `apikey` query parameter.
    #[serde(default = "default_api_key")]
    pub api_key: String,

    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Connect timeout in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Default timeout for `subscribe_and_wait` in milliseconds.
    #[serde(default = "default_subscribe_timeout")]
    pub subscribe_timeout_ms: u64,

    /// Reconnect delay policy.
    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    /// Connect on `subscribe()` when disconnected.
    #[serde(default = "default_true")]
    pub auto_connect: bool,

    /// Disconnect once the last channel is removed.
    #[serde(default = "default_true")]
    pub disconnect_on_no_subscriptions: bool,

    /// Capacity of the outbound frame queue.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

// Default value functions
fn default_url() -> String {
    std::env::var("RELAY_URL").unwrap_or_else(|_| "http://localhost:4000".to_string())
}

fn default_api_key() -> String {
    std::env::var("RELAY_API_KEY").unwrap_or_default()
}

fn default_heartbeat_interval() -> u64 {
    15_000 // 15 seconds
}

fn default_connect_timeout() -> u64 {
    10_000
}

fn default_subscribe_timeout() -> u64 {
    10_000
}

fn default_reconnect_delay() -> u64 {
    7_000
}

fn default_true() -> bool {
    true
}

fn default_outbound_capacity() -> usize {
    256
}

fn default_max_message_size() -> usize {
    MAX_FRAME_SIZE
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            api_key: default_api_key(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            connect_timeout_ms: default_connect_timeout(),
            subscribe_timeout_ms: default_subscribe_timeout(),
            reconnect: ReconnectPolicy::default(),
            auto_connect: true,
            disconnect_on_no_subscriptions: true,
            outbound_capacity: default_outbound_capacity(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl ClientConfig {
    /// Create a config for a project URL and API key.
    #[must_use]
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            ..Self::default()
        }
    }

    /// Heartbeat interval.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Connect timeout.
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Default subscribe timeout.
    #[must_use]
    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    /// Full websocket endpoint for this config.
    #[must_use]
    pub fn websocket_url(&self) -> String {
        websocket_url(&self.url, &self.api_key)
    }

    /// Check the config for values the client cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::InvalidConfig`] describing the first problem.
    pub fn validate(&self) -> Result<(), RealtimeError> {
        if self.url.trim().is_empty() {
            return Err(RealtimeError::InvalidConfig("url must not be empty".into()));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(RealtimeError::InvalidConfig(
                "heartbeat_interval_ms must be positive".into(),
            ));
        }
        if self.outbound_capacity == 0 {
            return Err(RealtimeError::InvalidConfig(
                "outbound_capacity must be positive".into(),
            ));
        }
        if let ReconnectPolicy::Exponential { base_ms, max_ms } = self.reconnect {
            if base_ms == 0 || base_ms > max_ms {
                return Err(RealtimeError::InvalidConfig(
                    "exponential reconnect needs 0 < base_ms <= max_ms".into(),
                ));
            }
        }
        Ok(())
    }
}
