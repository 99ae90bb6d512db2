//! Client errors.

use tenvis_relay_core::ChannelError;
use thiserror::Error;

/// Errors returned by the realtime client.
///
/// Transport failures never show up here: they are recovered by reconnecting.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// `connect()` was called on a connected client.
    #[error("Already connected")]
    AlreadyConnected,

    /// The operation needs a connection and auto-connect is disabled.
    #[error("Not connected")]
    NotConnected,

    /// Channel state machine refused the operation, or the join failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// The channel did not subscribe in time.
    #[error("Timed out waiting for {topic} to subscribe")]
    SubscribeTimeout { topic: String },

    /// Client configuration is invalid.
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// A payload could not be serialized.
    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Result type for client operations.
pub type Result<T, E = RealtimeError> = std::result::Result<T, E>;
