//! Classification of inbound messages.
//!
//! [`classify`] maps a message to one [`EventKind`] by event name and payload
//! shape; [`ChannelEvent::decode`] then decodes the payload for that kind once,
//! so routing code matches on a tagged value instead of re-probing JSON.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::ProtocolError;
use crate::message::{events, Payload, WireMessage};
use crate::postgres::{PostgresChange, PostgresJoinConfig};

/// Substring the server puts in `system` messages when the channel token expired.
pub const TOKEN_EXPIRED_MESSAGE: &str = "access token has expired";

/// Semantic kind of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// `system` message with status `ok`: the channel is fully joined.
    JoinOk,
    /// Plain `phx_reply`, or a `system` message that is neither ok nor token expiry.
    SystemReply,
    /// `phx_reply` whose response lists confirmed postgres change subscriptions.
    PostgresChangesAck,
    /// Database change notification.
    PostgresChange,
    /// Application broadcast.
    Broadcast,
    /// Incremental presence update.
    PresenceDiff,
    /// Full presence snapshot.
    PresenceState,
    /// Server closed the channel.
    Close,
    /// Server reported a channel error.
    Error,
    /// The channel's access token expired.
    TokenExpired,
    /// Anything else.
    Unhandled,
}

/// Classify a message.
#[must_use]
pub fn classify(message: &WireMessage) -> EventKind {
    match message.event.as_str() {
        events::CLOSE => EventKind::Close,
        events::ERROR => EventKind::Error,
        events::REPLY => {
            let has_changes = message
                .response()
                .is_some_and(|r| r.contains_key(events::POSTGRES_CHANGES));
            if has_changes {
                EventKind::PostgresChangesAck
            } else {
                EventKind::SystemReply
            }
        }
        events::BROADCAST => EventKind::Broadcast,
        events::PRESENCE_DIFF => EventKind::PresenceDiff,
        events::PRESENCE_STATE => EventKind::PresenceState,
        events::POSTGRES_CHANGES => EventKind::PostgresChange,
        events::SYSTEM => {
            let expired = message
                .payload
                .get("message")
                .and_then(Value::as_str)
                .is_some_and(|m| m.contains(TOKEN_EXPIRED_MESSAGE));
            if expired {
                EventKind::TokenExpired
            } else if message.status() == Some("ok") {
                EventKind::JoinOk
            } else {
                EventKind::SystemReply
            }
        }
        _ => EventKind::Unhandled,
    }
}

/// A reply or non-ok system message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reply {
    /// `ok`, `error`, or empty when absent.
    pub status: String,
    /// Reply body.
    pub response: Payload,
    /// Human-readable message carried by `system` frames.
    pub message: Option<String>,
}

impl Reply {
    /// Whether the reply reports success.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    /// Best-effort failure reason.
    #[must_use]
    pub fn reason(&self) -> String {
        self.response
            .get("reason")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| format!("status {}", self.status))
    }

    fn from_message(message: &WireMessage) -> Self {
        Self {
            status: message.status().unwrap_or_default().to_string(),
            response: message.response().cloned().unwrap_or_default(),
            message: message
                .payload
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }
}

/// An inbound broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEvent {
    /// Application event name.
    pub event: String,
    /// Application payload.
    #[serde(default)]
    pub payload: Value,
}

impl BroadcastEvent {
    /// Decode the payload into a typed value.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not match `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// An incremental presence update, keyed by presence key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceDiff {
    /// Presences that joined.
    #[serde(default)]
    pub joins: Payload,
    /// Presences that left.
    #[serde(default)]
    pub leaves: Payload,
}

#[derive(Deserialize)]
struct PostgresEnvelope {
    #[serde(default)]
    ids: Vec<i64>,
    data: PostgresChange,
}

/// A classified, decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    JoinOk,
    SystemReply(Reply),
    PostgresChangesAck {
        reply: Reply,
        configs: Vec<PostgresJoinConfig>,
    },
    PostgresChange {
        ids: Vec<i64>,
        change: PostgresChange,
    },
    Broadcast(BroadcastEvent),
    PresenceDiff(PresenceDiff),
    PresenceState(Payload),
    Close,
    Error {
        reason: Option<String>,
    },
    TokenExpired {
        message: String,
    },
    Unhandled,
}

impl ChannelEvent {
    /// Classify and decode a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload does not have the shape its kind requires.
    pub fn decode(message: &WireMessage) -> Result<Self, ProtocolError> {
        let event = match classify(message) {
            EventKind::JoinOk => ChannelEvent::JoinOk,
            EventKind::SystemReply => ChannelEvent::SystemReply(Reply::from_message(message)),
            EventKind::PostgresChangesAck => {
                let reply = Reply::from_message(message);
                let configs = reply
                    .response
                    .get(events::POSTGRES_CHANGES)
                    .cloned()
                    .map(serde_json::from_value::<Vec<PostgresJoinConfig>>)
                    .transpose()
                    .map_err(|e| invalid(message, e))?
                    .unwrap_or_default();
                ChannelEvent::PostgresChangesAck { reply, configs }
            }
            EventKind::PostgresChange => {
                let envelope: PostgresEnvelope = from_payload(message)?;
                ChannelEvent::PostgresChange {
                    ids: envelope.ids,
                    change: envelope.data,
                }
            }
            EventKind::Broadcast => ChannelEvent::Broadcast(from_payload(message)?),
            EventKind::PresenceDiff => ChannelEvent::PresenceDiff(from_payload(message)?),
            EventKind::PresenceState => ChannelEvent::PresenceState(message.payload.clone()),
            EventKind::Close => ChannelEvent::Close,
            EventKind::Error => ChannelEvent::Error {
                reason: message
                    .payload
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            EventKind::TokenExpired => ChannelEvent::TokenExpired {
                message: message
                    .payload
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            },
            EventKind::Unhandled => ChannelEvent::Unhandled,
        };
        Ok(event)
    }

    /// The kind this event was classified as.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            ChannelEvent::JoinOk => EventKind::JoinOk,
            ChannelEvent::SystemReply(_) => EventKind::SystemReply,
            ChannelEvent::PostgresChangesAck { .. } => EventKind::PostgresChangesAck,
            ChannelEvent::PostgresChange { .. } => EventKind::PostgresChange,
            ChannelEvent::Broadcast(_) => EventKind::Broadcast,
            ChannelEvent::PresenceDiff(_) => EventKind::PresenceDiff,
            ChannelEvent::PresenceState(_) => EventKind::PresenceState,
            ChannelEvent::Close => EventKind::Close,
            ChannelEvent::Error { .. } => EventKind::Error,
            ChannelEvent::TokenExpired { .. } => EventKind::TokenExpired,
            ChannelEvent::Unhandled => EventKind::Unhandled,
        }
    }
}

fn from_payload<T: DeserializeOwned>(message: &WireMessage) -> Result<T, ProtocolError> {
    T::deserialize(Value::Object(message.payload.clone())).map_err(|e| invalid(message, e))
}

fn invalid(message: &WireMessage, error: serde_json::Error) -> ProtocolError {
    ProtocolError::InvalidPayload {
        event: message.event.clone(),
        reason: error.to_string(),
    }
}
