//! Wire message envelope for the Relay protocol.
//!
//! Every frame exchanged with the server is a JSON object of the form
//! `{topic, event, payload, ref}`. The payload is always a JSON object.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// A JSON object payload.
pub type Payload = Map<String, Value>;

/// Topic used for connection-level frames such as heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Prefix prepended to every channel name to form its topic.
pub const TOPIC_PREFIX: &str = "realtime:";

/// Event names used on the wire.
pub mod events {
    pub const JOIN: &str = "phx_join";
    pub const LEAVE: &str = "phx_leave";
    pub const REPLY: &str = "phx_reply";
    pub const CLOSE: &str = "phx_close";
    pub const ERROR: &str = "phx_error";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const SYSTEM: &str = "system";
    pub const BROADCAST: &str = "broadcast";
    pub const PRESENCE: &str = "presence";
    pub const PRESENCE_DIFF: &str = "presence_diff";
    pub const PRESENCE_STATE: &str = "presence_state";
    pub const POSTGRES_CHANGES: &str = "postgres_changes";
}

/// Build the topic for a channel name.
#[must_use]
pub fn channel_topic(name: &str) -> String {
    format!("{TOPIC_PREFIX}{name}")
}

/// A protocol message.
///
/// Messages are immutable once built; they are constructed either by the codec
/// when a frame arrives or by one of the helper constructors before sending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Routing key. `realtime:<name>` for channels, `phoenix` for the connection.
    pub topic: String,
    /// Event name.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub payload: Payload,
    /// Correlation reference echoed back in replies.
    #[serde(rename = "ref", default)]
    pub msg_ref: Option<String>,
}

impl WireMessage {
    /// Create a new message.
    #[must_use]
    pub fn new(
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Payload,
        msg_ref: Option<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            msg_ref,
        }
    }

    /// Create a heartbeat frame.
    #[must_use]
    pub fn heartbeat(msg_ref: impl Into<String>) -> Self {
        Self::new(
            PHOENIX_TOPIC,
            events::HEARTBEAT,
            Payload::new(),
            Some(msg_ref.into()),
        )
    }

    /// Create a join frame for a topic with a prepared join payload.
    #[must_use]
    pub fn join(topic: impl Into<String>, payload: Payload, msg_ref: impl Into<String>) -> Self {
        Self::new(topic, events::JOIN, payload, Some(msg_ref.into()))
    }

    /// Create a leave frame.
    #[must_use]
    pub fn leave(topic: impl Into<String>, msg_ref: impl Into<String>) -> Self {
        Self::new(topic, events::LEAVE, Payload::new(), Some(msg_ref.into()))
    }

    /// Create an access token update frame.
    #[must_use]
    pub fn access_token(
        topic: impl Into<String>,
        token: impl Into<String>,
        msg_ref: impl Into<String>,
    ) -> Self {
        let mut payload = Payload::new();
        payload.insert("access_token".into(), Value::String(token.into()));
        Self::new(topic, events::ACCESS_TOKEN, payload, Some(msg_ref.into()))
    }

    /// Create an outgoing broadcast frame.
    #[must_use]
    pub fn broadcast(
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
        msg_ref: impl Into<String>,
    ) -> Self {
        Self::new(
            topic,
            events::BROADCAST,
            object(json!({
                "type": "broadcast",
                "event": event.into(),
                "payload": payload,
            })),
            Some(msg_ref.into()),
        )
    }

    /// Create a presence track frame.
    #[must_use]
    pub fn presence_track(
        topic: impl Into<String>,
        payload: Value,
        msg_ref: impl Into<String>,
    ) -> Self {
        Self::new(
            topic,
            events::PRESENCE,
            object(json!({
                "type": "presence",
                "event": "track",
                "payload": payload,
            })),
            Some(msg_ref.into()),
        )
    }

    /// Create a presence untrack frame.
    #[must_use]
    pub fn presence_untrack(topic: impl Into<String>, msg_ref: impl Into<String>) -> Self {
        Self::new(
            topic,
            events::PRESENCE,
            object(json!({
                "type": "presence",
                "event": "untrack",
            })),
            Some(msg_ref.into()),
        )
    }

    /// Reply status (`ok` / `error`) carried by `phx_reply` and `system` frames.
    #[must_use]
    pub fn status(&self) -> Option<&str> {
        self.payload.get("status").and_then(Value::as_str)
    }

    /// The `response` object of a reply, if any.
    #[must_use]
    pub fn response(&self) -> Option<&Payload> {
        self.payload.get("response").and_then(Value::as_object)
    }

    /// Whether this is a connection-level frame.
    #[must_use]
    pub fn is_phoenix(&self) -> bool {
        self.topic == PHOENIX_TOPIC
    }
}

fn object(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}
