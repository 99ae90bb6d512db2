//! # relay-protocol
//!
//! Wire protocol definitions for the Relay realtime client.
//!
//! This crate defines the JSON envelope exchanged with the realtime server,
//! the codec for it, and the classifier that turns inbound messages into
//! typed channel events.
//!
//! ## Message Kinds
//!
//! - `phx_join` / `phx_leave` / `phx_reply` - Channel membership handshake
//! - `postgres_changes` - Database change notifications
//! - `broadcast` - Application messages
//! - `presence_state` / `presence_diff` - Online users
//! - `heartbeat` - Connection keepalive
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{classify, codec, EventKind, WireMessage};
//!
//! let frame = codec::encode(&WireMessage::heartbeat("1")).unwrap();
//! let decoded = codec::decode(&frame).unwrap();
//! assert_eq!(classify(&decoded), EventKind::Unhandled);
//! ```

pub mod codec;
pub mod event;
pub mod message;
pub mod postgres;
pub mod version;

pub use codec::{decode, encode, ProtocolError};
pub use event::{classify, BroadcastEvent, ChannelEvent, EventKind, PresenceDiff, Reply};
pub use message::{channel_topic, events, Payload, WireMessage, PHOENIX_TOPIC, TOPIC_PREFIX};
pub use postgres::{
    Column, PostgresAction, PostgresChange, PostgresChangeFilter, PostgresEvent,
    PostgresJoinConfig,
};
pub use version::{websocket_url, Version, API_VERSION, PROTOCOL_VERSION};
