//! # relay-core
//!
//! Channel state and callback dispatch for the Relay realtime client.
//!
//! This crate provides the transport-agnostic building blocks:
//!
//! - **Channel** - Join/leave state machine for one topic
//! - **Registry** - Callbacks keyed by event, dispatched by server-assigned ids
//! - **Presence** - Fold presence snapshots and diffs into a member view
//! - **Status** - Connection and channel status values
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ Connection  │────▶│   Channel   │────▶│  Registry   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!   routes by topic     state machine        callbacks
//! ```
//!
//! Channels never touch the network. They return the frames their transitions
//! require and the connection layer sends them.

pub mod channel;
pub mod presence;
pub mod registry;
pub mod status;

pub use channel::{
    validate_channel_name, BroadcastConfig, Channel, ChannelConfig, ChannelError, CloseReason,
    PresenceConfig, MAX_CHANNEL_NAME_LENGTH,
};
pub use presence::{Presence, PresenceSet};
pub use registry::{
    BroadcastCallback, CallbackEntry, CallbackId, CallbackRegistry, PostgresCallback,
    PresenceCallback, ANY_EVENT,
};
pub use status::{ChannelStatus, ConnectionStatus};
