//! # relay-client
//!
//! Realtime pub/sub client for Phoenix-protocol servers.
//!
//! One [`RealtimeClient`] owns one socket. Channels created on it share that
//! socket; each has its own join state and callbacks:
//!
//! - **Postgres changes** - row events for the filters registered before join
//! - **Broadcast** - application messages by event name, or `"*"` for all
//! - **Presence** - snapshots and diffs of who is online
//!
//! The client keeps the socket alive with heartbeats, reconnects on failure,
//! and rejoins every channel that was joined when the connection dropped.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tenvis_relay_client::{ClientConfig, RealtimeClient};
//! use relay_protocol::{PostgresChangeFilter, PostgresEvent};
//! use tenvis_relay_core::ChannelConfig;
//!
//! # async fn run() -> Result<(), tenvis_relay_client::RealtimeError> {
//! let client = RealtimeClient::new(ClientConfig::new("https://project.example.co", "anon-key"))?;
//! let todos = client.channel("todos", ChannelConfig::default())?;
//! todos.on_postgres_change(
//!     PostgresChangeFilter::new(PostgresEvent::All, "public").table("todos"),
//!     |change| println!("{} on {}", change.action.event(), change.table),
//! );
//! todos.subscribe_and_wait().await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod channel;
pub mod client;
pub mod config;
mod connection;
pub mod error;
pub mod metrics;

pub use auth::{AccessTokenProvider, StaticToken, TokenWatch};
pub use channel::RealtimeChannel;
pub use client::RealtimeClient;
pub use config::{ClientConfig, ReconnectPolicy};
pub use error::{RealtimeError, Result};
