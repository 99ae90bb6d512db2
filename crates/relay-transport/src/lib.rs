//! # relay-transport
//!
//! Client transport abstraction for the Relay realtime client.
//!
//! A [`Transport`] dials the server and hands back a [`Session`]: a sink the
//! writer task owns and a stream the reader task owns. Both halves speak
//! [`WireMessage`](relay_protocol::WireMessage), so the connection layer never
//! sees frame encoding.
//!
//! - **WebSocket** - tokio-tungstenite, text frames carrying JSON
//! - **Memory** - an in-process pair for tests (`memory` feature)
//!
//! ```rust,ignore
//! use tenvis_relay_transport::{Transport, WebSocketConfig, WebSocketTransport};
//!
//! let transport = WebSocketTransport::new(WebSocketConfig::default());
//! let mut session = transport.connect(&url).await?;
//! while let Some(message) = session.stream.recv().await? {
//!     // Route message
//! }
//! ```

pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(any(test, feature = "memory"))]
pub mod memory;

pub use traits::{
    ConnectionId, MessageSink, MessageStream, Session, Transport, TransportError,
};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketTransport};

#[cfg(any(test, feature = "memory"))]
pub use memory::{MemoryPeer, MemoryServer, MemoryTransport};
