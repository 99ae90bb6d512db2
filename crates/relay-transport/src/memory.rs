//! In-process transport.
//!
//! [`MemoryTransport::pair`] returns a transport for the client and a
//! [`MemoryServer`] that plays the server side. Every successful connect hands
//! the server a [`MemoryPeer`] carrying the raw JSON the client wrote.

use async_trait::async_trait;
use relay_protocol::{codec, WireMessage};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::traits::{ConnectionId, MessageSink, MessageStream, Session, Transport, TransportError};

enum Inbound {
    Text(String),
    Fail(String),
}

#[derive(Debug, Default)]
struct Counters {
    connects: AtomicUsize,
    fail_next: AtomicUsize,
}

/// Client side of the in-process transport.
pub struct MemoryTransport {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    counters: Arc<Counters>,
}

impl MemoryTransport {
    /// Create a connected transport/server pair.
    #[must_use]
    pub fn pair() -> (Self, MemoryServer) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        (
            Self {
                accept_tx,
                counters: counters.clone(),
            },
            MemoryServer {
                accept_rx,
                counters,
            },
        )
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, url: &str) -> Result<Session, TransportError> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .counters
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::ConnectFailed("connection refused".into()));
        }

        let id = ConnectionId::generate();
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();

        let peer = MemoryPeer {
            id: id.clone(),
            url: url.to_string(),
            to_client: Some(server_tx),
            from_client: client_rx,
        };
        self.accept_tx
            .send(peer)
            .map_err(|_| TransportError::ConnectFailed("server gone".into()))?;
        debug!(conn = %id, url, "Memory transport connected");

        Ok(Session {
            id,
            sink: Box::new(MemorySink { tx: Some(client_tx) }),
            stream: Box::new(MemoryStream { rx: server_rx }),
        })
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn send(&mut self, message: &WireMessage) -> Result<(), TransportError> {
        let text = codec::encode(message)?;
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(text).map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

#[async_trait]
impl MessageStream for MemoryStream {
    async fn recv(&mut self) -> Result<Option<WireMessage>, TransportError> {
        match self.rx.recv().await {
            Some(Inbound::Text(text)) => Ok(Some(codec::decode(&text)?)),
            Some(Inbound::Fail(reason)) => Err(TransportError::ReceiveFailed(reason)),
            None => Ok(None),
        }
    }
}

/// Server side of the in-process transport.
pub struct MemoryServer {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
    counters: Arc<Counters>,
}

impl MemoryServer {
    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }

    /// Take a pending connection without waiting.
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.try_recv().ok()
    }

    /// Number of connect attempts so far, refused ones included.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    /// Refuse the next `n` connect attempts.
    pub fn fail_next_connects(&self, n: usize) {
        self.counters.fail_next.store(n, Ordering::SeqCst);
    }
}

/// The server's end of one connection.
pub struct MemoryPeer {
    id: ConnectionId,
    url: String,
    to_client: Option<mpsc::UnboundedSender<Inbound>>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// Connection identifier shared with the client session.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// URL the client dialed.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Wait for the next message from the client.
    ///
    /// Returns `None` once the client has closed its sink.
    pub async fn recv(&mut self) -> Option<WireMessage> {
        let text = self.from_client.recv().await?;
        codec::decode(&text).ok()
    }

    /// Wait for the next raw JSON text from the client.
    pub async fn recv_raw(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Take a message the client already sent, without waiting.
    pub fn try_recv(&mut self) -> Option<WireMessage> {
        let text = self.from_client.try_recv().ok()?;
        codec::decode(&text).ok()
    }

    /// Send a message to the client.
    ///
    /// Returns `false` if the client side is gone.
    pub fn send(&self, message: &WireMessage) -> bool {
        codec::encode(message).is_ok_and(|text| self.send_raw(text))
    }

    /// Send raw text to the client, valid JSON or not.
    pub fn send_raw(&self, text: impl Into<String>) -> bool {
        self.to_client
            .as_ref()
            .is_some_and(|tx| tx.send(Inbound::Text(text.into())).is_ok())
    }

    /// Make the client's next read fail with a transport error.
    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.to_client
            .as_ref()
            .is_some_and(|tx| tx.send(Inbound::Fail(reason.into())).is_ok())
    }

    /// Close the connection from the server side.
    pub fn close(&mut self) {
        self.to_client = None;
    }
}
