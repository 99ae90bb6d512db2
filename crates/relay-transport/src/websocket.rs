//! WebSocket transport implementation.
//!
//! This module provides a WebSocket client transport using tokio-tungstenite.
//! Messages travel as JSON text frames.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use relay_protocol::{codec, ProtocolError, WireMessage};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, trace, warn};

use crate::traits::{ConnectionId, MessageSink, MessageStream, Session, Transport, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Time allowed for the TCP, TLS and upgrade handshakes.
    pub connect_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: codec::MAX_FRAME_SIZE,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// WebSocket transport.
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport {
    config: WebSocketConfig,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport.
    #[must_use]
    pub fn new(config: WebSocketConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<Session, TransportError> {
        let (ws_stream, response) =
            tokio::time::timeout(self.config.connect_timeout, connect_async(url))
                .await
                .map_err(|_| TransportError::Timeout)?
                .map_err(|e| TransportError::ConnectFailed(e.to_string()))?;

        let id = ConnectionId::generate();
        info!(conn = %id, status = %response.status(), "WebSocket connected");

        let (sink, stream) = ws_stream.split();
        Ok(Session {
            id: id.clone(),
            sink: Box::new(WebSocketSink { id: id.clone(), sink }),
            stream: Box::new(WebSocketReader {
                id,
                stream,
                max_message_size: self.config.max_message_size,
            }),
        })
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

/// Write half of a WebSocket session.
struct WebSocketSink {
    id: ConnectionId,
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl MessageSink for WebSocketSink {
    async fn send(&mut self, message: &WireMessage) -> Result<(), TransportError> {
        let text = codec::encode(message)?;
        trace!(conn = %self.id, topic = %message.topic, event = %message.event, "Sending");
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::SendFailed(format!("Failed to close: {e}"))),
        }
    }
}

/// Read half of a WebSocket session.
///
/// Pings are answered by tungstenite itself; the pong goes out with the next
/// write on the sink half.
struct WebSocketReader {
    id: ConnectionId,
    stream: SplitStream<WsStream>,
    max_message_size: usize,
}

impl WebSocketReader {
    fn check_size(&self, len: usize) -> Result<(), TransportError> {
        if len > self.max_message_size {
            warn!(
                conn = %self.id,
                size = len,
                max = self.max_message_size,
                "Message too large"
            );
            return Err(ProtocolError::FrameTooLarge(len).into());
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStream for WebSocketReader {
    async fn recv(&mut self) -> Result<Option<WireMessage>, TransportError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    self.check_size(text.len())?;
                    return Ok(Some(codec::decode(&text)?));
                }
                Some(Ok(Message::Binary(data))) => {
                    self.check_size(data.len())?;
                    return Ok(Some(codec::decode_bytes(&data)?));
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    debug!(conn = %self.id, ?frame, "Received close frame");
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    debug!(conn = %self.id, "Connection closed");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    warn!(conn = %self.id, error = %e, "WebSocket error");
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
                None => {
                    debug!(conn = %self.id, "WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}
