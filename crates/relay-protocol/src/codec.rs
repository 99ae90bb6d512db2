//! Codec for encoding and decoding Relay wire messages.
//!
//! Frames travel as JSON text, one message per websocket frame.

use thiserror::Error;

use crate::message::WireMessage;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame is not valid UTF-8.
    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,

    /// Payload does not have the shape its event requires.
    #[error("Invalid {event} payload: {reason}")]
    InvalidPayload {
        /// Event whose payload failed to decode.
        event: String,
        /// What was wrong.
        reason: String,
    },
}

/// Encode a message to JSON text.
///
/// # Errors
///
/// Returns an error if the message is too large or encoding fails.
pub fn encode(message: &WireMessage) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(message)?;

    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    Ok(text)
}

/// Decode a message from JSON text.
///
/// # Errors
///
/// Returns an error if the text is too large or is not a valid message.
pub fn decode(text: &str) -> Result<WireMessage, ProtocolError> {
    if text.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(text.len()));
    }

    Ok(serde_json::from_str(text)?)
}

/// Decode a message from a binary frame holding UTF-8 JSON.
///
/// # Errors
///
/// Returns an error if the data is not UTF-8 or not a valid message.
pub fn decode_bytes(data: &[u8]) -> Result<WireMessage, ProtocolError> {
    let text = std::str::from_utf8(data).map_err(|_| ProtocolError::InvalidUtf8)?;
    decode(text)
}
