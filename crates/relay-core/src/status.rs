//! Connection and channel status values.

use std::fmt;

/// State of the shared websocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        })
    }
}

/// State of one channel's subscription.
///
/// ```text
/// Closed ──subscribe──▶ Joining ──join ok──▶ Subscribed ──unsubscribe──▶ Leaving ──leave ok──▶ Unsubscribed
/// ```
///
/// `Closed` and `Unsubscribed` both accept a new `subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelStatus {
    #[default]
    Closed,
    Joining,
    Subscribed,
    Leaving,
    Unsubscribed,
}

impl ChannelStatus {
    /// Whether a join may start from this state.
    #[must_use]
    pub fn can_join(self) -> bool {
        matches!(self, ChannelStatus::Closed | ChannelStatus::Unsubscribed)
    }

    /// Whether a leave may start from this state.
    #[must_use]
    pub fn can_leave(self) -> bool {
        matches!(self, ChannelStatus::Joining | ChannelStatus::Subscribed)
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelStatus::Closed => "closed",
            ChannelStatus::Joining => "joining",
            ChannelStatus::Subscribed => "subscribed",
            ChannelStatus::Leaving => "leaving",
            ChannelStatus::Unsubscribed => "unsubscribed",
        })
    }
}
