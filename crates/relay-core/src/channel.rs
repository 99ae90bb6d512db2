//! Channel abstraction for Relay.
//!
//! A channel is one logical subscription multiplexed over the shared
//! connection. It owns its join/leave state machine and its callback registry;
//! it builds the control frames for its transitions but never sends them, so
//! the connection layer decides when and how frames go out.

use crate::presence::PresenceSet;
use crate::registry::CallbackRegistry;
use crate::status::ChannelStatus;
use relay_protocol::{ChannelEvent, Payload, PostgresJoinConfig, Reply, WireMessage, TOPIC_PREFIX};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Maximum channel name length.
pub const MAX_CHANNEL_NAME_LENGTH: usize = 256;

/// Validate a channel name.
///
/// # Errors
///
/// Returns an error message if the channel name is invalid.
pub fn validate_channel_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("Channel name cannot be empty");
    }
    if name.len() > MAX_CHANNEL_NAME_LENGTH {
        return Err("Channel name too long");
    }
    if name.starts_with(TOPIC_PREFIX) {
        return Err("Channel name must not include the topic prefix");
    }
    if !name.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Channel name contains invalid characters");
    }
    Ok(())
}

/// Channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Invalid channel name.
    #[error("Invalid channel name: {0}")]
    InvalidName(&'static str),

    /// Operation not allowed in the current state.
    #[error("Cannot {operation} {topic} while {status}")]
    InvalidState {
        topic: String,
        status: ChannelStatus,
        operation: &'static str,
    },

    /// The server refused the join.
    #[error("Join rejected: {0}")]
    JoinRejected(String),

    /// The connection was closed before the channel joined.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The channel was unsubscribed while waiting.
    #[error("Channel {0} was unsubscribed")]
    Unsubscribed(String),
}

/// Broadcast options sent on join.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Ask the server to acknowledge each broadcast sent.
    #[serde(default)]
    pub ack: bool,
    /// Receive broadcasts sent by this client.
    #[serde(rename = "self", default)]
    pub receive_own: bool,
}

/// Presence options sent on join.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceConfig {
    /// Presence key for this client; empty lets the server assign one.
    #[serde(default)]
    pub key: String,
}

/// Per-channel configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    /// Private channels require an authorized token.
    #[serde(default)]
    pub private: bool,
}

impl ChannelConfig {
    /// Receive own broadcasts.
    #[must_use]
    pub fn broadcast_self(mut self, enabled: bool) -> Self {
        self.broadcast.receive_own = enabled;
        self
    }

    /// Request broadcast acknowledgements.
    #[must_use]
    pub fn broadcast_ack(mut self, enabled: bool) -> Self {
        self.broadcast.ack = enabled;
        self
    }

    /// Set the presence key.
    #[must_use]
    pub fn presence_key(mut self, key: impl Into<String>) -> Self {
        self.presence.key = key.into();
        self
    }

    /// Mark the channel private.
    #[must_use]
    pub fn private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }
}

/// Why a channel ended up closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The connection went away.
    Disconnected,
    /// The server refused the join.
    Rejected(String),
    /// The server closed the channel.
    ServerClosed,
    /// The server reported a channel error.
    ServerError,
}

#[derive(Debug, Default)]
struct ChannelState {
    status: ChannelStatus,
    join_ref: Option<String>,
    leave_ref: Option<String>,
    /// Join (again) as soon as the connection is up.
    rejoin: bool,
    close_reason: Option<CloseReason>,
}

/// A channel for pub/sub messaging.
#[derive(Debug)]
pub struct Channel {
    topic: String,
    config: ChannelConfig,
    registry: CallbackRegistry,
    presence: Mutex<PresenceSet>,
    state: Mutex<ChannelState>,
    status_tx: watch::Sender<ChannelStatus>,
}

impl Channel {
    /// Create a channel for a topic.
    #[must_use]
    pub fn new(topic: impl Into<String>, config: ChannelConfig) -> Self {
        let (status_tx, _) = watch::channel(ChannelStatus::Closed);
        Self {
            topic: topic.into(),
            config,
            registry: CallbackRegistry::new(),
            presence: Mutex::new(PresenceSet::new()),
            state: Mutex::new(ChannelState::default()),
            status_tx,
        }
    }

    /// Get the channel topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Get the channel name (the topic without its prefix).
    #[must_use]
    pub fn name(&self) -> &str {
        self.topic.strip_prefix(TOPIC_PREFIX).unwrap_or(&self.topic)
    }

    /// Get the channel configuration.
    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Get the callback registry.
    #[must_use]
    pub fn registry(&self) -> &CallbackRegistry {
        &self.registry
    }

    /// Current presence view, as of the last snapshot and diffs.
    #[must_use]
    pub fn presence(&self) -> PresenceSet {
        self.presence_view().clone()
    }

    fn presence_view(&self) -> MutexGuard<'_, PresenceSet> {
        self.presence.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the current status.
    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        self.lock().status
    }

    /// Observe status changes.
    #[must_use]
    pub fn watch_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status_tx.subscribe()
    }

    /// Whether the channel should join once the connection is up.
    #[must_use]
    pub fn needs_rejoin(&self) -> bool {
        let state = self.lock();
        state.status == ChannelStatus::Closed && state.rejoin
    }

    /// Why the channel last closed, if it did.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lock().close_reason.clone()
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, state: &mut ChannelState, status: ChannelStatus) {
        if state.status != status {
            debug!(topic = %self.topic, from = %state.status, to = %status, "Channel status changed");
        }
        state.status = status;
        self.status_tx.send_replace(status);
    }

    /// Build the join payload.
    #[must_use]
    pub fn join_payload(&self, access_token: Option<&str>) -> Payload {
        let mut config = json!({
            "broadcast": self.config.broadcast,
            "presence": self.config.presence,
            "postgres_changes": self.registry.postgres_filters(),
        });
        if self.config.private {
            config["private"] = Value::Bool(true);
        }

        let mut payload = Payload::new();
        payload.insert("config".into(), config);
        if let Some(token) = access_token {
            payload.insert("access_token".into(), Value::String(token.to_string()));
        }
        payload
    }

    /// Start joining and return the join frame to send.
    ///
    /// Allowed from `Closed` and `Unsubscribed`. Clears the server-confirmed
    /// postgres subscriptions; the server reassigns ids on every join.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidState`] from any other state.
    pub fn begin_join(
        &self,
        join_ref: impl Into<String>,
        access_token: Option<&str>,
    ) -> Result<WireMessage, ChannelError> {
        let mut state = self.lock();
        if !state.status.can_join() {
            return Err(self.invalid_state(&state, "subscribe"));
        }

        let join_ref = join_ref.into();
        state.join_ref = Some(join_ref.clone());
        state.leave_ref = None;
        state.rejoin = false;
        state.close_reason = None;
        self.registry.clear_server_changes();
        self.set_status(&mut state, ChannelStatus::Joining);

        Ok(WireMessage::join(
            self.topic.clone(),
            self.join_payload(access_token),
            join_ref,
        ))
    }

    /// Record that a join was requested while the connection is down.
    ///
    /// The connection layer sends the join once it connects.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidState`] unless `Closed` or `Unsubscribed`.
    pub fn request_join(&self) -> Result<(), ChannelError> {
        let mut state = self.lock();
        if !state.status.can_join() {
            return Err(self.invalid_state(&state, "subscribe"));
        }
        state.rejoin = true;
        state.close_reason = None;
        let status = state.status;
        if status == ChannelStatus::Unsubscribed {
            self.set_status(&mut state, ChannelStatus::Closed);
        }
        debug!(topic = %self.topic, "Join deferred until connected");
        Ok(())
    }

    /// Start leaving and return the leave frame to send.
    ///
    /// Returns `Ok(None)` when only a deferred join was pending: it is
    /// cancelled and nothing needs to go out.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::InvalidState`] unless `Joining` or `Subscribed`.
    pub fn begin_leave(
        &self,
        leave_ref: impl Into<String>,
    ) -> Result<Option<WireMessage>, ChannelError> {
        let mut state = self.lock();
        if state.status == ChannelStatus::Closed && state.rejoin {
            state.rejoin = false;
            self.set_status(&mut state, ChannelStatus::Unsubscribed);
            return Ok(None);
        }
        if !state.status.can_leave() {
            return Err(self.invalid_state(&state, "unsubscribe"));
        }

        let leave_ref = leave_ref.into();
        state.leave_ref = Some(leave_ref.clone());
        state.rejoin = false;
        self.set_status(&mut state, ChannelStatus::Leaving);
        Ok(Some(WireMessage::leave(self.topic.clone(), leave_ref)))
    }

    /// Mark the channel as no longer present on the server.
    ///
    /// Used when the channel is removed from the connection.
    pub fn detach(&self) {
        let mut state = self.lock();
        state.rejoin = false;
        state.join_ref = None;
        state.leave_ref = None;
        self.registry.clear_server_changes();
        self.presence_view().clear();
        if state.status != ChannelStatus::Closed {
            self.set_status(&mut state, ChannelStatus::Unsubscribed);
        }
    }

    /// React to the connection going away.
    ///
    /// With `reconnecting`, joined and joining channels are flagged to join
    /// again on the next connection; otherwise pending joins are abandoned.
    pub fn connection_lost(&self, reconnecting: bool) {
        let mut state = self.lock();
        match state.status {
            ChannelStatus::Joining | ChannelStatus::Subscribed => {
                state.rejoin = reconnecting;
                state.join_ref = None;
                state.close_reason = Some(CloseReason::Disconnected);
                self.registry.clear_server_changes();
                self.set_status(&mut state, ChannelStatus::Closed);
            }
            ChannelStatus::Leaving => {
                state.leave_ref = None;
                self.registry.clear_server_changes();
                self.set_status(&mut state, ChannelStatus::Unsubscribed);
            }
            ChannelStatus::Closed if state.rejoin && !reconnecting => {
                state.rejoin = false;
                state.close_reason = Some(CloseReason::Disconnected);
                self.set_status(&mut state, ChannelStatus::Closed);
            }
            ChannelStatus::Closed | ChannelStatus::Unsubscribed => {}
        }
    }

    /// Wait until the channel is subscribed.
    ///
    /// Keeps waiting across reconnects while a rejoin is pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the join is rejected, the connection is closed,
    /// or the channel is unsubscribed first.
    pub async fn wait_subscribed(&self) -> Result<(), ChannelError> {
        let mut rx = self.status_tx.subscribe();
        loop {
            if let Some(outcome) = self.join_outcome() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Err(ChannelError::ConnectionClosed);
            }
        }
    }

    fn join_outcome(&self) -> Option<Result<(), ChannelError>> {
        let state = self.lock();
        match state.status {
            ChannelStatus::Subscribed => Some(Ok(())),
            ChannelStatus::Joining => None,
            ChannelStatus::Closed if state.rejoin => None,
            ChannelStatus::Closed => Some(Err(match &state.close_reason {
                Some(CloseReason::Rejected(reason)) => ChannelError::JoinRejected(reason.clone()),
                Some(_) => ChannelError::ConnectionClosed,
                None => self.invalid_state(&state, "wait for"),
            })),
            ChannelStatus::Leaving | ChannelStatus::Unsubscribed => {
                Some(Err(ChannelError::Unsubscribed(self.topic.clone())))
            }
        }
    }

    fn invalid_state(&self, state: &ChannelState, operation: &'static str) -> ChannelError {
        ChannelError::InvalidState {
            topic: self.topic.clone(),
            status: state.status,
            operation,
        }
    }

    /// Apply an inbound event addressed to this channel.
    ///
    /// A `phx_error` on a subscribed channel closes it with
    /// [`needs_rejoin`](Self::needs_rejoin) set; the connection layer is
    /// expected to join it again.
    pub fn handle_event(&self, event: &ChannelEvent, msg_ref: Option<&str>) {
        match event {
            ChannelEvent::JoinOk => {
                let mut state = self.lock();
                if state.status == ChannelStatus::Joining {
                    info!(topic = %self.topic, "Joined channel");
                    self.set_status(&mut state, ChannelStatus::Subscribed);
                }
            }
            ChannelEvent::PostgresChangesAck { reply, configs } => {
                self.on_reply(reply, msg_ref, Some(configs));
            }
            ChannelEvent::SystemReply(reply) => self.on_reply(reply, msg_ref, None),
            ChannelEvent::PostgresChange { ids, change } => {
                self.registry.trigger_postgres_change(ids, change);
            }
            ChannelEvent::Broadcast(broadcast) => {
                self.registry.trigger_broadcast(broadcast);
            }
            ChannelEvent::PresenceDiff(diff) => {
                self.presence_view().apply_diff(diff);
                self.registry.trigger_presence_diff(diff);
            }
            ChannelEvent::PresenceState(state) => {
                // Snapshots replace the view; callbacks get the difference.
                let diff = self.presence_view().sync(state);
                self.registry.trigger_presence_diff(&diff);
            }
            ChannelEvent::Close => self.on_close(),
            ChannelEvent::Error { reason } => self.on_error(reason.as_deref()),
            ChannelEvent::TokenExpired { message } => {
                warn!(topic = %self.topic, message = %message, "Channel access token expired");
            }
            ChannelEvent::Unhandled => {
                trace!(topic = %self.topic, "Dropping unhandled event");
            }
        }
    }

    fn on_reply(
        &self,
        reply: &Reply,
        msg_ref: Option<&str>,
        configs: Option<&Vec<PostgresJoinConfig>>,
    ) {
        let mut state = self.lock();
        let join_reply = ref_matches(state.join_ref.as_deref(), msg_ref);
        let leave_reply = ref_matches(state.leave_ref.as_deref(), msg_ref);

        match state.status {
            ChannelStatus::Joining if join_reply => {
                if reply.is_ok() {
                    if let Some(configs) = configs {
                        self.registry.set_server_changes(configs.clone());
                    }
                    info!(topic = %self.topic, "Joined channel");
                    self.set_status(&mut state, ChannelStatus::Subscribed);
                } else {
                    let reason = reply.reason();
                    warn!(topic = %self.topic, reason = %reason, "Join rejected");
                    state.rejoin = false;
                    state.close_reason = Some(CloseReason::Rejected(reason));
                    self.set_status(&mut state, ChannelStatus::Closed);
                }
            }
            ChannelStatus::Subscribed if join_reply && reply.is_ok() => {
                if let Some(configs) = configs {
                    self.registry.set_server_changes(configs.clone());
                }
            }
            ChannelStatus::Leaving if leave_reply || reply.is_ok() => {
                if !reply.is_ok() {
                    warn!(topic = %self.topic, reason = %reply.reason(), "Leave reply reported an error");
                }
                info!(topic = %self.topic, "Left channel");
                state.leave_ref = None;
                self.registry.clear_server_changes();
                self.set_status(&mut state, ChannelStatus::Unsubscribed);
            }
            status => {
                debug!(
                    topic = %self.topic,
                    status = %status,
                    reply_status = %reply.status,
                    "Received system reply"
                );
            }
        }
    }

    fn on_close(&self) {
        let mut state = self.lock();
        match state.status {
            ChannelStatus::Leaving => {
                info!(topic = %self.topic, "Left channel");
                state.leave_ref = None;
                self.registry.clear_server_changes();
                self.set_status(&mut state, ChannelStatus::Unsubscribed);
            }
            ChannelStatus::Joining | ChannelStatus::Subscribed => {
                info!(topic = %self.topic, "Channel closed by server");
                state.rejoin = false;
                state.close_reason = Some(CloseReason::ServerClosed);
                self.registry.clear_server_changes();
                self.set_status(&mut state, ChannelStatus::Closed);
            }
            ChannelStatus::Closed | ChannelStatus::Unsubscribed => {}
        }
    }

    fn on_error(&self, reason: Option<&str>) {
        let mut state = self.lock();
        warn!(
            topic = %self.topic,
            status = %state.status,
            reason = reason.unwrap_or("unspecified"),
            "Channel error"
        );
        match state.status {
            ChannelStatus::Subscribed => {
                state.rejoin = true;
                state.close_reason = Some(CloseReason::ServerError);
                self.registry.clear_server_changes();
                self.set_status(&mut state, ChannelStatus::Closed);
            }
            ChannelStatus::Joining => {
                state.rejoin = false;
                state.close_reason = Some(CloseReason::Rejected(
                    reason.unwrap_or("channel error").to_string(),
                ));
                self.set_status(&mut state, ChannelStatus::Closed);
            }
            _ => {}
        }
    }
}

fn ref_matches(expected: Option<&str>, received: Option<&str>) -> bool {
    match (expected, received) {
        (Some(expected), Some(received)) => expected == received,
        (_, None) => true,
        (None, Some(_)) => false,
    }
}
