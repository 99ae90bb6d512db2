//! Application-facing channel handle.

use crate::connection::ConnectionManager;
use crate::error::{RealtimeError, Result};
use relay_protocol::{
    BroadcastEvent, PostgresChange, PostgresChangeFilter, PostgresJoinConfig, PresenceDiff,
    WireMessage,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tenvis_relay_core::{CallbackId, Channel, ChannelError, ChannelStatus, PresenceSet};
use tokio::sync::watch;
use tokio::time;

/// A channel on a [`RealtimeClient`](crate::RealtimeClient).
///
/// Cheap to clone; clones share state and callbacks.
#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<Channel>,
    manager: ConnectionManager,
}

impl RealtimeChannel {
    pub(crate) fn new(inner: Arc<Channel>, manager: ConnectionManager) -> Self {
        Self { inner, manager }
    }

    pub(crate) fn inner(&self) -> &Arc<Channel> {
        &self.inner
    }

    /// Full topic, `realtime:<name>`.
    #[must_use]
    pub fn topic(&self) -> &str {
        self.inner.topic()
    }

    /// Channel name as passed to [`RealtimeClient::channel`](crate::RealtimeClient::channel).
    #[must_use]
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        self.inner.status()
    }

    /// Observe status changes.
    #[must_use]
    pub fn status_changes(&self) -> watch::Receiver<ChannelStatus> {
        self.inner.watch_status()
    }

    /// Server-confirmed postgres subscriptions of the current join.
    #[must_use]
    pub fn confirmed_postgres_changes(&self) -> Arc<Vec<PostgresJoinConfig>> {
        self.inner.registry().server_changes()
    }

    /// Call `callback` for broadcasts named `event`; `"*"` matches every event.
    pub fn on_broadcast<F>(&self, event: impl Into<String>, callback: F) -> CallbackId
    where
        F: Fn(&BroadcastEvent) + Send + Sync + 'static,
    {
        self.inner.registry().add_broadcast_callback(event, callback)
    }

    /// Call `callback` for database changes matching `filter`.
    ///
    /// Filters are sent with the join, so register before subscribing.
    pub fn on_postgres_change<F>(&self, filter: PostgresChangeFilter, callback: F) -> CallbackId
    where
        F: Fn(&PostgresChange) + Send + Sync + 'static,
    {
        self.inner.registry().add_postgres_callback(filter, callback)
    }

    /// Current presence members, folded from snapshots and diffs.
    #[must_use]
    pub fn presence(&self) -> PresenceSet {
        self.inner.presence()
    }

    /// Call `callback` for presence snapshots and diffs.
    ///
    /// A `presence_state` snapshot arrives as a diff against the previous
    /// view: every snapshot key in `joins`, and every member missing from the
    /// snapshot in `leaves`. Folding each diff with
    /// [`PresenceSet::apply_diff`] tracks [`presence`](Self::presence).
    pub fn on_presence<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&PresenceDiff) + Send + Sync + 'static,
    {
        self.inner.registry().add_presence_callback(callback)
    }

    /// Remove a callback. Returns `false` if the id is unknown.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        self.inner.registry().remove_callback_by_id(id)
    }

    /// Join the channel.
    ///
    /// Returns once the join is queued, or deferred until the connection is up.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::NotConnected`] when disconnected with
    /// auto-connect disabled, or a channel error if already joining or joined.
    pub async fn subscribe(&self) -> Result<()> {
        self.manager.subscribe(&self.inner).await
    }

    /// Join the channel and wait for the server to confirm.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::SubscribeTimeout`] after the configured
    /// subscribe timeout, or the join's failure.
    pub async fn subscribe_and_wait(&self) -> Result<()> {
        let timeout = self.manager.config().subscribe_timeout();
        self.subscribe_and_wait_timeout(timeout).await
    }

    /// Like [`subscribe_and_wait`](Self::subscribe_and_wait) with an explicit timeout.
    ///
    /// # Errors
    ///
    /// See [`subscribe_and_wait`](Self::subscribe_and_wait).
    pub async fn subscribe_and_wait_timeout(&self, timeout: Duration) -> Result<()> {
        self.subscribe().await?;
        time::timeout(timeout, self.inner.wait_subscribed())
            .await
            .map_err(|_| RealtimeError::SubscribeTimeout {
                topic: self.topic().to_string(),
            })?
            .map_err(RealtimeError::from)
    }

    /// Leave the channel. Callbacks stay registered.
    ///
    /// # Errors
    ///
    /// Returns a channel error unless joining or subscribed.
    pub async fn unsubscribe(&self) -> Result<()> {
        self.manager.unsubscribe(&self.inner).await
    }

    /// Send a broadcast to the channel's other subscribers.
    ///
    /// # Errors
    ///
    /// Returns an error unless subscribed, or if `payload` fails to serialize.
    pub async fn broadcast(&self, event: &str, payload: impl Serialize) -> Result<()> {
        let payload = serde_json::to_value(payload)?;
        self.push("broadcast", |msg_ref| {
            WireMessage::broadcast(self.topic(), event, payload, msg_ref)
        })
        .await
    }

    /// Publish this client's presence payload.
    ///
    /// # Errors
    ///
    /// Returns an error unless subscribed, or if `payload` fails to serialize.
    pub async fn track(&self, payload: impl Serialize) -> Result<()> {
        let payload = serde_json::to_value(payload)?;
        self.push("track", |msg_ref| {
            WireMessage::presence_track(self.topic(), payload, msg_ref)
        })
        .await
    }

    /// Withdraw this client's presence.
    ///
    /// # Errors
    ///
    /// Returns an error unless subscribed.
    pub async fn untrack(&self) -> Result<()> {
        self.push("untrack", |msg_ref| {
            WireMessage::presence_untrack(self.topic(), msg_ref)
        })
        .await
    }

    async fn push(
        &self,
        operation: &'static str,
        build: impl FnOnce(String) -> WireMessage,
    ) -> Result<()> {
        let status = self.status();
        if status != ChannelStatus::Subscribed {
            return Err(ChannelError::InvalidState {
                topic: self.topic().to_string(),
                status,
                operation,
            }
            .into());
        }
        self.manager.send(build(self.manager.make_ref())).await
    }
}

impl fmt::Debug for RealtimeChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeChannel")
            .field("topic", &self.topic())
            .field("status", &self.status())
            .finish()
    }
}
