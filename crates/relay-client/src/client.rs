//! Client facade.

use crate::auth::AccessTokenProvider;
use crate::channel::RealtimeChannel;
use crate::config::ClientConfig;
use crate::connection::ConnectionManager;
use crate::error::Result;
use relay_protocol::channel_topic;
use std::fmt;
use std::sync::Arc;
use tenvis_relay_core::{
    validate_channel_name, Channel, ChannelConfig, ChannelError, ConnectionStatus,
};
use tenvis_relay_transport::{Transport, WebSocketConfig, WebSocketTransport};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Realtime client: one connection, many channels.
///
/// Dropping the client disconnects it.
pub struct RealtimeClient {
    manager: ConnectionManager,
    token_task: Option<JoinHandle<()>>,
}

impl RealtimeClient {
    /// Create a client that connects over WebSocket.
    ///
    /// Does not connect; see [`connect`](Self::connect).
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::InvalidConfig`](crate::RealtimeError::InvalidConfig) if the config is invalid.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport = WebSocketTransport::new(WebSocketConfig {
            max_message_size: config.max_message_size,
            connect_timeout: config.connect_timeout(),
        });
        Self::with_transport(config, Arc::new(transport))
    }

    /// Create a client over a custom transport.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::InvalidConfig`](crate::RealtimeError::InvalidConfig) if the config is invalid.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        debug!(url = %config.url, transport = transport.name(), "Creating realtime client");
        Ok(Self {
            manager: ConnectionManager::new(config, transport),
            token_task: None,
        })
    }

    /// Take access tokens from `provider`.
    ///
    /// If the provider publishes changes, each new token is pushed to the
    /// subscribed channels. Following changes needs a tokio runtime.
    #[must_use]
    pub fn with_token_provider(mut self, provider: Arc<dyn AccessTokenProvider>) -> Self {
        self.manager.set_access_token(provider.current_access_token());

        if let Some(mut changes) = provider.token_changes() {
            let Ok(handle) = Handle::try_current() else {
                warn!("No tokio runtime; token changes will not be followed");
                return self;
            };
            let shared = self.manager.downgrade();
            self.token_task = Some(handle.spawn(async move {
                while changes.changed().await.is_ok() {
                    let token = changes.borrow_and_update().clone();
                    let Some(manager) = ConnectionManager::upgrade(&shared) else {
                        break;
                    };
                    debug!("Access token changed");
                    manager.update_auth(token).await;
                }
            }));
        }
        self
    }

    /// Client configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        self.manager.config()
    }

    /// Connect and rejoin channels awaiting a join.
    ///
    /// A transport failure does not fail the call: the client keeps retrying
    /// in the background and [`status_changes`](Self::status_changes) reports
    /// when it is up.
    ///
    /// # Errors
    ///
    /// Returns [`RealtimeError::AlreadyConnected`](crate::RealtimeError::AlreadyConnected) if already connected.
    pub async fn connect(&self) -> Result<()> {
        self.manager.connect().await
    }

    /// Disconnect and stop reconnecting. Idempotent.
    ///
    /// Joined channels move to `Closed`; a pending `subscribe_and_wait` fails
    /// with a connection-closed error.
    pub async fn disconnect(&self) {
        self.manager.disconnect().await;
    }

    /// Current connection status.
    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.manager.status()
    }

    /// Observe connection status changes.
    #[must_use]
    pub fn status_changes(&self) -> watch::Receiver<ConnectionStatus> {
        self.manager.status_changes()
    }

    /// Create a channel named `name` (topic `realtime:<name>`).
    ///
    /// A channel created with the name of an existing one takes over its
    /// routing; the old channel is detached and ends `Unsubscribed`.
    ///
    /// # Errors
    ///
    /// Returns a channel error if the name is invalid.
    pub fn channel(&self, name: &str, config: ChannelConfig) -> Result<RealtimeChannel> {
        validate_channel_name(name).map_err(ChannelError::InvalidName)?;
        let channel = Arc::new(Channel::new(channel_topic(name), config));
        self.manager.register(Arc::clone(&channel));
        Ok(RealtimeChannel::new(channel, self.manager.clone()))
    }

    /// Every registered channel.
    #[must_use]
    pub fn channels(&self) -> Vec<RealtimeChannel> {
        self.manager
            .channels()
            .into_iter()
            .map(|channel| RealtimeChannel::new(channel, self.manager.clone()))
            .collect()
    }

    /// Leave and forget a channel.
    ///
    /// Disconnects when it was the last channel and
    /// `disconnect_on_no_subscriptions` is set.
    pub async fn remove_channel(&self, channel: &RealtimeChannel) {
        self.manager.remove_channel(channel.inner()).await;
    }

    /// Leave and forget every channel.
    pub async fn remove_all_channels(&self) {
        self.manager.remove_all_channels().await;
    }

    /// Use `token` for future joins and push it to subscribed channels.
    pub async fn set_auth(&self, token: Option<String>) {
        self.manager.update_auth(token).await;
    }
}

impl fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("url", &self.config().url)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        if let Some(task) = self.token_task.take() {
            task.abort();
        }
        if let Ok(handle) = Handle::try_current() {
            let manager = self.manager.clone();
            handle.spawn(async move { manager.disconnect().await });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::TokenWatch;
    use crate::config::ReconnectPolicy;
    use crate::error::RealtimeError;
    use relay_protocol::{PostgresChangeFilter, PostgresEvent, WireMessage};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tenvis_relay_core::ChannelStatus;
    use tenvis_relay_transport::{MemoryPeer, MemoryServer, MemoryTransport};
    use tokio::sync::mpsc;
    use tokio::time;

    fn config() -> ClientConfig {
        let mut config = ClientConfig::new("http://localhost:4000", "anon");
        config.reconnect = ReconnectPolicy::Fixed { delay_ms: 1_000 };
        config
    }

    fn client(config: ClientConfig) -> (RealtimeClient, MemoryServer) {
        let (transport, server) = MemoryTransport::pair();
        let client = RealtimeClient::with_transport(config, Arc::new(transport)).unwrap();
        (client, server)
    }

    fn object(value: Value) -> relay_protocol::Payload {
        value.as_object().cloned().unwrap()
    }

    /// Next non-heartbeat frame; heartbeats are acknowledged.
    async fn next_frame(peer: &mut MemoryPeer) -> WireMessage {
        loop {
            let message = peer.recv().await.expect("client closed the connection");
            if message.event != "heartbeat" {
                return message;
            }
            peer.send(&WireMessage::new(
                "phoenix",
                "phx_reply",
                object(json!({"status": "ok", "response": {}})),
                message.msg_ref.clone(),
            ));
        }
    }

    fn reply(to: &WireMessage, status: &str, response: Value) -> WireMessage {
        WireMessage::new(
            to.topic.clone(),
            "phx_reply",
            object(json!({"status": status, "response": response})),
            to.msg_ref.clone(),
        )
    }

    async fn wait_for(channel: &RealtimeChannel, status: ChannelStatus) {
        let mut changes = channel.status_changes();
        time::timeout(Duration::from_secs(5), changes.wait_for(|s| *s == status))
            .await
            .expect("status not reached")
            .unwrap();
    }

    async fn join(
        client: &RealtimeClient,
        peer: &mut MemoryPeer,
        name: &str,
    ) -> (RealtimeChannel, WireMessage) {
        let channel = client.channel(name, ChannelConfig::default()).unwrap();
        channel.subscribe().await.unwrap();
        let join = next_frame(peer).await;
        peer.send(&reply(&join, "ok", json!({"postgres_changes": []})));
        wait_for(&channel, ChannelStatus::Subscribed).await;
        (channel, join)
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_twice_is_a_usage_error() {
        let (client, mut server) = client(config());
        client.connect().await.unwrap();
        let _peer = server.accept().await.unwrap();

        assert_eq!(client.status(), ConnectionStatus::Connected);
        assert!(matches!(
            client.connect().await,
            Err(RealtimeError::AlreadyConnected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_websocket_url_is_dialed() {
        let (client, mut server) = client(config());
        client.connect().await.unwrap();
        let peer = server.accept().await.unwrap();
        assert_eq!(
            peer.url(),
            "ws://localhost:4000/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_frame_and_ack() {
        let (client, mut server) = client(config());
        client.connect().await.unwrap();
        let mut peer = server.accept().await.unwrap();

        let channel = client.channel("todos", ChannelConfig::default()).unwrap();
        channel.on_postgres_change(
            PostgresChangeFilter::new(PostgresEvent::Insert, "public").table("todos"),
            |_| {},
        );
        channel.subscribe().await.unwrap();
        assert_eq!(channel.status(), ChannelStatus::Joining);

        let join = next_frame(&mut peer).await;
        assert_eq!(join.topic, "realtime:todos");
        assert_eq!(join.event, "phx_join");
        assert!(join.msg_ref.is_some());
        assert!(!join.payload.contains_key("access_token"));
        assert_eq!(
            join.payload["config"]["postgres_changes"],
            json!([{"event": "INSERT", "schema": "public", "table": "todos"}])
        );

        peer.send(&reply(
            &join,
            "ok",
            json!({"postgres_changes": [
                {"event": "INSERT", "schema": "public", "table": "todos", "id": 42}
            ]}),
        ));
        wait_for(&channel, ChannelStatus::Subscribed).await;
        assert_eq!(channel.confirmed_postgres_changes()[0].id, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_postgres_change_dispatch() {
        let (client, mut server) = client(config());
        client.connect().await.unwrap();
        let mut peer = server.accept().await.unwrap();

        let channel = client.channel("todos", ChannelConfig::default()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.on_postgres_change(
            PostgresChangeFilter::new(PostgresEvent::All, "public").table("todos"),
            move |change| {
                let _ = tx.send(change.clone());
            },
        );
        channel.subscribe().await.unwrap();
        let join = next_frame(&mut peer).await;
        peer.send(&reply(
            &join,
            "ok",
            json!({"postgres_changes": [
                {"event": "*", "schema": "public", "table": "todos", "id": 5}
            ]}),
        ));
        wait_for(&channel, ChannelStatus::Subscribed).await;

        // Not confirmed: never delivered.
        peer.send(&WireMessage::new(
            "realtime:todos",
            "postgres_changes",
            object(json!({"ids": [99], "data": {
                "schema": "public", "table": "todos", "type": "INSERT", "record": {"id": 0}
            }})),
            None,
        ));
        peer.send(&WireMessage::new(
            "realtime:todos",
            "postgres_changes",
            object(json!({"ids": [5], "data": {
                "schema": "public", "table": "todos", "type": "UPDATE",
                "record": {"id": 1, "done": true}, "old_record": {"id": 1}
            }})),
            None,
        ));

        let change = rx.recv().await.unwrap();
        assert_eq!(change.action.event(), PostgresEvent::Update);
        assert_eq!(change.action.record().unwrap()["done"], true);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_scenario() {
        let (client, mut server) = client(config());
        client.connect().await.unwrap();
        let mut peer = server.accept().await.unwrap();

        let channel = client.channel("chat", ChannelConfig::default()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let msg_tx = tx.clone();
        channel.on_broadcast("msg", move |event| {
            let _ = msg_tx.send(("msg", event.payload.clone()));
        });
        channel.on_broadcast("other", move |event| {
            let _ = tx.send(("other", event.payload.clone()));
        });
        channel.subscribe().await.unwrap();
        let join = next_frame(&mut peer).await;
        peer.send(&reply(&join, "ok", json!({})));
        wait_for(&channel, ChannelStatus::Subscribed).await;

        peer.send(&WireMessage::new(
            "realtime:chat",
            "broadcast",
            object(json!({"type": "broadcast", "event": "msg", "payload": {"text": "hi"}})),
            None,
        ));

        assert_eq!(rx.recv().await.unwrap(), ("msg", json!({"text": "hi"})));
        time::sleep(Duration::from_millis(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_broadcast_and_presence() {
        let (client, mut server) = client(config());
        client.connect().await.unwrap();
        let mut peer = server.accept().await.unwrap();

        let idle = client.channel("idle", ChannelConfig::default()).unwrap();
        assert!(matches!(
            idle.broadcast("msg", json!({"n": 1})).await,
            Err(RealtimeError::Channel(ChannelError::InvalidState { .. }))
        ));
        assert!(idle.track(json!({})).await.is_err());

        let (channel, _) = join(&client, &mut peer, "room").await;
        channel.broadcast("msg", json!({"n": 1})).await.unwrap();
        let sent = next_frame(&mut peer).await;
        assert_eq!(sent.event, "broadcast");
        assert_eq!(sent.payload["event"], "msg");
        assert_eq!(sent.payload["payload"]["n"], 1);

        channel.track(json!({"user": "u1"})).await.unwrap();
        let tracked = next_frame(&mut peer).await;
        assert_eq!(tracked.event, "presence");
        assert_eq!(tracked.payload["event"], "track");

        channel.untrack().await.unwrap();
        assert_eq!(next_frame(&mut peer).await.payload["event"], "untrack");
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_rejected() {
        let (client, mut server) = client(config());
        client.connect().await.unwrap();
        let mut peer = server.accept().await.unwrap();

        let channel = client.channel("secret", ChannelConfig::default().private(true)).unwrap();
        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.subscribe_and_wait().await })
        };
        let join = next_frame(&mut peer).await;
        assert_eq!(join.payload["config"]["private"], true);
        peer.send(&reply(&join, "error", json!({"reason": "unauthorized"})));

        match waiter.await.unwrap() {
            Err(RealtimeError::Channel(ChannelError::JoinRejected(reason))) => {
                assert_eq!(reason, "unauthorized");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(channel.status(), ChannelStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_timeout() {
        let (client, mut server) = client(config());
        client.connect().await.unwrap();
        let _peer = server.accept().await.unwrap();

        let channel = client.channel("slow", ChannelConfig::default()).unwrap();
        let result = channel
            .subscribe_and_wait_timeout(Duration::from_secs(2))
            .await;
        assert!(matches!(result, Err(RealtimeError::SubscribeTimeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_during_wait_is_connection_closed() {
        let (client, mut server) = client(config());
        client.connect().await.unwrap();
        let mut peer = server.accept().await.unwrap();

        let channel = client.channel("room", ChannelConfig::default()).unwrap();
        let waiter = {
            let channel = channel.clone();
            tokio::spawn(async move { channel.subscribe_and_wait().await })
        };
        let _join = next_frame(&mut peer).await;
        client.disconnect().await;

        assert!(matches!(
            waiter.await.unwrap(),
            Err(RealtimeError::Channel(ChannelError::ConnectionClosed))
        ));
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
        assert!(peer.recv().await.is_none());

        // Idempotent.
        client.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_after_server_drop() {
        let (client, mut server) = client(config());
        client.connect().await.unwrap();
        let mut peer = server.accept().await.unwrap();
        let (channel, first_join) = join(&client, &mut peer, "room").await;

        peer.close();
        wait_for(&channel, ChannelStatus::Closed).await;
        assert!(channel.confirmed_postgres_changes().is_empty());

        let mut peer = server.accept().await.unwrap();
        let rejoin = next_frame(&mut peer).await;
        assert_eq!(rejoin.event, "phx_join");
        assert_eq!(rejoin.topic, "realtime:room");
        assert_ne!(rejoin.msg_ref, first_join.msg_ref);

        peer.send(&reply(&rejoin, "ok", json!({})));
        wait_for(&channel, ChannelStatus::Subscribed).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe() {
        let (client, mut server) = client(config());
        client.connect().await.unwrap();
        let mut peer = server.accept().await.unwrap();

        let closed = client.channel("idle", ChannelConfig::default()).unwrap();
        assert!(matches!(
            closed.unsubscribe().await,
            Err(RealtimeError::Channel(ChannelError::InvalidState { .. }))
        ));
        assert_eq!(closed.status(), ChannelStatus::Closed);

        let (channel, _) = join(&client, &mut peer, "room").await;
        channel.unsubscribe().await.unwrap();
        assert_eq!(channel.status(), ChannelStatus::Leaving);

        let leave = next_frame(&mut peer).await;
        assert_eq!(leave.event, "phx_leave");
        peer.send(&reply(&leave, "ok", json!({})));
        wait_for(&channel, ChannelStatus::Unsubscribed).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_channel_leaves_and_disconnects_when_idle() {
        let (client, mut server) = client(config());
        client.connect().await.unwrap();
        let mut peer = server.accept().await.unwrap();
        let (channel, _) = join(&client, &mut peer, "room").await;

        client.remove_channel(&channel).await;

        let leave = next_frame(&mut peer).await;
        assert_eq!(leave.event, "phx_leave");
        assert_eq!(leave.topic, "realtime:room");
        assert!(peer.recv().await.is_none());
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
        assert!(client.channels().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_channel_keeps_connection_when_configured() {
        let mut config = config();
        config.disconnect_on_no_subscriptions = false;
        let (client, mut server) = client(config);
        client.connect().await.unwrap();
        let mut peer = server.accept().await.unwrap();
        let _ = join(&client, &mut peer, "a").await;
        let _ = join(&client, &mut peer, "b").await;

        client.remove_all_channels().await;
        assert!(client.channels().is_empty());
        assert_eq!(client.status(), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_without_auto_connect() {
        let mut config = config();
        config.auto_connect = false;
        let (client, server) = client(config);

        let channel = client.channel("room", ChannelConfig::default()).unwrap();
        assert!(matches!(
            channel.subscribe().await,
            Err(RealtimeError::NotConnected)
        ));
        assert_eq!(server.connect_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_auto_connects() {
        let (client, mut server) = client(config());
        let channel = client.channel("room", ChannelConfig::default()).unwrap();

        channel.subscribe().await.unwrap();
        assert_eq!(client.status(), ConnectionStatus::Connected);

        let mut peer = server.accept().await.unwrap();
        assert_eq!(next_frame(&mut peer).await.event, "phx_join");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_join_sent_once_connected() {
        let (client, mut server) = client(config());
        server.fail_next_connects(1);
        let channel = client.channel("room", ChannelConfig::default()).unwrap();

        channel.subscribe().await.unwrap();
        assert_eq!(channel.status(), ChannelStatus::Closed);

        let mut peer = server.accept().await.unwrap();
        let join = next_frame(&mut peer).await;
        assert_eq!(join.event, "phx_join");
        peer.send(&reply(&join, "ok", json!({})));
        wait_for(&channel, ChannelStatus::Subscribed).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_auth_reaches_subscribed_channels_only() {
        let (client, mut server) = client(config());
        client.connect().await.unwrap();
        let mut peer = server.accept().await.unwrap();
        let (_joined, _) = join(&client, &mut peer, "joined").await;
        let _idle = client.channel("idle", ChannelConfig::default()).unwrap();

        client.set_auth(Some("new-token".into())).await;

        let frame = next_frame(&mut peer).await;
        assert_eq!(frame.event, "access_token");
        assert_eq!(frame.topic, "realtime:joined");
        assert_eq!(frame.payload["access_token"], "new-token");
        time::sleep(Duration::from_millis(10)).await;
        assert!(peer.try_recv().is_none());

        let late = client.channel("late", ChannelConfig::default()).unwrap();
        late.subscribe().await.unwrap();
        assert_eq!(next_frame(&mut peer).await.payload["access_token"], "new-token");
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_provider_changes_are_pushed() {
        let provider = Arc::new(TokenWatch::new(Some("first".into())));
        let (client, mut server) = client(config());
        let client = client.with_token_provider(provider.clone());
        client.connect().await.unwrap();
        let mut peer = server.accept().await.unwrap();

        let (_channel, join_frame) = join(&client, &mut peer, "room").await;
        assert_eq!(join_frame.payload["access_token"], "first");

        provider.set(Some("second".into()));
        let frame = next_frame(&mut peer).await;
        assert_eq!(frame.event, "access_token");
        assert_eq!(frame.payload["access_token"], "second");
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_state_and_diff() {
        let (client, mut server) = client(config());
        client.connect().await.unwrap();
        let mut peer = server.accept().await.unwrap();

        let channel = client
            .channel("lobby", ChannelConfig::default().presence_key("me"))
            .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.on_presence(move |diff| {
            let _ = tx.send(diff.clone());
        });
        channel.subscribe().await.unwrap();
        let join = next_frame(&mut peer).await;
        assert_eq!(join.payload["config"]["presence"]["key"], "me");
        peer.send(&reply(&join, "ok", json!({})));
        wait_for(&channel, ChannelStatus::Subscribed).await;

        peer.send(&WireMessage::new(
            "realtime:lobby",
            "presence_state",
            object(json!({"u1": {"metas": []}})),
            None,
        ));
        peer.send(&WireMessage::new(
            "realtime:lobby",
            "presence_diff",
            object(json!({"joins": {}, "leaves": {"u1": {"metas": []}}})),
            None,
        ));

        let mut set = tenvis_relay_core::PresenceSet::new();
        set.apply_diff(&rx.recv().await.unwrap());
        assert!(set.is_present("u1"));
        set.apply_diff(&rx.recv().await.unwrap());
        assert!(set.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_presence_snapshot_after_rejoin_drops_departed() {
        let (client, mut server) = client(config());
        client.connect().await.unwrap();
        let mut peer = server.accept().await.unwrap();

        let channel = client.channel("lobby", ChannelConfig::default()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.on_presence(move |diff| {
            let _ = tx.send(diff.clone());
        });
        channel.subscribe().await.unwrap();
        let join = next_frame(&mut peer).await;
        peer.send(&reply(&join, "ok", json!({})));
        wait_for(&channel, ChannelStatus::Subscribed).await;

        let mut folded = tenvis_relay_core::PresenceSet::new();
        peer.send(&WireMessage::new(
            "realtime:lobby",
            "presence_state",
            object(json!({"u1": {"metas": []}, "u2": {"metas": []}})),
            None,
        ));
        folded.apply_diff(&rx.recv().await.unwrap());
        assert_eq!(folded.keys(), vec!["u1", "u2"]);

        peer.close();
        wait_for(&channel, ChannelStatus::Closed).await;
        let mut peer = server.accept().await.unwrap();
        let rejoin = next_frame(&mut peer).await;
        peer.send(&reply(&rejoin, "ok", json!({})));
        wait_for(&channel, ChannelStatus::Subscribed).await;

        peer.send(&WireMessage::new(
            "realtime:lobby",
            "presence_state",
            object(json!({"u2": {"metas": []}})),
            None,
        ));
        let diff = rx.recv().await.unwrap();
        assert!(diff.leaves.contains_key("u1"));
        folded.apply_diff(&diff);

        assert_eq!(folded.keys(), vec!["u2"]);
        assert_eq!(channel.presence().keys(), vec!["u2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replaced_channel_settles_its_waiter() {
        let (client, mut server) = client(config());
        client.connect().await.unwrap();
        let mut peer = server.accept().await.unwrap();

        let first = client.channel("room", ChannelConfig::default()).unwrap();
        let waiter = {
            let first = first.clone();
            tokio::spawn(async move { first.subscribe_and_wait().await })
        };
        let join = next_frame(&mut peer).await;
        assert_eq!(join.event, "phx_join");

        let second = client.channel("room", ChannelConfig::default()).unwrap();
        client.disconnect().await;

        let outcome = time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter still pending")
            .unwrap();
        assert!(matches!(
            outcome,
            Err(RealtimeError::Channel(ChannelError::Unsubscribed(_)))
        ));
        assert_eq!(first.status(), ChannelStatus::Unsubscribed);
        assert_eq!(second.status(), ChannelStatus::Closed);
        assert_eq!(client.channels().len(), 1);
    }

    #[test]
    fn test_invalid_channel_name() {
        let (client, _server) = client(config());
        assert!(matches!(
            client.channel("", ChannelConfig::default()),
            Err(RealtimeError::Channel(ChannelError::InvalidName(_)))
        ));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let (transport, _server) = MemoryTransport::pair();
        let mut config = config();
        config.outbound_capacity = 0;
        assert!(matches!(
            RealtimeClient::with_transport(config, Arc::new(transport)),
            Err(RealtimeError::InvalidConfig(_))
        ));
    }
}
