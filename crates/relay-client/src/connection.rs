//! Connection manager.
//!
//! Owns the single socket shared by every channel. Per connection it runs two
//! tasks: a reader that routes inbound messages by topic, and a writer that
//! drains the outbound queue and sends heartbeats. When either notices the
//! connection is gone it triggers a reconnect for its epoch; the first trigger
//! per epoch tears down and starts a supervisor, later ones do nothing.

use crate::config::ClientConfig;
use crate::error::{RealtimeError, Result};
use crate::metrics;
use dashmap::DashMap;
use relay_protocol::{events, ChannelEvent, WireMessage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tenvis_relay_core::{Channel, ChannelStatus, ConnectionStatus};
use tenvis_relay_transport::{MessageSink, MessageStream, Transport, TransportError};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Tasks of one connection lifetime.
struct ConnectionTasks {
    epoch: u64,
    shutdown: watch::Sender<bool>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl ConnectionTasks {
    async fn join(self) {
        for (task, handle) in [("writer", self.writer), ("reader", self.reader)] {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(task, epoch = self.epoch, "Connection task panicked");
                }
            }
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    epoch: u64,
    tasks: Option<ConnectionTasks>,
    supervisor: Option<JoinHandle<()>>,
}

pub(crate) struct Shared {
    config: ClientConfig,
    url: String,
    transport: Arc<dyn Transport>,
    status: watch::Sender<ConnectionStatus>,
    channels: DashMap<String, Arc<Channel>>,
    next_ref: AtomicU64,
    heartbeat_ref: Mutex<Option<String>>,
    access_token: RwLock<Option<String>>,
    outbound: Mutex<Option<mpsc::Sender<WireMessage>>>,
    lifecycle: AsyncMutex<Lifecycle>,
}

/// Handle to the shared connection state.
#[derive(Clone)]
pub(crate) struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub(crate) fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let url = config.websocket_url();
        Self {
            shared: Arc::new(Shared {
                config,
                url,
                transport,
                status,
                channels: DashMap::new(),
                next_ref: AtomicU64::new(1),
                heartbeat_ref: Mutex::new(None),
                access_token: RwLock::new(None),
                outbound: Mutex::new(None),
                lifecycle: AsyncMutex::new(Lifecycle::default()),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<Shared> {
        Arc::downgrade(&self.shared)
    }

    pub(crate) fn upgrade(shared: &Weak<Shared>) -> Option<Self> {
        shared.upgrade().map(|shared| Self { shared })
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    pub(crate) fn status_changes(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    fn set_status(&self, status: ConnectionStatus) {
        let previous = self.shared.status.send_replace(status);
        if previous != status {
            debug!(from = %previous, to = %status, "Connection status changed");
        }
    }

    /// Next message ref. Refs are never reused within a client.
    pub(crate) fn make_ref(&self) -> String {
        self.shared.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }

    pub(crate) fn access_token(&self) -> Option<String> {
        self.shared
            .access_token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_access_token(&self, token: Option<String>) {
        *self
            .shared
            .access_token
            .write()
            .unwrap_or_else(PoisonError::into_inner) = token;
    }

    /// Register a channel for routing, replacing any channel on the same topic.
    ///
    /// A displaced channel is detached: it no longer receives frames, so its
    /// waiters and status observers settle instead of hanging.
    pub(crate) fn register(&self, channel: Arc<Channel>) {
        let topic = channel.topic().to_string();
        let previous = self.shared.channels.insert(topic.clone(), Arc::clone(&channel));
        if let Some(previous) = previous.filter(|previous| !Arc::ptr_eq(previous, &channel)) {
            debug!(topic = %topic, "Replaced channel routing");
            previous.detach();
        }
        metrics::set_active_channels(self.shared.channels.len());
    }

    pub(crate) fn channels(&self) -> Vec<Arc<Channel>> {
        self.shared
            .channels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    #[cfg(test)]
    pub(crate) async fn epoch(&self) -> u64 {
        self.shared.lifecycle.lock().await.epoch
    }

    // Lifecycle

    /// Connect on behalf of the application.
    ///
    /// A transport failure is not returned: it schedules a background retry.
    pub(crate) async fn connect(&self) -> Result<()> {
        let mut lifecycle = self.shared.lifecycle.lock().await;
        if lifecycle.tasks.is_some() {
            return Err(RealtimeError::AlreadyConnected);
        }
        if let Some(supervisor) = lifecycle.supervisor.take() {
            supervisor.abort();
        }

        let connected = match self.open(&mut lifecycle).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Connect failed, retrying in the background");
                self.schedule_reconnect(&mut lifecycle);
                false
            }
        };
        drop(lifecycle);

        if connected {
            self.rejoin_channels().await;
        }
        Ok(())
    }

    /// Connect unless connected or a retry is already scheduled.
    async fn ensure_connected(&self) {
        let mut lifecycle = self.shared.lifecycle.lock().await;
        if lifecycle.tasks.is_some() || lifecycle.supervisor.is_some() {
            return;
        }

        let connected = match self.open(&mut lifecycle).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Auto-connect failed, retrying in the background");
                self.schedule_reconnect(&mut lifecycle);
                false
            }
        };
        drop(lifecycle);

        if connected {
            self.rejoin_channels().await;
        }
    }

    /// Close the connection and stop reconnecting. Idempotent.
    pub(crate) async fn disconnect(&self) {
        let mut lifecycle = self.shared.lifecycle.lock().await;
        if let Some(supervisor) = lifecycle.supervisor.take() {
            supervisor.abort();
        }
        let tasks = self.teardown(&mut lifecycle, false);
        drop(lifecycle);

        if let Some(tasks) = tasks {
            tasks.join().await;
            info!("Disconnected");
        }
    }

    async fn open(&self, lifecycle: &mut Lifecycle) -> Result<(), TransportError> {
        self.set_status(ConnectionStatus::Connecting);
        debug!(transport = self.shared.transport.name(), "Connecting");

        let attempt = time::timeout(
            self.shared.config.connect_timeout(),
            self.shared.transport.connect(&self.shared.url),
        )
        .await;
        let session = match attempt {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                self.set_status(ConnectionStatus::Disconnected);
                return Err(e);
            }
            Err(_) => {
                self.set_status(ConnectionStatus::Disconnected);
                return Err(TransportError::Timeout);
            }
        };

        lifecycle.epoch += 1;
        let epoch = lifecycle.epoch;
        let conn = session.id;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.shared.config.outbound_capacity);
        *lock(&self.shared.heartbeat_ref) = None;
        *lock(&self.shared.outbound) = Some(outbound_tx);

        let writer = tokio::spawn(write_loop(
            self.downgrade(),
            epoch,
            session.sink,
            outbound_rx,
            shutdown_rx.clone(),
            self.shared.config.heartbeat_interval(),
        ));
        let reader = tokio::spawn(read_loop(
            self.downgrade(),
            epoch,
            session.stream,
            shutdown_rx,
        ));
        lifecycle.tasks = Some(ConnectionTasks {
            epoch,
            shutdown,
            writer,
            reader,
        });

        self.set_status(ConnectionStatus::Connected);
        metrics::record_connection();
        info!(conn = %conn, epoch, "Connected");
        Ok(())
    }

    /// Stop the current connection's tasks and update every channel.
    ///
    /// The returned tasks are already signalled; callers outside those tasks
    /// may await them.
    fn teardown(&self, lifecycle: &mut Lifecycle, reconnecting: bool) -> Option<ConnectionTasks> {
        let tasks = lifecycle.tasks.take();
        if let Some(tasks) = &tasks {
            tasks.shutdown.send_replace(true);
            metrics::record_disconnection();
            debug!(epoch = tasks.epoch, reconnecting, "Tearing down connection");
        }
        *lock(&self.shared.outbound) = None;
        *lock(&self.shared.heartbeat_ref) = None;

        for channel in self.channels() {
            channel.connection_lost(reconnecting);
        }
        self.set_status(ConnectionStatus::Disconnected);
        tasks
    }

    fn schedule_reconnect(&self, lifecycle: &mut Lifecycle) {
        if let Some(previous) = lifecycle.supervisor.take() {
            previous.abort();
        }
        metrics::record_reconnect();
        lifecycle.supervisor = Some(tokio::spawn(supervise(self.downgrade())));
    }

    /// Tear down and reconnect, once per connection epoch.
    pub(crate) async fn trigger_reconnect(&self, epoch: u64) {
        let mut lifecycle = self.shared.lifecycle.lock().await;
        let current = lifecycle.tasks.as_ref().map(|tasks| tasks.epoch);
        if current != Some(epoch) {
            trace!(epoch, ?current, "Reconnect already handled");
            return;
        }
        // Signalled, not awaited: the caller is usually one of these tasks.
        drop(self.teardown(&mut lifecycle, true));
        self.schedule_reconnect(&mut lifecycle);
    }

    /// Send a fresh join for every channel flagged for rejoin.
    async fn rejoin_channels(&self) {
        let pending: Vec<_> = self
            .channels()
            .into_iter()
            .filter(|channel| channel.needs_rejoin())
            .collect();

        for channel in pending {
            if let Err(e) = self.send_join(&channel).await {
                warn!(topic = %channel.topic(), error = %e, "Rejoin failed");
            }
        }
    }

    /// Rejoin a channel the server errored out while the socket stayed up.
    ///
    /// Waits one reconnect delay first. If the connection drops meanwhile,
    /// the rejoin after reconnecting takes over.
    fn schedule_rejoin(&self, channel: Arc<Channel>) {
        let delay = self.shared.config.reconnect.delay(1);
        debug!(topic = %channel.topic(), delay_ms = delay.as_millis() as u64, "Rejoin scheduled");
        let shared = self.downgrade();
        tokio::spawn(async move {
            time::sleep(delay).await;
            let Some(manager) = ConnectionManager::upgrade(&shared) else {
                return;
            };
            let registered = manager
                .shared
                .channels
                .get(channel.topic())
                .is_some_and(|entry| Arc::ptr_eq(entry.value(), &channel));
            if !registered || !channel.needs_rejoin() || !manager.is_connected() {
                return;
            }
            if let Err(e) = manager.send_join(&channel).await {
                warn!(topic = %channel.topic(), error = %e, "Rejoin failed");
            }
        });
    }

    // Frames

    /// Queue a frame for the writer.
    pub(crate) async fn send(&self, message: WireMessage) -> Result<()> {
        let outbound = lock(&self.shared.outbound).clone();
        let outbound = outbound.ok_or(RealtimeError::NotConnected)?;
        outbound
            .send(message)
            .await
            .map_err(|_| RealtimeError::NotConnected)
    }

    async fn send_join(&self, channel: &Channel) -> Result<()> {
        let token = self.access_token();
        let join = channel.begin_join(self.make_ref(), token.as_deref())?;
        debug!(topic = %channel.topic(), msg_ref = ?join.msg_ref, "Joining channel");

        if let Err(e) = self.send(join).await {
            // Lost the connection in between; join again once it is back.
            channel.connection_lost(true);
            return Err(e);
        }
        Ok(())
    }

    /// Join a channel, connecting first when allowed.
    pub(crate) async fn subscribe(&self, channel: &Arc<Channel>) -> Result<()> {
        if !self.is_connected() {
            if !self.shared.config.auto_connect {
                return Err(RealtimeError::NotConnected);
            }
            self.ensure_connected().await;
        }

        if !self.is_connected() {
            channel.request_join()?;
            return Ok(());
        }
        match self.send_join(channel).await {
            Err(RealtimeError::NotConnected) => Ok(()),
            other => other,
        }
    }

    /// Leave a channel.
    pub(crate) async fn unsubscribe(&self, channel: &Channel) -> Result<()> {
        let Some(leave) = channel.begin_leave(self.make_ref())? else {
            return Ok(());
        };
        debug!(topic = %channel.topic(), "Leaving channel");
        if let Err(e) = self.send(leave).await {
            debug!(topic = %channel.topic(), error = %e, "Leave not sent");
            channel.connection_lost(false);
        }
        Ok(())
    }

    /// Leave (if joined) and forget a channel.
    pub(crate) async fn remove_channel(&self, channel: &Arc<Channel>) {
        self.detach_channel(channel).await;
        self.disconnect_if_idle().await;
    }

    /// Remove every channel.
    pub(crate) async fn remove_all_channels(&self) {
        for channel in self.channels() {
            self.detach_channel(&channel).await;
        }
        self.disconnect_if_idle().await;
    }

    async fn detach_channel(&self, channel: &Arc<Channel>) {
        if channel.status().can_leave() {
            match channel.begin_leave(self.make_ref()) {
                Ok(Some(leave)) => {
                    if let Err(e) = self.send(leave).await {
                        debug!(topic = %channel.topic(), error = %e, "Leave not sent");
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(topic = %channel.topic(), error = %e, "Leave skipped"),
            }
        }

        self.shared
            .channels
            .remove_if(channel.topic(), |_, registered| Arc::ptr_eq(registered, channel));
        channel.detach();
        metrics::set_active_channels(self.shared.channels.len());
        info!(topic = %channel.topic(), "Removed channel");
    }

    async fn disconnect_if_idle(&self) {
        if self.shared.config.disconnect_on_no_subscriptions && self.shared.channels.is_empty() {
            debug!("No channels left");
            self.disconnect().await;
        }
    }

    /// Record a new token and push it to every subscribed channel.
    pub(crate) async fn update_auth(&self, token: Option<String>) {
        self.set_access_token(token.clone());
        let Some(token) = token else {
            debug!("Access token cleared");
            return;
        };

        for channel in self.channels() {
            if channel.status() != ChannelStatus::Subscribed {
                continue;
            }
            let frame = WireMessage::access_token(channel.topic(), token.as_str(), self.make_ref());
            if let Err(e) = self.send(frame).await {
                debug!(topic = %channel.topic(), error = %e, "Access token not sent");
            }
        }
    }

    fn next_heartbeat(&self) -> Option<WireMessage> {
        let mut pending = lock(&self.shared.heartbeat_ref);
        if pending.is_some() {
            return None;
        }
        let msg_ref = self.make_ref();
        *pending = Some(msg_ref.clone());
        Some(WireMessage::heartbeat(msg_ref))
    }

    fn route(&self, message: WireMessage) {
        metrics::record_message("inbound");
        trace!(topic = %message.topic, event = %message.event, msg_ref = ?message.msg_ref, "Received");

        if message.is_phoenix() && message.event == events::REPLY {
            let mut pending = lock(&self.shared.heartbeat_ref);
            if message.msg_ref.is_some() && *pending == message.msg_ref {
                *pending = None;
                trace!("Heartbeat acknowledged");
                return;
            }
        }

        let channel = self
            .shared
            .channels
            .get(&message.topic)
            .map(|entry| Arc::clone(entry.value()));
        let Some(channel) = channel else {
            debug!(topic = %message.topic, event = %message.event, "No channel for topic");
            metrics::record_dropped("unknown_topic");
            return;
        };

        match ChannelEvent::decode(&message) {
            Ok(event) => {
                channel.handle_event(&event, message.msg_ref.as_deref());
                if matches!(event, ChannelEvent::Error { .. }) && channel.needs_rejoin() {
                    self.schedule_rejoin(channel);
                }
            }
            Err(e) => {
                warn!(topic = %message.topic, event = %message.event, error = %e, "Dropping malformed payload");
                metrics::record_dropped("payload");
            }
        }
    }
}

async fn supervise(shared: Weak<Shared>) {
    let mut attempt = 0u32;
    loop {
        attempt = attempt.saturating_add(1);
        let Some(delay) = shared.upgrade().map(|s| s.config.reconnect.delay(attempt)) else {
            return;
        };
        debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting after delay");
        time::sleep(delay).await;

        let Some(manager) = ConnectionManager::upgrade(&shared) else {
            return;
        };
        let mut lifecycle = manager.shared.lifecycle.lock().await;
        if lifecycle.tasks.is_some() {
            lifecycle.supervisor = None;
            return;
        }
        match manager.open(&mut lifecycle).await {
            Ok(()) => {
                lifecycle.supervisor = None;
                drop(lifecycle);
                info!(attempt, "Reconnected");
                manager.rejoin_channels().await;
                return;
            }
            Err(e) => warn!(attempt, error = %e, "Reconnect failed"),
        }
    }
}

async fn write_loop(
    shared: Weak<Shared>,
    epoch: u64,
    mut sink: Box<dyn MessageSink>,
    mut outbound: mpsc::Receiver<WireMessage>,
    mut shutdown: watch::Receiver<bool>,
    period: Duration,
) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                // Flush what was queued before the shutdown, e.g. a final leave.
                while let Ok(message) = outbound.try_recv() {
                    if sink.send(&message).await.is_err() {
                        break;
                    }
                }
                break;
            }

            _ = ticker.tick() => {
                let Some(manager) = ConnectionManager::upgrade(&shared) else { break };
                let Some(heartbeat) = manager.next_heartbeat() else {
                    warn!(epoch, "Heartbeat timed out");
                    metrics::record_heartbeat_timeout();
                    manager.trigger_reconnect(epoch).await;
                    break;
                };
                trace!(epoch, msg_ref = ?heartbeat.msg_ref, "Sending heartbeat");
                if let Err(e) = sink.send(&heartbeat).await {
                    warn!(epoch, error = %e, "Heartbeat send failed");
                    manager.trigger_reconnect(epoch).await;
                    break;
                }
            }

            message = outbound.recv() => {
                let Some(message) = message else { break };
                match sink.send(&message).await {
                    Ok(()) => metrics::record_message("outbound"),
                    Err(e) if !e.is_fatal() => {
                        error!(topic = %message.topic, event = %message.event, error = %e, "Dropping unencodable frame");
                        metrics::record_dropped("encode");
                    }
                    Err(e) => {
                        error!(topic = %message.topic, event = %message.event, error = %e, "Send failed");
                        if let Some(manager) = ConnectionManager::upgrade(&shared) {
                            manager.trigger_reconnect(epoch).await;
                        }
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = sink.close().await {
        debug!(epoch, error = %e, "Close failed");
    }
    debug!(epoch, "Writer stopped");
}

async fn read_loop(
    shared: Weak<Shared>,
    epoch: u64,
    mut stream: Box<dyn MessageStream>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            received = stream.recv() => received,
        };
        let Some(manager) = ConnectionManager::upgrade(&shared) else { break };

        match received {
            Ok(Some(message)) => manager.route(message),
            Ok(None) => {
                info!(epoch, "Server closed the connection");
                manager.trigger_reconnect(epoch).await;
                break;
            }
            Err(e) if !e.is_fatal() => {
                warn!(epoch, error = %e, "Dropping undecodable frame");
                metrics::record_dropped("decode");
            }
            Err(e) => {
                warn!(epoch, error = %e, "Receive failed");
                manager.trigger_reconnect(epoch).await;
                break;
            }
        }
    }
    debug!(epoch, "Reader stopped");
}
