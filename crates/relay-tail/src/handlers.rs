//! Channel wiring for relay-tail.
//!
//! Every configured channel gets callbacks that log what it receives.

use crate::config::{TailChannel, TailConfig};
use crate::metrics;
use anyhow::Result;
use relay_protocol::{BroadcastEvent, PostgresChange, PresenceDiff};
use std::sync::{Arc, Mutex};
use tenvis_relay_client::{RealtimeChannel, RealtimeClient, StaticToken};
use tenvis_relay_core::PresenceSet;
use tracing::{info, warn};

/// Connect, subscribe to every configured channel and log until Ctrl-C.
///
/// # Errors
///
/// Returns an error if the client cannot be created or a channel is invalid.
pub async fn run(config: TailConfig) -> Result<()> {
    let mut client = RealtimeClient::new(config.client.clone())?;
    if let Some(token) = &config.access_token {
        client = client.with_token_provider(Arc::new(StaticToken::new(token.clone())));
    }

    let channels = config
        .channels
        .iter()
        .map(|entry| attach(&client, entry))
        .collect::<Result<Vec<_>>>()?;

    let mut status = client.status_changes();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = *status.borrow_and_update();
            info!(status = ?current, "Connection status changed");
        }
    });

    client.connect().await?;
    for channel in &channels {
        if let Err(e) = channel.subscribe().await {
            warn!(topic = channel.topic(), error = %e, "Failed to subscribe");
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    client.remove_all_channels().await;
    client.disconnect().await;
    Ok(())
}

/// Create the channel for `entry` and register its logging callbacks.
///
/// # Errors
///
/// Returns an error if the channel name is invalid.
pub fn attach(client: &RealtimeClient, entry: &TailChannel) -> Result<RealtimeChannel> {
    let channel = client.channel(&entry.name, entry.config.clone())?;
    let topic: Arc<str> = Arc::from(channel.topic());

    for event in &entry.broadcast {
        let topic = Arc::clone(&topic);
        channel.on_broadcast(event.clone(), move |broadcast| {
            log_broadcast(&topic, broadcast);
        });
    }

    for filter in &entry.postgres {
        let topic = Arc::clone(&topic);
        channel.on_postgres_change(filter.clone(), move |change| {
            log_change(&topic, change);
        });
    }

    if entry.presence {
        let tracker = PresenceTracker::default();
        channel.on_presence(move |diff| {
            let present = tracker.apply(diff);
            metrics::record_event("presence");
            info!(
                topic = %topic,
                joins = diff.joins.len(),
                leaves = diff.leaves.len(),
                present,
                "Presence"
            );
        });
    }

    info!(
        topic = channel.topic(),
        broadcast = entry.broadcast.len(),
        postgres = entry.postgres.len(),
        presence = entry.presence,
        "Channel configured"
    );
    Ok(channel)
}

fn log_broadcast(topic: &str, broadcast: &BroadcastEvent) {
    metrics::record_event("broadcast");
    info!(
        topic,
        event = %broadcast.event,
        payload = ?broadcast.payload,
        "Broadcast"
    );
}

fn log_change(topic: &str, change: &PostgresChange) {
    metrics::record_event("postgres");
    info!(
        topic,
        event = %change.action.event(),
        schema = %change.schema,
        table = %change.table,
        record = ?change.action.record(),
        old_record = ?change.action.old_record(),
        "Postgres change"
    );
}

/// Current presence of one channel, folded from the diffs its callback
/// receives. Snapshots arrive as diffs against the previous view, so members
/// gone after a rejoin are dropped too.
#[derive(Default)]
struct PresenceTracker {
    set: Mutex<PresenceSet>,
}

impl PresenceTracker {
    /// Apply `diff` and return how many keys are present.
    fn apply(&self, diff: &PresenceDiff) -> usize {
        let mut set = match self.set.lock() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        };
        set.apply_diff(diff);
        set.count()
    }
}
