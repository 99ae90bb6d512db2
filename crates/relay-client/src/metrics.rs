//! Client metrics.
//!
//! Recorded through the `metrics` facade; nothing is exported unless the
//! application installs a recorder.

use metrics::{counter, gauge};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "relay_connections_total";
    pub const CONNECTED: &str = "relay_connected";
    pub const RECONNECTS_TOTAL: &str = "relay_reconnects_total";
    pub const HEARTBEAT_TIMEOUTS_TOTAL: &str = "relay_heartbeat_timeouts_total";
    pub const MESSAGES_TOTAL: &str = "relay_messages_total";
    pub const DROPPED_TOTAL: &str = "relay_messages_dropped_total";
    pub const CHANNELS_ACTIVE: &str = "relay_channels_active";
}

/// Describe every client metric to the installed recorder.
pub fn describe() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of successful connections"
    );
    metrics::describe_gauge!(names::CONNECTED, "1 while the socket is connected");
    metrics::describe_counter!(names::RECONNECTS_TOTAL, "Total number of scheduled reconnects");
    metrics::describe_counter!(
        names::HEARTBEAT_TIMEOUTS_TOTAL,
        "Heartbeats that went unanswered for a full interval"
    );
    metrics::describe_counter!(names::MESSAGES_TOTAL, "Total number of messages by direction");
    metrics::describe_counter!(
        names::DROPPED_TOTAL,
        "Inbound or outbound messages dropped, by reason"
    );
    metrics::describe_gauge!(names::CHANNELS_ACTIVE, "Current number of registered channels");
}

pub(crate) fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTED).set(1.0);
}

pub(crate) fn record_disconnection() {
    gauge!(names::CONNECTED).set(0.0);
}

pub(crate) fn record_reconnect() {
    counter!(names::RECONNECTS_TOTAL).increment(1);
}

pub(crate) fn record_heartbeat_timeout() {
    counter!(names::HEARTBEAT_TIMEOUTS_TOTAL).increment(1);
}

pub(crate) fn record_message(direction: &'static str) {
    counter!(names::MESSAGES_TOTAL, "direction" => direction).increment(1);
}

pub(crate) fn record_dropped(reason: &'static str) {
    counter!(names::DROPPED_TOTAL, "reason" => reason).increment(1);
}

pub(crate) fn set_active_channels(count: usize) {
    gauge!(names::CHANNELS_ACTIVE).set(count as f64);
}
