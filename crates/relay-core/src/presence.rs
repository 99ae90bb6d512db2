//! Presence tracking for Relay channels.
//!
//! The server delivers presence as a full snapshot (`presence_state`) followed
//! by incremental diffs (`presence_diff`). [`PresenceSet`] folds both into a
//! map keyed by presence key for consumers that want the current view.

use relay_protocol::{Payload, PresenceDiff};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// One member of a channel's presence set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presence {
    /// Presence key, assigned by the server or chosen by the client on join.
    pub key: String,
    /// Metadata published by the member.
    pub payload: Value,
}

impl Presence {
    /// Create a presence entry.
    #[must_use]
    pub fn new(key: impl Into<String>, payload: Value) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }
}

/// Current presence view for a channel.
#[derive(Debug, Clone, Default)]
pub struct PresenceSet {
    members: BTreeMap<String, Presence>,
}

impl PresenceSet {
    /// Create an empty presence set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of present members.
    #[must_use]
    pub fn count(&self) -> usize {
        self.members.len()
    }

    /// Check if a key is present.
    #[must_use]
    pub fn is_present(&self, key: &str) -> bool {
        self.members.contains_key(key)
    }

    /// Get a member by key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Presence> {
        self.members.get(key)
    }

    /// Replace the whole view with a `presence_state` snapshot.
    ///
    /// Returns the equivalent diff: every snapshot key in `joins`, and every
    /// previous member missing from the snapshot in `leaves`. Folding that
    /// diff into a copy of the old view yields the new one.
    pub fn sync(&mut self, state: &Payload) -> PresenceDiff {
        let members: BTreeMap<String, Presence> = state
            .iter()
            .map(|(key, payload)| (key.clone(), Presence::new(key.clone(), payload.clone())))
            .collect();

        let leaves: Payload = self
            .members
            .iter()
            .filter(|(key, _)| !members.contains_key(*key))
            .map(|(key, presence)| (key.clone(), presence.payload.clone()))
            .collect();

        self.members = members;
        debug!(
            members = self.members.len(),
            left = leaves.len(),
            "Presence: synced state"
        );
        PresenceDiff {
            joins: state.clone(),
            leaves,
        }
    }

    /// Drop every member.
    pub fn clear(&mut self) {
        self.members.clear();
    }

    /// Fold a diff into the view: joins insert or replace, leaves remove.
    pub fn apply_diff(&mut self, diff: &PresenceDiff) {
        for (key, payload) in &diff.joins {
            self.members
                .insert(key.clone(), Presence::new(key.clone(), payload.clone()));
        }
        for key in diff.leaves.keys() {
            if self.members.remove(key).is_some() {
                debug!(key = %key, "Presence: member left");
            }
        }
    }

    /// Get all present keys, sorted.
    #[must_use]
    pub fn keys(&self) -> Vec<&str> {
        self.members.keys().map(String::as_str).collect()
    }

    /// Get all members as an owned snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Presence> {
        self.members.values().cloned().collect()
    }

    /// Check if presence is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn diff(value: Value) -> PresenceDiff {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_join_then_leave_is_empty() {
        let mut set = PresenceSet::new();
        set.apply_diff(&diff(json!({
            "joins": {"u1": {"metas": [{"phx_ref": "a", "name": "Alice"}]}},
            "leaves": {}
        })));
        assert!(set.is_present("u1"));
        assert_eq!(set.count(), 1);

        set.apply_diff(&diff(json!({
            "joins": {},
            "leaves": {"u1": {"metas": [{"phx_ref": "a"}]}}
        })));
        assert!(set.is_empty());
    }

    #[test]
    fn test_sync_replaces_members() {
        let mut set = PresenceSet::new();
        set.apply_diff(&diff(json!({"joins": {"old": {}}, "leaves": {}})));

        let state: Payload = serde_json::from_value(json!({
            "u1": {"metas": []},
            "u2": {"metas": []}
        }))
        .unwrap();
        let diff = set.sync(&state);

        assert_eq!(set.keys(), vec!["u1", "u2"]);
        assert!(!set.is_present("old"));
        assert_eq!(diff.joins.len(), 2);
        assert!(diff.leaves.contains_key("old"));
    }

    #[test]
    fn test_sync_diff_folds_to_snapshot() {
        let mut view = PresenceSet::new();
        let mut mirror = PresenceSet::new();

        let first: Payload = serde_json::from_value(json!({"u1": {}, "u2": {}})).unwrap();
        mirror.apply_diff(&view.sync(&first));
        assert_eq!(mirror.keys(), vec!["u1", "u2"]);

        let second: Payload = serde_json::from_value(json!({"u2": {}})).unwrap();
        mirror.apply_diff(&view.sync(&second));
        assert_eq!(mirror.keys(), vec!["u2"]);
        assert_eq!(view.keys(), mirror.keys());
    }

    #[test]
    fn test_leave_of_unknown_key_is_ignored() {
        let mut set = PresenceSet::new();
        set.apply_diff(&diff(json!({"leaves": {"ghost": {}}})));
        assert!(set.is_empty());
    }

    #[test]
    fn test_rejoin_replaces_payload() {
        let mut set = PresenceSet::new();
        set.apply_diff(&diff(json!({"joins": {"u1": {"status": "away"}}})));
        set.apply_diff(&diff(json!({"joins": {"u1": {"status": "online"}}})));
        assert_eq!(set.get("u1").unwrap().payload["status"], "online");
        assert_eq!(set.snapshot().len(), 1);
    }
}
