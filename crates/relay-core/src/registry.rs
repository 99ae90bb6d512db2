//! Per-channel callback registry.
//!
//! Holds the application callbacks registered on a channel together with the
//! list of postgres change subscriptions the server has confirmed for the
//! current join. Dispatch collects the matching callbacks first and invokes
//! them with no lock held, so callbacks may register or remove other
//! callbacks freely.

use dashmap::DashMap;
use relay_protocol::{
    BroadcastEvent, PostgresChange, PostgresChangeFilter, PostgresJoinConfig, PresenceDiff,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::trace;

/// Identifier returned on registration, used to remove a callback.
pub type CallbackId = u64;

/// Broadcast event name that matches every broadcast.
pub const ANY_EVENT: &str = "*";

/// Handler for database changes.
pub type PostgresCallback = Arc<dyn Fn(&PostgresChange) + Send + Sync + 'static>;

/// Handler for broadcasts.
pub type BroadcastCallback = Arc<dyn Fn(&BroadcastEvent) + Send + Sync + 'static>;

/// Handler for presence updates.
pub type PresenceCallback = Arc<dyn Fn(&PresenceDiff) + Send + Sync + 'static>;

/// A registered callback.
#[derive(Clone)]
pub enum CallbackEntry {
    Postgres {
        id: CallbackId,
        filter: PostgresChangeFilter,
        callback: PostgresCallback,
    },
    Broadcast {
        id: CallbackId,
        event: String,
        callback: BroadcastCallback,
    },
    Presence {
        id: CallbackId,
        callback: PresenceCallback,
    },
}

impl CallbackEntry {
    /// The entry's id.
    #[must_use]
    pub fn id(&self) -> CallbackId {
        match self {
            CallbackEntry::Postgres { id, .. }
            | CallbackEntry::Broadcast { id, .. }
            | CallbackEntry::Presence { id, .. } => *id,
        }
    }
}

impl std::fmt::Debug for CallbackEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallbackEntry::Postgres { id, filter, .. } => f
                .debug_struct("Postgres")
                .field("id", id)
                .field("filter", filter)
                .finish(),
            CallbackEntry::Broadcast { id, event, .. } => f
                .debug_struct("Broadcast")
                .field("id", id)
                .field("event", event)
                .finish(),
            CallbackEntry::Presence { id, .. } => {
                f.debug_struct("Presence").field("id", id).finish()
            }
        }
    }
}

/// Callbacks and server confirmations for one channel.
#[derive(Debug)]
pub struct CallbackRegistry {
    next_id: AtomicU64,
    callbacks: DashMap<CallbackId, CallbackEntry>,
    server_changes: RwLock<Arc<Vec<PostgresJoinConfig>>>,
}

impl CallbackRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            callbacks: DashMap::new(),
            server_changes: RwLock::new(Arc::new(Vec::new())),
        }
    }

    fn allocate_id(&self) -> CallbackId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a handler for broadcasts named `event` (`"*"` for all).
    pub fn add_broadcast_callback<F>(&self, event: impl Into<String>, callback: F) -> CallbackId
    where
        F: Fn(&BroadcastEvent) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.callbacks.insert(
            id,
            CallbackEntry::Broadcast {
                id,
                event: event.into(),
                callback: Arc::new(callback),
            },
        );
        id
    }

    /// Register a handler for database changes matching `filter`.
    ///
    /// The handler only fires once the server has confirmed the filter.
    pub fn add_postgres_callback<F>(&self, filter: PostgresChangeFilter, callback: F) -> CallbackId
    where
        F: Fn(&PostgresChange) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.callbacks.insert(
            id,
            CallbackEntry::Postgres {
                id,
                filter,
                callback: Arc::new(callback),
            },
        );
        id
    }

    /// Register a handler for presence updates.
    pub fn add_presence_callback<F>(&self, callback: F) -> CallbackId
    where
        F: Fn(&PresenceDiff) + Send + Sync + 'static,
    {
        let id = self.allocate_id();
        self.callbacks.insert(
            id,
            CallbackEntry::Presence {
                id,
                callback: Arc::new(callback),
            },
        );
        id
    }

    /// Remove a callback.
    ///
    /// Returns `true` if the callback was registered.
    pub fn remove_callback_by_id(&self, id: CallbackId) -> bool {
        self.callbacks.remove(&id).is_some()
    }

    /// Number of registered callbacks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Whether no callbacks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    /// Distinct postgres filters in registration order.
    #[must_use]
    pub fn postgres_filters(&self) -> Vec<PostgresChangeFilter> {
        let mut filters: Vec<(CallbackId, PostgresChangeFilter)> = self
            .callbacks
            .iter()
            .filter_map(|e| match e.value() {
                CallbackEntry::Postgres { id, filter, .. } => Some((*id, filter.clone())),
                _ => None,
            })
            .collect();
        filters.sort_by_key(|(id, _)| *id);

        let mut distinct: Vec<PostgresChangeFilter> = Vec::with_capacity(filters.len());
        for (_, filter) in filters {
            if !distinct.contains(&filter) {
                distinct.push(filter);
            }
        }
        distinct
    }

    /// Replace the server-confirmed subscriptions.
    pub fn set_server_changes(&self, changes: Vec<PostgresJoinConfig>) {
        let mut guard = self
            .server_changes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(changes);
    }

    /// Forget all server confirmations.
    pub fn clear_server_changes(&self) {
        self.set_server_changes(Vec::new());
    }

    /// The current server-confirmed subscriptions.
    #[must_use]
    pub fn server_changes(&self) -> Arc<Vec<PostgresJoinConfig>> {
        self.server_changes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Snapshot matching entries, ordered by registration.
    fn collect<T>(&self, mut select: impl FnMut(&CallbackEntry) -> Option<T>) -> Vec<T> {
        let mut matched: Vec<(CallbackId, T)> = self
            .callbacks
            .iter()
            .filter_map(|e| select(e.value()).map(|t| (*e.key(), t)))
            .collect();
        matched.sort_by_key(|(id, _)| *id);
        matched.into_iter().map(|(_, t)| t).collect()
    }

    /// Invoke broadcast callbacks registered for this event name.
    ///
    /// Returns the number of callbacks invoked.
    pub fn trigger_broadcast(&self, event: &BroadcastEvent) -> usize {
        let callbacks = self.collect(|entry| match entry {
            CallbackEntry::Broadcast {
                event: name,
                callback,
                ..
            } if name == &event.event || name == ANY_EVENT => Some(callback.clone()),
            _ => None,
        });

        trace!(event = %event.event, callbacks = callbacks.len(), "Dispatching broadcast");
        for callback in &callbacks {
            callback(event);
        }
        callbacks.len()
    }

    /// Invoke postgres callbacks whose filter was confirmed under one of `ids`.
    ///
    /// Returns the number of callbacks invoked.
    pub fn trigger_postgres_change(&self, ids: &[i64], change: &PostgresChange) -> usize {
        let server_changes = self.server_changes();
        let confirmed: Vec<&PostgresJoinConfig> = server_changes
            .iter()
            .filter(|c| ids.contains(&c.id))
            .collect();
        if confirmed.is_empty() {
            return 0;
        }

        let callbacks = self.collect(|entry| match entry {
            CallbackEntry::Postgres {
                filter, callback, ..
            } if confirmed.iter().any(|c| c.matches(filter)) => Some(callback.clone()),
            _ => None,
        });

        trace!(
            table = %change.table,
            callbacks = callbacks.len(),
            "Dispatching postgres change"
        );
        for callback in &callbacks {
            callback(change);
        }
        callbacks.len()
    }

    /// Invoke every presence callback with the raw diff.
    ///
    /// Returns the number of callbacks invoked.
    pub fn trigger_presence_diff(&self, diff: &PresenceDiff) -> usize {
        let callbacks = self.collect(|entry| match entry {
            CallbackEntry::Presence { callback, .. } => Some(callback.clone()),
            _ => None,
        });

        for callback in &callbacks {
            callback(diff);
        }
        callbacks.len()
    }
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::PostgresEvent;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn change() -> PostgresChange {
        serde_json::from_value(json!({
            "schema": "public", "table": "todos", "type": "INSERT", "record": {"id": 1}
        }))
        .unwrap()
    }

    fn confirmed(filter: &PostgresChangeFilter, id: i64) -> PostgresJoinConfig {
        PostgresJoinConfig {
            schema: filter.schema.clone(),
            table: filter.table.clone(),
            filter: filter.filter.clone(),
            event: filter.event,
            id,
        }
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&PostgresChange) + Send + Sync + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        (hits, move |_: &PostgresChange| {
            h.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_ids_are_never_reused() {
        let registry = CallbackRegistry::new();
        let a = registry.add_presence_callback(|_| {});
        assert!(registry.remove_callback_by_id(a));
        let b = registry.add_presence_callback(|_| {});
        assert!(b > a);
        assert!(!registry.remove_callback_by_id(a));
    }

    #[test]
    fn test_postgres_fires_only_for_confirmed_ids() {
        let registry = CallbackRegistry::new();
        let todos = PostgresChangeFilter::new(PostgresEvent::All, "public").table("todos");
        let users = PostgresChangeFilter::new(PostgresEvent::Insert, "public").table("users");
        let (todo_hits, todo_cb) = counter();
        let (user_hits, user_cb) = counter();
        registry.add_postgres_callback(todos.clone(), todo_cb);
        registry.add_postgres_callback(users.clone(), user_cb);

        // Nothing confirmed yet.
        assert_eq!(registry.trigger_postgres_change(&[1], &change()), 0);

        registry.set_server_changes(vec![confirmed(&todos, 1), confirmed(&users, 2)]);
        assert_eq!(registry.trigger_postgres_change(&[1], &change()), 1);
        assert_eq!(todo_hits.load(Ordering::SeqCst), 1);
        assert_eq!(user_hits.load(Ordering::SeqCst), 0);

        assert_eq!(registry.trigger_postgres_change(&[1, 2], &change()), 2);
        assert_eq!(registry.trigger_postgres_change(&[99], &change()), 0);
    }

    #[test]
    fn test_confirmation_replaces_not_merges() {
        let registry = CallbackRegistry::new();
        let todos = PostgresChangeFilter::new(PostgresEvent::All, "public").table("todos");
        let (hits, cb) = counter();
        registry.add_postgres_callback(todos.clone(), cb);

        registry.set_server_changes(vec![confirmed(&todos, 10)]);
        assert_eq!(registry.trigger_postgres_change(&[10], &change()), 1);

        registry.set_server_changes(vec![confirmed(&todos, 20)]);
        assert_eq!(registry.trigger_postgres_change(&[10], &change()), 0);
        assert_eq!(registry.trigger_postgres_change(&[20], &change()), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_removed_callback_never_fires() {
        let registry = CallbackRegistry::new();
        let todos = PostgresChangeFilter::new(PostgresEvent::All, "public").table("todos");
        registry.set_server_changes(vec![confirmed(&todos, 1)]);

        let mut live = Vec::new();
        for round in 0..20 {
            let (hits, cb) = counter();
            let id = registry.add_postgres_callback(todos.clone(), cb);
            live.push((id, hits));
            if round % 3 == 0 {
                let (id, _) = live.remove(0);
                registry.remove_callback_by_id(id);
            }
        }
        let removed: Vec<(CallbackId, Arc<AtomicUsize>)> = live.drain(..5).collect();
        for (id, _) in &removed {
            registry.remove_callback_by_id(*id);
        }

        let fired = registry.trigger_postgres_change(&[1], &change());
        assert_eq!(fired, live.len());
        for (_, hits) in &removed {
            assert_eq!(hits.load(Ordering::SeqCst), 0);
        }
        for (_, hits) in &live {
            assert_eq!(hits.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_broadcast_by_event_name() {
        let registry = CallbackRegistry::new();
        let got = Arc::new(std::sync::Mutex::new(Vec::new()));

        let g = got.clone();
        registry.add_broadcast_callback("msg", move |e: &BroadcastEvent| {
            g.lock().unwrap().push(e.payload.clone())
        });
        let other = Arc::new(AtomicUsize::new(0));
        let o = other.clone();
        registry.add_broadcast_callback("typing", move |_: &BroadcastEvent| {
            o.fetch_add(1, Ordering::SeqCst);
        });

        let event = BroadcastEvent {
            event: "msg".into(),
            payload: json!({"text": "hi"}),
        };
        assert_eq!(registry.trigger_broadcast(&event), 1);
        assert_eq!(*got.lock().unwrap(), vec![json!({"text": "hi"})]);
        assert_eq!(other.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wildcard_broadcast() {
        let registry = CallbackRegistry::new();
        registry.add_broadcast_callback(ANY_EVENT, |_| {});
        let event = BroadcastEvent {
            event: "anything".into(),
            payload: json!(null),
        };
        assert_eq!(registry.trigger_broadcast(&event), 1);
    }

    #[test]
    fn test_postgres_filters_are_distinct_and_ordered() {
        let registry = CallbackRegistry::new();
        let a = PostgresChangeFilter::new(PostgresEvent::Insert, "public").table("a");
        let b = PostgresChangeFilter::new(PostgresEvent::All, "public").table("b");
        registry.add_postgres_callback(a.clone(), |_| {});
        registry.add_postgres_callback(b.clone(), |_| {});
        registry.add_postgres_callback(a.clone(), |_| {});
        assert_eq!(registry.postgres_filters(), vec![a, b]);
    }

    #[test]
    fn test_callback_may_register_during_dispatch() {
        let registry = Arc::new(CallbackRegistry::new());
        let r = registry.clone();
        registry.add_presence_callback(move |_| {
            r.add_presence_callback(|_| {});
        });

        assert_eq!(registry.trigger_presence_diff(&PresenceDiff::default()), 1);
        assert_eq!(registry.len(), 2);
    }
}
