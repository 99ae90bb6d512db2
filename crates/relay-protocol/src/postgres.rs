//! Database change subscription types.
//!
//! A client asks for change notifications with a [`PostgresChangeFilter`] in its
//! join payload. The server answers with a list of [`PostgresJoinConfig`], each
//! carrying a server-assigned id, and tags every later [`PostgresChange`] with
//! the ids of the configs it matched.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::message::Payload;

/// Row event a change subscription listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PostgresEvent {
    #[serde(rename = "*")]
    All,
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "SELECT")]
    Select,
}

impl fmt::Display for PostgresEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PostgresEvent::All => "*",
            PostgresEvent::Insert => "INSERT",
            PostgresEvent::Update => "UPDATE",
            PostgresEvent::Delete => "DELETE",
            PostgresEvent::Select => "SELECT",
        };
        f.write_str(s)
    }
}

/// A client-requested change subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PostgresChangeFilter {
    /// Row event to listen for.
    pub event: PostgresEvent,
    /// Database schema.
    pub schema: String,
    /// Optional table restriction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Optional row filter, e.g. `id=eq.1`. Passed through to the server verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl PostgresChangeFilter {
    /// Listen for `event` on every table of `schema`.
    #[must_use]
    pub fn new(event: PostgresEvent, schema: impl Into<String>) -> Self {
        Self {
            event,
            schema: schema.into(),
            table: None,
            filter: None,
        }
    }

    /// Restrict to a table.
    #[must_use]
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Restrict to rows matching a filter expression.
    #[must_use]
    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }
}

/// A server-confirmed change subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostgresJoinConfig {
    /// Database schema.
    pub schema: String,
    /// Optional table restriction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    /// Optional row filter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Row event.
    pub event: PostgresEvent,
    /// Server-assigned id. Reassigned on every join.
    pub id: i64,
}

impl PostgresJoinConfig {
    /// Whether this confirmation is for the given client filter.
    ///
    /// Compares `schema`, `table`, `filter` and `event`; the id plays no part.
    #[must_use]
    pub fn matches(&self, filter: &PostgresChangeFilter) -> bool {
        self.schema == filter.schema
            && self.table == filter.table
            && self.filter == filter.filter
            && self.event == filter.event
    }
}

/// A column descriptor sent alongside change records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Database type name.
    #[serde(rename = "type")]
    pub column_type: String,
}

/// The row images of a change, by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PostgresAction {
    #[serde(rename = "INSERT")]
    Insert { record: Payload },
    #[serde(rename = "UPDATE")]
    Update { record: Payload, old_record: Payload },
    #[serde(rename = "DELETE")]
    Delete { old_record: Payload },
    #[serde(rename = "SELECT")]
    Select { record: Payload },
}

impl PostgresAction {
    /// The row event this action corresponds to.
    #[must_use]
    pub fn event(&self) -> PostgresEvent {
        match self {
            PostgresAction::Insert { .. } => PostgresEvent::Insert,
            PostgresAction::Update { .. } => PostgresEvent::Update,
            PostgresAction::Delete { .. } => PostgresEvent::Delete,
            PostgresAction::Select { .. } => PostgresEvent::Select,
        }
    }

    /// The new row image, absent for deletes.
    #[must_use]
    pub fn record(&self) -> Option<&Payload> {
        match self {
            PostgresAction::Insert { record }
            | PostgresAction::Update { record, .. }
            | PostgresAction::Select { record } => Some(record),
            PostgresAction::Delete { .. } => None,
        }
    }

    /// The previous row image, present for updates and deletes.
    #[must_use]
    pub fn old_record(&self) -> Option<&Payload> {
        match self {
            PostgresAction::Update { old_record, .. } | PostgresAction::Delete { old_record } => {
                Some(old_record)
            }
            _ => None,
        }
    }
}

/// A database change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostgresChange {
    /// Schema of the changed table.
    pub schema: String,
    /// Changed table.
    pub table: String,
    /// Commit timestamp as sent by the server.
    #[serde(default)]
    pub commit_timestamp: Option<String>,
    /// Column descriptors.
    #[serde(default)]
    pub columns: Vec<Column>,
    /// Row images.
    #[serde(flatten)]
    pub action: PostgresAction,
}

impl PostgresChange {
    /// Decode the new row image into a typed record.
    ///
    /// Returns `None` for deletes.
    ///
    /// # Errors
    ///
    /// Returns an error if the record does not match `T`.
    pub fn decode_record<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        self.action
            .record()
            .map(|r| serde_json::from_value(serde_json::Value::Object(r.clone())))
    }

    /// Decode the previous row image into a typed record.
    ///
    /// Returns `None` for inserts and selects.
    ///
    /// # Errors
    ///
    /// Returns an error if the record does not match `T`.
    pub fn decode_old_record<T: DeserializeOwned>(&self) -> Option<Result<T, serde_json::Error>> {
        self.action
            .old_record()
            .map(|r| serde_json::from_value(serde_json::Value::Object(r.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_serialization_skips_empty() {
        let filter = PostgresChangeFilter::new(PostgresEvent::All, "public");
        let value = serde_json::to_value(&filter).unwrap();
        assert_eq!(value, json!({"event": "*", "schema": "public"}));
    }

    #[test]
    fn test_join_config_matches_structurally() {
        let filter = PostgresChangeFilter::new(PostgresEvent::Insert, "public")
            .table("messages")
            .filter("room=eq.1");
        let config: PostgresJoinConfig = serde_json::from_value(json!({
            "schema": "public", "table": "messages", "filter": "room=eq.1",
            "event": "INSERT", "id": 42
        }))
        .unwrap();
        assert!(config.matches(&filter));
        assert!(!config.matches(&filter.clone().table("other")));
        assert!(!config.matches(&PostgresChangeFilter::new(PostgresEvent::All, "public")));
    }

    #[test]
    fn test_decode_update_change() {
        #[derive(Deserialize)]
        struct Row {
            id: i64,
            name: String,
        }

        let change: PostgresChange = serde_json::from_value(json!({
            "schema": "public",
            "table": "users",
            "commit_timestamp": "2024-01-01T00:00:00Z",
            "type": "UPDATE",
            "columns": [{"name": "id", "type": "int8"}],
            "record": {"id": 1, "name": "new"},
            "old_record": {"id": 1},
            "errors": null
        }))
        .unwrap();

        assert_eq!(change.action.event(), PostgresEvent::Update);
        let row: Row = change.decode_record().unwrap().unwrap();
        assert_eq!(row.id, 1);
        assert_eq!(row.name, "new");
        assert!(change.decode_old_record::<Row>().unwrap().is_err());
    }

    #[test]
    fn test_delete_has_no_record() {
        let change: PostgresChange = serde_json::from_value(json!({
            "schema": "public", "table": "users", "type": "DELETE",
            "old_record": {"id": 3}
        }))
        .unwrap();
        assert!(change.action.record().is_none());
        assert_eq!(change.action.old_record().unwrap()["id"], 3);
    }
}
