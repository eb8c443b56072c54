//! Record types stored by arbor and the write vocabulary shared by them.
//!
//! Every entity table carries the same bookkeeping columns so the store can
//! treat entities uniformly:
//!
//! - `id`: local identity, `INTEGER PRIMARY KEY AUTOINCREMENT`
//! - `cloud_id`: replication identity, unique, independent of `id`
//! - `parent_id`: nullable self-reference forming a forest
//! - `created_at_us` / `updated_at_us`: stamped by the store
//! - `deleted_at_us`: soft-delete marker

pub mod task;

use std::fmt;

use rusqlite::Row;
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

pub use task::Task;

/// Local identity of a stored record.
pub type RecordId = i64;

/// Columns every entity table must provide.
pub const BOOKKEEPING_COLUMNS: &[&str] = &[
    "id",
    "cloud_id",
    "parent_id",
    "created_at_us",
    "updated_at_us",
    "deleted_at_us",
];

/// Columns only the store may write.
pub const MANAGED_COLUMNS: &[&str] = &["id", "created_at_us", "updated_at_us"];

/// Name of an entity type; doubles as the change-bus topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKind(&'static str);

impl EntityKind {
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        self.0
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// A record type the store can persist, query, and project.
pub trait Entity: Clone + fmt::Debug + Send + Sync + 'static {
    /// Change-bus topic for this entity.
    const KIND: EntityKind;
    /// Backing table.
    const TABLE: &'static str;
    /// Selectable columns, in the order [`Entity::from_row`] reads them.
    /// Must include every entry of [`BOOKKEEPING_COLUMNS`].
    const COLUMNS: &'static [&'static str];

    /// Decode a row selected with [`Entity::COLUMNS`].
    ///
    /// # Errors
    ///
    /// Returns the underlying rusqlite error when a column is missing or has
    /// an unexpected type.
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;

    fn id(&self) -> RecordId;

    fn cloud_id(&self) -> &str;

    fn parent_id(&self) -> Option<RecordId>;

    /// Current value of `column`, used to evaluate scope predicates in
    /// memory. Returns `None` for columns the entity does not have.
    fn column(&self, column: &str) -> Option<Value>;
}

/// Value side of an [`Assignment`].
///
/// `Now` is resolved to the store clock when the write executes, which lets
/// immutable scopes carry "stamp the current time" defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Null,
    Integer(i64),
    Text(String),
    Now,
}

impl FieldValue {
    /// Concrete SQL value, with `Now` replaced by `now_us`.
    #[must_use]
    pub fn resolve(&self, now_us: i64) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::Integer(v) => Value::Integer(*v),
            Self::Text(s) => Value::Text(s.clone()),
            Self::Now => Value::Integer(now_us),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<Option<i64>> for FieldValue {
    fn from(value: Option<i64>) -> Self {
        value.map_or(Self::Null, Self::Integer)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// One `column = value` write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub column: String,
    pub value: FieldValue,
}

impl Assignment {
    #[must_use]
    pub fn new(column: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }

    #[must_use]
    pub fn null(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: FieldValue::Null,
        }
    }

    #[must_use]
    pub fn now(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: FieldValue::Now,
        }
    }
}

/// Merge two assignment lists; on a column conflict the entry from
/// `overrides` wins. Column order follows first appearance.
#[must_use]
pub fn merge_assignments(base: &[Assignment], overrides: &[Assignment]) -> Vec<Assignment> {
    let mut merged: Vec<Assignment> = Vec::with_capacity(base.len() + overrides.len());
    for assignment in base.iter().chain(overrides) {
        if let Some(existing) = merged.iter_mut().find(|a| a.column == assignment.column) {
            existing.value = assignment.value.clone();
        } else {
            merged.push(assignment.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_prefers_overrides_and_keeps_order() {
        let base = vec![
            Assignment::new("body", "a"),
            Assignment::now("completed_at_us"),
        ];
        let overrides = vec![
            Assignment::null("completed_at_us"),
            Assignment::new("parent_id", 7_i64),
        ];

        let merged = merge_assignments(&base, &overrides);
        assert_eq!(
            merged,
            vec![
                Assignment::new("body", "a"),
                Assignment::null("completed_at_us"),
                Assignment::new("parent_id", 7_i64),
            ]
        );
    }

    #[test]
    fn now_resolves_to_clock_value() {
        assert_eq!(FieldValue::Now.resolve(42), Value::Integer(42));
        assert_eq!(FieldValue::Null.resolve(42), Value::Null);
        assert_eq!(
            FieldValue::from("x").resolve(0),
            Value::Text("x".to_string())
        );
    }

    #[test]
    fn field_value_serializes_tagged() {
        let json = serde_json::to_string(&Assignment::now("deleted_at_us")).expect("serialize");
        assert_eq!(json, r#"{"column":"deleted_at_us","value":{"type":"now"}}"#);
        let back: Assignment = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, Assignment::now("deleted_at_us"));
    }
}
