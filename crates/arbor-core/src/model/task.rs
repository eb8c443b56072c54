//! The task entity.

use rusqlite::Row;
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};

use super::{Assignment, Entity, EntityKind, RecordId};

/// A task row from the `tasks` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: RecordId,
    pub cloud_id: String,
    pub body: String,
    pub parent_id: Option<RecordId>,
    pub completed_at_us: Option<i64>,
    pub created_at_us: i64,
    pub updated_at_us: i64,
    pub deleted_at_us: Option<i64>,
}

impl Task {
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        self.completed_at_us.is_some()
    }

    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        self.deleted_at_us.is_some()
    }
}

impl Entity for Task {
    const KIND: EntityKind = EntityKind::new("task");
    const TABLE: &'static str = "tasks";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "cloud_id",
        "body",
        "parent_id",
        "completed_at_us",
        "created_at_us",
        "updated_at_us",
        "deleted_at_us",
    ];

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get("id")?,
            cloud_id: row.get("cloud_id")?,
            body: row.get("body")?,
            parent_id: row.get("parent_id")?,
            completed_at_us: row.get("completed_at_us")?,
            created_at_us: row.get("created_at_us")?,
            updated_at_us: row.get("updated_at_us")?,
            deleted_at_us: row.get("deleted_at_us")?,
        })
    }

    fn id(&self) -> RecordId {
        self.id
    }

    fn cloud_id(&self) -> &str {
        &self.cloud_id
    }

    fn parent_id(&self) -> Option<RecordId> {
        self.parent_id
    }

    fn column(&self, column: &str) -> Option<Value> {
        fn opt(v: Option<i64>) -> Value {
            v.map_or(Value::Null, Value::Integer)
        }

        Some(match column {
            "id" => Value::Integer(self.id),
            "cloud_id" => Value::Text(self.cloud_id.clone()),
            "body" => Value::Text(self.body.clone()),
            "parent_id" => opt(self.parent_id),
            "completed_at_us" => opt(self.completed_at_us),
            "created_at_us" => Value::Integer(self.created_at_us),
            "updated_at_us" => Value::Integer(self.updated_at_us),
            "deleted_at_us" => opt(self.deleted_at_us),
            _ => return None,
        })
    }
}

/// Field setters for task writes.
pub mod field {
    use super::{Assignment, RecordId};
    use crate::model::FieldValue;

    #[must_use]
    pub fn body(text: impl Into<String>) -> Assignment {
        Assignment::new("body", FieldValue::Text(text.into()))
    }

    #[must_use]
    pub fn parent(parent: Option<RecordId>) -> Assignment {
        Assignment::new("parent_id", parent)
    }

    #[must_use]
    pub fn cloud_id(id: impl Into<String>) -> Assignment {
        Assignment::new("cloud_id", FieldValue::Text(id.into()))
    }

    #[must_use]
    pub fn completed_at(at_us: Option<i64>) -> Assignment {
        Assignment::new("completed_at_us", at_us)
    }

    #[must_use]
    pub fn completed_now() -> Assignment {
        Assignment::now("completed_at_us")
    }

    #[must_use]
    pub fn uncompleted() -> Assignment {
        Assignment::null("completed_at_us")
    }

    #[must_use]
    pub fn deleted_at(at_us: Option<i64>) -> Assignment {
        Assignment::new("deleted_at_us", at_us)
    }

    #[must_use]
    pub fn deleted_now() -> Assignment {
        Assignment::now("deleted_at_us")
    }

    #[must_use]
    pub fn restored() -> Assignment {
        Assignment::null("deleted_at_us")
    }
}
