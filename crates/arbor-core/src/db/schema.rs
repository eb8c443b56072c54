//! SQLite schema for the task store.
//!
//! - `tasks` holds one row per task, forming a forest through `parent_id`
//! - `cloud_id` is the replication identity and is unique on its own
//! - removing a parent hard-detaches its children (`ON DELETE SET NULL`)

/// Migration v1: the `tasks` table.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cloud_id TEXT NOT NULL UNIQUE CHECK (length(cloud_id) > 0),
    body TEXT NOT NULL DEFAULT '',
    parent_id INTEGER REFERENCES tasks(id) ON DELETE SET NULL,
    completed_at_us INTEGER,
    created_at_us INTEGER NOT NULL,
    updated_at_us INTEGER NOT NULL,
    deleted_at_us INTEGER,
    CHECK (parent_id IS NULL OR parent_id <> id)
);
";

/// Migration v2: indexes for the hot scope filters and closure joins.
pub const MIGRATION_V2_SQL: &str = r"
CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(deleted_at_us, completed_at_us);
CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created_at_us);
";

/// Indexes expected after all migrations have run.
pub const REQUIRED_INDEXES: &[&str] =
    &["idx_tasks_parent", "idx_tasks_status", "idx_tasks_created"];
