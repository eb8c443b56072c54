//! SQLite connection setup for the task store.
//!
//! Runtime pragmas:
//! - `journal_mode = WAL` so external readers do not block the writer
//! - `busy_timeout` from configuration (default 5s)
//! - `foreign_keys = ON` so `parent_id` stays referentially valid

pub mod migrations;
pub mod query;
pub mod schema;

use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;

use crate::error::StoreError;

/// Busy timeout used when configuration does not override it.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (or create) the store database, apply pragmas, and migrate.
///
/// # Errors
///
/// Returns [`StoreError::CreateDir`] or [`StoreError::Open`] when the file
/// cannot be opened, [`StoreError::Migration`] when the schema cannot be
/// brought up to date, and [`StoreError::SchemaTooNew`] for a store written
/// by a newer build.
pub fn open_store(path: &Path, busy_timeout: Duration) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| StoreError::CreateDir {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    let mut conn = Connection::open(path).map_err(|source| StoreError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    configure_connection(&conn, busy_timeout).map_err(|source| StoreError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    migrations::migrate(&mut conn)?;
    Ok(conn)
}

/// Private in-memory database with the full schema.
///
/// # Errors
///
/// Returns [`StoreError::Open`], [`StoreError::Migration`] or
/// [`StoreError::SchemaTooNew`].
pub fn open_in_memory() -> Result<Connection, StoreError> {
    let mut conn = Connection::open_in_memory().map_err(|source| StoreError::Open {
        path: ":memory:".into(),
        source,
    })?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(StoreError::Migration)?;
    migrations::migrate(&mut conn)?;
    Ok(conn)
}

fn configure_connection(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(busy_timeout)?;
    Ok(())
}
