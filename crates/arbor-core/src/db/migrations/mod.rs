//! Numbered schema steps, recorded in `PRAGMA user_version`.
//!
//! A store written by a newer build is refused rather than opened with a
//! schema this build does not know.

use rusqlite::{Connection, types::Type};

use super::schema;
use crate::error::StoreError;

struct Step {
    version: u32,
    name: &'static str,
    sql: &'static str,
}

const STEPS: &[Step] = &[
    Step {
        version: 1,
        name: "tasks table",
        sql: schema::MIGRATION_V1_SQL,
    },
    Step {
        version: 2,
        name: "scope and closure indexes",
        sql: schema::MIGRATION_V2_SQL,
    },
];

pub const LATEST_SCHEMA_VERSION: u32 = 2;

/// # Errors
///
/// Fails if the pragma cannot be read or holds a value outside `u32`.
pub fn current_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let raw: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, Box::new(err)))
}

/// Bring `conn` up to [`LATEST_SCHEMA_VERSION`] and return the version it
/// ends at. Each step commits on its own, so a failure leaves the earlier
/// steps in place and the next open resumes from there.
///
/// # Errors
///
/// [`StoreError::SchemaTooNew`] for a store from a newer build, otherwise
/// [`StoreError::Migration`].
pub fn migrate(conn: &mut Connection) -> Result<u32, StoreError> {
    let found = current_schema_version(conn).map_err(StoreError::Migration)?;
    if found > LATEST_SCHEMA_VERSION {
        return Err(StoreError::SchemaTooNew {
            found,
            supported: LATEST_SCHEMA_VERSION,
        });
    }

    let pending = STEPS.iter().filter(|step| step.version > found);
    let mut reached = found;
    for step in pending {
        apply(conn, step).map_err(StoreError::Migration)?;
        tracing::debug!(version = step.version, step = step.name, "store schema upgraded");
        reached = step.version;
    }
    Ok(reached)
}

fn apply(conn: &mut Connection, step: &Step) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(step.sql)?;
    tx.pragma_update(None, "user_version", i64::from(step.version))?;
    tx.commit()
}
