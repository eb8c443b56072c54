//! SQL builders for scoped reads and closure queries.
//!
//! Column names come from [`Entity::COLUMNS`] or from scopes validated
//! against them, so they are spliced into SQL text; every value is bound.

use std::fmt::Write as _;

use rusqlite::types::Value;
use rusqlite::{Connection, params_from_iter};

use crate::model::{Entity, RecordId};
use crate::scope::{Direction, Order, Predicate};

/// Maximum number of bound ids per `IN (...)` list.
pub const MAX_IN_CHUNK: usize = 500;

// ---------------------------------------------------------------------------
// Select builder
// ---------------------------------------------------------------------------

/// A `SELECT` over one entity table.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    table: &'static str,
    columns: &'static [&'static str],
    predicate: Predicate,
    ordering: Vec<Order>,
    limit: Option<u32>,
}

impl Select {
    /// Unfiltered select of every column of `E`.
    #[must_use]
    pub fn of<E: Entity>() -> Self {
        Self {
            table: E::TABLE,
            columns: E::COLUMNS,
            predicate: Predicate::True,
            ordering: Vec::new(),
            limit: None,
        }
    }

    #[must_use]
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = self.predicate.and(predicate);
        self
    }

    #[must_use]
    pub fn order_by(mut self, order: Order) -> Self {
        if !self.ordering.iter().any(|o| o.column == order.column) {
            self.ordering.push(order);
        }
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Full-row query, ordered, with `id` as the final tie-breaker.
    #[must_use]
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        self.render(&self.columns.join(", "), true)
    }

    /// Same filter and order, selecting only `id`.
    #[must_use]
    pub fn to_id_sql(&self) -> (String, Vec<Value>) {
        self.render("id", true)
    }

    #[must_use]
    pub fn to_count_sql(&self) -> (String, Vec<Value>) {
        self.render("COUNT(*)", false)
    }

    fn render(&self, projection: &str, ordered: bool) -> (String, Vec<Value>) {
        let mut sql = format!("SELECT {projection} FROM {}", self.table);
        let mut params = Vec::new();

        if self.predicate != Predicate::True {
            sql.push_str(" WHERE ");
            self.predicate.render(&mut sql, &mut params);
        }

        if ordered {
            sql.push_str(" ORDER BY ");
            for order in &self.ordering {
                let dir = match order.direction {
                    Direction::Asc => "ASC",
                    Direction::Desc => "DESC",
                };
                let _ = write!(sql, "{} {dir}, ", order.column);
            }
            if self.ordering.iter().any(|o| o.column == "id") {
                sql.truncate(sql.len() - 2);
            } else {
                sql.push_str("id ASC");
            }
            if let Some(limit) = self.limit {
                let _ = write!(sql, " LIMIT {limit}");
            }
        }

        (sql, params)
    }

    /// Run the full-row query and decode each row.
    ///
    /// # Errors
    ///
    /// Returns the rusqlite error from preparing, stepping, or decoding.
    pub fn fetch<E: Entity>(&self, conn: &Connection) -> rusqlite::Result<Vec<E>> {
        let (sql, params) = self.to_sql();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), E::from_row)?;
        rows.collect()
    }

    /// Run the id-only query.
    ///
    /// # Errors
    ///
    /// Returns the rusqlite error from preparing or stepping.
    pub fn fetch_ids(&self, conn: &Connection) -> rusqlite::Result<Vec<RecordId>> {
        let (sql, params) = self.to_id_sql();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), |row| row.get(0))?;
        rows.collect()
    }

    /// # Errors
    ///
    /// Returns the rusqlite error from the count query.
    pub fn count(&self, conn: &Connection) -> rusqlite::Result<u64> {
        let (sql, params) = self.to_count_sql();
        conn.query_row(&sql, params_from_iter(params), |row| row.get(0))
    }
}

// ---------------------------------------------------------------------------
// Hierarchy
// ---------------------------------------------------------------------------

/// Ids of `roots` plus all their transitive descendants, in ascending order.
///
/// Roots that do not exist contribute nothing. `UNION` gives the recursion
/// set semantics, so a cyclic parent chain terminates.
///
/// # Errors
///
/// Returns the rusqlite error from the recursive query.
pub fn descendant_closure(
    conn: &Connection,
    table: &str,
    roots: &[RecordId],
) -> rusqlite::Result<Vec<RecordId>> {
    let mut closure = Vec::new();
    for chunk in roots.chunks(MAX_IN_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "WITH RECURSIVE closure(id) AS (
                SELECT id FROM {table} WHERE id IN ({placeholders})
                UNION
                SELECT t.id FROM {table} t JOIN closure c ON t.parent_id = c.id
            )
            SELECT id FROM closure"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk), |row| row.get(0))?;
        for id in rows {
            closure.push(id?);
        }
    }
    closure.sort_unstable();
    closure.dedup();
    Ok(closure)
}

/// Parent of `id`: `Ok(None)` when the row does not exist, `Ok(Some(None))`
/// for a root.
///
/// # Errors
///
/// Returns the rusqlite error from the lookup.
pub fn parent_of(
    conn: &Connection,
    table: &str,
    id: RecordId,
) -> rusqlite::Result<Option<Option<RecordId>>> {
    let sql = format!("SELECT parent_id FROM {table} WHERE id = ?1");
    let mut stmt = conn.prepare_cached(&sql)?;
    let mut rows = stmt.query([id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

/// Ids from `ids` that exist in `table`.
///
/// # Errors
///
/// Returns the rusqlite error from the lookup.
pub fn existing_ids(
    conn: &Connection,
    table: &str,
    ids: &[RecordId],
) -> rusqlite::Result<Vec<RecordId>> {
    let mut found = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(MAX_IN_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!("SELECT id FROM {table} WHERE id IN ({placeholders})");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk), |row| row.get(0))?;
        for id in rows {
            found.push(id?);
        }
    }
    Ok(found)
}
