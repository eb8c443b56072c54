//! The relational store: typed, scoped CRUD over one SQLite connection.
//!
//! A [`Store`] is a cheap handle; clones share the connection, the change
//! bus, and the clock. Every operation takes the connection lock for its
//! whole duration, so callers never observe a half-applied write. Writes
//! publish on the bus after commit and before the lock is released, which
//! keeps event order identical to commit order.
//!
//! Every operation returns a typed [`Result`]. Callers that prefer to degrade
//! instead of failing use [`Store::lenient`].

mod lenient;

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::types::Value;
use rusqlite::{Connection, Transaction, params_from_iter};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::bus::{Change, ChangeBus, ChangeEvent, Origin, Subscription};
use crate::clock::{Clock, SystemClock};
use crate::db::{self, query};
use crate::error::StoreError;
use crate::model::{Assignment, Entity, FieldValue, MANAGED_COLUMNS, RecordId, merge_assignments};
use crate::scope::{Predicate, Scope};

pub use lenient::Lenient;

/// Store construction options.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub busy_timeout: Duration,
    pub clock: Arc<dyn Clock>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: db::DEFAULT_BUSY_TIMEOUT,
            clock: Arc::new(SystemClock),
        }
    }
}

impl StoreOptions {
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub const fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout;
        self
    }
}

/// A row removed by [`Store::purge_soft_deleted`].
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Purged {
    pub id: RecordId,
    pub cloud_id: String,
}

struct StoreInner {
    conn: Mutex<Connection>,
    bus: ChangeBus,
    clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
    origin: Origin,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("origin", &self.origin)
            .field("clock", &self.inner.clock)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open (or create) a store file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Open`], [`StoreError::CreateDir`], or
    /// [`StoreError::Migration`].
    pub fn open(path: &Path, options: StoreOptions) -> Result<Self, StoreError> {
        let conn = db::open_store(path, options.busy_timeout)?;
        info!(path = %path.display(), "opened task store");
        Ok(Self::from_connection(conn, options.clock))
    }

    /// Private in-memory store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Open`] or [`StoreError::Migration`].
    pub fn in_memory(options: StoreOptions) -> Result<Self, StoreError> {
        let conn = db::open_in_memory()?;
        Ok(Self::from_connection(conn, options.clock))
    }

    fn from_connection(conn: Connection, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                conn: Mutex::new(conn),
                bus: ChangeBus::new(),
                clock,
            }),
            origin: Origin::Local,
        }
    }

    #[must_use]
    pub fn bus(&self) -> &ChangeBus {
        &self.inner.bus
    }

    #[must_use]
    pub fn subscribe<E: Entity>(&self) -> Subscription {
        self.inner.bus.subscribe(E::KIND)
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    #[must_use]
    pub const fn origin(&self) -> Origin {
        self.origin
    }

    /// A handle on the same store whose writes are tagged with `origin`.
    #[must_use]
    pub fn with_origin(&self, origin: Origin) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            origin,
        }
    }

    /// View that logs failures and degrades to empty results.
    #[must_use]
    pub const fn lenient(&self) -> Lenient<'_> {
        Lenient::new(self)
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Insert a record through `scope`, whose defaults are applied first and
    /// overridden by `fields`. A `cloud_id` is generated unless supplied.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownColumn`]/[`StoreError::ReadOnlyColumn`]
    /// for bad assignments, [`StoreError::MissingParent`] when `parent_id`
    /// names a missing row, or a query error.
    pub async fn insert<E: Entity>(
        &self,
        fields: &[Assignment],
        scope: &Scope<E>,
    ) -> Result<E, StoreError> {
        scope.validate()?;
        validate_assignments::<E>(fields)?;

        let mut merged = merge_assignments(scope.default_fields(), fields);
        if !merged.iter().any(|a| a.column == "cloud_id") {
            merged.push(Assignment::new(
                "cloud_id",
                FieldValue::Text(uuid::Uuid::new_v4().to_string()),
            ));
        }

        self.write::<E, _, _>(|tx, now| {
            if let Some(parent) = assigned_parent(&merged) {
                require_parent::<E>(tx, parent)?;
            }

            let mut columns: Vec<&str> = merged.iter().map(|a| a.column.as_str()).collect();
            columns.extend(["created_at_us", "updated_at_us"]);
            let mut values: Vec<Value> = merged.iter().map(|a| a.value.resolve(now)).collect();
            values.extend([Value::Integer(now), Value::Integer(now)]);

            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({})",
                E::TABLE,
                columns.join(", "),
                vec!["?"; columns.len()].join(", ")
            );
            tx.execute(&sql, params_from_iter(values))?;
            let id = tx.last_insert_rowid();
            let record = fetch_one::<E>(tx, id)?;
            debug!(kind = %E::KIND, id, "inserted");
            Ok((record, vec![Change::Changed(id)]))
        })
        .await
    }

    /// Update `id` (and, when `recursive`, all its descendants) with
    /// `fields`, restricted to rows matching `scope`.
    ///
    /// Returns the ids actually written. A recursive update publishes one
    /// `ChangedMany` event for the whole closure.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if `id` does not exist,
    /// [`StoreError::MissingParent`] or [`StoreError::CycleDetected`] for an
    /// invalid `parent_id`, or a validation/query error. Nothing is written
    /// on error.
    pub async fn update<E: Entity>(
        &self,
        id: RecordId,
        fields: &[Assignment],
        recursive: bool,
        scope: &Scope<E>,
    ) -> Result<Vec<RecordId>, StoreError> {
        scope.validate()?;
        validate_assignments::<E>(fields)?;

        self.write::<E, _, _>(|tx, now| {
            if query::existing_ids(tx, E::TABLE, &[id])?.is_empty() {
                return Err(StoreError::NotFound { kind: E::KIND, id });
            }
            let targets = if recursive {
                query::descendant_closure(tx, E::TABLE, &[id])?
            } else {
                vec![id]
            };
            let written = update_rows::<E>(tx, &targets, fields, scope, now)?;
            let change = if recursive {
                Change::ChangedMany(written.clone())
            } else {
                Change::changed(written.clone())
            };
            Ok((written, vec![change]))
        })
        .await
    }

    /// Non-recursive batch update of `ids`; missing ids are skipped.
    ///
    /// # Errors
    ///
    /// Same as [`Store::update`], except missing ids are not an error.
    pub async fn update_ids<E: Entity>(
        &self,
        ids: &[RecordId],
        fields: &[Assignment],
        scope: &Scope<E>,
    ) -> Result<Vec<RecordId>, StoreError> {
        scope.validate()?;
        validate_assignments::<E>(fields)?;

        self.write::<E, _, _>(|tx, now| {
            let written = update_rows::<E>(tx, ids, fields, scope, now)?;
            Ok((written.clone(), vec![Change::changed(written)]))
        })
        .await
    }

    /// Hard-delete `ids`. Children of deleted rows that survive are detached
    /// and announced as changed.
    ///
    /// # Errors
    ///
    /// Returns a query error; nothing is deleted in that case.
    pub async fn delete<E: Entity>(&self, ids: &[RecordId]) -> Result<Vec<RecordId>, StoreError> {
        self.write::<E, _, _>(|tx, now| {
            let (deleted, detached) = delete_rows::<E>(tx, ids, now)?;
            let mut changes = Vec::new();
            if !deleted.is_empty() {
                changes.push(Change::deleted(deleted.clone()));
            }
            if !detached.is_empty() {
                changes.push(Change::changed(detached));
            }
            Ok((deleted, changes))
        })
        .await
    }

    /// Physically remove rows soft-deleted more than `older_than` ago.
    ///
    /// # Errors
    ///
    /// Returns a query error; nothing is purged in that case.
    pub async fn purge_soft_deleted<E: Entity>(
        &self,
        older_than: Duration,
    ) -> Result<Vec<Purged>, StoreError> {
        let window = i64::try_from(older_than.as_micros()).unwrap_or(i64::MAX);
        self.write::<E, _, _>(|tx, now| {
            let cutoff = now.saturating_sub(window);
            let sql = format!(
                "SELECT id, cloud_id FROM {} WHERE deleted_at_us IS NOT NULL AND deleted_at_us < ?1",
                E::TABLE
            );
            let mut stmt = tx.prepare(&sql)?;
            let purged = stmt
                .query_map([cutoff], |row| {
                    Ok(Purged {
                        id: row.get(0)?,
                        cloud_id: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            drop(stmt);

            let ids: Vec<RecordId> = purged.iter().map(|p| p.id).collect();
            let (deleted, detached) = delete_rows::<E>(tx, &ids, now)?;
            info!(kind = %E::KIND, purged = deleted.len(), "purged soft-deleted rows");
            let mut changes = Vec::new();
            if !deleted.is_empty() {
                changes.push(Change::deleted(deleted));
            }
            if !detached.is_empty() {
                changes.push(Change::changed(detached));
            }
            Ok((purged, changes))
        })
        .await
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Every row matching `scope`, in scope order.
    ///
    /// # Errors
    ///
    /// Returns a validation or query error.
    pub async fn fetch<E: Entity>(&self, scope: &Scope<E>) -> Result<Vec<E>, StoreError> {
        scope.validate()?;
        let conn = self.inner.conn.lock().await;
        Ok(scope.apply(query::Select::of::<E>()).fetch(&conn)?)
    }

    /// Rows among `ids` that match `scope`, in scope order.
    ///
    /// # Errors
    ///
    /// Returns a validation or query error.
    pub async fn fetch_ids<E: Entity>(
        &self,
        scope: &Scope<E>,
        ids: &[RecordId],
    ) -> Result<Vec<E>, StoreError> {
        scope.validate()?;
        let conn = self.inner.conn.lock().await;
        fetch_in::<E>(&conn, scope, ids)
    }

    /// `root` and all its descendants that match `scope`.
    ///
    /// # Errors
    ///
    /// Returns a validation or query error.
    pub async fn fetch_recursive<E: Entity>(
        &self,
        root: RecordId,
        scope: &Scope<E>,
    ) -> Result<Vec<E>, StoreError> {
        scope.validate()?;
        let conn = self.inner.conn.lock().await;
        let closure = query::descendant_closure(&conn, E::TABLE, &[root])?;
        fetch_in::<E>(&conn, scope, &closure)
    }

    /// Sorted ids of `roots` and all their descendants, regardless of scope.
    ///
    /// # Errors
    ///
    /// Returns a query error.
    pub async fn descendant_closure<E: Entity>(
        &self,
        roots: &[RecordId],
    ) -> Result<Vec<RecordId>, StoreError> {
        let conn = self.inner.conn.lock().await;
        Ok(query::descendant_closure(&conn, E::TABLE, roots)?)
    }

    /// Ancestor chain of `id`, immediate parent first. A cyclic chain is cut
    /// at the first repeat.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if `id` does not exist, or a query
    /// error.
    pub async fn ancestors<E: Entity>(&self, id: RecordId) -> Result<Vec<E>, StoreError> {
        let conn = self.inner.conn.lock().await;
        let mut parent = query::parent_of(&conn, E::TABLE, id)?
            .ok_or(StoreError::NotFound { kind: E::KIND, id })?;

        let mut visited = HashSet::from([id]);
        let mut chain = Vec::new();
        while let Some(parent_id) = parent {
            if !visited.insert(parent_id) {
                break;
            }
            let record = fetch_one::<E>(&conn, parent_id)?;
            parent = record.parent_id();
            chain.push(record);
        }
        Ok(chain)
    }

    /// `id` if it exists and matches `scope`.
    ///
    /// # Errors
    ///
    /// Returns a validation or query error.
    pub async fn pluck<E: Entity>(
        &self,
        id: RecordId,
        scope: &Scope<E>,
    ) -> Result<Option<E>, StoreError> {
        scope.validate()?;
        let conn = self.inner.conn.lock().await;
        let rows = scope
            .apply(query::Select::of::<E>())
            .filter(Predicate::eq("id", id))
            .fetch(&conn)?;
        Ok(rows.into_iter().next())
    }

    /// Look up a record by replication identity, ignoring scopes.
    ///
    /// # Errors
    ///
    /// Returns a query error.
    pub async fn pluck_by_cloud_id<E: Entity>(
        &self,
        cloud_id: &str,
    ) -> Result<Option<E>, StoreError> {
        let conn = self.inner.conn.lock().await;
        let rows = query::Select::of::<E>()
            .filter(Predicate::eq("cloud_id", cloud_id.to_string()))
            .fetch(&conn)?;
        Ok(rows.into_iter().next())
    }

    /// # Errors
    ///
    /// Returns a validation or query error.
    pub async fn count<E: Entity>(&self, scope: &Scope<E>) -> Result<u64, StoreError> {
        scope.validate()?;
        let conn = self.inner.conn.lock().await;
        Ok(scope.apply(query::Select::of::<E>()).count(&conn)?)
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    /// Run `op` in a transaction, commit, then publish its changes tagged
    /// with this handle's origin. Empty changes are not published.
    async fn write<E, T, F>(&self, op: F) -> Result<T, StoreError>
    where
        E: Entity,
        F: FnOnce(&Transaction<'_>, i64) -> Result<(T, Vec<Change>), StoreError>,
    {
        let mut conn = self.inner.conn.lock().await;
        let now = self.inner.clock.now_us();
        let tx = conn.transaction()?;
        let (value, changes) = op(&tx, now)?;
        tx.commit()?;

        for change in changes {
            if change.ids().is_empty() {
                continue;
            }
            self.inner.bus.publish(&ChangeEvent {
                kind: E::KIND,
                change,
                origin: self.origin,
            });
        }
        Ok(value)
    }
}

/// Reject assignments to unknown or store-managed columns.
///
/// # Errors
///
/// Returns [`StoreError::UnknownColumn`] or [`StoreError::ReadOnlyColumn`].
pub fn validate_assignments<E: Entity>(fields: &[Assignment]) -> Result<(), StoreError> {
    for assignment in fields {
        let column = assignment.column.as_str();
        if MANAGED_COLUMNS.contains(&column) {
            return Err(StoreError::ReadOnlyColumn(column.to_string()));
        }
        if !E::COLUMNS.contains(&column) {
            return Err(StoreError::UnknownColumn {
                table: E::TABLE,
                column: column.to_string(),
            });
        }
    }
    Ok(())
}

fn assigned_parent(fields: &[Assignment]) -> Option<RecordId> {
    fields
        .iter()
        .rev()
        .find(|a| a.column == "parent_id")
        .and_then(|a| match a.value {
            FieldValue::Integer(id) => Some(id),
            _ => None,
        })
}

fn require_parent<E: Entity>(conn: &Connection, parent: RecordId) -> Result<(), StoreError> {
    if query::existing_ids(conn, E::TABLE, &[parent])?.is_empty() {
        return Err(StoreError::MissingParent {
            kind: E::KIND,
            parent,
        });
    }
    Ok(())
}

fn fetch_one<E: Entity>(conn: &Connection, id: RecordId) -> Result<E, StoreError> {
    query::Select::of::<E>()
        .filter(Predicate::eq("id", id))
        .fetch::<E>(conn)?
        .into_iter()
        .next()
        .ok_or(StoreError::NotFound { kind: E::KIND, id })
}

/// Scope-filtered rows among `ids`, chunked and re-sorted into scope order.
fn fetch_in<E: Entity>(
    conn: &Connection,
    scope: &Scope<E>,
    ids: &[RecordId],
) -> Result<Vec<E>, StoreError> {
    let mut rows = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(query::MAX_IN_CHUNK) {
        rows.extend(
            scope
                .apply(query::Select::of::<E>())
                .filter(Predicate::id_in(chunk.iter().copied()))
                .fetch::<E>(conn)?,
        );
    }
    if ids.len() > query::MAX_IN_CHUNK {
        rows.sort_by(|a, b| scope.compare(a, b));
    }
    Ok(rows)
}

fn update_rows<E: Entity>(
    tx: &Transaction<'_>,
    targets: &[RecordId],
    fields: &[Assignment],
    scope: &Scope<E>,
    now: i64,
) -> Result<Vec<RecordId>, StoreError> {
    if let Some(parent) = assigned_parent(fields) {
        require_parent::<E>(tx, parent)?;
        let subtree = query::descendant_closure(tx, E::TABLE, targets)?;
        if subtree.binary_search(&parent).is_ok() {
            let id = targets.first().copied().unwrap_or(parent);
            return Err(StoreError::CycleDetected {
                kind: E::KIND,
                id,
                proposed_parent: parent,
            });
        }
    }

    let mut written = Vec::new();
    for chunk in targets.chunks(query::MAX_IN_CHUNK) {
        written.extend(
            scope
                .apply(query::Select::of::<E>())
                .filter(Predicate::id_in(chunk.iter().copied()))
                .fetch_ids(tx)?,
        );
    }
    written.sort_unstable();
    if written.is_empty() {
        return Ok(written);
    }

    let mut sets: Vec<String> = fields.iter().map(|a| format!("{} = ?", a.column)).collect();
    sets.push("updated_at_us = ?".to_string());
    let set_clause = sets.join(", ");

    for chunk in written.chunks(query::MAX_IN_CHUNK) {
        let sql = format!(
            "UPDATE {} SET {set_clause} WHERE id IN ({})",
            E::TABLE,
            vec!["?"; chunk.len()].join(", ")
        );
        let mut values: Vec<Value> = fields.iter().map(|a| a.value.resolve(now)).collect();
        values.push(Value::Integer(now));
        values.extend(chunk.iter().map(|id| Value::Integer(*id)));
        tx.execute(&sql, params_from_iter(values))?;
    }
    debug!(kind = %E::KIND, rows = written.len(), "updated");
    Ok(written)
}

/// Delete `ids`, first detaching surviving children. Returns
/// `(deleted, detached)`.
fn delete_rows<E: Entity>(
    tx: &Transaction<'_>,
    ids: &[RecordId],
    now: i64,
) -> Result<(Vec<RecordId>, Vec<RecordId>), StoreError> {
    let mut deleted = query::existing_ids(tx, E::TABLE, ids)?;
    deleted.sort_unstable();
    deleted.dedup();
    if deleted.is_empty() {
        return Ok((deleted, Vec::new()));
    }

    let doomed: HashSet<RecordId> = deleted.iter().copied().collect();
    let mut detached = Vec::new();
    for chunk in deleted.chunks(query::MAX_IN_CHUNK) {
        let sql = format!(
            "SELECT id FROM {} WHERE parent_id IN ({})",
            E::TABLE,
            vec!["?"; chunk.len()].join(", ")
        );
        let mut stmt = tx.prepare(&sql)?;
        let children = stmt.query_map(params_from_iter(chunk), |row| row.get::<_, RecordId>(0))?;
        for child in children {
            let child = child?;
            if !doomed.contains(&child) {
                detached.push(child);
            }
        }
    }
    detached.sort_unstable();

    for chunk in detached.chunks(query::MAX_IN_CHUNK) {
        let sql = format!(
            "UPDATE {} SET parent_id = NULL, updated_at_us = ? WHERE id IN ({})",
            E::TABLE,
            vec!["?"; chunk.len()].join(", ")
        );
        let values =
            std::iter::once(Value::Integer(now)).chain(chunk.iter().map(|id| Value::Integer(*id)));
        tx.execute(&sql, params_from_iter(values))?;
    }
    for chunk in deleted.chunks(query::MAX_IN_CHUNK) {
        let sql = format!(
            "DELETE FROM {} WHERE id IN ({})",
            E::TABLE,
            vec!["?"; chunk.len()].join(", ")
        );
        tx.execute(&sql, params_from_iter(chunk))?;
    }
    debug!(kind = %E::KIND, deleted = deleted.len(), detached = detached.len(), "deleted");
    Ok((deleted, detached))
}
