//! Live query monitors.
//!
//! A [`QueryMonitor`] watches the change bus for one entity kind and keeps
//! any number of [`Projection`]s in step with a scope. Each change event is
//! turned into a [`Delta`] by [`compute_delta`] with at most two queries, so
//! projections never rescan the table.
//!
//! Recursive monitoring expands every event to the descendant closure of the
//! touched ids before filtering: a change on a parent can move descendants
//! in or out of the scope without touching their rows.
//!
//! Projections must tolerate either delivery order: removing an absent id is
//! a no-op, and upserting a present id replaces it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::bus::Change;
use crate::error::StoreError;
use crate::model::{Entity, RecordId};
use crate::scope::Scope;
use crate::store::Store;

/// Something that mirrors a scoped list of records.
pub trait Projection<E: Entity>: Send + Sync {
    /// Add or replace each record by id.
    fn upsert(&self, records: Vec<E>);

    /// Drop these ids; unknown ids are ignored.
    fn remove(&self, ids: &[RecordId]);
}

/// Net effect of one change event on a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta<E> {
    pub upserts: Vec<E>,
    pub removals: Vec<RecordId>,
}

impl<E> Default for Delta<E> {
    fn default() -> Self {
        Self {
            upserts: Vec::new(),
            removals: Vec::new(),
        }
    }
}

impl<E: Entity> Delta<E> {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removals.is_empty()
    }

    pub fn apply_to(&self, projection: &dyn Projection<E>) {
        if !self.upserts.is_empty() {
            projection.upsert(self.upserts.clone());
        }
        if !self.removals.is_empty() {
            projection.remove(&self.removals);
        }
    }
}

/// Work out which rows a change adds, updates, or removes for `scope`.
///
/// # Errors
///
/// Returns the store error from the underlying query.
pub async fn compute_delta<E: Entity>(
    store: &Store,
    scope: &Scope<E>,
    recursive: bool,
    change: &Change,
) -> Result<Delta<E>, StoreError> {
    if change.is_deletion() {
        return Ok(Delta {
            upserts: Vec::new(),
            removals: change.ids().to_vec(),
        });
    }

    let touched = if recursive {
        let mut closure = store.descendant_closure::<E>(change.ids()).await?;
        closure.extend_from_slice(change.ids());
        closure.sort_unstable();
        closure.dedup();
        closure
    } else if let Change::Changed(id) = change {
        return Ok(match store.pluck(*id, scope).await? {
            Some(record) => Delta {
                upserts: vec![record],
                removals: Vec::new(),
            },
            None => Delta {
                upserts: Vec::new(),
                removals: vec![*id],
            },
        });
    } else {
        change.ids().to_vec()
    };

    let upserts = store.fetch_ids(scope, &touched).await?;
    let present: HashSet<RecordId> = upserts.iter().map(Entity::id).collect();
    let removals = touched
        .into_iter()
        .filter(|id| !present.contains(id))
        .collect();
    Ok(Delta { upserts, removals })
}

type Projections<E> = Arc<RwLock<Vec<Arc<dyn Projection<E>>>>>;

/// Ids currently delivered to projections, across restarts.
type Projected = Arc<Mutex<HashSet<RecordId>>>;

struct Running<E> {
    scope: Scope<E>,
    recursive: bool,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Keeps registered projections synchronised with one scope.
pub struct QueryMonitor<E: Entity> {
    store: Store,
    projections: Projections<E>,
    projected: Projected,
    running: Option<Running<E>>,
}

impl<E: Entity> QueryMonitor<E> {
    #[must_use]
    pub fn new(store: Store) -> Self {
        Self {
            store,
            projections: Arc::new(RwLock::new(Vec::new())),
            projected: Arc::new(Mutex::new(HashSet::new())),
            running: None,
        }
    }

    #[must_use]
    pub const fn is_monitoring(&self) -> bool {
        self.running.is_some()
    }

    #[must_use]
    pub fn scope(&self) -> Option<&Scope<E>> {
        self.running.as_ref().map(|r| &r.scope)
    }

    /// Start (or restart) watching `scope`. Registered projections are
    /// seeded with its current contents; rows left over from a previous
    /// scope that are not in the new one are removed.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns the store error from the seeding query; monitoring is not
    /// started in that case.
    pub async fn begin_monitoring(
        &mut self,
        scope: Scope<E>,
        recursive: bool,
    ) -> Result<(), StoreError> {
        self.stop_monitoring().await;

        // Subscribe before seeding so no write between the two is missed.
        let mut subscription = self.store.subscribe::<E>();
        let seed = self.store.fetch(&scope).await?;
        let stale: Vec<RecordId> = {
            let mut projected = self.projected.lock().unwrap_or_else(PoisonError::into_inner);
            let fresh: HashSet<RecordId> = seed.iter().map(Entity::id).collect();
            let mut stale: Vec<RecordId> = projected.difference(&fresh).copied().collect();
            stale.sort_unstable();
            *projected = fresh;
            stale
        };
        let seed_delta = Delta {
            upserts: seed,
            removals: stale,
        };
        for projection in self.snapshot() {
            seed_delta.apply_to(projection.as_ref());
        }

        let (stop, mut stop_rx) = oneshot::channel();
        let store = self.store.clone();
        let projections = Arc::clone(&self.projections);
        let projected = Arc::clone(&self.projected);
        let loop_scope = scope.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    event = subscription.recv() => {
                        let Some(event) = event else { break };
                        match compute_delta(&store, &loop_scope, recursive, &event.change).await {
                            Ok(delta) if delta.is_empty() => {}
                            Ok(delta) => {
                                debug!(
                                    scope = loop_scope.name(),
                                    upserts = delta.upserts.len(),
                                    removals = delta.removals.len(),
                                    "delivering delta"
                                );
                                track(&projected, &delta);
                                let targets = projections
                                    .read()
                                    .unwrap_or_else(PoisonError::into_inner)
                                    .clone();
                                for projection in targets {
                                    delta.apply_to(projection.as_ref());
                                }
                            }
                            Err(err) => warn!(
                                scope = loop_scope.name(),
                                code = %err.code(),
                                error = %err,
                                "monitor query failed; skipping event"
                            ),
                        }
                    }
                }
            }
            drop(subscription);
            debug!(scope = loop_scope.name(), "monitor loop stopped");
        });

        self.running = Some(Running {
            scope,
            recursive,
            stop,
            handle,
        });
        Ok(())
    }

    /// Register `projection`; if monitoring, seed it with the current scope
    /// contents.
    ///
    /// # Errors
    ///
    /// Returns the store error from the seeding query. The projection stays
    /// registered.
    pub async fn keep_synchronised(
        &self,
        projection: Arc<dyn Projection<E>>,
    ) -> Result<(), StoreError> {
        self.projections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&projection));
        if let Some(running) = &self.running {
            let seed = self.store.fetch(&running.scope).await?;
            self.projected
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend(seed.iter().map(Entity::id));
            projection.upsert(seed);
        }
        Ok(())
    }

    /// Stop delivering to `projection`. Returns whether it was registered.
    pub fn deregister(&self, projection: &Arc<dyn Projection<E>>) -> bool {
        let target = Arc::as_ptr(projection).cast::<()>();
        let mut projections = self
            .projections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = projections.len();
        projections.retain(|p| Arc::as_ptr(p).cast::<()>() != target);
        projections.len() != before
    }

    /// Stop the loop and wait for it to finish; its subscription is gone by
    /// the time this returns.
    pub async fn stop_monitoring(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.stop.send(());
            if let Err(err) = running.handle.await {
                warn!(error = %err, recursive = running.recursive, "monitor loop ended abnormally");
            }
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn Projection<E>>> {
        self.projections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn track<E: Entity>(projected: &Mutex<HashSet<RecordId>>, delta: &Delta<E>) {
    let mut projected = projected.lock().unwrap_or_else(PoisonError::into_inner);
    for id in &delta.removals {
        projected.remove(id);
    }
    projected.extend(delta.upserts.iter().map(Entity::id));
}

// ---------------------------------------------------------------------------
// ListProjection
// ---------------------------------------------------------------------------

/// A sorted in-memory list kept in scope order.
pub struct ListProjection<E> {
    scope: Scope<E>,
    rows: Mutex<Vec<E>>,
    version: watch::Sender<u64>,
}

impl<E: Entity> ListProjection<E> {
    #[must_use]
    pub fn new(scope: Scope<E>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            scope,
            rows: Mutex::new(Vec::new()),
            version,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<E> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<RecordId> {
        self.rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(Entity::id)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bumped after every upsert or remove.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

impl<E: Entity> Projection<E> for ListProjection<E> {
    fn upsert(&self, records: Vec<E>) {
        {
            let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
            for record in records {
                rows.retain(|r| r.id() != record.id());
                let at = rows.partition_point(|r| self.scope.compare(r, &record).is_lt());
                rows.insert(at, record);
            }
        }
        self.version.send_modify(|v| *v += 1);
    }

    fn remove(&self, ids: &[RecordId]) {
        {
            let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
            rows.retain(|r| !ids.contains(&r.id()));
        }
        self.version.send_modify(|v| *v += 1);
    }
}
