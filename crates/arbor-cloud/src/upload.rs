//! Pushing local changes to the remote database.

use std::collections::{BTreeSet, HashMap};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arbor_core::bus::Origin;
use arbor_core::{RecordId, Scope, Store, Task};
use futures::StreamExt as _;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{RemoteError, ReplicationError};
use crate::lock::RecordLocks;
use crate::mapping::CloudMirror;
use crate::remote::{RemoteDatabase, RemoteRecord};
use crate::replicator::ReplicatorConfig;

/// Outcome of one upload or flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Records written remotely, new or existing.
    pub saved: usize,
    /// Of `saved`, records that did not exist remotely.
    pub created: usize,
    pub deleted: usize,
    /// Ids queued because the account is unavailable.
    pub deferred: usize,
}

impl UploadReport {
    fn absorb(&mut self, other: Self) {
        self.saved += other.saved;
        self.created += other.created;
        self.deleted += other.deleted;
        self.deferred += other.deferred;
    }
}

// ---------------------------------------------------------------------------
// Account gate
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct GateState {
    paused: bool,
    uploads: BTreeSet<RecordId>,
    deletes: BTreeSet<String>,
}

/// Stops remote traffic after the account becomes unavailable and queues
/// the work until it is back.
#[derive(Debug, Default)]
pub struct AccountGate {
    state: Mutex<GateState>,
}

impl AccountGate {
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Ids waiting for the account or parked after repeated failures,
    /// sorted. The next [`UploadEngine::notify_account_available`] sends
    /// them.
    #[must_use]
    pub fn pending_uploads(&self) -> Vec<RecordId> {
        self.lock().uploads.iter().copied().collect()
    }

    #[must_use]
    pub fn pending_deletes(&self) -> Vec<String> {
        self.lock().deletes.iter().cloned().collect()
    }

    fn pause(&self) {
        self.lock().paused = true;
    }

    fn defer_uploads(&self, ids: &[RecordId]) {
        self.lock().uploads.extend(ids.iter().copied());
    }

    fn defer_deletes(&self, cloud_ids: &[String]) {
        self.lock().deletes.extend(cloud_ids.iter().cloned());
    }

    /// Reopen the gate and hand back everything queued.
    fn resume(&self) -> (Vec<RecordId>, Vec<String>) {
        let mut state = self.lock();
        state.paused = false;
        let uploads = std::mem::take(&mut state.uploads).into_iter().collect();
        let deletes = std::mem::take(&mut state.deletes).into_iter().collect();
        (uploads, deletes)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Find-or-create and overwrite remote records for local ones.
///
/// Overwrite is unconditional (last writer wins); fields are never merged.
pub struct UploadEngine<E: CloudMirror = Task> {
    store: Store,
    remote: Arc<dyn RemoteDatabase>,
    locks: RecordLocks,
    config: ReplicatorConfig,
    gate: AccountGate,
    _entity: PhantomData<fn() -> E>,
}

impl<E: CloudMirror> std::fmt::Debug for UploadEngine<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadEngine")
            .field("record_type", &E::RECORD_TYPE)
            .field("config", &self.config)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

impl<E: CloudMirror> UploadEngine<E> {
    #[must_use]
    pub fn new(
        store: &Store,
        remote: Arc<dyn RemoteDatabase>,
        locks: RecordLocks,
        config: ReplicatorConfig,
    ) -> Self {
        Self {
            store: store.clone(),
            remote,
            locks,
            config,
            gate: AccountGate::default(),
            _entity: PhantomData,
        }
    }

    #[must_use]
    pub const fn gate(&self) -> &AccountGate {
        &self.gate
    }

    /// Upload `ids` in one fetch round trip and one save batch. Ids that no
    /// longer exist locally are skipped.
    ///
    /// While the account gate is paused nothing is sent; the ids are queued
    /// and reported as deferred.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::NotAuthenticated`] when the account
    /// became unavailable during this call (the ids are queued), or a
    /// remote or store error.
    #[tracing::instrument(
        skip(self),
        fields(zone = %self.config.zone, record_type = E::RECORD_TYPE)
    )]
    pub async fn upload(&self, ids: &[RecordId]) -> Result<UploadReport, ReplicationError> {
        if ids.is_empty() {
            return Ok(UploadReport::default());
        }
        if self.gate.is_paused() {
            self.gate.defer_uploads(ids);
            debug!(count = ids.len(), "account unavailable; upload deferred");
            return Ok(UploadReport {
                deferred: ids.len(),
                ..UploadReport::default()
            });
        }

        let scope = Scope::<E>::new("replication");
        let cloud_ids: Vec<String> = self
            .store
            .fetch_ids(&scope, ids)
            .await?
            .iter()
            .map(|r| r.cloud_id().to_string())
            .collect();
        let _guard = self.locks.lock(&cloud_ids).await;

        // Re-read under the lock so a concurrent download is not undone.
        let records = self.store.fetch_ids(&scope, ids).await?;
        if records.is_empty() {
            return Ok(UploadReport::default());
        }
        let parent_cloud_ids = self.parent_cloud_ids(&records).await?;
        let cloud_ids: Vec<String> = records.iter().map(|r| r.cloud_id().to_string()).collect();

        let mut existing = match self.remote.fetch(&self.config.zone, &cloud_ids).await {
            Ok(found) => found,
            Err(err) => return Err(self.pause_on_auth(err, ids)),
        };

        let mut report = UploadReport::default();
        let mut batch = Vec::with_capacity(records.len());
        for record in &records {
            let mut remote = match existing.remove(record.cloud_id()) {
                Some(Ok(found)) => found,
                Some(Err(RemoteError::UnknownItem(_))) | None => {
                    report.created += 1;
                    RemoteRecord::new(record.cloud_id(), E::RECORD_TYPE)
                }
                Some(Err(err)) => return Err(self.pause_on_auth(err, ids)),
            };
            let parent = record
                .parent_id()
                .and_then(|p| parent_cloud_ids.get(&p))
                .map(String::as_str);
            record.write_fields(parent, &mut remote);
            batch.push(remote);
        }

        report.saved = batch.len();
        if let Err(err) = self.remote.save(&self.config.zone, batch).await {
            return Err(self.pause_on_auth(err, ids));
        }
        debug!(saved = report.saved, created = report.created, "uploaded records");
        Ok(report)
    }

    /// Remove records remotely by cloud id, or queue them while paused.
    ///
    /// # Errors
    ///
    /// Same as [`UploadEngine::upload`].
    #[tracing::instrument(skip(self), fields(zone = %self.config.zone))]
    pub async fn delete_remote(
        &self,
        cloud_ids: &[String],
    ) -> Result<UploadReport, ReplicationError> {
        if cloud_ids.is_empty() {
            return Ok(UploadReport::default());
        }
        if self.gate.is_paused() {
            self.gate.defer_deletes(cloud_ids);
            return Ok(UploadReport {
                deferred: cloud_ids.len(),
                ..UploadReport::default()
            });
        }

        let _guard = self.locks.lock(cloud_ids).await;
        match self.remote.delete(&self.config.zone, cloud_ids).await {
            Ok(()) => Ok(UploadReport {
                deleted: cloud_ids.len(),
                ..UploadReport::default()
            }),
            Err(RemoteError::NotAuthenticated) => {
                self.gate.pause();
                self.gate.defer_deletes(cloud_ids);
                warn!("account unavailable; remote deletes queued");
                Err(ReplicationError::NotAuthenticated)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Reopen the account gate and send everything queued while it was
    /// paused.
    ///
    /// # Errors
    ///
    /// Same as [`UploadEngine::upload`]. Work that could not be sent is
    /// queued again if the account is still unavailable.
    pub async fn notify_account_available(&self) -> Result<UploadReport, ReplicationError> {
        let (uploads, deletes) = self.gate.resume();
        info!(
            uploads = uploads.len(),
            deletes = deletes.len(),
            "account available; flushing queued replication"
        );
        let mut report = match self.upload(&uploads).await {
            Ok(report) => report,
            Err(err) => {
                // Keep the deletes for the next flush.
                self.gate.defer_deletes(&deletes);
                return Err(err);
            }
        };
        report.absorb(self.delete_remote(&deletes).await?);
        Ok(report)
    }

    /// Cloud ids of the parents of `records`.
    async fn parent_cloud_ids(
        &self,
        records: &[E],
    ) -> Result<HashMap<RecordId, String>, ReplicationError> {
        let mut cloud_ids: HashMap<RecordId, String> = records
            .iter()
            .map(|r| (r.id(), r.cloud_id().to_string()))
            .collect();
        let missing: Vec<RecordId> = records
            .iter()
            .filter_map(|r| r.parent_id())
            .filter(|p| !cloud_ids.contains_key(p))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if !missing.is_empty() {
            let parents = self
                .store
                .fetch_ids(&Scope::<E>::new("replication"), &missing)
                .await?;
            cloud_ids.extend(parents.iter().map(|p| (p.id(), p.cloud_id().to_string())));
        }
        Ok(cloud_ids)
    }

    fn pause_on_auth(&self, err: RemoteError, ids: &[RecordId]) -> ReplicationError {
        if matches!(err, RemoteError::NotAuthenticated) {
            self.gate.pause();
            self.gate.defer_uploads(ids);
            warn!(count = ids.len(), "account unavailable; uploads paused");
        }
        err.into()
    }
}

// ---------------------------------------------------------------------------
// Background worker
// ---------------------------------------------------------------------------

/// Attempts per batch before a failing background upload is parked on the
/// account gate.
const MAX_ATTEMPTS: u32 = 5;

/// Delay before the first retry; doubles on each further attempt.
const RETRY_BASE: Duration = Duration::from_millis(100);

/// Uploads local changes as the store announces them.
///
/// Events from downloads ([`Origin::Cloud`]) are ignored, as are deletions;
/// remote deletes are driven explicitly by purges. Retryable failures are
/// retried with backoff; batches that keep failing, or are still waiting
/// when the worker stops, are parked on the account gate.
#[derive(Debug)]
pub struct UploadWorker {
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl UploadWorker {
    /// Start consuming change events for `E`.
    #[must_use]
    pub fn spawn<E: CloudMirror>(engine: &Arc<UploadEngine<E>>) -> Self {
        let mut subscription = engine.store.subscribe::<E>();
        let engine = Arc::clone(engine);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut inflight: FuturesUnordered<BoxFuture<'static, Attempt>> =
                FuturesUnordered::new();
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    Some(done) = inflight.next(), if !inflight.is_empty() => {
                        if let Some((ids, attempt)) = settle(done) {
                            inflight.push(attempt_upload(Arc::clone(&engine), ids, attempt));
                        }
                    }
                    event = subscription.recv() => {
                        let Some(event) = event else { break };
                        if event.origin == Origin::Cloud || event.change.is_deletion() {
                            continue;
                        }
                        let ids = event.change.ids().to_vec();
                        inflight.push(attempt_upload(Arc::clone(&engine), ids, 1));
                    }
                }
            }
            // Attempts already scheduled finish; anything still to retry is parked.
            drop(subscription);
            while let Some(done) = inflight.next().await {
                if let Some((ids, _)) = settle(done) {
                    engine.gate.defer_uploads(&ids);
                }
            }
            debug!("upload worker stopped");
        });

        Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// Signal the worker, let in-flight uploads finish, and wait for it.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "upload worker ended abnormally");
            }
        }
    }
}

struct Attempt {
    ids: Vec<RecordId>,
    attempt: u32,
    result: Result<UploadReport, ReplicationError>,
}

fn attempt_upload<E: CloudMirror>(
    engine: Arc<UploadEngine<E>>,
    ids: Vec<RecordId>,
    attempt: u32,
) -> BoxFuture<'static, Attempt> {
    Box::pin(async move {
        if attempt > 1 {
            tokio::time::sleep(retry_delay(attempt)).await;
        }
        let result = engine.upload(&ids).await;
        if result
            .as_ref()
            .is_err_and(|err| attempt >= MAX_ATTEMPTS && err.is_retryable())
        {
            engine.gate.defer_uploads(&ids);
        }
        Attempt {
            ids,
            attempt,
            result,
        }
    })
}

fn retry_delay(attempt: u32) -> Duration {
    RETRY_BASE * 2_u32.pow(attempt.saturating_sub(2).min(6))
}

/// Log the outcome and return the ids and attempt number to retry, if any.
fn settle(done: Attempt) -> Option<(Vec<RecordId>, u32)> {
    match done.result {
        Ok(report) => {
            debug!(?report, attempt = done.attempt, "background upload finished");
            None
        }
        // Queued by the account gate.
        Err(ReplicationError::NotAuthenticated) => None,
        Err(err) if err.is_retryable() && done.attempt < MAX_ATTEMPTS => {
            warn!(
                error = %err,
                attempt = done.attempt,
                count = done.ids.len(),
                "background upload failed; retrying"
            );
            Some((done.ids, done.attempt + 1))
        }
        Err(err) if err.is_retryable() => {
            warn!(
                error = %err,
                count = done.ids.len(),
                "background upload kept failing; parked until the account is flushed"
            );
            None
        }
        Err(err) => {
            warn!(error = %err, "background upload failed");
            None
        }
    }
}
