//! Pulling remote changes into the local store.
//!
//! The feed is consumed one page at a time. Each page is applied as
//! upserts keyed by cloud id, so re-applying a page after a crash is
//! harmless. The change token is persisted only once the feed reports no
//! more pending pages.

use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;
use std::sync::Arc;

use arbor_core::bus::Origin;
use arbor_core::prefs::{self, Preferences};
use arbor_core::{Assignment, Entity, FieldValue, RecordId, Scope, Store, StoreError, Task};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::error::ReplicationError;
use crate::lock::RecordLocks;
use crate::mapping::CloudMirror;
use crate::remote::{ChangePage, ChangeToken, RemoteDatabase, RemoteRecord};
use crate::replicator::ReplicatorConfig;

/// Preference key holding the durable change token for `zone`.
#[must_use]
pub fn token_key(zone: &str) -> String {
    format!("cloud.change_token.{zone}")
}

/// Outcome of one [`DownloadEngine::pull`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadReport {
    pub pages: usize,
    pub upserted: usize,
    pub deleted: usize,
    /// Records skipped because their fields could not be decoded.
    pub malformed: usize,
    /// Parent links that named a record this device does not have.
    pub unresolved_parents: usize,
}

/// Applies the remote change feed to the local store.
///
/// Writes go through a store handle tagged [`Origin::Cloud`], so the
/// upload engine does not echo them back.
pub struct DownloadEngine<E: CloudMirror = Task> {
    store: Store,
    remote: Arc<dyn RemoteDatabase>,
    prefs: Arc<dyn Preferences>,
    locks: RecordLocks,
    config: ReplicatorConfig,
    running: AsyncMutex<()>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: CloudMirror> std::fmt::Debug for DownloadEngine<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadEngine")
            .field("record_type", &E::RECORD_TYPE)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<E: CloudMirror> DownloadEngine<E> {
    #[must_use]
    pub fn new(
        store: &Store,
        remote: Arc<dyn RemoteDatabase>,
        prefs: Arc<dyn Preferences>,
        locks: RecordLocks,
        config: ReplicatorConfig,
    ) -> Self {
        Self {
            store: store.with_origin(Origin::Cloud),
            remote,
            prefs,
            locks,
            config,
            running: AsyncMutex::new(()),
            _entity: PhantomData,
        }
    }

    /// The last durably completed change token, if any.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::Preferences`] if the stored token cannot
    /// be read.
    pub fn token(&self) -> Result<Option<ChangeToken>, ReplicationError> {
        Ok(prefs::get_json(&*self.prefs, &token_key(&self.config.zone))?)
    }

    /// Forget the change token; the next pull starts from the beginning.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::Preferences`] on a storage failure.
    pub fn reset_token(&self) -> Result<(), ReplicationError> {
        self.prefs.remove(&token_key(&self.config.zone))?;
        Ok(())
    }

    /// Pull every pending change. Concurrent calls run one after another.
    ///
    /// # Errors
    ///
    /// Returns a remote, store, or preferences error. Pages applied before
    /// the failure stay applied; the durable token is not advanced, so the
    /// next pull re-applies them.
    #[tracing::instrument(
        skip(self),
        fields(zone = %self.config.zone, record_type = E::RECORD_TYPE)
    )]
    pub async fn pull(&self) -> Result<DownloadReport, ReplicationError> {
        let _running = self.running.lock().await;
        let key = token_key(&self.config.zone);
        let mut token: Option<ChangeToken> = prefs::get_json(&*self.prefs, &key)?;
        let mut links = PendingLinks::default();
        let mut report = DownloadReport::default();

        loop {
            let page = self
                .remote
                .changes_since(&self.config.zone, token.as_ref(), self.config.page_size)
                .await?;
            report.pages += 1;
            self.apply_page(&page, &mut links, &mut report).await?;

            if !page.more_pending {
                prefs::set_json(&*self.prefs, &key, &page.token)?;
                break;
            }
            token = Some(page.token);
            debug!(pages = report.pages, "more changes pending");
        }

        report.unresolved_parents = links.unresolved();
        if report.unresolved_parents > 0 {
            warn!(
                count = report.unresolved_parents,
                "parent records missing locally; children left unlinked"
            );
        }
        info!(
            pages = report.pages,
            upserted = report.upserted,
            deleted = report.deleted,
            "pulled remote changes"
        );
        Ok(report)
    }

    async fn apply_page(
        &self,
        page: &ChangePage,
        links: &mut PendingLinks,
        report: &mut DownloadReport,
    ) -> Result<(), ReplicationError> {
        let modified: Vec<&RemoteRecord> = page
            .modified
            .iter()
            .filter(|r| r.record_type == E::RECORD_TYPE)
            .collect();
        let deleted: Vec<&str> = page
            .deleted
            .iter()
            .filter(|r| r.record_type == E::RECORD_TYPE)
            .map(|r| r.record_id.as_str())
            .collect();
        let foreign = page.modified.len() + page.deleted.len() - modified.len() - deleted.len();
        if foreign > 0 {
            debug!(foreign, "skipping records of other types");
        }

        let _guard = self
            .locks
            .lock(
                modified
                    .iter()
                    .map(|r| r.record_id.as_str())
                    .chain(deleted.iter().copied()),
            )
            .await;

        // Fields first, so a child listed before its parent can still be
        // linked in the second pass.
        for record in modified {
            if let Some(id) = self.upsert(record, links, report).await? {
                debug!(id, cloud_id = %record.record_id, "applied remote record");
                report.upserted += 1;
            }
        }
        self.link_parents(links).await?;

        let mut local = Vec::with_capacity(deleted.len());
        for cloud_id in deleted {
            if let Some(existing) = self.store.pluck_by_cloud_id::<E>(cloud_id).await? {
                local.push(existing.id());
            }
        }
        if !local.is_empty() {
            links.forget(&local);
            let removed = self.store.delete::<E>(&local).await?;
            report.deleted += removed.len();
        }
        Ok(())
    }

    async fn upsert(
        &self,
        record: &RemoteRecord,
        links: &mut PendingLinks,
        report: &mut DownloadReport,
    ) -> Result<Option<RecordId>, ReplicationError> {
        let decoded = E::read_fields(record)
            .and_then(|fields| E::parent_cloud_id(record).map(|parent| (fields, parent)));
        let (mut fields, parent) = match decoded {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(cloud_id = %record.record_id, error = %err, "skipping malformed record");
                report.malformed += 1;
                return Ok(None);
            }
        };

        let scope = replication_scope::<E>();
        let id = match self.store.pluck_by_cloud_id::<E>(&record.record_id).await? {
            Some(existing) => {
                self.store
                    .update(existing.id(), &fields, false, &scope)
                    .await?;
                existing.id()
            }
            None => {
                fields.push(Assignment::new(
                    "cloud_id",
                    FieldValue::Text(record.record_id.clone()),
                ));
                self.store.insert(&fields, &scope).await?.id()
            }
        };
        links.want(id, parent);
        Ok(Some(id))
    }

    async fn link_parents(&self, links: &mut PendingLinks) -> Result<(), ReplicationError> {
        if links.wanted.is_empty() {
            return Ok(());
        }
        let scope = replication_scope::<E>();
        let ids: Vec<RecordId> = links.wanted.keys().copied().collect();
        let current: HashMap<RecordId, Option<RecordId>> = self
            .store
            .fetch_ids(&scope, &ids)
            .await?
            .iter()
            .map(|r| (r.id(), r.parent_id()))
            .collect();

        let mut resolved = Vec::new();
        for (&id, parent_cloud_id) in &links.wanted {
            let desired = match parent_cloud_id {
                None => None,
                Some(cloud_id) => match self.store.pluck_by_cloud_id::<E>(cloud_id).await? {
                    Some(parent) => Some(parent.id()),
                    // Might arrive on a later page.
                    None => continue,
                },
            };
            resolved.push(id);

            let Some(&actual) = current.get(&id) else {
                continue;
            };
            if actual == desired {
                continue;
            }
            match self
                .store
                .update(id, &[Assignment::new("parent_id", desired)], false, &scope)
                .await
            {
                Ok(_) => {}
                Err(
                    err @ (StoreError::CycleDetected { .. } | StoreError::MissingParent { .. }),
                ) => {
                    warn!(id, error = %err, "rejected remote parent link");
                }
                Err(err) => return Err(err.into()),
            }
        }
        for id in resolved {
            links.wanted.remove(&id);
        }
        Ok(())
    }
}

/// Parent links still to apply, keyed by local id.
#[derive(Debug, Default)]
struct PendingLinks {
    wanted: BTreeMap<RecordId, Option<String>>,
}

impl PendingLinks {
    fn want(&mut self, id: RecordId, parent_cloud_id: Option<String>) {
        self.wanted.insert(id, parent_cloud_id);
    }

    fn forget(&mut self, ids: &[RecordId]) {
        for id in ids {
            self.wanted.remove(id);
        }
    }

    fn unresolved(&self) -> usize {
        self.wanted.len()
    }
}

fn replication_scope<E: Entity>() -> Scope<E> {
    Scope::new("replication")
}
