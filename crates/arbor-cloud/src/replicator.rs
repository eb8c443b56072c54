//! Replication facade tying setup, download, upload, and purge together.

use std::sync::Arc;
use std::time::Duration;

use arbor_core::config::CloudConfig;
use arbor_core::prefs::Preferences;
use arbor_core::store::Purged;
use arbor_core::{Scope, Store, Task};
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

use crate::download::{DownloadEngine, DownloadReport};
use crate::error::ReplicationError;
use crate::lock::RecordLocks;
use crate::mapping::CloudMirror;
use crate::remote::RemoteDatabase;
use crate::setup;
use crate::upload::{UploadEngine, UploadReport, UploadWorker};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatorConfig {
    pub zone: String,
    /// Change-feed entries requested per page.
    pub page_size: usize,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self::from(&CloudConfig::default())
    }
}

impl From<&CloudConfig> for ReplicatorConfig {
    fn from(config: &CloudConfig) -> Self {
        Self {
            zone: config.zone.clone(),
            page_size: config.page_size.max(1),
        }
    }
}

/// Two-way replication of one entity type against one zone.
pub struct Replicator<E: CloudMirror = Task> {
    store: Store,
    remote: Arc<dyn RemoteDatabase>,
    prefs: Arc<dyn Preferences>,
    config: ReplicatorConfig,
    download: DownloadEngine<E>,
    upload: Arc<UploadEngine<E>>,
    worker: AsyncMutex<Option<UploadWorker>>,
}

impl<E: CloudMirror> std::fmt::Debug for Replicator<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("config", &self.config)
            .field("download", &self.download)
            .field("upload", &self.upload)
            .finish_non_exhaustive()
    }
}

impl<E: CloudMirror> Replicator<E> {
    #[must_use]
    pub fn new(
        store: &Store,
        remote: Arc<dyn RemoteDatabase>,
        prefs: Arc<dyn Preferences>,
        config: ReplicatorConfig,
    ) -> Self {
        let locks = RecordLocks::new();
        let download = DownloadEngine::new(
            store,
            Arc::clone(&remote),
            Arc::clone(&prefs),
            locks.clone(),
            config.clone(),
        );
        let upload = Arc::new(UploadEngine::new(
            store,
            Arc::clone(&remote),
            locks,
            config.clone(),
        ));
        Self {
            store: store.clone(),
            remote,
            prefs,
            config,
            download,
            upload,
            worker: AsyncMutex::new(None),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    #[must_use]
    pub const fn download(&self) -> &DownloadEngine<E> {
        &self.download
    }

    #[must_use]
    pub fn upload(&self) -> &UploadEngine<E> {
        &self.upload
    }

    /// Provision the zone unless this device already did.
    ///
    /// # Errors
    ///
    /// See [`setup::ensure_zone_ready`].
    pub async fn setup(&self) -> Result<bool, ReplicationError> {
        setup::ensure_zone_ready(&*self.remote, &*self.prefs, &self.config.zone).await
    }

    /// # Errors
    ///
    /// See [`DownloadEngine::pull`].
    pub async fn pull(&self) -> Result<DownloadReport, ReplicationError> {
        self.download.pull().await
    }

    /// # Errors
    ///
    /// See [`UploadEngine::upload`].
    pub async fn push(
        &self,
        ids: &[arbor_core::RecordId],
    ) -> Result<UploadReport, ReplicationError> {
        self.upload.upload(ids).await
    }

    /// Upload every local record, including soft-deleted ones.
    ///
    /// # Errors
    ///
    /// See [`UploadEngine::upload`].
    pub async fn push_all(&self) -> Result<UploadReport, ReplicationError> {
        let ids = self
            .store
            .fetch::<E>(&Scope::new("replication"))
            .await?
            .iter()
            .map(arbor_core::Entity::id)
            .collect::<Vec<_>>();
        info!(count = ids.len(), "uploading all local records");
        self.upload.upload(&ids).await
    }

    /// Start uploading local changes in the background. No-op if already
    /// running.
    pub async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if worker.is_none() {
            *worker = Some(UploadWorker::spawn(&self.upload));
        }
    }

    /// Stop the background uploader, waiting for in-flight uploads.
    pub async fn stop(&self) {
        let worker = self.worker.lock().await.take();
        if let Some(worker) = worker {
            worker.stop().await;
        }
    }

    pub async fn is_running(&self) -> bool {
        self.worker.lock().await.is_some()
    }

    /// # Errors
    ///
    /// See [`UploadEngine::notify_account_available`].
    pub async fn notify_account_available(&self) -> Result<UploadReport, ReplicationError> {
        self.upload.notify_account_available().await
    }

    /// Purge soft-deleted records older than `older_than` locally, then
    /// delete them remotely.
    ///
    /// # Errors
    ///
    /// Returns a store error (nothing purged), or the remote error from the
    /// delete. Local rows are gone in the latter case; remote deletes that
    /// failed for lack of an account stay queued.
    pub async fn purge_soft_deleted(
        &self,
        older_than: Duration,
    ) -> Result<Vec<Purged>, ReplicationError> {
        let purged = self.store.purge_soft_deleted::<E>(older_than).await?;
        let cloud_ids: Vec<String> = purged.iter().map(|p| p.cloud_id.clone()).collect();
        self.upload.delete_remote(&cloud_ids).await?;
        Ok(purged)
    }
}
