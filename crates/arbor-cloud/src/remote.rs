//! The remote record database consumed by replication.
//!
//! Records are flat string-keyed JSON maps addressed by a record id (the
//! local cloud id) inside a named zone. Implementations talk to a hosted
//! service; [`crate::memory::MemoryRemote`] is an in-process stand-in.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RemoteError;

/// One remote record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub record_id: String,
    pub record_type: String,
    #[serde(default)]
    pub fields: BTreeMap<String, serde_json::Value>,
}

impl RemoteRecord {
    #[must_use]
    pub fn new(record_id: impl Into<String>, record_type: impl Into<String>) -> Self {
        Self {
            record_id: record_id.into(),
            record_type: record_type.into(),
            fields: BTreeMap::new(),
        }
    }
}

/// A record removed remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedRecord {
    pub record_id: String,
    pub record_type: String,
}

/// Opaque cursor into a zone's change feed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeToken(pub String);

impl ChangeToken {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One page of the change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangePage {
    pub modified: Vec<RemoteRecord>,
    pub deleted: Vec<DeletedRecord>,
    /// Cursor after this page. Only durable once `more_pending` is false.
    pub token: ChangeToken,
    pub more_pending: bool,
}

/// Per-id outcome of [`RemoteDatabase::fetch`].
pub type FetchResults = BTreeMap<String, Result<RemoteRecord, RemoteError>>;

/// Remote record store with an incremental change feed.
///
/// Every call may fail with [`RemoteError::NotAuthenticated`] when the
/// account is unavailable.
#[async_trait]
pub trait RemoteDatabase: Send + Sync {
    /// Look up records by id. A missing record is reported per id as
    /// [`RemoteError::UnknownItem`]; the outer error is for whole-call
    /// failures.
    async fn fetch(&self, zone: &str, ids: &[String]) -> Result<FetchResults, RemoteError>;

    /// Create or overwrite records as one batch.
    async fn save(&self, zone: &str, records: Vec<RemoteRecord>) -> Result<(), RemoteError>;

    /// Remove records. Ids that do not exist are ignored.
    async fn delete(&self, zone: &str, ids: &[String]) -> Result<(), RemoteError>;

    /// Changes after `token` (from the beginning when `None`), at most
    /// `limit` entries per page.
    async fn changes_since(
        &self,
        zone: &str,
        token: Option<&ChangeToken>,
        limit: usize,
    ) -> Result<ChangePage, RemoteError>;

    async fn ensure_zone_exists(&self, zone: &str) -> Result<(), RemoteError>;

    /// Make sure push notifications for `zone` are registered.
    async fn ensure_subscription_exists(&self, zone: &str) -> Result<(), RemoteError>;
}
