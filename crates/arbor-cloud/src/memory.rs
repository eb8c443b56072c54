//! In-process remote database for tests and local simulation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use crate::error::RemoteError;
use crate::remote::{
    ChangePage, ChangeToken, DeletedRecord, FetchResults, RemoteDatabase, RemoteRecord,
};

/// How many times each remote operation has been called.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub fetch: usize,
    pub save: usize,
    pub delete: usize,
    pub changes: usize,
    pub ensure_zone: usize,
    pub ensure_subscription: usize,
}

#[derive(Debug, Clone)]
struct LogEntry {
    seq: u64,
    record_id: String,
    record_type: String,
    deleted: bool,
}

#[derive(Debug, Default)]
struct Zone {
    records: BTreeMap<String, RemoteRecord>,
    log: Vec<LogEntry>,
}

impl Zone {
    fn append(&mut self, seq: u64, record_id: &str, record_type: &str, deleted: bool) {
        // Only the latest entry per record is ever served.
        self.log.retain(|entry| entry.record_id != record_id);
        self.log.push(LogEntry {
            seq,
            record_id: record_id.to_string(),
            record_type: record_type.to_string(),
            deleted,
        });
    }
}

#[derive(Debug)]
struct State {
    zones: BTreeMap<String, Zone>,
    subscriptions: BTreeSet<String>,
    next_seq: u64,
    authenticated: bool,
    fail_changes_after: Option<usize>,
    failing_saves: usize,
    calls: CallCounts,
}

/// A remote that keeps zones in memory with a sequence-numbered change log.
///
/// Change tokens are the decimal sequence number of the last served entry.
/// Saving to or reading from a zone that was never created fails with
/// [`RemoteError::Other`], like a real provider.
#[derive(Debug)]
pub struct MemoryRemote {
    state: Mutex<State>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                zones: BTreeMap::new(),
                subscriptions: BTreeSet::new(),
                next_seq: 1,
                authenticated: true,
                fail_changes_after: None,
                failing_saves: 0,
                calls: CallCounts::default(),
            }),
        }
    }

    /// Toggle account availability. While unavailable every call fails
    /// with [`RemoteError::NotAuthenticated`].
    pub fn set_authenticated(&self, authenticated: bool) {
        self.lock().authenticated = authenticated;
    }

    /// Let `calls` more `changes_since` requests succeed, then fail each
    /// one with a service error. `None` clears the injection.
    pub fn fail_changes_after(&self, calls: Option<usize>) {
        self.lock().fail_changes_after = calls;
    }

    /// Fail the next `count` saves with a service error, writing nothing.
    pub fn fail_saves(&self, count: usize) {
        self.lock().failing_saves = count;
    }

    #[must_use]
    pub fn calls(&self) -> CallCounts {
        self.lock().calls
    }

    /// Write a record as another device would, creating the zone if
    /// needed.
    pub fn put_record(&self, zone: &str, record: RemoteRecord) {
        let mut state = self.lock();
        let seq = state.bump();
        let zone = state.zones.entry(zone.to_string()).or_default();
        zone.append(seq, &record.record_id, &record.record_type, false);
        zone.records.insert(record.record_id.clone(), record);
    }

    /// Delete a record as another device would.
    pub fn remove_record(&self, zone: &str, record_id: &str) {
        let mut state = self.lock();
        let seq = state.bump();
        let Some(zone) = state.zones.get_mut(zone) else {
            return;
        };
        if let Some(record) = zone.records.remove(record_id) {
            zone.append(seq, record_id, &record.record_type, true);
        }
    }

    #[must_use]
    pub fn record(&self, zone: &str, record_id: &str) -> Option<RemoteRecord> {
        self.lock()
            .zones
            .get(zone)
            .and_then(|z| z.records.get(record_id).cloned())
    }

    /// Every record in `zone`, ordered by id.
    #[must_use]
    pub fn records(&self, zone: &str) -> Vec<RemoteRecord> {
        self.lock()
            .zones
            .get(zone)
            .map(|z| z.records.values().cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn has_zone(&self, zone: &str) -> bool {
        self.lock().zones.contains_key(zone)
    }

    #[must_use]
    pub fn has_subscription(&self, zone: &str) -> bool {
        self.lock().subscriptions.contains(zone)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn authorized(&self) -> Result<MutexGuard<'_, State>, RemoteError> {
        let state = self.lock();
        if state.authenticated {
            Ok(state)
        } else {
            Err(RemoteError::NotAuthenticated)
        }
    }
}

impl State {
    fn bump(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn zone_mut(&mut self, zone: &str) -> Result<&mut Zone, RemoteError> {
        self.zones
            .get_mut(zone)
            .ok_or_else(|| RemoteError::Other(format!("zone '{zone}' does not exist")))
    }
}

#[async_trait]
impl RemoteDatabase for MemoryRemote {
    async fn fetch(&self, zone: &str, ids: &[String]) -> Result<FetchResults, RemoteError> {
        let mut state = self.authorized()?;
        state.calls.fetch += 1;
        let zone = state.zone_mut(zone)?;
        Ok(ids
            .iter()
            .map(|id| {
                let result = zone
                    .records
                    .get(id)
                    .cloned()
                    .ok_or_else(|| RemoteError::UnknownItem(id.clone()));
                (id.clone(), result)
            })
            .collect())
    }

    async fn save(&self, zone: &str, records: Vec<RemoteRecord>) -> Result<(), RemoteError> {
        let mut state = self.authorized()?;
        state.calls.save += 1;
        state.zone_mut(zone)?;
        if state.failing_saves > 0 {
            state.failing_saves -= 1;
            return Err(RemoteError::service("injected save failure"));
        }
        for record in records {
            let seq = state.bump();
            let target = state.zone_mut(zone)?;
            target.append(seq, &record.record_id, &record.record_type, false);
            target.records.insert(record.record_id.clone(), record);
        }
        Ok(())
    }

    async fn delete(&self, zone: &str, ids: &[String]) -> Result<(), RemoteError> {
        let mut state = self.authorized()?;
        state.calls.delete += 1;
        state.zone_mut(zone)?;
        for id in ids {
            let seq = state.bump();
            let target = state.zone_mut(zone)?;
            if let Some(record) = target.records.remove(id) {
                target.append(seq, id, &record.record_type, true);
            }
        }
        Ok(())
    }

    async fn changes_since(
        &self,
        zone: &str,
        token: Option<&ChangeToken>,
        limit: usize,
    ) -> Result<ChangePage, RemoteError> {
        let mut state = self.authorized()?;
        state.calls.changes += 1;
        let remaining = state.fail_changes_after;
        match remaining {
            Some(0) => return Err(RemoteError::service("injected change feed failure")),
            Some(n) => state.fail_changes_after = Some(n - 1),
            None => {}
        }

        let since = match token {
            None => 0,
            Some(token) => token
                .as_str()
                .parse::<u64>()
                .map_err(|_| RemoteError::Other(format!("invalid change token '{}'", token.0)))?,
        };
        let feed = state.zone_mut(zone)?;

        let pending: Vec<&LogEntry> = feed.log.iter().filter(|e| e.seq > since).collect();
        let take = limit.max(1).min(pending.len());
        let more_pending = pending.len() > take;
        let last_seq = pending[..take].last().map_or(since, |e| e.seq);

        let mut page = ChangePage {
            modified: Vec::new(),
            deleted: Vec::new(),
            token: ChangeToken(last_seq.to_string()),
            more_pending,
        };
        for entry in &pending[..take] {
            if entry.deleted {
                page.deleted.push(DeletedRecord {
                    record_id: entry.record_id.clone(),
                    record_type: entry.record_type.clone(),
                });
            } else if let Some(record) = feed.records.get(&entry.record_id) {
                page.modified.push(record.clone());
            }
        }
        debug!(
            zone,
            since,
            modified = page.modified.len(),
            deleted = page.deleted.len(),
            more_pending,
            "served change page"
        );
        Ok(page)
    }

    async fn ensure_zone_exists(&self, zone: &str) -> Result<(), RemoteError> {
        let mut state = self.authorized()?;
        state.calls.ensure_zone += 1;
        state.zones.entry(zone.to_string()).or_default();
        Ok(())
    }

    async fn ensure_subscription_exists(&self, zone: &str) -> Result<(), RemoteError> {
        let mut state = self.authorized()?;
        state.calls.ensure_subscription += 1;
        state.zone_mut(zone)?;
        state.subscriptions.insert(zone.to_string());
        Ok(())
    }
}
