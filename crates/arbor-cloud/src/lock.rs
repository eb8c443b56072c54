//! Per-record serialization of replication work.
//!
//! Upload and download both lock every cloud id they touch before reading
//! or writing it, always in sorted order so two batches that overlap
//! cannot deadlock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Lazily created async locks keyed by cloud id.
///
/// Entries are held weakly and pruned once no guard or waiter refers to
/// them.
#[derive(Debug, Clone, Default)]
pub struct RecordLocks {
    table: Arc<Mutex<HashMap<String, Weak<AsyncMutex<()>>>>>,
}

/// Held locks; released on drop.
#[derive(Debug)]
pub struct RecordGuard {
    ids: Vec<String>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl RecordGuard {
    /// Locked ids, sorted.
    #[must_use]
    pub fn ids(&self) -> &[String] {
        &self.ids
    }
}

impl RecordLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every id in `ids`, waiting for current holders.
    pub async fn lock<I, S>(&self, ids: I) -> RecordGuard
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ids: Vec<String> = ids.into_iter().map(|s| s.as_ref().to_string()).collect();
        ids.sort_unstable();
        ids.dedup();

        let mutexes = self.handles(&ids);
        let mut guards = Vec::with_capacity(mutexes.len());
        for mutex in mutexes {
            guards.push(mutex.lock_owned().await);
        }
        RecordGuard {
            ids,
            _guards: guards,
        }
    }

    /// Number of ids with a live lock.
    #[must_use]
    pub fn len(&self) -> usize {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.values().filter(|w| w.strong_count() > 0).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn handles(&self, ids: &[String]) -> Vec<Arc<AsyncMutex<()>>> {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.retain(|_, weak| weak.strong_count() > 0);
        ids.iter()
            .map(|id| {
                if let Some(live) = table.get(id).and_then(Weak::upgrade) {
                    return live;
                }
                let fresh = Arc::new(AsyncMutex::new(()));
                table.insert(id.clone(), Arc::downgrade(&fresh));
                fresh
            })
            .collect()
    }
}
