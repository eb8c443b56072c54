//! Per-entity change notifications.
//!
//! The bus is owned by a [`crate::store::Store`] and handed to consumers;
//! there is no process-wide instance. Each subscriber gets its own
//! unbounded channel, so [`ChangeBus::publish`] never blocks and never
//! drops an event for a live subscriber.

use std::collections::HashMap;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::trace;

use crate::model::{EntityKind, RecordId};

/// Who caused a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    #[default]
    Local,
    Cloud,
}

/// What happened to which records.
///
/// A `*Many` event is equivalent to the corresponding single events applied
/// at the same logical instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Change {
    Changed(RecordId),
    ChangedMany(Vec<RecordId>),
    Deleted(RecordId),
    DeletedMany(Vec<RecordId>),
}

impl Change {
    #[must_use]
    pub fn ids(&self) -> &[RecordId] {
        match self {
            Self::Changed(id) | Self::Deleted(id) => slice::from_ref(id),
            Self::ChangedMany(ids) | Self::DeletedMany(ids) => ids,
        }
    }

    #[must_use]
    pub const fn is_deletion(&self) -> bool {
        matches!(self, Self::Deleted(_) | Self::DeletedMany(_))
    }

    /// `Changed` for one id, `ChangedMany` otherwise.
    #[must_use]
    pub fn changed(mut ids: Vec<RecordId>) -> Self {
        if ids.len() == 1 {
            Self::Changed(ids.remove(0))
        } else {
            Self::ChangedMany(ids)
        }
    }

    /// `Deleted` for one id, `DeletedMany` otherwise.
    #[must_use]
    pub fn deleted(mut ids: Vec<RecordId>) -> Self {
        if ids.len() == 1 {
            Self::Deleted(ids.remove(0))
        } else {
            Self::DeletedMany(ids)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: EntityKind,
    pub change: Change,
    pub origin: Origin,
}

type Subscribers = Vec<(u64, UnboundedSender<ChangeEvent>)>;

#[derive(Debug, Default)]
struct BusInner {
    next_id: AtomicU64,
    topics: Mutex<HashMap<EntityKind, Subscribers>>,
}

impl BusInner {
    fn remove(&self, kind: EntityKind, id: u64) {
        let mut topics = self.topics.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(subs) = topics.get_mut(&kind) {
            subs.retain(|(sub_id, _)| *sub_id != id);
            if subs.is_empty() {
                topics.remove(&kind);
            }
        }
    }
}

/// Cheaply cloneable handle to a shared bus.
#[derive(Debug, Clone, Default)]
pub struct ChangeBus {
    inner: Arc<BusInner>,
}

impl ChangeBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a fresh, independent channel of events for `kind`.
    #[must_use]
    pub fn subscribe(&self, kind: EntityKind) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push((id, tx));
        trace!(%kind, id, "subscribed");
        Subscription {
            id,
            kind,
            rx,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Explicit form of dropping `subscription`.
    pub fn unsubscribe(&self, subscription: Subscription) {
        drop(subscription);
    }

    /// Deliver `event` to every current subscriber of its kind.
    pub fn publish(&self, event: &ChangeEvent) {
        let mut topics = self.inner.topics.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(subs) = topics.get_mut(&event.kind) else {
            return;
        };
        subs.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        trace!(kind = %event.kind, subscribers = subs.len(), ?event.change, "published");
        if subs.is_empty() {
            topics.remove(&event.kind);
        }
    }

    #[must_use]
    pub fn subscriber_count(&self, kind: EntityKind) -> usize {
        self.inner
            .topics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

/// One subscriber's view of a topic. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    kind: EntityKind,
    rx: UnboundedReceiver<ChangeEvent>,
    bus: Weak<BusInner>,
}

impl Subscription {
    #[must_use]
    pub const fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Next event; `None` once the bus is gone and the queue is drained.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.kind, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TASK: EntityKind = EntityKind::new("task");
    const NOTE: EntityKind = EntityKind::new("note");

    fn event(kind: EntityKind, change: Change) -> ChangeEvent {
        ChangeEvent {
            kind,
            change,
            origin: Origin::Local,
        }
    }

    #[test]
    fn every_subscriber_sees_every_event() {
        let bus = ChangeBus::new();
        let mut a = bus.subscribe(TASK);
        let mut b = bus.subscribe(TASK);

        bus.publish(&event(TASK, Change::Changed(1)));
        bus.publish(&event(TASK, Change::DeletedMany(vec![2, 3])));

        for sub in [&mut a, &mut b] {
            assert_eq!(sub.try_recv().map(|e| e.change), Some(Change::Changed(1)));
            assert_eq!(
                sub.try_recv().map(|e| e.change),
                Some(Change::DeletedMany(vec![2, 3]))
            );
            assert!(sub.try_recv().is_none());
        }
    }

    #[test]
    fn topics_are_independent() {
        let bus = ChangeBus::new();
        let mut notes = bus.subscribe(NOTE);
        bus.publish(&event(TASK, Change::Changed(1)));
        assert!(notes.try_recv().is_none());
    }

    #[test]
    fn drop_and_unsubscribe_release_channels() {
        let bus = ChangeBus::new();
        let a = bus.subscribe(TASK);
        let b = bus.subscribe(TASK);
        assert_eq!(bus.subscriber_count(TASK), 2);

        drop(a);
        assert_eq!(bus.subscriber_count(TASK), 1);
        bus.unsubscribe(b);
        assert_eq!(bus.subscriber_count(TASK), 0);
    }

    #[test]
    fn subscription_outliving_bus_is_harmless() {
        let bus = ChangeBus::new();
        let mut sub = bus.subscribe(TASK);
        bus.publish(&event(TASK, Change::Changed(4)));
        drop(bus);
        assert_eq!(sub.try_recv().map(|e| e.change), Some(Change::Changed(4)));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn change_constructors_pick_arity() {
        assert_eq!(Change::changed(vec![1]), Change::Changed(1));
        assert_eq!(Change::changed(vec![1, 2]).ids(), &[1, 2]);
        assert!(Change::deleted(vec![5]).is_deletion());
        assert!(!Change::changed(vec![]).is_deletion());
    }
}
