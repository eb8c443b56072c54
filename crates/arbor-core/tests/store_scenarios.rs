use std::sync::Arc;

use arbor_core::clock::ManualClock;
use arbor_core::model::task::field;
use arbor_core::scope::{Order, Scope, tasks};
use arbor_core::store::{Store, StoreOptions};
use arbor_core::{StoreError, Task};

fn store_at(start_us: i64) -> (Store, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(start_us));
    let store = Store::in_memory(StoreOptions::default().with_clock(clock.clone()))
        .expect("in-memory store");
    (store, clock)
}

#[tokio::test]
async fn insert_through_scope_applies_its_defaults() {
    let (store, _) = store_at(5_000);
    let inserted: Task = store
        .insert(&[field::body("ship it")], &tasks::completed())
        .await
        .expect("insert");

    assert_eq!(inserted.completed_at_us, Some(5_000));
    assert_eq!(inserted.created_at_us, inserted.updated_at_us);

    let fetched = store.fetch(&tasks::completed()).await.expect("fetch");
    assert_eq!(fetched, vec![inserted]);
    assert!(store.fetch(&tasks::active()).await.expect("fetch").is_empty());
}

#[tokio::test]
async fn explicit_fields_override_scope_defaults() {
    let (store, _) = store_at(5_000);
    let parent: Task = store.insert(&[], &tasks::active()).await.expect("parent");
    let other: Task = store.insert(&[], &tasks::active()).await.expect("other");

    let child: Task = store
        .insert(&[field::parent(Some(other.id))], &tasks::children_of(parent.id))
        .await
        .expect("child");
    assert_eq!(child.parent_id, Some(other.id));
}

#[tokio::test]
async fn fetch_orders_by_scope_then_id() {
    let (store, clock) = store_at(100);
    let first: Task = store.insert(&[], &tasks::active()).await.expect("first");
    let second: Task = store.insert(&[], &tasks::active()).await.expect("second");
    clock.set(50);
    let earliest: Task = store.insert(&[], &tasks::active()).await.expect("earliest");

    let ids: Vec<i64> = store
        .fetch(&tasks::active())
        .await
        .expect("fetch")
        .iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ids, vec![earliest.id, first.id, second.id]);

    let newest_first: Scope<Task> = Scope::new("newest").order_by(Order::desc("created_at_us"));
    let ids: Vec<i64> = store
        .fetch(&newest_first)
        .await
        .expect("fetch")
        .iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(ids, vec![first.id, second.id, earliest.id]);
}

#[tokio::test]
async fn fetch_recursive_filters_the_subtree() {
    let (store, _) = store_at(1);
    let root: Task = store.insert(&[], &tasks::active()).await.expect("root");
    let open: Task = store
        .insert(&[], &tasks::children_of(root.id))
        .await
        .expect("open child");
    let done: Task = store
        .insert(&[field::completed_now()], &tasks::children_of(root.id))
        .await
        .expect("done child");
    let grandchild: Task = store
        .insert(&[], &tasks::children_of(done.id))
        .await
        .expect("grandchild");
    let _unrelated: Task = store.insert(&[], &tasks::active()).await.expect("unrelated");

    let everything = store
        .fetch_recursive(root.id, &tasks::unfiltered())
        .await
        .expect("fetch_recursive");
    let mut ids: Vec<i64> = everything.iter().map(|t| t.id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![root.id, open.id, done.id, grandchild.id]);

    let active = store
        .fetch_recursive(root.id, &tasks::active())
        .await
        .expect("fetch_recursive");
    let mut ids: Vec<i64> = active.iter().map(|t| t.id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![root.id, open.id, grandchild.id]);
}

#[tokio::test]
async fn scoped_update_only_touches_matching_rows() {
    let (store, _) = store_at(1);
    let root: Task = store.insert(&[], &tasks::active()).await.expect("root");
    let done: Task = store
        .insert(&[field::completed_now()], &tasks::children_of(root.id))
        .await
        .expect("done");
    let open: Task = store
        .insert(&[], &tasks::children_of(root.id))
        .await
        .expect("open");

    let written = store
        .update(root.id, &[field::body("renamed")], true, &tasks::active())
        .await
        .expect("update");
    assert_eq!(written, vec![root.id, open.id]);

    let untouched: Task = store
        .pluck(done.id, &tasks::unfiltered())
        .await
        .expect("pluck")
        .expect("present");
    assert_eq!(untouched.body, "");
}

#[tokio::test]
async fn count_and_pluck_respect_scope() {
    let (store, _) = store_at(1);
    let live: Task = store.insert(&[], &tasks::active()).await.expect("live");
    let trashed: Task = store.insert(&[], &tasks::deleted()).await.expect("trashed");

    assert_eq!(store.count(&tasks::all()).await.expect("count"), 1);
    assert_eq!(store.count(&tasks::unfiltered()).await.expect("count"), 2);
    assert!(store.pluck(trashed.id, &tasks::all()).await.expect("pluck").is_none());
    assert_eq!(
        store
            .pluck_by_cloud_id::<Task>(&live.cloud_id)
            .await
            .expect("by cloud id")
            .map(|t| t.id),
        Some(live.id)
    );
}

#[tokio::test]
async fn cycle_rejection_leaves_store_untouched() {
    let (store, _) = store_at(1);
    let a: Task = store.insert(&[], &tasks::active()).await.expect("a");
    let b: Task = store.insert(&[], &tasks::children_of(a.id)).await.expect("b");
    let mut sub = store.subscribe::<Task>();

    let err = store
        .update::<Task>(a.id, &[field::parent(Some(b.id))], true, &tasks::all())
        .await
        .expect_err("cycle");
    assert!(matches!(err, StoreError::CycleDetected { .. }));
    assert!(sub.try_recv().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writers_are_serialized() {
    let (store, _) = store_at(1);
    let mut handles = Vec::new();
    for i in 0..32 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .insert::<Task>(&[field::body(format!("t{i}"))], &tasks::active())
                .await
        }));
    }
    for handle in handles {
        handle.await.expect("join").expect("insert");
    }
    assert_eq!(store.count(&tasks::active()).await.expect("count"), 32);
}

#[tokio::test]
async fn on_disk_store_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join(".arbor").join("arbor.sqlite3");

    let inserted: Task = {
        let store = Store::open(&path, StoreOptions::default()).expect("open");
        store
            .insert(&[field::body("persist me")], &tasks::active())
            .await
            .expect("insert")
    };

    let reopened = Store::open(&path, StoreOptions::default()).expect("reopen");
    let found: Option<Task> = reopened.pluck(inserted.id, &tasks::all()).await.expect("pluck");
    assert_eq!(found, Some(inserted));
}
