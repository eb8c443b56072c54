use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arbor_cloud::error::RemoteError;
use arbor_cloud::{
    CloudMirror, MemoryRemote, RemoteDatabase, RemoteRecord, ReplicationError, Replicator,
    ReplicatorConfig,
};
use arbor_core::prefs::Preferences;
use arbor_core::clock::ManualClock;
use arbor_core::model::task::field;
use arbor_core::prefs::MemoryPreferences;
use arbor_core::scope::tasks;
use arbor_core::store::{Store, StoreOptions};
use arbor_core::{Entity, Task};
use serde_json::json;
use tokio::time::timeout;

const ZONE: &str = "tasks";

struct Device {
    store: Store,
    prefs: Arc<MemoryPreferences>,
    replicator: Replicator,
}

fn device(remote: &Arc<MemoryRemote>, page_size: usize) -> Device {
    let store = Store::in_memory(StoreOptions::default()).expect("store");
    let prefs = Arc::new(MemoryPreferences::new());
    let replicator = replicator(&store, remote, &prefs, page_size);
    Device {
        store,
        prefs,
        replicator,
    }
}

fn replicator(
    store: &Store,
    remote: &Arc<MemoryRemote>,
    prefs: &Arc<MemoryPreferences>,
    page_size: usize,
) -> Replicator {
    let remote: Arc<dyn RemoteDatabase> = remote.clone();
    let prefs: Arc<dyn Preferences> = prefs.clone();
    Replicator::new(
        store,
        remote,
        prefs,
        ReplicatorConfig {
            zone: ZONE.into(),
            page_size,
        },
    )
}

fn remote_task(cloud_id: &str, body: &str, parent: Option<&str>) -> RemoteRecord {
    let mut record = RemoteRecord::new(cloud_id, Task::RECORD_TYPE);
    record.fields.insert("body".into(), json!(body));
    record.fields.insert("parent".into(), json!(parent));
    record
}

async fn all_tasks(store: &Store) -> Vec<Task> {
    store.fetch(&tasks::unfiltered()).await.expect("fetch")
}

async fn by_cloud_id(store: &Store, cloud_id: &str) -> Task {
    store
        .pluck_by_cloud_id::<Task>(cloud_id)
        .await
        .expect("pluck")
        .unwrap_or_else(|| panic!("{cloud_id} not present locally"))
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn round_trip_preserves_mirrored_fields() {
    let remote = Arc::new(MemoryRemote::new());
    let a = device(&remote, 50);
    a.replicator.setup().await.expect("setup");

    let parent: Task = a
        .store
        .insert(&[field::body("groceries")], &tasks::active())
        .await
        .expect("parent");
    let child: Task = a
        .store
        .insert(&[field::body("milk")], &tasks::children_of(parent.id))
        .await
        .expect("child");
    let done: Task = a
        .store
        .insert(&[field::body("bread")], &tasks::completed())
        .await
        .expect("done");
    let gone: Task = a
        .store
        .insert(&[field::body("eggs")], &tasks::deleted())
        .await
        .expect("gone");

    let report = a.replicator.push_all().await.expect("push");
    assert_eq!(report.saved, 4);
    assert_eq!(report.created, 4);

    let b = device(&remote, 50);
    let pulled = b.replicator.pull().await.expect("pull");
    assert_eq!(pulled.upserted, 4);
    assert_eq!(pulled.unresolved_parents, 0);

    let originals: HashMap<String, Task> = all_tasks(&a.store)
        .await
        .into_iter()
        .map(|t| (t.cloud_id.clone(), t))
        .collect();
    let local_to_cloud: HashMap<i64, String> = all_tasks(&b.store)
        .await
        .into_iter()
        .map(|t| (t.id, t.cloud_id))
        .collect();
    for copy in all_tasks(&b.store).await {
        let original = &originals[&copy.cloud_id];
        assert_eq!(copy.body, original.body);
        assert_eq!(copy.completed_at_us, original.completed_at_us);
        assert_eq!(copy.deleted_at_us, original.deleted_at_us);
        let copy_parent = copy.parent_id.map(|p| local_to_cloud[&p].clone());
        let original_parent = original.parent_id.map(|p| {
            originals
                .values()
                .find(|t| t.id == p)
                .expect("parent")
                .cloud_id
                .clone()
        });
        assert_eq!(copy_parent, original_parent);
    }

    let copied_child = by_cloud_id(&b.store, &child.cloud_id).await;
    let copied_parent = by_cloud_id(&b.store, &parent.cloud_id).await;
    assert_eq!(copied_child.parent_id, Some(copied_parent.id));
    assert!(by_cloud_id(&b.store, &done.cloud_id).await.is_completed());
    assert!(by_cloud_id(&b.store, &gone.cloud_id).await.is_deleted());
}

#[tokio::test]
async fn crash_before_token_persisted_reapplies_without_duplicates() {
    let remote = Arc::new(MemoryRemote::new());
    let dev = device(&remote, 1);
    dev.replicator.setup().await.expect("setup");
    remote.put_record(ZONE, remote_task("r-1", "first", None));
    remote.put_record(ZONE, remote_task("r-2", "second", None));

    // First page applies, the second request fails mid-batch.
    remote.fail_changes_after(Some(1));
    let err = dev.replicator.pull().await.expect_err("injected failure");
    assert!(matches!(err, ReplicationError::Remote(RemoteError::Service(_))));
    assert_eq!(all_tasks(&dev.store).await.len(), 1);
    assert_eq!(dev.replicator.download().token().expect("token"), None);

    // Restart over the same store and preferences.
    remote.fail_changes_after(None);
    let restarted = replicator(&dev.store, &remote, &dev.prefs, 1);
    let report = restarted.pull().await.expect("pull");
    assert_eq!(report.upserted, 2);

    let bodies: Vec<String> = all_tasks(&dev.store)
        .await
        .into_iter()
        .map(|t| t.body)
        .collect();
    assert_eq!(bodies, ["first", "second"]);
    assert!(restarted.download().token().expect("token").is_some());

    let again = restarted.pull().await.expect("idle pull");
    assert_eq!(again.upserted, 0);
    assert_eq!(again.pages, 1);
}

#[tokio::test]
async fn children_listed_before_parents_are_linked() {
    let remote = Arc::new(MemoryRemote::new());
    let same_page = device(&remote, 10);
    let across_pages = device(&remote, 1);
    same_page.replicator.setup().await.expect("setup");
    remote.put_record(ZONE, remote_task("kid", "child", Some("mom")));
    remote.put_record(ZONE, remote_task("mom", "parent", None));

    for dev in [&same_page, &across_pages] {
        let report = dev.replicator.pull().await.expect("pull");
        assert_eq!(report.unresolved_parents, 0);
        let kid = by_cloud_id(&dev.store, "kid").await;
        let mom = by_cloud_id(&dev.store, "mom").await;
        assert_eq!(kid.parent_id, Some(mom.id));
    }
}

#[tokio::test]
async fn missing_parents_are_reported_and_left_unlinked() {
    let remote = Arc::new(MemoryRemote::new());
    let dev = device(&remote, 10);
    dev.replicator.setup().await.expect("setup");
    remote.put_record(ZONE, remote_task("kid", "child", Some("nobody")));

    let report = dev.replicator.pull().await.expect("pull");
    assert_eq!(report.unresolved_parents, 1);
    assert_eq!(by_cloud_id(&dev.store, "kid").await.parent_id, None);
}

#[tokio::test]
async fn remote_updates_and_deletions_apply_locally() {
    let remote = Arc::new(MemoryRemote::new());
    let dev = device(&remote, 10);
    dev.replicator.setup().await.expect("setup");
    remote.put_record(ZONE, remote_task("r-1", "draft", None));
    dev.replicator.pull().await.expect("pull");
    let local_id = by_cloud_id(&dev.store, "r-1").await.id;

    let mut edited = remote_task("r-1", "final", None);
    edited.fields.insert("completedAt".into(), json!(42));
    remote.put_record(ZONE, edited);
    dev.replicator.pull().await.expect("pull edit");
    let task = by_cloud_id(&dev.store, "r-1").await;
    assert_eq!(task.id, local_id);
    assert_eq!(task.body, "final");
    assert_eq!(task.completed_at_us, Some(42));

    remote.remove_record(ZONE, "r-1");
    let report = dev.replicator.pull().await.expect("pull delete");
    assert_eq!(report.deleted, 1);
    assert!(all_tasks(&dev.store).await.is_empty());
}

#[tokio::test]
async fn malformed_records_are_skipped() {
    let remote = Arc::new(MemoryRemote::new());
    let dev = device(&remote, 10);
    dev.replicator.setup().await.expect("setup");
    let mut broken = remote_task("bad", "x", None);
    broken.fields.insert("deletedAt".into(), json!("soon"));
    remote.put_record(ZONE, broken);
    remote.put_record(ZONE, remote_task("good", "y", None));

    let report = dev.replicator.pull().await.expect("pull");
    assert_eq!(report.malformed, 1);
    assert_eq!(report.upserted, 1);
    assert_eq!(all_tasks(&dev.store).await.len(), 1);
}

#[tokio::test]
async fn upload_overwrites_existing_remote_record() {
    let remote = Arc::new(MemoryRemote::new());
    let dev = device(&remote, 10);
    dev.replicator.setup().await.expect("setup");
    let mut existing = remote_task("r-1", "remote text", None);
    existing.fields.insert("color".into(), json!("blue"));
    remote.put_record(ZONE, existing);
    dev.replicator.pull().await.expect("pull");

    let task = by_cloud_id(&dev.store, "r-1").await;
    dev.store
        .update::<Task>(task.id, &[field::body("local text")], false, &tasks::all())
        .await
        .expect("edit");

    let report = dev.replicator.push(&[task.id]).await.expect("push");
    assert_eq!(report.saved, 1);
    assert_eq!(report.created, 0);
    let record = remote.record(ZONE, "r-1").expect("remote record");
    assert_eq!(record.fields["body"], json!("local text"));
    assert_eq!(record.fields["color"], json!("blue"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_uploads_local_changes_but_not_downloads() {
    let remote = Arc::new(MemoryRemote::new());
    let dev = device(&remote, 10);
    dev.replicator.setup().await.expect("setup");
    dev.replicator.start().await;
    assert!(dev.replicator.is_running().await);

    let task: Task = dev
        .store
        .insert(&[field::body("typed locally")], &tasks::active())
        .await
        .expect("insert");
    eventually("local insert to reach the remote", || {
        remote.record(ZONE, &task.cloud_id).is_some()
    })
    .await;

    remote.put_record(ZONE, remote_task("from-elsewhere", "synced in", None));
    let saves_before = remote.calls().save;
    dev.replicator.pull().await.expect("pull");
    tokio::time::sleep(Duration::from_millis(50)).await;
    dev.replicator.stop().await;

    assert!(!dev.replicator.is_running().await);
    assert_eq!(remote.calls().save, saves_before);
    assert_eq!(dev.store.bus().subscriber_count(Task::KIND), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_retries_after_transient_save_failure() {
    let remote = Arc::new(MemoryRemote::new());
    let dev = device(&remote, 10);
    dev.replicator.setup().await.expect("setup");
    remote.fail_saves(1);
    dev.replicator.start().await;

    let task: Task = dev
        .store
        .insert(&[field::body("flaky network")], &tasks::active())
        .await
        .expect("insert");
    eventually("the retried upload to reach the remote", || {
        remote.record(ZONE, &task.cloud_id).is_some()
    })
    .await;
    dev.replicator.stop().await;

    assert_eq!(remote.calls().save, 2);
    assert!(dev.replicator.upload().gate().pending_uploads().is_empty());
}

#[tokio::test]
async fn account_gate_queues_until_available() {
    let remote = Arc::new(MemoryRemote::new());
    let dev = device(&remote, 10);
    dev.replicator.setup().await.expect("setup");
    let first: Task = dev
        .store
        .insert(&[field::body("one")], &tasks::active())
        .await
        .expect("one");
    let second: Task = dev
        .store
        .insert(&[field::body("two")], &tasks::active())
        .await
        .expect("two");

    remote.set_authenticated(false);
    let err = dev.replicator.push(&[first.id]).await.expect_err("offline");
    assert!(matches!(err, ReplicationError::NotAuthenticated));
    assert!(dev.replicator.upload().gate().is_paused());

    let fetches = remote.calls().fetch;
    let report = dev.replicator.push(&[second.id]).await.expect("deferred");
    assert_eq!(report.deferred, 1);
    assert_eq!(remote.calls().fetch, fetches);
    assert_eq!(
        dev.replicator.upload().gate().pending_uploads(),
        vec![first.id, second.id]
    );

    remote.set_authenticated(true);
    let flushed = dev.replicator.notify_account_available().await.expect("flush");
    assert_eq!(flushed.saved, 2);
    assert!(!dev.replicator.upload().gate().is_paused());
    assert!(dev.replicator.upload().gate().pending_uploads().is_empty());
    assert_eq!(remote.records(ZONE).len(), 2);
}

#[tokio::test]
async fn purge_deletes_remote_records() {
    let clock = Arc::new(ManualClock::new(1_000_000));
    let store = Store::in_memory(StoreOptions::default().with_clock(clock.clone())).expect("store");
    let remote = Arc::new(MemoryRemote::new());
    let prefs = Arc::new(MemoryPreferences::new());
    let replicator = replicator(&store, &remote, &prefs, 10);
    replicator.setup().await.expect("setup");

    let kept: Task = store
        .insert(&[field::body("keep")], &tasks::active())
        .await
        .expect("kept");
    let trashed: Task = store
        .insert(&[field::body("trash")], &tasks::deleted())
        .await
        .expect("trashed");
    replicator.push_all().await.expect("push");
    assert_eq!(remote.records(ZONE).len(), 2);

    clock.advance(2 * 86_400 * 1_000_000);
    let purged = replicator
        .purge_soft_deleted(Duration::from_secs(86_400))
        .await
        .expect("purge");
    assert_eq!(purged.len(), 1);
    assert_eq!(purged[0].cloud_id, trashed.cloud_id);
    assert!(remote.record(ZONE, &trashed.cloud_id).is_none());
    assert!(remote.record(ZONE, &kept.cloud_id).is_some());
}
