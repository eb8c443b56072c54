use std::sync::{Arc, Mutex};
use std::time::Duration;

use arbor_core::model::task::field;
use arbor_core::monitor::{ListProjection, Projection, QueryMonitor};
use arbor_core::scope::tasks;
use arbor_core::store::{Store, StoreOptions};
use arbor_core::{Entity, RecordId, Task};
use tokio::time::timeout;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Upsert(Vec<RecordId>),
    Remove(Vec<RecordId>),
}

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<Call>>,
}

impl Recorder {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("lock").clone()
    }
}

impl Projection<Task> for Recorder {
    fn upsert(&self, records: Vec<Task>) {
        let ids = records.iter().map(|t| t.id).collect();
        self.calls.lock().expect("lock").push(Call::Upsert(ids));
    }

    fn remove(&self, ids: &[RecordId]) {
        self.calls.lock().expect("lock").push(Call::Remove(ids.to_vec()));
    }
}

async fn wait_until(list: &ListProjection<Task>, pred: impl Fn(&[RecordId]) -> bool) {
    let mut rx = list.watch();
    timeout(Duration::from_secs(5), async {
        loop {
            if pred(&list.ids()) {
                return;
            }
            rx.changed().await.expect("projection alive");
        }
    })
    .await
    .expect("projection converged");
}

async fn wait_for_call(recorder: &Recorder, wanted: &Call) {
    timeout(Duration::from_secs(5), async {
        while !recorder.calls().contains(wanted) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("call observed");
}

#[tokio::test]
async fn completing_parent_recursively_removes_both_from_active() {
    let store = Store::in_memory(StoreOptions::default()).expect("store");
    let recorder = Arc::new(Recorder::default());
    let list = Arc::new(ListProjection::new(tasks::active()));

    let mut monitor = QueryMonitor::new(store.clone());
    monitor
        .keep_synchronised(recorder.clone())
        .await
        .expect("register recorder");
    monitor
        .keep_synchronised(list.clone())
        .await
        .expect("register list");
    monitor
        .begin_monitoring(tasks::active(), false)
        .await
        .expect("begin");

    let a: Task = store
        .insert(&[field::body("x")], &tasks::active())
        .await
        .expect("a");
    let b: Task = store
        .insert(&[field::parent(Some(a.id))], &tasks::active())
        .await
        .expect("b");
    wait_until(&list, |ids| ids == [a.id, b.id]).await;

    store
        .update::<Task>(a.id, &[field::completed_now()], true, &tasks::all())
        .await
        .expect("complete");

    wait_until(&list, <[RecordId]>::is_empty).await;
    wait_for_call(&recorder, &Call::Remove(vec![a.id, b.id])).await;

    let both: Vec<Task> = store
        .fetch_ids(&tasks::unfiltered(), &[a.id, b.id])
        .await
        .expect("fetch");
    assert!(both.iter().all(Task::is_completed));

    monitor.stop_monitoring().await;
}

#[tokio::test]
async fn recursive_monitor_sees_descendants_reenter() {
    let store = Store::in_memory(StoreOptions::default()).expect("store");
    let root: Task = store.insert(&[], &tasks::active()).await.expect("root");
    let child: Task = store
        .insert(&[], &tasks::children_of(root.id))
        .await
        .expect("child");
    store
        .update::<Task>(root.id, &[field::completed_now()], true, &tasks::all())
        .await
        .expect("complete subtree");

    let list = Arc::new(ListProjection::new(tasks::active()));
    let mut monitor = QueryMonitor::new(store.clone());
    monitor
        .begin_monitoring(tasks::active(), true)
        .await
        .expect("begin");
    monitor
        .keep_synchronised(list.clone())
        .await
        .expect("register");
    assert!(list.is_empty());

    // Reopening the subtree touches every row in one event; the recursive
    // monitor resolves the closure and brings both back.
    store
        .update::<Task>(root.id, &[field::uncompleted()], true, &tasks::all())
        .await
        .expect("reopen subtree");
    wait_until(&list, |ids| ids == [root.id, child.id]).await;

    monitor.stop_monitoring().await;
}

#[tokio::test]
async fn keep_synchronised_seeds_current_contents() {
    let store = Store::in_memory(StoreOptions::default()).expect("store");
    let existing: Task = store.insert(&[], &tasks::active()).await.expect("existing");
    let _done: Task = store.insert(&[], &tasks::completed()).await.expect("done");

    let mut monitor = QueryMonitor::new(store.clone());
    monitor
        .begin_monitoring(tasks::active(), false)
        .await
        .expect("begin");

    let list = Arc::new(ListProjection::new(tasks::active()));
    monitor
        .keep_synchronised(list.clone())
        .await
        .expect("register");
    assert_eq!(list.ids(), vec![existing.id]);

    monitor.stop_monitoring().await;
}

#[tokio::test]
async fn stop_monitoring_releases_the_subscription() {
    let store = Store::in_memory(StoreOptions::default()).expect("store");
    let mut monitor = QueryMonitor::<Task>::new(store.clone());
    monitor
        .begin_monitoring(tasks::all(), false)
        .await
        .expect("begin");
    assert!(monitor.is_monitoring());
    assert_eq!(store.bus().subscriber_count(Task::KIND), 1);

    monitor.stop_monitoring().await;
    assert!(!monitor.is_monitoring());
    assert_eq!(store.bus().subscriber_count(Task::KIND), 0);
}

#[tokio::test]
async fn deregistered_projection_stops_receiving() {
    let store = Store::in_memory(StoreOptions::default()).expect("store");
    let list = Arc::new(ListProjection::new(tasks::all()));
    let handle: Arc<dyn Projection<Task>> = list.clone();
    let witness = Arc::new(ListProjection::new(tasks::all()));

    let mut monitor = QueryMonitor::new(store.clone());
    monitor
        .keep_synchronised(Arc::clone(&handle))
        .await
        .expect("register");
    monitor
        .keep_synchronised(witness.clone())
        .await
        .expect("register witness");
    monitor
        .begin_monitoring(tasks::all(), false)
        .await
        .expect("begin");

    assert!(monitor.deregister(&handle));
    let t: Task = store.insert(&[], &tasks::all()).await.expect("insert");
    wait_until(&witness, |ids| ids == [t.id]).await;
    assert!(list.is_empty());

    monitor.stop_monitoring().await;
}
