use arbor_core::model::task::field;
use arbor_core::scope::tasks;
use arbor_core::store::{Store, StoreOptions};
use arbor_core::undo::{Bijection, History, HistoryConfig, TaskEdit};
use arbor_core::{RecordId, Task};

async fn seeded() -> (Store, Vec<RecordId>) {
    let store = Store::in_memory(StoreOptions::default()).expect("store");
    let a: Task = store
        .insert(&[field::body("a")], &tasks::active())
        .await
        .expect("a");
    let b: Task = store
        .insert(&[field::body("b")], &tasks::children_of(a.id))
        .await
        .expect("b");
    (store, vec![a.id, b.id])
}

async fn bodies(store: &Store, ids: &[RecordId]) -> Vec<String> {
    store
        .fetch_ids(&tasks::unfiltered(), ids)
        .await
        .expect("fetch")
        .into_iter()
        .map(|t| t.body)
        .collect()
}

#[tokio::test]
async fn captured_edit_undoes_and_redoes() {
    let (store, ids) = seeded().await;
    let history = History::new(HistoryConfig::default());

    let before = TaskEdit::capture(&store, &ids, &["completed_at_us"])
        .await
        .expect("capture");
    let complete = TaskEdit::assign(ids.clone(), vec![field::completed_at(Some(77))]);
    history
        .perform(Bijection::edit("complete", &store, complete, before))
        .await
        .expect("perform");
    assert_eq!(store.count(&tasks::completed()).await.expect("count"), 2);

    assert!(history.undo().await.expect("undo"));
    assert_eq!(store.count(&tasks::completed()).await.expect("count"), 0);
    assert_eq!(store.count(&tasks::active()).await.expect("count"), 2);

    assert!(history.redo().await.expect("redo"));
    let done: Vec<Task> = store.fetch(&tasks::completed()).await.expect("fetch");
    assert!(done.iter().all(|t| t.completed_at_us == Some(77)));

    assert!(history.undo().await.expect("undo"));
    assert!(!history.undo().await.expect("undo past bottom"));
    assert_eq!(store.count(&tasks::active()).await.expect("count"), 2);
}

#[tokio::test]
async fn per_row_values_are_restored() {
    let (store, ids) = seeded().await;
    let history = History::default();

    let before = TaskEdit::capture(&store, &ids, &["body"])
        .await
        .expect("capture");
    let rename = TaskEdit::assign(ids.clone(), vec![field::body("same")]);
    history
        .perform(Bijection::edit("rename", &store, rename, before))
        .await
        .expect("perform");
    assert_eq!(bodies(&store, &ids).await, vec!["same", "same"]);

    history.undo().await.expect("undo");
    assert_eq!(bodies(&store, &ids).await, vec!["a", "b"]);
}

#[tokio::test]
async fn edit_failure_keeps_history_position() {
    let (store, ids) = seeded().await;
    let history = History::default();

    let bad_backward = TaskEdit::assign(vec![ids[0]], vec![field::parent(Some(ids[1]))]);
    let forward = TaskEdit::assign(vec![ids[0]], vec![field::body("renamed")]);
    history
        .perform(Bijection::edit("bad", &store, forward, bad_backward))
        .await
        .expect("perform");

    assert!(history.undo().await.is_err());
    assert_eq!(history.undo_level().await, 0);
    assert!(history.capabilities().can_undo);
}
