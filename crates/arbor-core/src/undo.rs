//! Linear undo/redo history over reversible operations.
//!
//! The history is a list of [`Reversible`] entries plus an undo level: 0 at
//! the head, `n` after `n` undos. Recording while the level is non-zero
//! discards the undone tail first. The only output is the pair of
//! [`Capabilities`] flags, broadcast on a `watch` channel after every
//! change.
//!
//! All operations take one async lock for their full duration, including
//! the awaited action. An action must therefore not call back into the
//! same history.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tracing::{debug, warn};

use crate::error::ErrorCode;
use crate::model::{Assignment, Entity, FieldValue, RecordId, Task};
use crate::scope::tasks;
use crate::store::Store;

/// Error type returned by actions.
pub type ActionError = Box<dyn std::error::Error + Send + Sync>;

pub type ActionResult = Result<(), ActionError>;

/// A pair of mutually inverse operations.
///
/// Calling `backward` after `forward` (or the reverse) must restore
/// equivalent observable state. The history relies on it but cannot check.
#[async_trait]
pub trait Reversible: Send + Sync {
    fn label(&self) -> &str;

    async fn forward(&self) -> ActionResult;

    async fn backward(&self) -> ActionResult;
}

/// One direction of a [`Bijection`].
#[async_trait]
pub trait Action: Send + Sync {
    async fn run(&self) -> ActionResult;
}

type BoxFuture = Pin<Box<dyn Future<Output = ActionResult> + Send>>;

struct FnAction<F>(F);

#[async_trait]
impl<F> Action for FnAction<F>
where
    F: Fn() -> BoxFuture + Send + Sync,
{
    async fn run(&self) -> ActionResult {
        (self.0)().await
    }
}

/// Forward and backward actions under one label.
#[derive(Clone)]
pub struct Bijection {
    label: String,
    forward: Arc<dyn Action>,
    backward: Arc<dyn Action>,
}

impl fmt::Debug for Bijection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bijection")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl Bijection {
    #[must_use]
    pub fn new(
        label: impl Into<String>,
        forward: Arc<dyn Action>,
        backward: Arc<dyn Action>,
    ) -> Self {
        Self {
            label: label.into(),
            forward,
            backward,
        }
    }

    /// Build from two closures returning futures.
    #[must_use]
    pub fn from_fns<F, B, FF, BF>(label: impl Into<String>, forward: F, backward: B) -> Self
    where
        F: Fn() -> FF + Send + Sync + 'static,
        B: Fn() -> BF + Send + Sync + 'static,
        FF: Future<Output = ActionResult> + Send + 'static,
        BF: Future<Output = ActionResult> + Send + 'static,
    {
        Self::new(
            label,
            Arc::new(FnAction(move || -> BoxFuture { Box::pin(forward()) })),
            Arc::new(FnAction(move || -> BoxFuture { Box::pin(backward()) })),
        )
    }

    /// Task edits applied to `store`, e.g. a captured "before" as
    /// `backward` and the requested change as `forward`.
    #[must_use]
    pub fn edit(
        label: impl Into<String>,
        store: &Store,
        forward: TaskEdit,
        backward: TaskEdit,
    ) -> Self {
        Self::new(
            label,
            Arc::new(EditAction {
                store: store.clone(),
                edit: forward,
            }),
            Arc::new(EditAction {
                store: store.clone(),
                edit: backward,
            }),
        )
    }
}

#[async_trait]
impl Reversible for Bijection {
    fn label(&self) -> &str {
        &self.label
    }

    async fn forward(&self) -> ActionResult {
        self.forward.run().await
    }

    async fn backward(&self) -> ActionResult {
        self.backward.run().await
    }
}

// ---------------------------------------------------------------------------
// Task edits
// ---------------------------------------------------------------------------

/// Serializable description of a task write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TaskEdit {
    /// Apply `assignments` to every id in `ids`.
    Assign {
        ids: Vec<RecordId>,
        assignments: Vec<Assignment>,
    },
    /// Apply edits in order.
    Batch { edits: Vec<TaskEdit> },
}

impl TaskEdit {
    #[must_use]
    pub fn assign(ids: Vec<RecordId>, assignments: Vec<Assignment>) -> Self {
        Self::Assign { ids, assignments }
    }

    /// Record the current values of `columns` for each of `ids`, as an edit
    /// that restores them. Ids that do not exist are skipped.
    ///
    /// # Errors
    ///
    /// Returns the store error from the read, or an error for a column whose
    /// stored value has no [`FieldValue`] form.
    pub async fn capture(
        store: &Store,
        ids: &[RecordId],
        columns: &[&str],
    ) -> Result<Self, ActionError> {
        let rows: Vec<Task> = store.fetch_ids(&tasks::unfiltered(), ids).await?;
        let mut edits = Vec::with_capacity(rows.len());
        for row in rows {
            let mut assignments = Vec::with_capacity(columns.len());
            for column in columns {
                let value = match row.column(column) {
                    Some(rusqlite::types::Value::Null) => FieldValue::Null,
                    Some(rusqlite::types::Value::Integer(v)) => FieldValue::Integer(v),
                    Some(rusqlite::types::Value::Text(s)) => FieldValue::Text(s),
                    other => {
                        return Err(format!("cannot capture column {column}: {other:?}").into());
                    }
                };
                assignments.push(Assignment::new(*column, value));
            }
            edits.push(Self::assign(vec![row.id], assignments));
        }
        Ok(Self::Batch { edits })
    }

    async fn apply(&self, store: &Store) -> ActionResult {
        let mut pending = vec![self];
        // Depth-first, preserving order.
        while let Some(edit) = pending.pop() {
            match edit {
                Self::Assign { ids, assignments } => {
                    store
                        .update_ids(ids, assignments, &tasks::unfiltered())
                        .await?;
                }
                Self::Batch { edits } => pending.extend(edits.iter().rev()),
            }
        }
        Ok(())
    }
}

struct EditAction {
    store: Store,
    edit: TaskEdit,
}

#[async_trait]
impl Action for EditAction {
    async fn run(&self) -> ActionResult {
        self.edit.apply(&self.store).await
    }
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Oldest entries are dropped beyond this many. `None` is unbounded.
    pub max_depth: Option<usize>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_depth: Some(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Capabilities {
    pub can_undo: bool,
    pub can_redo: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("undo action '{label}' failed: {source}")]
    Undo {
        label: String,
        #[source]
        source: ActionError,
    },

    #[error("redo action '{label}' failed: {source}")]
    Redo {
        label: String,
        #[source]
        source: ActionError,
    },

    #[error("action '{label}' failed: {source}")]
    Perform {
        label: String,
        #[source]
        source: ActionError,
    },
}

impl HistoryError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::UndoActionFailed
    }
}

#[derive(Default)]
struct HistoryState {
    entries: VecDeque<Arc<dyn Reversible>>,
    undo_level: usize,
}

impl HistoryState {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            can_undo: self.undo_level < self.entries.len(),
            can_redo: self.undo_level > 0,
        }
    }
}

pub struct History {
    state: Mutex<HistoryState>,
    capabilities: watch::Sender<Capabilities>,
    config: HistoryConfig,
}

impl fmt::Debug for History {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("History")
            .field("config", &self.config)
            .field("capabilities", &*self.capabilities.borrow())
            .finish_non_exhaustive()
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(HistoryConfig::default())
    }
}

impl History {
    #[must_use]
    pub fn new(config: HistoryConfig) -> Self {
        let (capabilities, _) = watch::channel(Capabilities::default());
        Self {
            state: Mutex::new(HistoryState::default()),
            capabilities,
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> HistoryConfig {
        self.config
    }

    /// Receiver of the capability flags; starts with the current value.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Capabilities> {
        self.capabilities.subscribe()
    }

    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        *self.capabilities.borrow()
    }

    pub async fn undo_level(&self) -> usize {
        self.state.lock().await.undo_level
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Append an already-applied operation, discarding any undone tail.
    pub async fn record(&self, op: impl Reversible + 'static) {
        let mut state = self.state.lock().await;
        self.push(&mut state, Arc::new(op));
    }

    /// Run `op.forward()` and record it on success.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Perform`]; nothing is recorded.
    pub async fn perform(&self, op: impl Reversible + 'static) -> Result<(), HistoryError> {
        let mut state = self.state.lock().await;
        op.forward().await.map_err(|source| HistoryError::Perform {
            label: op.label().to_string(),
            source,
        })?;
        self.push(&mut state, Arc::new(op));
        Ok(())
    }

    /// Undo the most recent not-yet-undone entry. Returns `false` when there
    /// is nothing to undo.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Undo`] if the backward action fails; the undo
    /// level is unchanged.
    pub async fn undo(&self) -> Result<bool, HistoryError> {
        let mut state = self.state.lock().await;
        let len = state.entries.len();
        if state.undo_level >= len {
            return Ok(false);
        }
        let entry = Arc::clone(&state.entries[len - 1 - state.undo_level]);
        if let Err(source) = entry.backward().await {
            warn!(label = entry.label(), error = %source, "undo failed");
            return Err(HistoryError::Undo {
                label: entry.label().to_string(),
                source,
            });
        }
        state.undo_level += 1;
        debug!(label = entry.label(), undo_level = state.undo_level, "undone");
        self.broadcast(&state);
        Ok(true)
    }

    /// Redo the most recently undone entry. Returns `false` when there is
    /// nothing to redo.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::Redo`] if the forward action fails; the undo
    /// level is unchanged.
    pub async fn redo(&self) -> Result<bool, HistoryError> {
        let mut state = self.state.lock().await;
        if state.undo_level == 0 {
            return Ok(false);
        }
        let entry = Arc::clone(&state.entries[state.entries.len() - state.undo_level]);
        if let Err(source) = entry.forward().await {
            warn!(label = entry.label(), error = %source, "redo failed");
            return Err(HistoryError::Redo {
                label: entry.label().to_string(),
                source,
            });
        }
        state.undo_level -= 1;
        debug!(label = entry.label(), undo_level = state.undo_level, "redone");
        self.broadcast(&state);
        Ok(true)
    }

    /// Drop every entry.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.entries.clear();
        state.undo_level = 0;
        self.broadcast(&state);
    }

    fn push(&self, state: &mut HistoryState, op: Arc<dyn Reversible>) {
        if state.undo_level > 0 {
            let keep = state.entries.len() - state.undo_level;
            state.entries.truncate(keep);
            state.undo_level = 0;
        }
        debug!(label = op.label(), "recorded");
        state.entries.push_back(op);
        if let Some(max) = self.config.max_depth {
            while state.entries.len() > max {
                state.entries.pop_front();
            }
        }
        self.broadcast(state);
    }

    fn broadcast(&self, state: &HistoryState) {
        self.capabilities.send_replace(state.capabilities());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn counter_op(counter: &Arc<AtomicI64>, delta: i64) -> Bijection {
        let up = Arc::clone(counter);
        let down = Arc::clone(counter);
        Bijection::from_fns(
            format!("add {delta}"),
            move || {
                let c = Arc::clone(&up);
                async move {
                    c.fetch_add(delta, Ordering::SeqCst);
                    Ok(())
                }
            },
            move || {
                let c = Arc::clone(&down);
                async move {
                    c.fetch_sub(delta, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
    }

    #[tokio::test]
    async fn undo_redo_walks_the_stack() {
        let value = Arc::new(AtomicI64::new(0));
        let history = History::default();

        history.perform(counter_op(&value, 1)).await.expect("perform");
        history.perform(counter_op(&value, 10)).await.expect("perform");
        assert_eq!(value.load(Ordering::SeqCst), 11);

        assert!(history.undo().await.expect("undo"));
        assert_eq!(value.load(Ordering::SeqCst), 1);
        assert!(history.undo().await.expect("undo"));
        assert_eq!(value.load(Ordering::SeqCst), 0);
        assert!(!history.undo().await.expect("undo past bottom"));
        assert_eq!(value.load(Ordering::SeqCst), 0);

        assert!(history.redo().await.expect("redo"));
        assert_eq!(value.load(Ordering::SeqCst), 1);
        assert_eq!(
            history.capabilities(),
            Capabilities {
                can_undo: true,
                can_redo: true
            }
        );
    }

    #[tokio::test]
    async fn recording_mid_stack_truncates() {
        let value = Arc::new(AtomicI64::new(0));
        let history = History::default();
        for delta in [1, 2, 4] {
            history.perform(counter_op(&value, delta)).await.expect("perform");
        }
        history.undo().await.expect("undo");
        history.undo().await.expect("undo");
        assert_eq!(history.undo_level().await, 2);

        history.perform(counter_op(&value, 100)).await.expect("perform");
        assert_eq!(history.len().await, 2);
        assert_eq!(history.undo_level().await, 0);
        assert!(!history.redo().await.expect("redo"));
        assert_eq!(value.load(Ordering::SeqCst), 101);
    }

    #[tokio::test]
    async fn failed_action_leaves_level_unchanged() {
        let history = History::default();
        history
            .record(Bijection::from_fns(
                "flaky",
                || async { Ok(()) },
                || async { Err::<(), ActionError>("boom".into()) },
            ))
            .await;

        let err = history.undo().await.expect_err("undo fails");
        assert!(matches!(err, HistoryError::Undo { ref label, .. } if label == "flaky"));
        assert_eq!(err.code(), ErrorCode::UndoActionFailed);
        assert_eq!(history.undo_level().await, 0);
        assert!(history.capabilities().can_undo);
    }

    #[tokio::test]
    async fn depth_limit_drops_oldest() {
        let value = Arc::new(AtomicI64::new(0));
        let history = History::new(HistoryConfig { max_depth: Some(2) });
        for delta in [1, 2, 4] {
            history.perform(counter_op(&value, delta)).await.expect("perform");
        }
        assert_eq!(history.len().await, 2);
        history.undo().await.expect("undo");
        history.undo().await.expect("undo");
        assert!(!history.undo().await.expect("bottom"));
        assert_eq!(value.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn capability_flags_are_broadcast() {
        let value = Arc::new(AtomicI64::new(0));
        let history = History::default();
        let mut rx = history.subscribe();
        assert_eq!(*rx.borrow_and_update(), Capabilities::default());

        history.perform(counter_op(&value, 1)).await.expect("perform");
        assert!(rx.has_changed().expect("sender alive"));
        assert_eq!(
            *rx.borrow_and_update(),
            Capabilities {
                can_undo: true,
                can_redo: false
            }
        );

        history.undo().await.expect("undo");
        assert_eq!(
            *rx.borrow_and_update(),
            Capabilities {
                can_undo: false,
                can_redo: true
            }
        );
    }

    #[test]
    fn task_edit_serializes_with_tag() {
        let edit = TaskEdit::Batch {
            edits: vec![TaskEdit::assign(vec![1, 2], vec![Assignment::null("completed_at_us")])],
        };
        let json = serde_json::to_value(&edit).expect("serialize");
        assert_eq!(json["op"], "batch");
        assert_eq!(json["edits"][0]["op"], "assign");
        let back: TaskEdit = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, edit);
    }
}
