//! `arbor list`: list tasks in a scope, optionally as a subtree.

use std::collections::HashMap;
use std::io::Write;

use arbor_core::{RecordId, Store, Task};
use clap::Args;

use super::{ScopeArg, require_task};
use crate::output::{self, OutputMode};

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Which tasks to show.
    #[arg(long, value_enum, default_value_t)]
    pub scope: ScopeArg,

    /// Only this task and its descendants, drawn as a tree.
    #[arg(long)]
    pub under: Option<RecordId>,
}

pub async fn run_list(
    args: &ListArgs,
    store: &Store,
    mode: OutputMode,
    w: &mut dyn Write,
) -> anyhow::Result<()> {
    let scope = args.scope.scope();
    let Some(root) = args.under else {
        let tasks = store.fetch(&scope).await?;
        return output::tasks(w, mode, &tasks);
    };

    require_task(store, root).await?;
    let subtree = store.fetch_recursive(root, &scope).await?;
    if mode.is_json() {
        return output::render_json(w, &subtree);
    }
    for (task, depth) in tree_order(&subtree, root) {
        output::task_line(w, task, depth)?;
    }
    Ok(())
}

/// Depth-first order of `tasks` from `root`, keeping sibling order.
/// Tasks whose parent was filtered out hang off the nearest shown level.
fn tree_order(tasks: &[Task], root: RecordId) -> Vec<(&Task, usize)> {
    let present: HashMap<RecordId, &Task> = tasks.iter().map(|t| (t.id, t)).collect();
    let mut children: HashMap<Option<RecordId>, Vec<&Task>> = HashMap::new();
    for task in tasks {
        let parent = task.parent_id.filter(|p| present.contains_key(p) && task.id != root);
        children.entry(parent).or_default().push(task);
    }

    let mut ordered = Vec::with_capacity(tasks.len());
    let mut stack: Vec<(&Task, usize)> = children
        .remove(&None)
        .unwrap_or_default()
        .into_iter()
        .rev()
        .map(|t| (t, 0))
        .collect();
    while let Some((task, depth)) = stack.pop() {
        ordered.push((task, depth));
        if let Some(kids) = children.remove(&Some(task.id)) {
            stack.extend(kids.into_iter().rev().map(|t| (t, depth + 1)));
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use arbor_core::model::task::field;
    use arbor_core::scope::tasks;
    use arbor_core::StoreOptions;

    use super::*;

    #[tokio::test]
    async fn subtree_renders_as_indented_tree() {
        let store = Store::in_memory(StoreOptions::default()).expect("store");
        let root: Task = store
            .insert(&[field::body("root")], &tasks::active())
            .await
            .expect("root");
        let kid: Task = store
            .insert(&[field::body("kid")], &tasks::children_of(root.id))
            .await
            .expect("kid");
        store
            .insert::<Task>(&[field::body("grandkid")], &tasks::children_of(kid.id))
            .await
            .expect("grandkid");
        store.insert::<Task>(&[field::body("elsewhere")], &tasks::active()).await.expect("other");

        let args = ListArgs {
            scope: ScopeArg::Active,
            under: Some(root.id),
        };
        let mut out = Vec::new();
        run_list(&args, &store, OutputMode::Human, &mut out).await.expect("list");
        let text = String::from_utf8(out).expect("utf8");
        assert_eq!(text, "#1 [ ] root\n  #2 [ ] kid\n    #3 [ ] grandkid\n");
    }

    #[tokio::test]
    async fn scope_filters_flat_listing() {
        let store = Store::in_memory(StoreOptions::default()).expect("store");
        store.insert::<Task>(&[field::body("open")], &tasks::active()).await.expect("open");
        store.insert::<Task>(&[field::body("closed")], &tasks::completed()).await.expect("closed");

        let args = ListArgs {
            scope: ScopeArg::Completed,
            under: None,
        };
        let mut out = Vec::new();
        run_list(&args, &store, OutputMode::Human, &mut out).await.expect("list");
        assert_eq!(String::from_utf8(out).expect("utf8"), "#2 [x] closed\n");
    }
}
