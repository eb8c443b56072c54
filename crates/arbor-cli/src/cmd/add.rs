//! `arbor add`: create a task.

use std::io::Write;

use arbor_core::model::task::field;
use arbor_core::scope::tasks;
use arbor_core::{RecordId, Store, Task};
use clap::Args;

use crate::output::{self, OutputMode};

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Task text.
    pub body: String,

    /// Nest under this task.
    #[arg(long)]
    pub parent: Option<RecordId>,

    /// Record the task as already completed.
    #[arg(long)]
    pub done: bool,
}

pub async fn run_add(
    args: &AddArgs,
    store: &Store,
    mode: OutputMode,
    w: &mut dyn Write,
) -> anyhow::Result<()> {
    let mut scope = args.parent.map_or_else(tasks::active, tasks::children_of);
    if args.done {
        scope = scope.compose(&tasks::completed());
    }
    let task: Task = store.insert(&[field::body(args.body.as_str())], &scope).await?;

    if mode.is_json() {
        output::render_json(w, &task)
    } else {
        writeln!(w, "added #{}", task.id)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use arbor_core::StoreOptions;
    use clap::Parser;

    use super::*;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        args: AddArgs,
    }

    #[test]
    fn add_args_parse() {
        let w = Wrapper::parse_from(["test", "buy milk", "--parent", "3", "--done"]);
        assert_eq!(w.args.body, "buy milk");
        assert_eq!(w.args.parent, Some(3));
        assert!(w.args.done);
    }

    #[tokio::test]
    async fn adds_nested_completed_task() {
        let store = Store::in_memory(StoreOptions::default()).expect("store");
        let parent: Task = store.insert(&[], &tasks::active()).await.expect("parent");
        let args = AddArgs {
            body: "child".into(),
            parent: Some(parent.id),
            done: true,
        };
        let mut out = Vec::new();
        run_add(&args, &store, OutputMode::Json, &mut out).await.expect("add");

        let task: Task = serde_json::from_slice(&out).expect("json");
        assert_eq!(task.parent_id, Some(parent.id));
        assert!(task.is_completed());
    }

    #[tokio::test]
    async fn missing_parent_is_an_error() {
        let store = Store::in_memory(StoreOptions::default()).expect("store");
        let args = AddArgs {
            body: "orphan".into(),
            parent: Some(99),
            done: false,
        };
        let mut out = Vec::new();
        let err = run_add(&args, &store, OutputMode::Human, &mut out)
            .await
            .expect_err("missing parent");
        assert!(err.to_string().contains("99"), "{err}");
    }
}
