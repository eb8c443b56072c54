//! `arbor show`: one task with its ancestry.

use std::io::Write;

use arbor_core::{RecordId, Store, Task};
use clap::Args;
use serde::Serialize;

use super::require_task;
use crate::output::{self, OutputMode};

#[derive(Args, Debug)]
pub struct ShowArgs {
    pub id: RecordId,
}

#[derive(Serialize)]
struct Shown<'a> {
    task: &'a Task,
    ancestors: &'a [Task],
}

pub async fn run_show(
    args: &ShowArgs,
    store: &Store,
    mode: OutputMode,
    w: &mut dyn Write,
) -> anyhow::Result<()> {
    let task = require_task(store, args.id).await?;
    let ancestors: Vec<Task> = store.ancestors(task.id).await?;

    if mode.is_json() {
        return output::render_json(
            w,
            &Shown {
                task: &task,
                ancestors: &ancestors,
            },
        );
    }

    output::task_line(w, &task, 0)?;
    output::kv(w, "cloud id", &task.cloud_id)?;
    output::kv(w, "created", output::timestamp(task.created_at_us))?;
    output::kv(w, "updated", output::timestamp(task.updated_at_us))?;
    if let Some(at) = task.completed_at_us {
        output::kv(w, "completed", output::timestamp(at))?;
    }
    if let Some(at) = task.deleted_at_us {
        output::kv(w, "deleted", output::timestamp(at))?;
    }
    if !ancestors.is_empty() {
        let path: Vec<String> = ancestors.iter().rev().map(|a| format!("#{}", a.id)).collect();
        output::kv(w, "path", path.join(" > "))?;
    }
    Ok(())
}
