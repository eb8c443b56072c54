//! `arbor done`, `arbor reopen`, `arbor delete` and `arbor restore`.
//!
//! State changes cascade to descendants unless `--only` is given. Each
//! command writes through the scope of tasks it applies to, so a subtree
//! completion leaves already-completed children with their original stamp.

use std::io::Write;

use arbor_core::model::task::field;
use arbor_core::scope::tasks;
use arbor_core::{Assignment, RecordId, Scope, Store, Task};
use clap::Args;

use super::require_task;
use crate::output::{self, OutputMode};

#[derive(Args, Debug)]
pub struct StatusArgs {
    pub id: RecordId,

    /// Leave descendants untouched.
    #[arg(long)]
    pub only: bool,
}

#[derive(Args, Debug)]
pub struct DeleteArgs {
    pub id: RecordId,

    /// Remove the row for good instead of moving it to the trash.
    /// Children are detached, not removed.
    #[arg(long)]
    pub hard: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Complete,
    Reopen,
    Trash,
    Restore,
}

impl Transition {
    fn verb(self) -> &'static str {
        match self {
            Self::Complete => "completed",
            Self::Reopen => "reopened",
            Self::Trash => "deleted",
            Self::Restore => "restored",
        }
    }

    fn write(self) -> (Assignment, Scope<Task>) {
        match self {
            Self::Complete => (field::completed_now(), tasks::active()),
            Self::Reopen => (field::uncompleted(), tasks::completed()),
            Self::Trash => (field::deleted_now(), tasks::all()),
            Self::Restore => (field::restored(), tasks::deleted()),
        }
    }
}

pub async fn run_transition(
    args: &StatusArgs,
    transition: Transition,
    store: &Store,
    mode: OutputMode,
    w: &mut dyn Write,
) -> anyhow::Result<()> {
    let (assignment, scope) = transition.write();
    let written = store
        .update(args.id, &[assignment], !args.only, &scope)
        .await?;

    if mode.is_json() {
        return output::render_json(
            w,
            &serde_json::json!({ "action": transition.verb(), "ids": written }),
        );
    }
    if written.is_empty() {
        writeln!(w, "#{} was already {}", args.id, transition.verb())?;
    } else {
        writeln!(w, "{} {} task(s)", transition.verb(), written.len())?;
    }
    Ok(())
}

pub async fn run_delete(
    args: &DeleteArgs,
    store: &Store,
    mode: OutputMode,
    w: &mut dyn Write,
) -> anyhow::Result<()> {
    if !args.hard {
        let status = StatusArgs {
            id: args.id,
            only: false,
        };
        return run_transition(&status, Transition::Trash, store, mode, w).await;
    }

    require_task(store, args.id).await?;
    store.delete::<Task>(&[args.id]).await?;
    output::success(w, mode, &format!("removed #{}", args.id))
}
