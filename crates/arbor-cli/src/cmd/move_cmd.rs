//! `arbor move`: reparent a task.

use std::io::Write;

use arbor_core::model::task::field;
use arbor_core::scope::tasks;
use arbor_core::{RecordId, Store};
use clap::Args;

use crate::output::{self, OutputMode};

#[derive(Args, Debug)]
pub struct MoveArgs {
    pub id: RecordId,

    /// New parent.
    #[arg(long, conflicts_with = "detach", required_unless_present = "detach")]
    pub to: Option<RecordId>,

    /// Detach from any parent.
    #[arg(long)]
    pub detach: bool,
}

pub async fn run_move(
    args: &MoveArgs,
    store: &Store,
    mode: OutputMode,
    w: &mut dyn Write,
) -> anyhow::Result<()> {
    let parent = if args.detach { None } else { args.to };
    store
        .update(args.id, &[field::parent(parent)], false, &tasks::unfiltered())
        .await?;
    let target = parent.map_or_else(|| "the top level".to_string(), |p| format!("#{p}"));
    output::success(w, mode, &format!("moved #{} under {target}", args.id))
}
