//! `arbor count`

use std::io::Write;

use arbor_core::Store;
use clap::Args;

use super::ScopeArg;
use crate::output::{self, OutputMode};

#[derive(Args, Debug)]
pub struct CountArgs {
    #[arg(long, value_enum, default_value_t)]
    pub scope: ScopeArg,
}

pub async fn run_count(
    args: &CountArgs,
    store: &Store,
    mode: OutputMode,
    w: &mut dyn Write,
) -> anyhow::Result<()> {
    let scope = args.scope.scope();
    let count = store.count(&scope).await?;
    if mode.is_json() {
        output::render_json(w, &serde_json::json!({ "scope": scope.name(), "count": count }))
    } else {
        writeln!(w, "{count}")?;
        Ok(())
    }
}
