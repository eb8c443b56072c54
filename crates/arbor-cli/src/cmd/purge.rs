//! `arbor purge`: empty the trash.

use std::io::Write;
use std::time::Duration;

use arbor_core::config::StoreConfig;
use arbor_core::{Store, Task};
use clap::Args;

use crate::output::{self, OutputMode};

#[derive(Args, Debug)]
pub struct PurgeArgs {
    /// Only purge tasks deleted more than this many days ago. Defaults to
    /// `store.retention_days`.
    #[arg(long)]
    pub older_than_days: Option<u32>,
}

pub async fn run_purge(
    args: &PurgeArgs,
    store: &Store,
    config: &StoreConfig,
    mode: OutputMode,
    w: &mut dyn Write,
) -> anyhow::Result<()> {
    let window = args.older_than_days.map_or_else(
        || config.retention(),
        |days| Duration::from_secs(u64::from(days) * 86_400),
    );
    let purged = store.purge_soft_deleted::<Task>(window).await?;
    if mode.is_json() {
        return output::render_json(w, &purged);
    }
    writeln!(w, "purged {} task(s)", purged.len())?;
    Ok(())
}
