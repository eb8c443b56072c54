//! Subcommand implementations.
//!
//! Every handler writes to the supplied writer so it can be exercised
//! against an in-memory store.

pub mod add;
pub mod config;
pub mod count;
pub mod list;
pub mod move_cmd;
pub mod purge;
pub mod show;
pub mod status;

use arbor_core::scope::tasks;
use arbor_core::{RecordId, Scope, Store, StoreError, Task};
use clap::ValueEnum;

/// Built-in scopes selectable from the command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ScopeArg {
    #[default]
    Active,
    All,
    Completed,
    Deleted,
    Orphans,
}

impl ScopeArg {
    pub fn scope(self) -> Scope<Task> {
        match self {
            Self::Active => tasks::active(),
            Self::All => tasks::all(),
            Self::Completed => tasks::completed(),
            Self::Deleted => tasks::deleted(),
            Self::Orphans => tasks::orphans().compose(&tasks::all()),
        }
    }
}

/// Fetch `id` regardless of state, or fail with `NotFound`.
pub async fn require_task(store: &Store, id: RecordId) -> Result<Task, StoreError> {
    store
        .pluck(id, &tasks::unfiltered())
        .await?
        .ok_or(StoreError::NotFound {
            kind: <Task as arbor_core::Entity>::KIND,
            id,
        })
}
