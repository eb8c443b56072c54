//! arbor-core library.
//!
//! Local-first task storage: a SQLite-backed [`store::Store`], composable
//! [`scope::Scope`]s, a per-kind [`bus::ChangeBus`], live
//! [`monitor::QueryMonitor`]s, and an undo/redo [`undo::History`].
//!
//! # Conventions
//!
//! - **Errors**: typed `thiserror` enums per layer; `anyhow` only for config
//!   loading.
//! - **Logging**: `tracing` macros (`info!`, `warn!`, `debug!`, `trace!`).
//! - **Time**: microseconds since the Unix epoch as `i64`, from a [`clock::Clock`].

pub mod bus;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod monitor;
pub mod prefs;
pub mod scope;
pub mod store;
pub mod undo;

pub use error::{ErrorCode, StoreError};
pub use model::{Assignment, Entity, EntityKind, FieldValue, RecordId, Task};
pub use scope::Scope;
pub use store::{Store, StoreOptions};
