//! Two-way replication between an arbor store and a remote record
//! database.
//!
//! [`Replicator`] is the entry point: it provisions the zone once, pulls
//! the remote change feed into the store, and pushes local changes back as
//! the store announces them.

pub mod download;
pub mod error;
pub mod lock;
pub mod mapping;
pub mod memory;
pub mod remote;
pub mod replicator;
pub mod setup;
pub mod upload;

pub use error::{RemoteError, ReplicationError};
pub use mapping::CloudMirror;
pub use memory::MemoryRemote;
pub use remote::{ChangePage, ChangeToken, DeletedRecord, RemoteDatabase, RemoteRecord};
pub use replicator::{Replicator, ReplicatorConfig};
