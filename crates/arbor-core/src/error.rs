use std::fmt;
use std::path::PathBuf;

use crate::model::{EntityKind, RecordId};

/// Machine-readable error codes for agent-friendly decision making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    StoreUnavailable,
    ConfigParseError,
    RecordNotFound,
    MissingParent,
    CycleDetected,
    UnknownColumn,
    ReadOnlyColumn,
    QueryFailed,
    CorruptRow,
    PreferencesUnavailable,
    UndoActionFailed,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::StoreUnavailable => "E1001",
            Self::ConfigParseError => "E1002",
            Self::RecordNotFound => "E2001",
            Self::MissingParent => "E2002",
            Self::CycleDetected => "E2003",
            Self::UnknownColumn => "E2004",
            Self::ReadOnlyColumn => "E2005",
            Self::QueryFailed => "E3001",
            Self::CorruptRow => "E3002",
            Self::PreferencesUnavailable => "E5001",
            Self::UndoActionFailed => "E6001",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::StoreUnavailable => "Task store could not be opened",
            Self::ConfigParseError => "Config file parse error",
            Self::RecordNotFound => "Record not found",
            Self::MissingParent => "Parent record does not exist",
            Self::CycleDetected => "Parent change would create a cycle",
            Self::UnknownColumn => "Unknown column",
            Self::ReadOnlyColumn => "Column is managed by the store",
            Self::QueryFailed => "Store query failed",
            Self::CorruptRow => "Stored row does not match the expected shape",
            Self::PreferencesUnavailable => "Preference storage unavailable",
            Self::UndoActionFailed => "Undo/redo action failed",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators and agents.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::StoreUnavailable => Some("Check the store path and its directory permissions."),
            Self::ConfigParseError => Some("Fix syntax in .arbor/config.toml and retry."),
            Self::RecordNotFound | Self::UnknownColumn | Self::ReadOnlyColumn => None,
            Self::MissingParent => Some("Create the parent first or pick an existing one."),
            Self::CycleDetected => Some("A record cannot be moved under one of its descendants."),
            Self::QueryFailed => Some("Retry once. If persistent, check disk space and locks."),
            Self::CorruptRow => Some("The store schema is out of date or was edited externally."),
            Self::PreferencesUnavailable => Some("Check write permissions on the preferences file."),
            Self::UndoActionFailed => Some("The history was left unchanged; retry or record anew."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors surfaced by [`crate::store::Store`].
///
/// Query failures and mapping failures are kept apart so callers can tell
/// "the statement failed" from "a row came back in an unexpected shape".
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to open store at {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to create store directory {}: {source}", .path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("store migration failed: {0}")]
    Migration(#[source] rusqlite::Error),

    #[error("store schema v{found} is newer than this build supports (v{supported})")]
    SchemaTooNew { found: u32, supported: u32 },

    #[error("store query failed: {0}")]
    Query(#[source] rusqlite::Error),

    #[error("row mapping failed: {0}")]
    Mapping(#[source] rusqlite::Error),

    #[error("unknown column '{column}' on table {table}")]
    UnknownColumn { table: &'static str, column: String },

    #[error("column '{0}' is managed by the store and cannot be assigned")]
    ReadOnlyColumn(String),

    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: RecordId },

    #[error("{kind} parent {parent} does not exist")]
    MissingParent { kind: EntityKind, parent: RecordId },

    #[error("moving {kind} {id} under {proposed_parent} would create a cycle")]
    CycleDetected {
        kind: EntityKind,
        id: RecordId,
        proposed_parent: RecordId,
    },
}

impl StoreError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Open { .. }
            | Self::CreateDir { .. }
            | Self::Migration(_)
            | Self::SchemaTooNew { .. } => ErrorCode::StoreUnavailable,
            Self::Query(_) => ErrorCode::QueryFailed,
            Self::Mapping(_) => ErrorCode::CorruptRow,
            Self::UnknownColumn { .. } => ErrorCode::UnknownColumn,
            Self::ReadOnlyColumn(_) => ErrorCode::ReadOnlyColumn,
            Self::NotFound { .. } => ErrorCode::RecordNotFound,
            Self::MissingParent { .. } => ErrorCode::MissingParent,
            Self::CycleDetected { .. } => ErrorCode::CycleDetected,
        }
    }

    /// Returns `true` for errors caused by the stored data rather than the
    /// request (schema drift, unexpected column types).
    #[must_use]
    pub const fn is_integrity_error(&self) -> bool {
        matches!(self, Self::Mapping(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::InvalidColumnName(_)
            | rusqlite::Error::InvalidColumnIndex(_)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::IntegralValueOutOfRange(..) => Self::Mapping(err),
            other => Self::Query(other),
        }
    }
}
