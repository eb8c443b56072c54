use arbor_core::ErrorCode;
use arbor_core::StoreError;
use arbor_core::prefs::PrefsError;

/// Provider error payload carried by [`RemoteError::Service`].
pub type ServiceError = Box<dyn std::error::Error + Send + Sync>;

/// Failures reported by a [`crate::remote::RemoteDatabase`].
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// The remote account is unavailable. Expected; retry once the account
    /// comes back.
    #[error("remote account is not available")]
    NotAuthenticated,

    /// Provider-specific failure; generally retryable with backoff.
    #[error("remote service error: {0}")]
    Service(#[source] ServiceError),

    /// The record does not exist remotely. On fetch this means "create".
    #[error("remote record '{0}' does not exist")]
    UnknownItem(String),

    #[error("remote error: {0}")]
    Other(String),
}

impl RemoteError {
    #[must_use]
    pub fn service(err: impl Into<ServiceError>) -> Self {
        Self::Service(err.into())
    }
}

/// Errors surfaced to replication callers.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    #[error("remote account is not available; replication paused")]
    NotAuthenticated,

    #[error(transparent)]
    Remote(RemoteError),

    #[error("local store error during replication: {0}")]
    Store(#[from] StoreError),

    #[error("replication state error: {0}")]
    Preferences(#[from] PrefsError),

    #[error("remote record '{record_id}' is malformed: {reason}")]
    Malformed { record_id: String, reason: String },
}

impl From<RemoteError> for ReplicationError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::NotAuthenticated => Self::NotAuthenticated,
            other => Self::Remote(other),
        }
    }
}

impl ReplicationError {
    /// Whether retrying later may succeed without intervention.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NotAuthenticated | Self::Remote(RemoteError::Service(_))
        )
    }

    /// Machine-readable code for the local side of the failure.
    #[must_use]
    pub const fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Store(err) => Some(err.code()),
            Self::Preferences(err) => Some(err.code()),
            Self::NotAuthenticated | Self::Remote(_) | Self::Malformed { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_authenticated_is_lifted() {
        let err = ReplicationError::from(RemoteError::NotAuthenticated);
        assert!(matches!(err, ReplicationError::NotAuthenticated));
        assert!(err.is_retryable());
    }

    #[test]
    fn service_errors_are_retryable_others_are_not() {
        assert!(ReplicationError::from(RemoteError::service("throttled")).is_retryable());
        assert!(!ReplicationError::from(RemoteError::Other("bad zone".into())).is_retryable());
    }

    #[test]
    fn store_errors_keep_their_code() {
        let err = ReplicationError::from(StoreError::ReadOnlyColumn("id".into()));
        assert_eq!(err.code(), Some(ErrorCode::ReadOnlyColumn));
    }
}
