use tracing::warn;

use crate::error::StoreError;
use crate::model::{Assignment, Entity, RecordId};
use crate::scope::Scope;

use super::Store;

/// Forgiving view over a [`Store`] for display paths.
///
/// Failures are logged at `warn` with their error code and replaced by an
/// empty list, `None`, or zero. Writes return `None`/empty on failure.
#[derive(Debug, Clone, Copy)]
pub struct Lenient<'a> {
    store: &'a Store,
}

impl<'a> Lenient<'a> {
    pub(super) const fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub async fn fetch<E: Entity>(&self, scope: &Scope<E>) -> Vec<E> {
        degrade("fetch", scope.name(), self.store.fetch(scope).await)
    }

    pub async fn fetch_recursive<E: Entity>(&self, root: RecordId, scope: &Scope<E>) -> Vec<E> {
        degrade(
            "fetch_recursive",
            scope.name(),
            self.store.fetch_recursive(root, scope).await,
        )
    }

    pub async fn pluck<E: Entity>(&self, id: RecordId, scope: &Scope<E>) -> Option<E> {
        degrade("pluck", scope.name(), self.store.pluck(id, scope).await)
    }

    pub async fn count<E: Entity>(&self, scope: &Scope<E>) -> u64 {
        degrade("count", scope.name(), self.store.count(scope).await)
    }

    pub async fn insert<E: Entity>(&self, fields: &[Assignment], scope: &Scope<E>) -> Option<E> {
        degrade(
            "insert",
            scope.name(),
            self.store.insert(fields, scope).await.map(Some),
        )
    }

    pub async fn update<E: Entity>(
        &self,
        id: RecordId,
        fields: &[Assignment],
        recursive: bool,
        scope: &Scope<E>,
    ) -> Vec<RecordId> {
        degrade(
            "update",
            scope.name(),
            self.store.update(id, fields, recursive, scope).await,
        )
    }
}

fn degrade<T: Default>(op: &'static str, scope: &str, result: Result<T, StoreError>) -> T {
    result.unwrap_or_else(|err| {
        warn!(op, scope, code = %err.code(), error = %err, "store operation failed; degrading");
        T::default()
    })
}
