//! Built-in task scopes.

use crate::model::task::field;
use crate::model::{RecordId, Task};

use super::{Order, Predicate, Scope};

/// Every row, soft-deleted or not. Used for closure computation.
#[must_use]
pub fn unfiltered() -> Scope<Task> {
    Scope::new("unfiltered").order_by(Order::asc("created_at_us"))
}

/// Everything that is not soft-deleted.
#[must_use]
pub fn all() -> Scope<Task> {
    Scope::new("all")
        .filter(Predicate::is_null("deleted_at_us"))
        .order_by(Order::asc("created_at_us"))
}

#[must_use]
pub fn active() -> Scope<Task> {
    Scope::new("active")
        .filter(Predicate::is_null("deleted_at_us"))
        .filter(Predicate::is_null("completed_at_us"))
        .order_by(Order::asc("created_at_us"))
}

/// Completed, not deleted. Inserting here stamps `completed_at_us`.
#[must_use]
pub fn completed() -> Scope<Task> {
    Scope::new("completed")
        .filter(Predicate::is_null("deleted_at_us"))
        .filter(Predicate::not_null("completed_at_us"))
        .order_by(Order::desc("completed_at_us"))
        .default_field(field::completed_now())
        .entry(false)
}

/// The trash. Inserting here stamps `deleted_at_us`.
#[must_use]
pub fn deleted() -> Scope<Task> {
    Scope::new("deleted")
        .filter(Predicate::not_null("deleted_at_us"))
        .order_by(Order::desc("deleted_at_us"))
        .default_field(field::deleted_now())
        .entry(false)
}

/// Roots of the forest. Usually composed with a status scope.
#[must_use]
pub fn orphans() -> Scope<Task> {
    Scope::new("orphans").filter(Predicate::is_null("parent_id"))
}

/// Direct children of `parent`; inserts land under it.
#[must_use]
pub fn children_of(parent: RecordId) -> Scope<Task> {
    Scope::new(format!("children_of({parent})"))
        .filter(Predicate::eq("parent_id", parent))
        .default_field(field::parent(Some(parent)))
}
