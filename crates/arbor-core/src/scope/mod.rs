//! Named, composable views over an entity table.
//!
//! A [`Scope`] bundles a [`Predicate`], an ordering, a set of default field
//! assignments for inserts, and an advisory "manual entry allowed" flag. The
//! same predicate drives both SQL rendering ([`Scope::apply`]) and in-memory
//! membership ([`Scope::applies_to_model`]).
//!
//! Scopes are immutable; builders consume `self` and factories such as
//! [`tasks::children_of`] return fresh instances.
//!
//! # Composition
//!
//! `a.compose(&b)` ANDs the predicates, ANDs the entry flags, concatenates
//! orderings (a column already ordered by `a` is not repeated), and merges
//! defaults with **`b` winning on conflicts**. Filtering is symmetric;
//! default resolution is not.

pub mod predicate;
pub mod tasks;

use std::cmp::Ordering;
use std::fmt;
use std::marker::PhantomData;

use rusqlite::types::Value;

use crate::db::query::Select;
use crate::error::StoreError;
use crate::model::{Assignment, Entity, merge_assignments};

pub use predicate::{Direction, Order, Predicate, compare_values};

pub struct Scope<E> {
    name: String,
    predicate: Predicate,
    ordering: Vec<Order>,
    defaults: Vec<Assignment>,
    allows_entry: bool,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for Scope<E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            predicate: self.predicate.clone(),
            ordering: self.ordering.clone(),
            defaults: self.defaults.clone(),
            allows_entry: self.allows_entry,
            _entity: PhantomData,
        }
    }
}

impl<E> fmt::Debug for Scope<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("name", &self.name)
            .field("predicate", &self.predicate)
            .field("ordering", &self.ordering)
            .field("defaults", &self.defaults)
            .field("allows_entry", &self.allows_entry)
            .finish()
    }
}

impl<E: Entity> Scope<E> {
    /// An unrestricted scope that allows entry and sets no defaults.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            predicate: Predicate::True,
            ordering: Vec::new(),
            defaults: Vec::new(),
            allows_entry: true,
            _entity: PhantomData,
        }
    }

    #[must_use]
    pub fn filter(mut self, predicate: Predicate) -> Self {
        self.predicate = self.predicate.and(predicate);
        self
    }

    #[must_use]
    pub fn order_by(mut self, order: Order) -> Self {
        push_order(&mut self.ordering, order);
        self
    }

    #[must_use]
    pub fn default_field(mut self, assignment: Assignment) -> Self {
        self.defaults = merge_assignments(&self.defaults, &[assignment]);
        self
    }

    #[must_use]
    pub const fn entry(mut self, allowed: bool) -> Self {
        self.allows_entry = allowed;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    #[must_use]
    pub fn ordering(&self) -> &[Order] {
        &self.ordering
    }

    /// Field values stamped onto rows inserted through this scope.
    #[must_use]
    pub fn default_fields(&self) -> &[Assignment] {
        &self.defaults
    }

    /// Whether a UI should offer manual entry here. The store does not
    /// enforce it.
    #[must_use]
    pub const fn allows_entry(&self) -> bool {
        self.allows_entry
    }

    /// Restrict and order `select` by this scope.
    #[must_use]
    pub fn apply(&self, select: Select) -> Select {
        self.ordering
            .iter()
            .cloned()
            .fold(select.filter(self.predicate.clone()), Select::order_by)
    }

    /// In-memory membership test; agrees with [`Scope::apply`] row for row.
    pub fn applies_to_model(&self, record: &E) -> bool {
        self.predicate.matches(record)
    }

    #[must_use]
    pub fn compose(&self, other: &Self) -> Self {
        let mut ordering = self.ordering.clone();
        for order in &other.ordering {
            push_order(&mut ordering, order.clone());
        }
        Self {
            name: format!("{}/{}", self.name, other.name),
            predicate: self.predicate.clone().and(other.predicate.clone()),
            ordering,
            defaults: merge_assignments(&self.defaults, &other.defaults),
            allows_entry: self.allows_entry && other.allows_entry,
            _entity: PhantomData,
        }
    }

    /// Order two records the way [`Scope::apply`] would, ties broken by id.
    pub fn compare(&self, a: &E, b: &E) -> Ordering {
        for order in &self.ordering {
            let left = a.column(&order.column).unwrap_or(Value::Null);
            let right = b.column(&order.column).unwrap_or(Value::Null);
            let ord = match order.direction {
                Direction::Asc => compare_values(&left, &right),
                Direction::Desc => compare_values(&right, &left),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        a.id().cmp(&b.id())
    }

    /// Reject predicates, orderings, or defaults that name columns `E` does
    /// not have.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownColumn`] for the first unknown column.
    pub fn validate(&self) -> Result<(), StoreError> {
        let mut columns = Vec::new();
        self.predicate.columns(&mut columns);
        columns.extend(self.ordering.iter().map(|o| o.column.as_str()));
        columns.extend(self.defaults.iter().map(|a| a.column.as_str()));
        for column in columns {
            if !E::COLUMNS.contains(&column) {
                return Err(StoreError::UnknownColumn {
                    table: E::TABLE,
                    column: column.to_string(),
                });
            }
        }
        Ok(())
    }
}

fn push_order(ordering: &mut Vec<Order>, order: Order) {
    if !ordering.iter().any(|o| o.column == order.column) {
        ordering.push(order);
    }
}
