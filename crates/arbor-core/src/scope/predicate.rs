//! Predicate trees shared by SQL rendering and in-memory matching.
//!
//! Rendering uses null-safe comparisons (`IS`, `COALESCE(.. IN ..)`) so every
//! predicate is two-valued in SQL, exactly like [`Predicate::matches`]. That
//! keeps `NOT` consistent between the two evaluators.

use std::cmp::Ordering;

use rusqlite::types::Value;

use crate::model::Entity;

/// A boolean filter over entity columns.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    True,
    IsNull(String),
    NotNull(String),
    Eq(String, Value),
    In(String, Vec<Value>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    #[must_use]
    pub fn is_null(column: impl Into<String>) -> Self {
        Self::IsNull(column.into())
    }

    #[must_use]
    pub fn not_null(column: impl Into<String>) -> Self {
        Self::NotNull(column.into())
    }

    #[must_use]
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(column.into(), value.into())
    }

    #[must_use]
    pub fn id_in(ids: impl IntoIterator<Item = i64>) -> Self {
        Self::In("id".to_string(), ids.into_iter().map(Value::Integer).collect())
    }

    /// Conjunction that flattens nested `And`s and drops `True`.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        let mut parts = Vec::new();
        for p in [self, other] {
            match p {
                Self::True => {}
                Self::And(inner) => parts.extend(inner),
                other => parts.push(other),
            }
        }
        match parts.len() {
            0 => Self::True,
            1 => parts.pop().unwrap_or(Self::True),
            _ => Self::And(parts),
        }
    }

    #[must_use]
    pub fn negate(self) -> Self {
        match self {
            Self::Not(inner) => *inner,
            other => Self::Not(Box::new(other)),
        }
    }

    /// Every column the predicate references.
    pub fn columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::True => {}
            Self::IsNull(c) | Self::NotNull(c) | Self::Eq(c, _) | Self::In(c, _) => out.push(c),
            Self::And(parts) | Self::Or(parts) => {
                for p in parts {
                    p.columns(out);
                }
            }
            Self::Not(inner) => inner.columns(out),
        }
    }

    /// Append the SQL form to `sql`, pushing bound values onto `params`.
    ///
    /// Column names are written verbatim; callers validate them against the
    /// entity's column list first.
    pub fn render(&self, sql: &mut String, params: &mut Vec<Value>) {
        match self {
            Self::True => sql.push('1'),
            Self::IsNull(c) => {
                sql.push_str(c);
                sql.push_str(" IS NULL");
            }
            Self::NotNull(c) => {
                sql.push_str(c);
                sql.push_str(" IS NOT NULL");
            }
            Self::Eq(c, v) => {
                sql.push_str(c);
                sql.push_str(" IS ?");
                params.push(v.clone());
            }
            Self::In(c, values) => {
                if values.is_empty() {
                    sql.push('0');
                    return;
                }
                sql.push_str("COALESCE(");
                sql.push_str(c);
                sql.push_str(" IN (");
                for (i, v) in values.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(", ");
                    }
                    sql.push('?');
                    params.push(v.clone());
                }
                sql.push_str("), 0)");
            }
            Self::And(parts) | Self::Or(parts) => {
                if parts.is_empty() {
                    sql.push(if matches!(self, Self::And(_)) { '1' } else { '0' });
                    return;
                }
                let joiner = if matches!(self, Self::And(_)) {
                    " AND "
                } else {
                    " OR "
                };
                sql.push('(');
                for (i, p) in parts.iter().enumerate() {
                    if i > 0 {
                        sql.push_str(joiner);
                    }
                    p.render(sql, params);
                }
                sql.push(')');
            }
            Self::Not(inner) => {
                sql.push_str("NOT (");
                inner.render(sql, params);
                sql.push(')');
            }
        }
    }

    /// Evaluate against an in-memory record. Unknown columns read as NULL.
    pub fn matches<E: Entity>(&self, record: &E) -> bool {
        let get = |c: &str| record.column(c).unwrap_or(Value::Null);
        match self {
            Self::True => true,
            Self::IsNull(c) => get(c) == Value::Null,
            Self::NotNull(c) => get(c) != Value::Null,
            Self::Eq(c, v) => get(c) == *v,
            Self::In(c, values) => {
                let actual = get(c);
                actual != Value::Null && values.contains(&actual)
            }
            Self::And(parts) => parts.iter().all(|p| p.matches(record)),
            Self::Or(parts) => parts.iter().any(|p| p.matches(record)),
            Self::Not(inner) => !inner.matches(record),
        }
    }
}

/// Sort direction for a scope ordering term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// One `ORDER BY` term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub direction: Direction,
}

impl Order {
    #[must_use]
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: Direction::Asc,
        }
    }

    #[must_use]
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: Direction::Desc,
        }
    }
}

/// Compare two SQL values the way SQLite orders them:
/// NULL < numbers < text < blob.
#[must_use]
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    const fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Integer(_) | Value::Real(_) => 1,
            Value::Text(_) => 2,
            Value::Blob(_) => 3,
        }
    }

    match (a, b) {
        (Value::Integer(x), Value::Integer(y)) => x.cmp(y),
        #[allow(clippy::cast_precision_loss)]
        (Value::Integer(x), Value::Real(y)) => (*x as f64).total_cmp(y),
        #[allow(clippy::cast_precision_loss)]
        (Value::Real(x), Value::Integer(y)) => x.total_cmp(&(*y as f64)),
        (Value::Real(x), Value::Real(y)) => x.total_cmp(y),
        (Value::Text(x), Value::Text(y)) => x.cmp(y),
        (Value::Blob(x), Value::Blob(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Task;

    fn task(parent: Option<i64>, completed: Option<i64>) -> Task {
        Task {
            id: 1,
            cloud_id: "c".into(),
            body: "b".into(),
            parent_id: parent,
            completed_at_us: completed,
            created_at_us: 0,
            updated_at_us: 0,
            deleted_at_us: None,
        }
    }

    #[test]
    fn and_flattens_and_drops_true() {
        let p = Predicate::True
            .and(Predicate::is_null("a"))
            .and(Predicate::is_null("b").and(Predicate::True));
        assert_eq!(
            p,
            Predicate::And(vec![Predicate::is_null("a"), Predicate::is_null("b")])
        );
        assert_eq!(Predicate::True.and(Predicate::True), Predicate::True);
    }

    #[test]
    fn render_is_null_safe() {
        let p = Predicate::eq("parent_id", 4_i64)
            .and(Predicate::In("id".into(), vec![]))
            .negate();
        let mut sql = String::new();
        let mut params = Vec::new();
        p.render(&mut sql, &mut params);
        assert_eq!(sql, "NOT ((parent_id IS ? AND 0))");
        assert_eq!(params, vec![Value::Integer(4)]);
    }

    #[test]
    fn not_eq_matches_null_column() {
        let p = Predicate::eq("parent_id", 4_i64).negate();
        assert!(p.matches(&task(None, None)));
        assert!(!p.matches(&task(Some(4), None)));
    }

    #[test]
    fn in_never_matches_null() {
        let p = Predicate::In("parent_id".into(), vec![Value::Integer(1)]);
        assert!(!p.matches(&task(None, None)));
        assert!(p.matches(&task(Some(1), None)));
    }

    #[test]
    fn values_order_like_sqlite() {
        assert_eq!(
            compare_values(&Value::Null, &Value::Integer(0)),
            Ordering::Less
        );
        assert_eq!(
            compare_values(&Value::Integer(5), &Value::Text("a".into())),
            Ordering::Less
        );
        assert_eq!(
            compare_values(&Value::Integer(5), &Value::Integer(2)),
            Ordering::Greater
        );
    }
}
