//! Row filters, sort keys and query descriptions.
//!
//! Filters are evaluated in two places: compiled to SQL by the Postgres
//! backend, and evaluated directly against JSON rows by the memory backend,
//! the change hub and live views. Comparisons follow SQL `NULL` semantics:
//! a missing or null field never satisfies a comparison.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

use super::Collection;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op", content = "args")]
pub enum Filter {
    All(Vec<Filter>),
    Any(Vec<Filter>),
    Eq(String, Value),
    Neq(String, Value),
    Gt(String, Value),
    Gte(String, Value),
    Lt(String, Value),
    Lte(String, Value),
    /// Case-insensitive substring match.
    Contains(String, String),
    In(String, Vec<Value>),
    IsNull(String),
    NotNull(String),
}

fn to_value(value: impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

impl Filter {
    /// Matches every row.
    pub fn everything() -> Self {
        Self::All(Vec::new())
    }

    pub fn eq(field: &str, value: impl Serialize) -> Self {
        Self::Eq(field.to_string(), to_value(value))
    }

    pub fn neq(field: &str, value: impl Serialize) -> Self {
        Self::Neq(field.to_string(), to_value(value))
    }

    pub fn gt(field: &str, value: impl Serialize) -> Self {
        Self::Gt(field.to_string(), to_value(value))
    }

    pub fn gte(field: &str, value: impl Serialize) -> Self {
        Self::Gte(field.to_string(), to_value(value))
    }

    pub fn lt(field: &str, value: impl Serialize) -> Self {
        Self::Lt(field.to_string(), to_value(value))
    }

    pub fn lte(field: &str, value: impl Serialize) -> Self {
        Self::Lte(field.to_string(), to_value(value))
    }

    pub fn contains(field: &str, needle: impl Into<String>) -> Self {
        Self::Contains(field.to_string(), needle.into())
    }

    pub fn is_in<V: Serialize>(field: &str, values: impl IntoIterator<Item = V>) -> Self {
        Self::In(field.to_string(), values.into_iter().map(to_value).collect())
    }

    pub fn is_null(field: &str) -> Self {
        Self::IsNull(field.to_string())
    }

    pub fn not_null(field: &str) -> Self {
        Self::NotNull(field.to_string())
    }

    pub fn any(filters: Vec<Filter>) -> Self {
        Self::Any(filters)
    }

    /// Conjunction, flattening nested `All`.
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Self::All(mut a), Self::All(b)) => {
                a.extend(b);
                Self::All(a)
            }
            (Self::All(mut a), other) => {
                a.push(other);
                Self::All(a)
            }
            (this, Self::All(mut b)) => {
                b.insert(0, this);
                Self::All(b)
            }
            (this, other) => Self::All(vec![this, other]),
        }
    }

    pub fn matches(&self, row: &Value) -> bool {
        let field = |name: &str| row.get(name).unwrap_or(&Value::Null);
        match self {
            Self::All(filters) => filters.iter().all(|f| f.matches(row)),
            Self::Any(filters) => filters.iter().any(|f| f.matches(row)),
            Self::Eq(name, value) => values_equal(field(name), value),
            Self::Neq(name, value) => {
                let current = field(name);
                !current.is_null() && !values_equal(current, value)
            }
            Self::Gt(name, value) => compare_values(field(name), value) == Some(Ordering::Greater),
            Self::Gte(name, value) => matches!(
                compare_values(field(name), value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Self::Lt(name, value) => compare_values(field(name), value) == Some(Ordering::Less),
            Self::Lte(name, value) => matches!(
                compare_values(field(name), value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Self::Contains(name, needle) => field(name)
                .as_str()
                .map(|s| s.to_lowercase().contains(&needle.to_lowercase()))
                .unwrap_or(false),
            Self::In(name, values) => {
                let current = field(name);
                values.iter().any(|v| values_equal(current, v))
            }
            Self::IsNull(name) => field(name).is_null(),
            Self::NotNull(name) => !field(name).is_null(),
        }
    }

    /// Like [`Filter::matches`] for a row that may carry only some of its
    /// columns: a predicate on a column the row does not have is taken as
    /// satisfied.
    pub fn may_match(&self, row: &Value) -> bool {
        match self {
            Self::All(filters) => filters.iter().all(|f| f.may_match(row)),
            Self::Any(filters) => filters.iter().any(|f| f.may_match(row)),
            Self::Eq(name, _)
            | Self::Neq(name, _)
            | Self::Gt(name, _)
            | Self::Gte(name, _)
            | Self::Lt(name, _)
            | Self::Lte(name, _)
            | Self::Contains(name, _)
            | Self::In(name, _)
            | Self::IsNull(name)
            | Self::NotNull(name) => row.get(name).is_none() || self.matches(row),
        }
    }
}

impl Default for Filter {
    fn default() -> Self {
        Self::everything()
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if a.is_null() || b.is_null() {
        return false;
    }
    compare_values(a, b) == Some(Ordering::Equal) || a == b
}

fn parse_timestamp(s: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(s).ok()
}

/// Order two JSON scalars the way the database orders the column values.
///
/// Numbers compare numerically. Strings that are RFC 3339 timestamps compare
/// chronologically, other strings lexicographically.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => match (parse_timestamp(x), parse_timestamp(y)) {
            (Some(tx), Some(ty)) => Some(tx.cmp(&ty)),
            _ => Some(x.cmp(y)),
        },
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    pub direction: Direction,
}

impl Sort {
    /// Compare two rows by this key. Nulls sort last in either direction.
    pub fn compare(&self, a: &Value, b: &Value) -> Ordering {
        let x = a.get(&self.field).unwrap_or(&Value::Null);
        let y = b.get(&self.field).unwrap_or(&Value::Null);
        match (x.is_null(), y.is_null()) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => {
                let ord = compare_values(x, y).unwrap_or(Ordering::Equal);
                match self.direction {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub offset: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: Collection,
    pub filter: Filter,
    pub sort: Vec<Sort>,
    pub range: Option<Range>,
}

impl Query {
    pub fn new(collection: Collection) -> Self {
        Self {
            collection,
            filter: Filter::everything(),
            sort: Vec::new(),
            range: None,
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = std::mem::take(&mut self.filter).and(filter);
        self
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.sort.push(Sort {
            field: field.to_string(),
            direction,
        });
        self
    }

    pub fn range(mut self, offset: u32, limit: u32) -> Self {
        self.range = Some(Range { offset, limit });
        self
    }

    /// Compare two rows by the query's sort keys.
    pub fn compare_rows(&self, a: &Value, b: &Value) -> Ordering {
        self.sort
            .iter()
            .map(|s| s.compare(a, b))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn timestamps_compare_chronologically_across_offset_formats() {
        let a = json!("2026-10-14T10:00:00Z");
        let b = json!("2026-10-14T12:30:00.5+02:00");
        // 12:30:00.5+02:00 is 10:30:00.5 UTC
        assert_eq!(compare_values(&a, &b), Some(Ordering::Less));
    }

    #[test]
    fn null_fields_never_satisfy_comparisons() {
        let row = json!({ "accepted_user_id": null, "budget": 450.0 });
        assert!(!Filter::eq("accepted_user_id", "x").matches(&row));
        assert!(!Filter::neq("accepted_user_id", "x").matches(&row));
        assert!(Filter::is_null("accepted_user_id").matches(&row));
        assert!(Filter::gte("budget", 450).matches(&row));
        assert!(!Filter::gt("budget", 450).matches(&row));
    }

    #[test]
    fn contains_is_case_insensitive_and_any_is_disjunction() {
        let row = json!({ "title": "Fix my Rust parser", "description": "lexer bugs" });
        let search = Filter::any(vec![
            Filter::contains("title", "LEXER"),
            Filter::contains("description", "LEXER"),
        ]);
        assert!(search.matches(&row));
        assert!(!Filter::contains("title", "python").matches(&row));
    }

    #[test]
    fn partial_rows_match_on_the_columns_they_carry() {
        let filter = Filter::eq("status", "OPEN").and(Filter::any(vec![
            Filter::contains("title", "lexer"),
            Filter::contains("description", "lexer"),
        ]));
        let slim = json!({ "id": "t", "status": "OPEN", "title": "Parser" });
        assert!(!filter.matches(&slim));
        assert!(filter.may_match(&slim));
        assert!(!filter.may_match(&json!({ "id": "t", "status": "DONE" })));
    }

    #[test]
    fn and_flattens_nested_conjunctions() {
        let f = Filter::everything()
            .and(Filter::eq("status", "OPEN"))
            .and(Filter::eq("visibility", "public"));
        match f {
            Filter::All(parts) => assert_eq!(parts.len(), 2),
            other => panic!("unexpected filter {other:?}"),
        }
    }

    #[test]
    fn sort_puts_nulls_last() {
        let sort = Sort { field: "deadline".into(), direction: Direction::Desc };
        let with = json!({ "deadline": "2026-10-15T00:00:00Z" });
        let without = json!({ "deadline": null });
        assert_eq!(sort.compare(&with, &without), Ordering::Less);
    }
}
