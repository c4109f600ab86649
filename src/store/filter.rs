//! Query filters.
//!
//! Filters are conjunctions over declared indexed fields: equality,
//! non-null, numeric less-than, and absence.

use serde::Serialize;
use serde_json::Value;

/// Filter operations.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    /// Field equals value
    Eq,
    /// Field is present and non-null
    NotNull,
    /// Field is numeric and less than value
    Lt,
    /// Field is absent or null
    Absent,
}

/// One predicate over an indexed field.
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Serialize) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value: serde_json::to_value(value).unwrap_or(Value::Null),
        }
    }

    pub fn not_null(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::NotNull,
            value: Value::Null,
        }
    }

    pub fn lt(field: impl Into<String>, value: impl Serialize) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Lt,
            value: serde_json::to_value(value).unwrap_or(Value::Null),
        }
    }

    pub fn absent(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Absent,
            value: Value::Null,
        }
    }

    /// Evaluate against a full record value. The SQLite index answers the
    /// same predicates; this path covers replay and tests.
    pub fn matches(&self, record: &Value) -> bool {
        let field = record.get(&self.field);
        match self.op {
            FilterOp::Eq => match field {
                Some(v) => *v == self.value,
                None => self.value.is_null(),
            },
            FilterOp::NotNull => matches!(field, Some(v) if !v.is_null()),
            FilterOp::Lt => match (field.and_then(Value::as_f64), self.value.as_f64()) {
                (Some(actual), Some(bound)) => actual < bound,
                _ => false,
            },
            FilterOp::Absent => field.is_none() || field.is_some_and(Value::is_null),
        }
    }
}
