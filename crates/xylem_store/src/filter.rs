//! Record selection filters.
//!
//! A filter is a `(column, operator, value)` triple. The database backend
//! compiles filters to SQL; the file backend evaluates the same model in
//! memory through [`FilterCondition::matches`], so a selection returns the
//! same rows whichever backend serves it.

use std::cmp::Ordering;
use std::str::FromStr;

use serde_json::Value as JsonValue;

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Lt,
    Ge,
    In,
    Like,
}

impl FromStr for FilterOp {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "eq" => Ok(Self::Eq),
            "lt" => Ok(Self::Lt),
            "ge" => Ok(Self::Ge),
            "in" => Ok(Self::In),
            "like" => Ok(Self::Like),
            other => Err(StoreError::invalid_filter(format!(
                "Invalid filter operator: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub enum FilterValue {
    One(JsonValue),
    Many(Vec<JsonValue>),
}

/// A single condition against a stored column.
#[derive(Debug, Clone)]
pub struct FilterCondition {
    pub column: String,
    pub op: FilterOp,
    pub value: FilterValue,
}

impl FilterCondition {
    /// Build a condition from the raw triple form.
    ///
    /// `in` takes a list, or a comma-joined string split verbatim (no
    /// trimming). For the other operators the literal string `"null"` means
    /// the SQL NULL.
    pub fn new(column: impl Into<String>, op: &str, value: JsonValue) -> Result<Self> {
        let op = op.parse::<FilterOp>()?;
        let value = match op {
            FilterOp::In => {
                let values = match value {
                    JsonValue::Array(items) => items,
                    JsonValue::String(joined) => joined
                        .split(',')
                        .map(|part| JsonValue::String(part.to_string()))
                        .collect(),
                    other => {
                        return Err(StoreError::invalid_filter(format!(
                            "'in' needs a list or a comma-joined string, got: {other}"
                        )))
                    }
                };
                FilterValue::Many(values)
            }
            _ => {
                let value = if value.as_str() == Some("null") {
                    JsonValue::Null
                } else {
                    value
                };
                FilterValue::One(value)
            }
        };
        Ok(Self {
            column: column.into(),
            op,
            value,
        })
    }

    /// In-memory evaluation mirroring the SQL operators, SQLite affinity
    /// included: numeric strings compare as numbers, LIKE ignores ASCII
    /// case, NULL never satisfies an ordering comparison.
    pub fn matches(&self, stored: Option<&JsonValue>) -> bool {
        let stored = stored.unwrap_or(&JsonValue::Null);
        match (&self.op, &self.value) {
            (FilterOp::Eq, FilterValue::One(target)) => json_eq(stored, target),
            (FilterOp::Lt, FilterValue::One(target)) => {
                json_cmp(stored, target).is_some_and(|o| o == Ordering::Less)
            }
            (FilterOp::Ge, FilterValue::One(target)) => {
                json_cmp(stored, target).is_some_and(|o| o != Ordering::Less)
            }
            (FilterOp::In, FilterValue::Many(targets)) => {
                targets.iter().any(|t| json_eq(stored, t))
            }
            (FilterOp::Like, FilterValue::One(target)) => {
                match (stored.as_str(), target.as_str()) {
                    (Some(text), Some(pattern)) => like_matches(pattern, text),
                    _ => false,
                }
            }
            _ => false,
        }
    }
}

/// Equality against one key inside a JSON-typed column.
#[derive(Debug, Clone)]
pub struct JsonFilterCondition {
    pub column: String,
    pub key: String,
    pub value: JsonValue,
}

impl JsonFilterCondition {
    pub fn new(column: impl Into<String>, key: impl Into<String>, value: JsonValue) -> Self {
        Self {
            column: column.into(),
            key: key.into(),
            value,
        }
    }

    pub fn matches(&self, stored: Option<&JsonValue>) -> bool {
        match stored.and_then(|v| v.get(&self.key)) {
            Some(extracted) => json_eq(extracted, &self.value),
            None => false,
        }
    }
}

pub(crate) fn json_eq(stored: &JsonValue, target: &JsonValue) -> bool {
    if let (Some(a), Some(b)) = (number_of(stored), number_of(target)) {
        return a == b;
    }
    stored == target
}

fn json_cmp(stored: &JsonValue, target: &JsonValue) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (number_of(stored), number_of(target)) {
        return a.partial_cmp(&b);
    }
    match (stored.as_str(), target.as_str()) {
        (Some(a), Some(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn number_of(value: &JsonValue) -> Option<f64> {
    match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn like_matches(pattern: &str, text: &str) -> bool {
    fn walk(pattern: &[char], text: &[char]) -> bool {
        match pattern.first() {
            None => text.is_empty(),
            Some('%') => {
                walk(&pattern[1..], text) || (!text.is_empty() && walk(pattern, &text[1..]))
            }
            Some('_') => !text.is_empty() && walk(&pattern[1..], &text[1..]),
            Some(c) => {
                !text.is_empty()
                    && text[0].eq_ignore_ascii_case(c)
                    && walk(&pattern[1..], &text[1..])
            }
        }
    }
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    walk(&pattern, &text)
}
