//! Field predicates used by `requiredIf` / `skipIf` step conditions.
//!
//! Evaluation never fails: a missing field, a non-numeric operand for an
//! ordering comparison, or a malformed membership list all resolve to a
//! boolean so that a bad predicate cannot block routing.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Upper bound on dotted-path segments followed during lookup.
pub const MAX_PATH_DEPTH: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    GreaterThan,
    LessThan,
    Equals,
    NotEquals,
    In,
    NotIn,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GreaterThan => "greater_than",
            Self::LessThan => "less_than",
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::In => "in",
            Self::NotIn => "not_in",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Predicate {
    pub field: String,
    pub condition: Condition,
    pub value: Value,
}

impl Predicate {
    pub fn new(field: impl Into<String>, condition: Condition, value: Value) -> Self {
        Self { field: field.into(), condition, value }
    }

    pub fn evaluate(&self, context: &PredicateContext) -> bool {
        let actual = context.lookup(&self.field);
        let numeric = context.is_decimal(&self.field);
        let equal = |actual: &Value, expected: &Value| values_equal(actual, expected, numeric);
        match self.condition {
            Condition::GreaterThan => numeric_pair(actual, &self.value).is_some_and(|(a, b)| a > b),
            Condition::LessThan => numeric_pair(actual, &self.value).is_some_and(|(a, b)| a < b),
            Condition::Equals => actual.is_some_and(|actual| equal(actual, &self.value)),
            Condition::NotEquals => !actual.is_some_and(|actual| equal(actual, &self.value)),
            Condition::In => membership(actual, &self.value, numeric).unwrap_or(false),
            Condition::NotIn => {
                membership(actual, &self.value, numeric).is_some_and(|member| !member)
            }
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.field.trim().is_empty() {
            return Err("predicate field must not be empty".to_owned());
        }
        if self.field.split('.').count() > MAX_PATH_DEPTH {
            return Err(format!(
                "predicate field `{}` is nested deeper than {MAX_PATH_DEPTH} levels",
                self.field
            ));
        }
        if matches!(self.condition, Condition::In | Condition::NotIn) && !self.value.is_array() {
            return Err(format!(
                "predicate on `{}` uses {} and needs an array value",
                self.field,
                self.condition.as_str()
            ));
        }
        Ok(())
    }
}

/// Flattened view of a report that predicates are evaluated against.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PredicateContext {
    fields: BTreeMap<String, Value>,
    decimals: BTreeSet<String>,
}

impl PredicateContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.decimals.remove(&key);
        self.fields.insert(key, value);
    }

    /// Stored as its exact string form; comparisons on the field are numeric.
    pub fn insert_decimal(&mut self, key: impl Into<String>, value: Decimal) {
        let key = key.into();
        self.fields.insert(key.clone(), Value::String(value.to_string()));
        self.decimals.insert(key);
    }

    fn is_decimal(&self, path: &str) -> bool {
        self.decimals.contains(path)
    }

    /// Resolves `a.b.0.c` style paths. A key that literally contains dots wins
    /// over path traversal.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        if let Some(value) = self.fields.get(path) {
            return Some(value);
        }

        let mut segments = path.split('.');
        let head = segments.next()?;
        let mut current = self.fields.get(head)?;
        for (depth, segment) in segments.enumerate() {
            if depth + 1 >= MAX_PATH_DEPTH {
                return None;
            }
            current = match current {
                Value::Object(map) => map.get(segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

fn as_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(number) => {
            let raw = number.to_string();
            Decimal::from_str(&raw).ok().or_else(|| Decimal::from_scientific(&raw).ok())
        }
        Value::String(raw) => Decimal::from_str(raw.trim()).ok(),
        _ => None,
    }
}

fn numeric_pair(actual: Option<&Value>, expected: &Value) -> Option<(Decimal, Decimal)> {
    Some((as_decimal(actual?)?, as_decimal(expected)?))
}

fn values_equal(actual: &Value, expected: &Value, numeric: bool) -> bool {
    if numeric || actual.is_number() || expected.is_number() {
        if let (Some(a), Some(b)) = (as_decimal(actual), as_decimal(expected)) {
            return a == b;
        }
    }
    actual == expected
}

fn membership(actual: Option<&Value>, expected: &Value, numeric: bool) -> Option<bool> {
    let candidates = expected.as_array()?;
    Some(actual.is_some_and(|actual| {
        candidates.iter().any(|item| values_equal(actual, item, numeric))
    }))
}
