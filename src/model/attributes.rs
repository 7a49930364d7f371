//! Typed attribute values and the ordered attribute set that identifies a
//! Resource or DataPoint. Uses a `BTreeMap` so iteration order is
//! deterministic, which attribute-action round-tripping depends on, though
//! uniqueness of a time series is defined on the set's *contents*, not its
//! iteration order.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A single attribute value. Mirrors the handful of concrete types an OTLP-
/// shaped attribute can carry.
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Str(String),
    Int(i64),
    Double(f64),
    Bool(bool),
}

impl AttributeValue {
    /// Best-effort coercion to `f64`, used by rollup aggregation and the
    /// Top-K engine's `counter_field` lookup. Never panics.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Int(i) => Some(*i as f64),
            AttributeValue::Double(d) => Some(*d),
            AttributeValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            AttributeValue::Str(s) => s.parse::<f64>().ok(),
        }
    }

    /// Best-effort coercion to `&str` for regex matching against
    /// `priority_rules`. Non-string values format via `Display`.
    pub fn as_match_str(&self) -> std::borrow::Cow<'_, str> {
        match self {
            AttributeValue::Str(s) => std::borrow::Cow::Borrowed(s.as_str()),
            AttributeValue::Int(i) => std::borrow::Cow::Owned(i.to_string()),
            AttributeValue::Double(d) => std::borrow::Cow::Owned(d.to_string()),
            AttributeValue::Bool(b) => std::borrow::Cow::Owned(b.to_string()),
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Str(s) => write!(f, "{s}"),
            AttributeValue::Int(i) => write!(f, "{i}"),
            AttributeValue::Double(d) => write!(f, "{d}"),
            AttributeValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// An ordered (by key) set of attributes. Two `AttributeSet`s are equal iff
/// they hold the same key→value pairs, independent of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeSet(BTreeMap<String, AttributeValue>);

impl AttributeSet {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: AttributeValue) -> Option<AttributeValue> {
        self.0.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<AttributeValue> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, AttributeValue)> for AttributeSet {
    fn from_iter<T: IntoIterator<Item = (String, AttributeValue)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_insertion_order() {
        let mut a = AttributeSet::new();
        a.insert("b", AttributeValue::Int(2));
        a.insert("a", AttributeValue::Int(1));

        let mut b = AttributeSet::new();
        b.insert("a", AttributeValue::Int(1));
        b.insert("b", AttributeValue::Int(2));

        assert_eq!(a, b);
    }

    #[test]
    fn as_f64_coerces_numeric_string() {
        assert_eq!(AttributeValue::Str("3.5".into()).as_f64(), Some(3.5));
    }

    #[test]
    fn as_f64_none_for_non_numeric_string() {
        assert_eq!(AttributeValue::Str("java".into()).as_f64(), None);
    }
}
