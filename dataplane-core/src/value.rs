//! Dynamic row/value representation shared by every component.
//!
//! The source system passes results and parameters around as opaque
//! dictionaries of any value. Here a row is an ordered column list and a
//! value is a small tagged enum — enough to round-trip through the cache
//! and across the wire without reaching for `serde_json::Value` on the
//! hot path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
}

impl Value {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Stable textual form used when hashing a value into a cache
    /// fingerprint or a shard-key digest.
    pub fn stable_repr(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Int(i) => format!("i:{i}"),
            Value::Float(f) => format!("f:{f}"),
            Value::Text(s) => format!("t:{s}"),
            Value::Bytes(b) => format!("b:{}", hex_encode(b)),
            Value::Timestamp(t) => format!("ts:{}", t.timestamp_micros()),
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

/// An ordered column -> value map. A `Vec` rather than a hash map: result
/// rows are small, built once, and column order matters for display.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row(pub Vec<(String, Value)>);

impl Row {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, column: impl Into<String>, value: Value) {
        self.0.push((column.into(), value));
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(c, _)| c.as_str())
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Row(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_get_returns_first_matching_column() {
        let mut row = Row::new();
        row.push("id", Value::Int(42));
        row.push("title", Value::Text("hello".into()));
        assert_eq!(row.get("id"), Some(&Value::Int(42)));
        assert_eq!(row.get("title").unwrap().as_text(), Some("hello"));
        assert_eq!(row.get("missing"), None);
    }

    #[test]
    fn stable_repr_is_deterministic() {
        let a = Value::Text("doc_123".into());
        let b = Value::Text("doc_123".into());
        assert_eq!(a.stable_repr(), b.stable_repr());
    }
}
