//! Cell values as they come out of a row stream.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A single cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// One row, in the column order of its stream.
pub type Row = Vec<Value>;

/// Key tuple in canonical text form; `None` is a NULL key part and sorts first.
pub type Key = Vec<Option<String>>;

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Text form used for key ordering. Matches what a database yields for
    /// `CAST(col AS text)`; trailing blanks are dropped so a `CHAR(n)` key
    /// pairs with the same `VARCHAR` key.
    pub fn canonical(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Text(s) => Some(s.trim_end().to_string()),
        }
    }

    /// Numeric reading of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Text(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    trimmed.parse::<f64>().ok().filter(|f| f.is_finite())
                }
            }
            Value::Null | Value::Bool(_) => None,
        }
    }

    /// Form used for checksums: numbers are printed uniformly and trailing
    /// blanks are dropped, so values that compare equal digest equally.
    pub fn normalized(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            other => match other.as_f64() {
                Some(f) => Some(f.to_string()),
                None => other.canonical(),
            },
        }
    }

    /// Equality used for non-key comparison. NULL equals NULL; numeric text
    /// compares numerically; trailing blanks are ignored.
    pub fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Null, _) | (_, Value::Null) => false,
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => a.normalized() == b.normalized(),
            },
        }
    }

    /// SQL comparison: `None` when either side is NULL.
    pub fn sql_cmp(&self, other: &Value) -> Option<Ordering> {
        if self.is_null() || other.is_null() {
            return None;
        }
        match (self.as_f64(), other.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => {
                let a = self.canonical()?;
                let b = other.canonical()?;
                Some(a.trim_end().cmp(b.trim_end()))
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Render a key tuple for messages: `(7, 'A')`.
pub fn describe_key(key: &Key) -> String {
    let parts: Vec<String> = key
        .iter()
        .map(|part| match part {
            Some(text) => text.clone(),
            None => "NULL".to_string(),
        })
        .collect();
    format!("({})", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_equality() {
        assert!(Value::from("1.0").same_as(&Value::Int(1)));
        assert!(Value::from(" 42 ").same_as(&Value::from("42")));
        assert!(!Value::from("42").same_as(&Value::from("43")));
    }

    #[test]
    fn test_trailing_blanks_ignored() {
        assert!(Value::from("abc   ").same_as(&Value::from("abc")));
        assert!(!Value::from("  abc").same_as(&Value::from("abc")));
    }

    #[test]
    fn test_key_form_ignores_trailing_blanks() {
        assert_eq!(Value::from("AB  ").canonical(), Value::from("AB").canonical());
        assert_ne!(Value::from(" AB").canonical(), Value::from("AB").canonical());
    }

    #[test]
    fn test_null_handling() {
        assert!(Value::Null.same_as(&Value::Null));
        assert!(!Value::Null.same_as(&Value::from("")));
        assert_eq!(Value::Null.sql_cmp(&Value::Int(1)), None);
    }

    #[test]
    fn test_key_order_is_text_order() {
        let a: Key = vec![Value::Int(10).canonical()];
        let b: Key = vec![Value::Int(9).canonical()];
        assert!(a < b);
        let null: Key = vec![None];
        assert!(null < a);
        assert_eq!(describe_key(&vec![Some("7".into()), None]), "(7, NULL)");
    }

    #[test]
    fn test_untagged_json() {
        let row: Row = serde_json::from_str(r#"[null, true, 3, 2.5, "x"]"#).unwrap();
        assert_eq!(
            row,
            vec![Value::Null, Value::Bool(true), Value::Int(3), Value::Float(2.5), Value::from("x")]
        );
    }
}
