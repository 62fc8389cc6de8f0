//! Primary keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// A primary key value.
///
/// Keys order integers before strings before compound keys, and compound
/// keys element-wise.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    /// Integer key, used by auto-increment tables.
    Int(i64),
    /// String key, used for client generated ids.
    Text(String),
    /// Key made of several field values.
    Compound(Vec<Key>),
}

impl Key {
    /// Converts a JSON value into a key.
    ///
    /// Returns `None` for values that cannot be keys (null, bool,
    /// non-integer numbers, objects).
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Key::Int),
            Value::String(s) => Some(Key::Text(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(Key::from_value)
                .collect::<Option<Vec<_>>>()
                .map(Key::Compound),
            _ => None,
        }
    }

    /// Converts the key back into a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Key::Int(i) => Value::from(*i),
            Key::Text(s) => Value::String(s.clone()),
            Key::Compound(parts) => Value::Array(parts.iter().map(Key::to_value).collect()),
        }
    }

    /// Returns the integer if this is an integer key.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Key::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{i}"),
            Key::Text(s) => write!(f, "{s:?}"),
            Key::Compound(parts) => {
                f.write_str("[")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str("+")?;
                    }
                    write!(f, "{part}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Int(value)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Text(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Text(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn converts_json_values() {
        assert_eq!(Key::from_value(&json!(7)), Some(Key::Int(7)));
        assert_eq!(Key::from_value(&json!("a")), Some(Key::from("a")));
        assert_eq!(
            Key::from_value(&json!(["t", 1])),
            Some(Key::Compound(vec![Key::from("t"), Key::Int(1)]))
        );
        assert_eq!(Key::from_value(&json!(1.5)), None);
        assert_eq!(Key::from_value(&json!(null)), None);
        assert_eq!(Key::from_value(&json!({"a": 1})), None);
    }

    #[test]
    fn ints_sort_before_text() {
        let mut keys = vec![Key::from("b"), Key::Int(10), Key::from("a"), Key::Int(2)];
        keys.sort();
        assert_eq!(
            keys,
            vec![Key::Int(2), Key::Int(10), Key::from("a"), Key::from("b")]
        );
    }

    #[test]
    fn serde_is_plain_json() {
        let key = Key::Compound(vec![Key::from("node"), Key::Int(3)]);
        let encoded = serde_json::to_value(&key).unwrap();
        assert_eq!(encoded, json!(["node", 3]));
        let decoded: Key = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, key);
    }
}
