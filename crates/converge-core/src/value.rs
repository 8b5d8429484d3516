//! Typed attribute values
//!
//! Declarations arrive as loosely typed JSON. They are converted once, at the
//! loader boundary, into [`AttrValue`] so that the diff engine and executor
//! never see untyped dictionaries or nulls.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Attribute name → value, ordered by name
pub type Attributes = BTreeMap<String, AttrValue>;

/// A single attribute value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<AttrValue>),
    Map(BTreeMap<String, AttrValue>),
}

impl AttrValue {
    /// Convert a JSON value, rejecting nulls
    ///
    /// `path` is used in the error message to point at the offending
    /// attribute, e.g. `network.0.bridge`.
    pub fn from_json(value: serde_json::Value, path: &str) -> Result<Self, String> {
        match value {
            serde_json::Value::Null => Err(format!("attribute `{}` is null", path)),
            serde_json::Value::Bool(b) => Ok(AttrValue::Bool(b)),
            serde_json::Value::Number(n) => Ok(AttrValue::Number(n)),
            serde_json::Value::String(s) => Ok(AttrValue::String(s)),
            serde_json::Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| AttrValue::from_json(item, &format!("{}.{}", path, i)))
                .collect::<Result<Vec<_>, _>>()
                .map(AttrValue::List),
            serde_json::Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| {
                    let child = format!("{}.{}", path, k);
                    AttrValue::from_json(v, &child).map(|v| (k, v))
                })
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(AttrValue::Map),
        }
    }

    /// Convert back into a JSON value
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            AttrValue::Bool(b) => serde_json::Value::Bool(*b),
            AttrValue::Number(n) => serde_json::Value::Number(n.clone()),
            AttrValue::String(s) => serde_json::Value::String(s.clone()),
            AttrValue::List(items) => {
                serde_json::Value::Array(items.iter().map(AttrValue::to_json).collect())
            }
            AttrValue::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Walk a dotted path into nested maps and lists
    ///
    /// List elements are addressed by their decimal index.
    pub fn lookup(&self, path: &[&str]) -> Option<&AttrValue> {
        let Some((head, rest)) = path.split_first() else {
            return Some(self);
        };
        match self {
            AttrValue::Map(map) => map.get(*head)?.lookup(rest),
            AttrValue::List(items) => {
                let index: usize = head.parse().ok()?;
                items.get(index)?.lookup(rest)
            }
            _ => None,
        }
    }
}

/// Look up a dotted path starting at a top-level attribute map
pub fn lookup_path<'a>(attributes: &'a Attributes, path: &[&str]) -> Option<&'a AttrValue> {
    let (head, rest) = path.split_first()?;
    attributes.get(*head)?.lookup(rest)
}

/// Renders the value the way it appears when interpolated into a string
impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::String(s) => f.write_str(s),
            AttrValue::Bool(b) => write!(f, "{}", b),
            AttrValue::Number(n) => write!(f, "{}", n),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::String(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::String(s)
    }
}

impl From<i64> for AttrValue {
    fn from(n: i64) -> Self {
        AttrValue::Number(n.into())
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::Bool(b)
    }
}
