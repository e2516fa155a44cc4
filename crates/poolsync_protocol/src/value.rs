//! Dynamic structured value type.

use crate::reference::ObjectRef;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A dynamic structured value.
///
/// This is the shape of everything the wire returns: call results, record
/// fields, event payloads and fault parameters. Maps are keyed by field name
/// and kept ordered so that two records with the same fields compare equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// Floating point number (task progress, memory ratios).
    Float(f64),
    /// Text string.
    Text(String),
    /// Reference to another server object.
    Ref(ObjectRef),
    /// Array of values.
    Array(Vec<Value>),
    /// Map of field name to value.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Creates a map value from name/value pairs.
    pub fn map<K, I>(pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Map(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Creates an empty map value.
    pub fn empty_map() -> Self {
        Value::Map(BTreeMap::new())
    }

    /// Returns true if this is `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Returns the boolean if this is a `Bool`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the integer if this is an `Integer`, or text holding one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Returns a float for `Float` and `Integer` values, or text holding one.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Returns the string if this is a `Text`.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Reads this value as an object reference.
    ///
    /// References are opaque, so any non-null text is accepted, the same as
    /// [`ObjectRef::parse`]. Callers use this only where a reference is
    /// expected. The null sentinel yields `None`.
    pub fn as_object_ref(&self) -> Option<ObjectRef> {
        match self {
            Value::Ref(r) => r.clone().into_option(),
            Value::Text(s) => ObjectRef::parse(s),
            _ => None,
        }
    }

    /// Returns the elements if this is an `Array`.
    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the entries if this is a `Map`.
    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Looks up a field if this is a `Map`.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(field))
    }

    /// Returns every reference in an array value, skipping null sentinels.
    pub fn as_object_refs(&self) -> Vec<ObjectRef> {
        self.as_array()
            .map(|items| items.iter().filter_map(Value::as_object_ref).collect())
            .unwrap_or_default()
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<ObjectRef> for Value {
    fn from(r: ObjectRef) -> Self {
        Value::Ref(r)
    }
}

impl From<&ObjectRef> for Value {
    fn from(r: &ObjectRef) -> Self {
        Value::Ref(r.clone())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}
