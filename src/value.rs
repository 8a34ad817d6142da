//! Values stored in variable overlays.
//!
//! A [`VariableValue`] is whatever a step decided to keep: plain text,
//! numbers, nested maps and lists taken from a JSON payload, raw bytes,
//! or an arbitrary [`Record`] that exposes named properties.

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A value exposing named properties to path expressions.
///
/// Implementors return `None` for properties they do not have; the
/// path resolver then keeps the record itself as the result.
pub trait Record: fmt::Debug + Send + Sync {
    fn property(&self, name: &str) -> Option<VariableValue>;
}

/// A variable value.
#[derive(Debug, Clone)]
pub enum VariableValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    /// Binary payload, shared rather than copied.
    Bytes(Arc<[u8]>),
    List(Vec<VariableValue>),
    Map(BTreeMap<String, VariableValue>),
    Record(Arc<dyn Record>),
}

impl VariableValue {
    /// Wrap a property-bearing value.
    pub fn record<R: Record + 'static>(record: R) -> Self {
        VariableValue::Record(Arc::new(record))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, VariableValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            VariableValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Arc<[u8]>> {
        match self {
            VariableValue::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[VariableValue]> {
        match self {
            VariableValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, VariableValue>> {
        match self {
            VariableValue::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Build a list from anything convertible.
    pub fn list<I, V>(items: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<VariableValue>,
    {
        VariableValue::List(items.into_iter().map(Into::into).collect())
    }

    /// `None` for [`VariableValue::Null`], the value otherwise.
    pub(crate) fn non_null(self) -> Option<Self> {
        if self.is_null() {
            None
        } else {
            Some(self)
        }
    }

    /// Convert into JSON. Bytes become an array of numbers and records
    /// their debug representation.
    pub fn to_json(&self) -> Value {
        match self {
            VariableValue::Null => Value::Null,
            VariableValue::Bool(b) => Value::Bool(*b),
            VariableValue::Integer(i) => Value::from(*i),
            VariableValue::Float(f) => Value::from(*f),
            VariableValue::String(s) => Value::String(s.clone()),
            VariableValue::Bytes(bytes) => {
                Value::Array(bytes.iter().map(|b| Value::from(*b)).collect())
            }
            VariableValue::List(items) => {
                Value::Array(items.iter().map(Self::to_json).collect())
            }
            VariableValue::Map(map) => Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            VariableValue::Record(record) => {
                Value::String(format!("{record:?}"))
            }
        }
    }
}

impl PartialEq for VariableValue {
    fn eq(&self, other: &Self) -> bool {
        use VariableValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Integer(a), Integer(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (String(a), String(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (List(a), List(b)) => a == b,
            (Map(a), Map(b)) => a == b,
            (Record(a), Record(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Display for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VariableValue::Null => f.write_str("null"),
            VariableValue::Bool(b) => write!(f, "{b}"),
            VariableValue::Integer(i) => write!(f, "{i}"),
            VariableValue::Float(x) => write!(f, "{x}"),
            VariableValue::String(s) => f.write_str(s),
            VariableValue::Bytes(bytes) => {
                write!(f, "<{} bytes>", bytes.len())
            }
            VariableValue::Record(record) => write!(f, "{record:?}"),
            VariableValue::List(_) | VariableValue::Map(_) => {
                write!(f, "{}", self.to_json())
            }
        }
    }
}

impl From<Value> for VariableValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => VariableValue::Null,
            Value::Bool(b) => VariableValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => VariableValue::Integer(i),
                None => VariableValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => VariableValue::String(s),
            Value::Array(items) => {
                VariableValue::List(items.into_iter().map(Self::from).collect())
            }
            Value::Object(map) => VariableValue::Map(
                map.into_iter().map(|(k, v)| (k, Self::from(v))).collect(),
            ),
        }
    }
}

impl From<&str> for VariableValue {
    fn from(value: &str) -> Self {
        VariableValue::String(value.to_string())
    }
}

impl From<String> for VariableValue {
    fn from(value: String) -> Self {
        VariableValue::String(value)
    }
}

impl From<bool> for VariableValue {
    fn from(value: bool) -> Self {
        VariableValue::Bool(value)
    }
}

impl From<i64> for VariableValue {
    fn from(value: i64) -> Self {
        VariableValue::Integer(value)
    }
}

impl From<f64> for VariableValue {
    fn from(value: f64) -> Self {
        VariableValue::Float(value)
    }
}

impl From<Vec<u8>> for VariableValue {
    fn from(value: Vec<u8>) -> Self {
        VariableValue::Bytes(value.into())
    }
}

impl From<Arc<[u8]>> for VariableValue {
    fn from(value: Arc<[u8]>) -> Self {
        VariableValue::Bytes(value)
    }
}

impl From<Vec<VariableValue>> for VariableValue {
    fn from(value: Vec<VariableValue>) -> Self {
        VariableValue::List(value)
    }
}

impl<V: Into<VariableValue>> From<BTreeMap<String, V>> for VariableValue {
    fn from(value: BTreeMap<String, V>) -> Self {
        VariableValue::Map(
            value.into_iter().map(|(k, v)| (k, v.into())).collect(),
        )
    }
}
