use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::crdt::element::ElementMeta;
use crate::ids::TimeTicket;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Immutable scalar payload of a primitive element.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum PrimitiveValue {
    Null,
    Boolean(bool),
    Integer(i32),
    Long(i64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    Date(DateTime<Utc>),
}

impl PrimitiveValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            PrimitiveValue::Null => "null",
            PrimitiveValue::Boolean(_) => "boolean",
            PrimitiveValue::Integer(_) => "integer",
            PrimitiveValue::Long(_) => "long",
            PrimitiveValue::Double(_) => "double",
            PrimitiveValue::String(_) => "string",
            PrimitiveValue::Bytes(_) => "bytes",
            PrimitiveValue::Date(_) => "date",
        }
    }

    /// Integral view used by counters; `None` for non-numeric values.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PrimitiveValue::Integer(v) => Some(i64::from(*v)),
            PrimitiveValue::Long(v) => Some(*v),
            PrimitiveValue::Double(v) if v.is_finite() => Some(*v as i64),
            _ => None,
        }
    }

    pub fn to_json_value(&self) -> Value {
        match self {
            PrimitiveValue::Null => Value::Null,
            PrimitiveValue::Boolean(v) => Value::Bool(*v),
            PrimitiveValue::Integer(v) => Value::from(*v),
            PrimitiveValue::Long(v) => Value::from(*v),
            PrimitiveValue::Double(v) => serde_json::Number::from_f64(*v)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            PrimitiveValue::String(v) => Value::String(v.clone()),
            PrimitiveValue::Bytes(v) => Value::Array(v.iter().map(|b| Value::from(*b)).collect()),
            PrimitiveValue::Date(v) => {
                Value::String(v.to_rfc3339_opts(SecondsFormat::Millis, true))
            }
        }
    }
}

impl From<bool> for PrimitiveValue {
    fn from(v: bool) -> Self {
        PrimitiveValue::Boolean(v)
    }
}

impl From<i32> for PrimitiveValue {
    fn from(v: i32) -> Self {
        PrimitiveValue::Integer(v)
    }
}

impl From<i64> for PrimitiveValue {
    fn from(v: i64) -> Self {
        PrimitiveValue::Long(v)
    }
}

impl From<f64> for PrimitiveValue {
    fn from(v: f64) -> Self {
        PrimitiveValue::Double(v)
    }
}

impl From<&str> for PrimitiveValue {
    fn from(v: &str) -> Self {
        PrimitiveValue::String(v.to_string())
    }
}

impl From<String> for PrimitiveValue {
    fn from(v: String) -> Self {
        PrimitiveValue::String(v)
    }
}

impl From<Vec<u8>> for PrimitiveValue {
    fn from(v: Vec<u8>) -> Self {
        PrimitiveValue::Bytes(v)
    }
}

impl From<DateTime<Utc>> for PrimitiveValue {
    fn from(v: DateTime<Utc>) -> Self {
        PrimitiveValue::Date(v)
    }
}

/// Leaf element holding a scalar.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Primitive {
    pub(crate) meta: ElementMeta,
    value: PrimitiveValue,
}

impl Primitive {
    pub fn new(value: PrimitiveValue, created_at: TimeTicket) -> Self {
        Self {
            meta: ElementMeta::new(created_at),
            value,
        }
    }

    pub fn value(&self) -> &PrimitiveValue {
        &self.value
    }

    pub fn to_json_value(&self) -> Value {
        self.value.to_json_value()
    }
}
