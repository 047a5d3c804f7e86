//! Metric boundary types
//!
//! Inbound metrics (write path) and outbound metrics (read path) share the
//! same shape: a measurement name, a tag set, named field values and a
//! timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::codec::Value;

/// Field value carried by a metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::UInt(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::String(v) => f.write_str(v),
        }
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        Self::UInt(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

/// Signed integers widen to `Int`, unsigned to `UInt`, floats to `Float`.
impl From<Value> for FieldValue {
    fn from(v: Value) -> Self {
        match v {
            Value::Bool(b) => Self::Bool(b),
            Value::I8(n) => Self::Int(i64::from(n)),
            Value::I16(n) => Self::Int(i64::from(n)),
            Value::I32(n) => Self::Int(i64::from(n)),
            Value::I64(n) => Self::Int(n),
            Value::U8(n) => Self::UInt(u64::from(n)),
            Value::U16(n) => Self::UInt(u64::from(n)),
            Value::U32(n) => Self::UInt(u64::from(n)),
            Value::U64(n) => Self::UInt(n),
            Value::F32(n) => Self::Float(f64::from(n)),
            Value::F64(n) => Self::Float(n),
            Value::Str(s) => Self::String(s),
        }
    }
}

/// A named, tagged set of field values at one instant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Metric {
    pub fn new(name: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_value_widening() {
        assert_eq!(FieldValue::from(Value::I8(-3)), FieldValue::Int(-3));
        assert_eq!(FieldValue::from(Value::U32(7)), FieldValue::UInt(7));
        assert_eq!(FieldValue::from(Value::F32(1.5)), FieldValue::Float(1.5));
        assert_eq!(
            FieldValue::from(Value::Str("x".into())),
            FieldValue::String("x".into())
        );
    }

    #[test]
    fn test_metric_json_shape() {
        let json = r#"{"name":"plc","tags":{"line":"a"},"fields":{"on":true,"temp":21.5,"count":3,"label":"ok"}}"#;
        let metric: Metric = serde_json::from_str(json).unwrap();
        assert_eq!(metric.name, "plc");
        assert_eq!(metric.tags["line"], "a");
        assert_eq!(metric.fields["on"], FieldValue::Bool(true));
        assert_eq!(metric.fields["temp"], FieldValue::Float(21.5));
        assert_eq!(metric.fields["count"], FieldValue::Int(3));
        assert_eq!(metric.fields["label"], FieldValue::String("ok".into()));
    }
}
