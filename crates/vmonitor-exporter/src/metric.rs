// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Records shipped to vMonitor and the typed ingestion boundary feeding them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Dimension set of a record, kept ordered by key so equality ignores insertion order.
pub type Dimensions = BTreeMap<String, String>;

/// Opaque metadata forwarded untouched as `value_meta`.
pub type ValueMeta = serde_json::Map<String, serde_json::Value>;

/// One observation on the wire: `{name, dimensions, value, timestamp, value_meta}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub name: String,
    pub dimensions: Dimensions,
    pub value: f64,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub value_meta: ValueMeta,
}

impl Record {
    #[must_use]
    pub fn new(name: impl Into<String>, dimensions: Dimensions, value: f64, timestamp: i64) -> Self {
        Record {
            name: name.into(),
            dimensions,
            value,
            timestamp,
            value_meta: ValueMeta::new(),
        }
    }
}

/// Canonical `k1:v1&k2:v2` form of a dimension set, used as the aggregation cache key.
#[must_use]
pub fn canonical_dimensions(dimensions: &Dimensions) -> String {
    let mut out = String::new();
    for (i, (key, value)) in dimensions.iter().enumerate() {
        if i > 0 {
            out.push('&');
        }
        out.push_str(key);
        out.push(':');
        out.push_str(value);
    }
    out
}

/// Attribute or value as it arrives from the collector.
///
/// This is the only place source types are coerced: [`FieldValue::as_f64`] converts every
/// numeric-like variant to a canonical `f64` once, at the edge.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    Str(String),
}

impl FieldValue {
    /// Numeric view of the value. Strings are parsed; booleans map to `1.0`/`0.0`.
    /// NaN and infinities are not numbers here and yield `None`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::UInt(v) => Some(*v as f64),
            FieldValue::Double(v) => Some(*v).filter(|v| v.is_finite()),
            FieldValue::Str(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Bool(b) => write!(f, "{b}"),
            FieldValue::Int(v) => write!(f, "{v}"),
            FieldValue::UInt(v) => write!(f, "{v}"),
            FieldValue::Double(v) => write!(f, "{v}"),
            FieldValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Double(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_string())
    }
}

/// Attribute map shared by data points and log entries.
pub type Attributes = BTreeMap<String, FieldValue>;

/// Stringifies attributes into a dimension set.
#[must_use]
pub fn attributes_to_dimensions(attributes: &Attributes) -> Dimensions {
    attributes
        .iter()
        .map(|(k, v)| (k.clone(), v.to_string()))
        .collect()
}

/// A gauge or sum data point handed over by the metrics receiver.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct DataPoint {
    pub name: String,
    #[serde(default)]
    pub attributes: Attributes,
    pub value: FieldValue,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

/// A log record's attributes, from which metrics are derived.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct LogEntry {
    #[serde(default)]
    pub attributes: Attributes,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_dimensions_sorted() {
        let mut a = Dimensions::new();
        a.insert("zone".to_string(), "hcm".to_string());
        a.insert("app".to_string(), "api".to_string());

        let mut b = Dimensions::new();
        b.insert("app".to_string(), "api".to_string());
        b.insert("zone".to_string(), "hcm".to_string());

        assert_eq!(canonical_dimensions(&a), "app:api&zone:hcm");
        assert_eq!(canonical_dimensions(&a), canonical_dimensions(&b));
        assert_eq!(canonical_dimensions(&Dimensions::new()), "");
    }

    #[test]
    fn test_field_value_as_f64() {
        assert_eq!(FieldValue::Int(-3).as_f64(), Some(-3.0));
        assert_eq!(FieldValue::UInt(7).as_f64(), Some(7.0));
        assert_eq!(FieldValue::Double(1.5).as_f64(), Some(1.5));
        assert_eq!(FieldValue::Bool(true).as_f64(), Some(1.0));
        assert_eq!(FieldValue::Str(" 42.5 ".to_string()).as_f64(), Some(42.5));
        assert_eq!(FieldValue::Str("abc".to_string()).as_f64(), None);
    }

    #[test]
    fn test_field_value_rejects_non_finite() {
        assert_eq!(FieldValue::Double(f64::NAN).as_f64(), None);
        assert_eq!(FieldValue::Double(f64::INFINITY).as_f64(), None);
        assert_eq!(FieldValue::Double(f64::NEG_INFINITY).as_f64(), None);
        assert_eq!(FieldValue::Str("NaN".to_string()).as_f64(), None);
        assert_eq!(FieldValue::Str("inf".to_string()).as_f64(), None);
        assert_eq!(FieldValue::Str("-infinity".to_string()).as_f64(), None);
        assert_eq!(FieldValue::Double(f64::MAX).as_f64(), Some(f64::MAX));
    }

    #[test]
    fn test_field_value_deserialize_untagged() {
        let attrs: Attributes =
            serde_json::from_str(r#"{"a": 1, "b": 2.5, "c": "x", "d": false}"#).unwrap();
        assert_eq!(attrs["a"], FieldValue::Int(1));
        assert_eq!(attrs["b"], FieldValue::Double(2.5));
        assert_eq!(attrs["c"], FieldValue::Str("x".to_string()));
        assert_eq!(attrs["d"], FieldValue::Bool(false));
    }

    #[test]
    fn test_record_wire_format() {
        let mut dims = Dimensions::new();
        dims.insert("host".to_string(), "node-1".to_string());
        let record = Record::new("cpu_usage", dims, 12.5, 1_700_000_000_000);

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "name": "cpu_usage",
                "dimensions": {"host": "node-1"},
                "value": 12.5,
                "timestamp": 1_700_000_000_000_i64,
                "value_meta": {}
            })
        );
    }
}
