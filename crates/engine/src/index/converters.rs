//! Conversion of JSON element values into typed index values.

use serde_json::Value;

use super::IndexValue;
use super::definitions::SearchParamType;
use crate::types::{FhirDate, FhirDateTime};

/// Converter for transforming JSON values to index values.
pub struct ValueConverter;

impl ValueConverter {
    /// Converts a JSON value to index values based on the target parameter type.
    ///
    /// May return multiple values for arrays or complex types. Values that do
    /// not fit the type are skipped.
    pub fn convert(value: &Value, target_type: SearchParamType) -> Vec<IndexValue> {
        match value {
            Value::Array(arr) => arr
                .iter()
                .flat_map(|item| Self::convert_single(item, target_type))
                .collect(),
            _ => Self::convert_single(value, target_type),
        }
    }

    fn convert_single(value: &Value, target_type: SearchParamType) -> Vec<IndexValue> {
        match target_type {
            SearchParamType::String => Self::convert_to_string(value),
            SearchParamType::Token => Self::convert_to_token(value),
            SearchParamType::Date => Self::convert_to_date(value),
            SearchParamType::Number => Self::convert_to_number(value),
            SearchParamType::Quantity => Self::convert_to_quantity(value),
            SearchParamType::Reference => Self::convert_to_reference(value),
            SearchParamType::Uri => Self::convert_to_uri(value),
            SearchParamType::Special => Self::convert_to_position(value),
        }
    }

    fn convert_to_string(value: &Value) -> Vec<IndexValue> {
        let mut results = Vec::new();
        match value {
            Value::String(s) => results.push(IndexValue::String(s.clone())),
            Value::Object(obj) => {
                // HumanName and Address parts
                for key in ["family", "text", "city", "district", "state", "postalCode", "country"] {
                    if let Some(s) = obj.get(key).and_then(Value::as_str) {
                        results.push(IndexValue::String(s.to_string()));
                    }
                }
                for key in ["given", "prefix", "suffix", "line"] {
                    if let Some(parts) = obj.get(key).and_then(Value::as_array) {
                        results.extend(
                            parts
                                .iter()
                                .filter_map(Value::as_str)
                                .map(|s| IndexValue::String(s.to_string())),
                        );
                    }
                }
            }
            _ => {}
        }
        results
    }

    fn convert_to_token(value: &Value) -> Vec<IndexValue> {
        let mut results = Vec::new();
        match value {
            Value::String(s) => results.push(IndexValue::Token {
                system: None,
                code: s.clone(),
            }),
            Value::Bool(b) => results.push(IndexValue::Token {
                system: None,
                code: b.to_string(),
            }),
            Value::Object(obj) => {
                let system = obj.get("system").and_then(Value::as_str).map(String::from);

                // CodeableConcept
                if let Some(coding) = obj.get("coding").and_then(Value::as_array) {
                    for c in coding {
                        results.extend(Self::convert_to_token(c));
                    }
                // Coding
                } else if let Some(code) = obj.get("code").and_then(Value::as_str) {
                    results.push(IndexValue::Token {
                        system,
                        code: code.to_string(),
                    });
                // Identifier and ContactPoint
                } else if let Some(v) = obj.get("value").and_then(Value::as_str) {
                    results.push(IndexValue::Token {
                        system,
                        code: v.to_string(),
                    });
                }
            }
            _ => {}
        }
        results
    }

    fn convert_to_date(value: &Value) -> Vec<IndexValue> {
        match value {
            Value::String(s) if !s.contains('T') => FhirDate::parse(s)
                .map(|d| {
                    let (from, to) = d.epoch_day_range();
                    IndexValue::Date { from, to }
                })
                .into_iter()
                .collect(),
            Value::String(s) => FhirDateTime::parse(s)
                .map(|dt| {
                    let (from, to) = dt.epoch_millis_range();
                    IndexValue::DateTime { from, to }
                })
                .into_iter()
                .collect(),
            Value::Object(obj) => {
                // Period; an open end is unbounded
                let start = obj
                    .get("start")
                    .and_then(Value::as_str)
                    .and_then(FhirDateTime::parse);
                let end = obj
                    .get("end")
                    .and_then(Value::as_str)
                    .and_then(FhirDateTime::parse);
                if start.is_none() && end.is_none() {
                    return Vec::new();
                }
                vec![IndexValue::DateTime {
                    from: start.map(|s| s.start.timestamp_millis()).unwrap_or(i64::MIN),
                    to: end.map(|e| e.end().timestamp_millis()).unwrap_or(i64::MAX),
                }]
            }
            _ => Vec::new(),
        }
    }

    fn convert_to_number(value: &Value) -> Vec<IndexValue> {
        match value {
            Value::Number(n) => n.as_f64().map(IndexValue::Number).into_iter().collect(),
            Value::String(s) => s.parse().ok().map(IndexValue::Number).into_iter().collect(),
            _ => Vec::new(),
        }
    }

    fn convert_to_quantity(value: &Value) -> Vec<IndexValue> {
        let Value::Object(obj) = value else {
            return Vec::new();
        };
        let Some(val) = obj.get("value").and_then(Value::as_f64) else {
            return Vec::new();
        };
        vec![IndexValue::Quantity {
            value: val,
            system: obj.get("system").and_then(Value::as_str).map(String::from),
            code: obj.get("code").and_then(Value::as_str).map(String::from),
            unit: obj.get("unit").and_then(Value::as_str).map(String::from),
        }]
    }

    fn convert_to_reference(value: &Value) -> Vec<IndexValue> {
        match value {
            Value::String(s) => vec![IndexValue::Reference(s.clone())],
            Value::Object(obj) => obj
                .get("reference")
                .and_then(Value::as_str)
                .map(|r| IndexValue::Reference(r.to_string()))
                .into_iter()
                .collect(),
            _ => Vec::new(),
        }
    }

    fn convert_to_uri(value: &Value) -> Vec<IndexValue> {
        match value {
            Value::String(s) => vec![IndexValue::Uri(s.clone())],
            _ => Vec::new(),
        }
    }

    fn convert_to_position(value: &Value) -> Vec<IndexValue> {
        let latitude = value.get("latitude").and_then(Value::as_f64);
        let longitude = value.get("longitude").and_then(Value::as_f64);
        match (latitude, longitude) {
            (Some(latitude), Some(longitude)) => vec![IndexValue::Position {
                latitude,
                longitude,
            }],
            _ => Vec::new(),
        }
    }
}
