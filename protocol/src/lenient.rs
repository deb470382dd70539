//! Forgiving field decoders for client-supplied JSON.
//!
//! Browser clients send ids and versions as either strings or numbers, and
//! omit or null out geometry they consider default. These helpers collapse
//! those shapes into the single Rust type each field uses.

use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::shape::{VectorElement, parse_elements};

/// Render a scalar JSON value as a string; anything else becomes empty.
pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => String::new(),
    }
}

/// Read a JSON value as `f64`, accepting numeric strings. Missing or null is zero.
pub(crate) fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Null => Some(0.0),
        _ => None,
    }
}

pub(crate) fn string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(value_to_string(&Value::deserialize(deserializer)?))
}

pub(crate) fn float<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    value_to_f64(&value).ok_or_else(|| serde::de::Error::custom(format!("expected a number, got {value}")))
}

pub(crate) fn elements<'de, D>(deserializer: D) -> Result<Vec<VectorElement>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?;
    Ok(raw.map(parse_elements).unwrap_or_default())
}
