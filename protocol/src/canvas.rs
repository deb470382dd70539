//! Canvases: a sized, backgrounded list of vector elements.
//!
//! A canvas travels as `{"id": "...", "vectorData": {...}}`. Older clients
//! send the vector data fields directly on the canvas object; both forms
//! decode to the same [`Canvas`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::lenient;
use crate::shape::{Action, VectorElement};

/// Drawable contents of one canvas.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorData {
    #[serde(default, deserialize_with = "lenient::float")]
    pub width: f64,
    #[serde(default, deserialize_with = "lenient::float")]
    pub height: f64,
    #[serde(default, deserialize_with = "lenient::string")]
    pub background_fill: String,
    #[serde(default, deserialize_with = "lenient::elements")]
    pub elements: Vec<VectorElement>,
    #[serde(default, deserialize_with = "lenient::string")]
    pub timestamp: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Canvas {
    #[serde(default, deserialize_with = "lenient::string")]
    pub id: String,
    #[serde(default)]
    pub vector_data: VectorData,
}

#[derive(Debug, thiserror::Error)]
pub enum CanvasError {
    #[error("canvas is not a JSON object")]
    NotAnObject,
    #[error("canvas has no id")]
    MissingId,
    #[error("malformed canvas: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl Canvas {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), vector_data: VectorData::default() }
    }

    /// Decode one canvas object in either the nested or the flat form.
    ///
    /// # Errors
    ///
    /// Returns a [`CanvasError`] when the value is not an object, fails to
    /// decode, or has an empty `id`.
    pub fn from_value(value: Value) -> Result<Self, CanvasError> {
        let Value::Object(mut map) = value else {
            return Err(CanvasError::NotAnObject);
        };

        let canvas: Self = if map.contains_key("vectorData") {
            serde_json::from_value(Value::Object(map))?
        } else {
            let id = map.remove("id").unwrap_or(Value::Null);
            let mut nested = Map::new();
            nested.insert("id".into(), id);
            nested.insert("vectorData".into(), Value::Object(map));
            serde_json::from_value(Value::Object(nested))?
        };

        if canvas.id.is_empty() {
            return Err(CanvasError::MissingId);
        }
        Ok(canvas)
    }

    #[must_use]
    pub fn element(&self, element_id: &str) -> Option<&VectorElement> {
        self.vector_data.elements.iter().find(|e| e.id() == element_id)
    }

    /// Replace the element with the same id, or append it.
    pub fn upsert_element(&mut self, element: VectorElement) {
        let elements = &mut self.vector_data.elements;
        match elements.iter_mut().find(|e| e.id() == element.id()) {
            Some(slot) => *slot = element,
            None => elements.push(element),
        }
    }

    /// Attach `action` to the element with `element_id`. Returns `false` when
    /// no such element exists.
    pub fn attach_action(&mut self, element_id: &str, action: Action) -> bool {
        let Some(element) = self.vector_data.elements.iter_mut().find(|e| e.id() == element_id) else {
            return false;
        };
        element.set_action(action);
        true
    }
}

/// Decode a `load`/`add` payload: a single canvas object or an array of them.
/// Entries that fail to decode are logged and skipped.
#[must_use]
pub fn parse_canvases(value: Value) -> Vec<Canvas> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(_) => vec![value],
        other => {
            warn!(kind = json_kind(&other), "canvas payload is neither object nor array");
            return Vec::new();
        }
    };

    items
        .into_iter()
        .filter_map(|item| match Canvas::from_value(item) {
            Ok(canvas) => Some(canvas),
            Err(e) => {
                warn!(error = %e, "dropping canvas");
                None
            }
        })
        .collect()
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
#[path = "canvas_test.rs"]
mod tests;
