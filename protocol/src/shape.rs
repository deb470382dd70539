//! Vector elements: the closed set of drawable shapes.
//!
//! DESIGN
//! ======
//! Every element carries the same style block (`id`, `stroke`, `strokeWidth`,
//! `fill`, optional `action`) plus variant geometry. On the wire the variant is
//! selected by the `type` field:
//!
//! ```json
//! {"type":"rectangle","id":"e1","stroke":"#000","strokeWidth":2,"fill":"none","x":0,"y":0,"width":10,"height":5}
//! ```
//!
//! The style block is `#[serde(flatten)]`ed into each variant so the JSON stays
//! flat while Rust code gets one `ShapeStyle` to read and mutate.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::lenient;

// =============================================================================
// PRIMITIVES
// =============================================================================

/// Canvas-space coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    #[serde(default, deserialize_with = "lenient::float")]
    pub x: f64,
    #[serde(default, deserialize_with = "lenient::float")]
    pub y: f64,
}

impl Point {
    #[must_use]
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Interaction attached to an element, e.g. `{"type":"link","link":"https://x"}`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type", default, deserialize_with = "lenient::string")]
    pub kind: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub link: String,
}

impl Action {
    #[must_use]
    pub fn link(url: impl Into<String>) -> Self {
        Self { kind: "link".into(), link: url.into() }
    }

    /// Clients send `{"type":"","link":""}` to mean "no action".
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kind.is_empty() && self.link.is_empty()
    }
}

fn non_empty_action<'de, D>(deserializer: D) -> Result<Option<Action>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Action>::deserialize(deserializer)?.filter(|a| !a.is_empty()))
}

/// Attributes shared by every element variant.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShapeStyle {
    #[serde(default, deserialize_with = "lenient::string")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient::string")]
    pub stroke: String,
    #[serde(default, deserialize_with = "lenient::float")]
    pub stroke_width: f64,
    #[serde(default, deserialize_with = "lenient::string")]
    pub fill: String,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "non_empty_action")]
    pub action: Option<Action>,
}

// =============================================================================
// VARIANTS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PathShape {
    #[serde(flatten)]
    pub style: ShapeStyle,
    #[serde(default)]
    pub points: Vec<Point>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RectangleShape {
    #[serde(flatten)]
    pub style: ShapeStyle,
    #[serde(default, deserialize_with = "lenient::float")]
    pub x: f64,
    #[serde(default, deserialize_with = "lenient::float")]
    pub y: f64,
    #[serde(default, deserialize_with = "lenient::float")]
    pub width: f64,
    #[serde(default, deserialize_with = "lenient::float")]
    pub height: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CircleShape {
    #[serde(flatten)]
    pub style: ShapeStyle,
    #[serde(default, deserialize_with = "lenient::float")]
    pub cx: f64,
    #[serde(default, deserialize_with = "lenient::float")]
    pub cy: f64,
    #[serde(default, deserialize_with = "lenient::float")]
    pub radius: f64,
}

/// One drawable element. The `type` field selects the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VectorElement {
    Path(PathShape),
    Rectangle(RectangleShape),
    Circle(CircleShape),
}

/// Discriminants accepted in the `type` field.
pub const ELEMENT_KINDS: [&str; 3] = ["path", "rectangle", "circle"];

#[derive(Debug, thiserror::Error)]
pub enum ElementError {
    #[error("element is not a JSON object")]
    NotAnObject,
    #[error("element has no type")]
    MissingKind,
    #[error("unknown element type: {0}")]
    UnknownKind(String),
    #[error("element has no id")]
    MissingId,
    #[error("malformed {kind} element: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl VectorElement {
    /// Decode one raw element, checking the discriminant before the body so
    /// unknown types produce a precise error.
    ///
    /// # Errors
    ///
    /// Returns an [`ElementError`] when the value is not an object, has a
    /// missing or unknown `type`, fails to decode, or has an empty `id`.
    pub fn from_value(value: Value) -> Result<Self, ElementError> {
        let Some(map) = value.as_object() else {
            return Err(ElementError::NotAnObject);
        };
        let Some(raw_kind) = map.get("type").and_then(Value::as_str) else {
            return Err(ElementError::MissingKind);
        };
        let Some(kind) = ELEMENT_KINDS.iter().copied().find(|k| *k == raw_kind) else {
            return Err(ElementError::UnknownKind(raw_kind.to_owned()));
        };

        let element: Self = serde_json::from_value(value).map_err(|source| ElementError::Malformed { kind, source })?;
        if element.id().is_empty() {
            return Err(ElementError::MissingId);
        }
        Ok(element)
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Path(_) => "path",
            Self::Rectangle(_) => "rectangle",
            Self::Circle(_) => "circle",
        }
    }

    #[must_use]
    pub fn style(&self) -> &ShapeStyle {
        match self {
            Self::Path(s) => &s.style,
            Self::Rectangle(s) => &s.style,
            Self::Circle(s) => &s.style,
        }
    }

    pub fn style_mut(&mut self) -> &mut ShapeStyle {
        match self {
            Self::Path(s) => &mut s.style,
            Self::Rectangle(s) => &mut s.style,
            Self::Circle(s) => &mut s.style,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.style().id
    }

    #[must_use]
    pub fn action(&self) -> Option<&Action> {
        self.style().action.as_ref()
    }

    pub fn set_action(&mut self, action: Action) {
        self.style_mut().action = if action.is_empty() { None } else { Some(action) };
    }
}

/// Decode a list of raw elements, dropping (and logging) the ones that fail.
#[must_use]
pub fn parse_elements(values: Vec<Value>) -> Vec<VectorElement> {
    values
        .into_iter()
        .filter_map(|value| match VectorElement::from_value(value) {
            Ok(element) => Some(element),
            Err(e) => {
                warn!(error = %e, "dropping vector element");
                None
            }
        })
        .collect()
}

#[cfg(test)]
#[path = "shape_test.rs"]
mod tests;
