//! Message envelope, typed inbound messages and user presence.
//!
//! DESIGN
//! ======
//! Every websocket text frame is one [`Envelope`]:
//!
//! ```json
//! {"type":"operation","subtype":"shape","data":{...},"userId":"u1","projectId":"p1"}
//! ```
//!
//! `Inbound::parse` turns an envelope into a closed enum once, so the hub
//! matches exhaustively instead of probing JSON. Operations without a
//! `subtype` are treated as `load`, which is what the earliest clients sent.
//!
//! Outbound envelopes built here are the workboard snapshot sent on connect
//! and the `users_state` roster the hub broadcasts on membership changes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::canvas::{Canvas, json_kind, parse_canvases};
use crate::lenient;
use crate::shape::{Action, ElementError, Point, VectorElement};

// =============================================================================
// ENVELOPE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "userID")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "projectID")]
    pub project_id: Option<String>,
}

/// Top-level message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Operation,
    CursorMove,
    UsersState,
}

impl MessageType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Operation => "operation",
            Self::CursorMove => "cursor_move",
            Self::UsersState => "users_state",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "operation" => Some(Self::Operation),
            "cursor_move" => Some(Self::CursorMove),
            "users_state" => Some(Self::UsersState),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("unknown operation subtype: {0}")]
    UnknownSubtype(String),
    #[error("invalid {subtype} payload: {reason}")]
    InvalidPayload { subtype: &'static str, reason: String },
    #[error(transparent)]
    Element(#[from] ElementError),
}

fn invalid(subtype: &'static str, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::InvalidPayload { subtype, reason: reason.into() }
}

impl Envelope {
    #[must_use]
    pub fn new(kind: MessageType, data: Value) -> Self {
        Self { kind: kind.as_str().to_owned(), subtype: None, data, user_id: None, project_id: None }
    }

    /// An `operation` envelope with the given subtype.
    #[must_use]
    pub fn operation(subtype: &str, data: Value) -> Self {
        Self { subtype: Some(subtype.to_owned()), ..Self::new(MessageType::Operation, data) }
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    #[must_use]
    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    /// Full workboard snapshot, sent once to each session on connect.
    ///
    /// # Errors
    ///
    /// Returns an error if a canvas fails to serialize.
    pub fn workboard(canvases: &[Canvas]) -> Result<Self, serde_json::Error> {
        Ok(Self::operation("load", serde_json::to_value(canvases)?))
    }

    /// Presence roster keyed by user id.
    ///
    /// # Errors
    ///
    /// Returns an error if a presence timestamp cannot be formatted.
    pub fn users_state(users: &UsersState) -> Result<Self, serde_json::Error> {
        Ok(Self::new(MessageType::UsersState, serde_json::to_value(users)?))
    }

    /// A cursor update from `user_id`.
    #[must_use]
    pub fn cursor_move(user_id: impl Into<String>, position: Point, is_drawing: bool) -> Self {
        let data = serde_json::json!({ "position": position, "isDrawing": is_drawing });
        Self::new(MessageType::CursorMove, data).with_user(user_id)
    }

    /// # Errors
    ///
    /// Returns an error if `text` is not a JSON envelope.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// # Errors
    ///
    /// Returns an error if the payload fails to serialize.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// TYPED INBOUND
// =============================================================================

/// Canvas mutations carried by `operation` envelopes.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// `load` and `add`: upsert each canvas whole.
    Load(Vec<Canvas>),
    /// `shape`: replace or append one element on a canvas.
    Shape { canvas_id: String, element: VectorElement },
    /// `canvas`: change a canvas background fill.
    Background { canvas_id: String, background: String },
    /// `remove`: drop a canvas.
    Remove { canvas_id: String },
    /// `action`: attach an interaction to an element.
    Action { canvas_id: String, element_id: String, action: Action },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Operation(Operation),
    CursorMove { user_id: Option<String>, position: Point, is_drawing: Option<bool> },
    /// Hub-produced only; clients echoing it are ignored.
    UsersState,
}

#[derive(Deserialize)]
struct ShapePayload {
    #[serde(default, deserialize_with = "lenient::string")]
    id: String,
    #[serde(default)]
    stroke: Value,
}

#[derive(Deserialize)]
struct BackgroundPayload {
    #[serde(default, deserialize_with = "lenient::string")]
    id: String,
    #[serde(default, deserialize_with = "lenient::string")]
    background: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActionPayload {
    #[serde(default, deserialize_with = "lenient::string")]
    canvas_id: String,
    #[serde(default, deserialize_with = "lenient::string")]
    vector_element_id: String,
    #[serde(default)]
    action: Action,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorPayload {
    position: Option<Point>,
    #[serde(default)]
    is_drawing: Option<bool>,
}

impl Inbound {
    /// Parse raw text into an envelope and its typed content.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] for invalid JSON, unknown types or
    /// subtypes, and payloads that do not match their subtype.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Self::from_envelope(Envelope::parse(text)?)
    }

    /// # Errors
    ///
    /// See [`Inbound::parse`].
    pub fn from_envelope(envelope: Envelope) -> Result<Self, ProtocolError> {
        let Some(kind) = MessageType::parse(&envelope.kind) else {
            return Err(ProtocolError::UnknownType(envelope.kind));
        };
        match kind {
            MessageType::Operation => {
                let subtype = envelope.subtype.as_deref().unwrap_or("load");
                Ok(Self::Operation(parse_operation(subtype, envelope.data)?))
            }
            MessageType::CursorMove => {
                let payload: CursorPayload = serde_json::from_value(envelope.data)
                    .map_err(|e| invalid("cursor_move", e.to_string()))?;
                let Some(position) = payload.position else {
                    return Err(invalid("cursor_move", "missing position"));
                };
                Ok(Self::CursorMove { user_id: envelope.user_id, position, is_drawing: payload.is_drawing })
            }
            MessageType::UsersState => Ok(Self::UsersState),
        }
    }
}

fn parse_operation(subtype: &str, data: Value) -> Result<Operation, ProtocolError> {
    match subtype {
        "load" | "add" => match data {
            Value::Object(_) | Value::Array(_) => Ok(Operation::Load(parse_canvases(data))),
            other => Err(invalid("load", format!("expected object or array, got {}", json_kind(&other)))),
        },
        "shape" => {
            let payload: ShapePayload = serde_json::from_value(data).map_err(|e| invalid("shape", e.to_string()))?;
            if payload.id.is_empty() {
                return Err(invalid("shape", "missing canvas id"));
            }
            let element = VectorElement::from_value(payload.stroke)?;
            Ok(Operation::Shape { canvas_id: payload.id, element })
        }
        "canvas" => {
            let payload: BackgroundPayload =
                serde_json::from_value(data).map_err(|e| invalid("canvas", e.to_string()))?;
            if payload.id.is_empty() {
                return Err(invalid("canvas", "missing canvas id"));
            }
            Ok(Operation::Background { canvas_id: payload.id, background: payload.background })
        }
        "remove" => {
            let canvas_id = match &data {
                Value::Object(map) => map.get("id").map(lenient::value_to_string).unwrap_or_default(),
                scalar => lenient::value_to_string(scalar),
            };
            if canvas_id.is_empty() {
                return Err(invalid("remove", "missing canvas id"));
            }
            Ok(Operation::Remove { canvas_id })
        }
        "action" => {
            let payload: ActionPayload = serde_json::from_value(data).map_err(|e| invalid("action", e.to_string()))?;
            if payload.canvas_id.is_empty() || payload.vector_element_id.is_empty() {
                return Err(invalid("action", "missing canvasId or vectorElementId"));
            }
            Ok(Operation::Action {
                canvas_id: payload.canvas_id,
                element_id: payload.vector_element_id,
                action: payload.action,
            })
        }
        other => Err(ProtocolError::UnknownSubtype(other.to_owned())),
    }
}

// =============================================================================
// PRESENCE
// =============================================================================

/// Live presence of one user in a project. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPresence {
    pub user_id: String,
    pub username: String,
    pub cursor: Option<Point>,
    pub color: String,
    #[serde(default)]
    pub is_drawing: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

/// Roster sent in `users_state`, keyed by user id.
pub type UsersState = BTreeMap<String, UserPresence>;

impl UserPresence {
    #[must_use]
    pub fn new(user_id: impl Into<String>, username: impl Into<String>, joined_at: OffsetDateTime) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            cursor: None,
            color: presence_color(joined_at),
            is_drawing: false,
            last_seen: joined_at,
        }
    }

    pub fn move_cursor(&mut self, position: Point, is_drawing: Option<bool>, at: OffsetDateTime) {
        self.cursor = Some(position);
        if let Some(drawing) = is_drawing {
            self.is_drawing = drawing;
        }
        self.last_seen = at;
    }
}

/// `#rrggbb` color derived from a join instant.
#[must_use]
pub fn presence_color(at: OffsetDateTime) -> String {
    format!("#{:06x}", at.unix_timestamp_nanos().rem_euclid(0xFF_FFFF))
}

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;
