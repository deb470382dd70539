//! Shared realtime wire model for the drawing backend and its clients.
//!
//! DESIGN
//! ======
//! Everything that crosses the websocket is JSON. This crate owns the typed
//! view of that JSON: vector elements, canvases, user presence and the message
//! envelope. Parsing happens once at the boundary (`Inbound::parse`) so the
//! hub never inspects raw `serde_json::Value` payloads.
//!
//! Decoding is lenient where clients are known to be sloppy (numeric ids,
//! empty actions, a single canvas where a list is expected) and strict about
//! the element discriminant and ids.

pub mod canvas;
pub mod message;
pub mod shape;

mod lenient;

pub use canvas::{Canvas, CanvasError, VectorData, parse_canvases};
pub use message::{Envelope, Inbound, MessageType, Operation, ProtocolError, UserPresence, UsersState, presence_color};
pub use shape::{Action, CircleShape, ElementError, PathShape, Point, RectangleShape, ShapeStyle, VectorElement};
