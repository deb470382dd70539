//! Domain services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own realtime state, business logic, and persistence so
//! route handlers can stay focused on protocol translation and auth plumbing.

pub mod account;
pub mod canvas;
pub mod hub;
pub mod persistence;
pub mod project;
pub mod registry;
pub mod session;
