//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! This module binds the realtime websocket endpoint and the JSON API for
//! accounts, projects and invitations under a single Axum router.

pub mod auth;
pub mod invitations;
pub mod projects;
pub mod ws;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Full application router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api = Router::new()
        .route("/api/users/register", post(auth::register))
        .route("/api/users/login", post(auth::login))
        .route("/api/auth/me", get(auth::me))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/projects", get(projects::list_projects).post(projects::create_project))
        .route("/api/projects/by-name/{name}", get(projects::find_project))
        .route("/api/projects/{id}", get(projects::get_project).delete(projects::delete_project))
        .route("/api/projects/{id}/workboard", get(projects::workboard))
        .route("/api/invitations", post(invitations::create_invitation))
        .route("/api/invitations/accept", post(invitations::accept_invitation))
        .route("/healthz", get(healthz))
        .layer(CompressionLayer::new());

    // The upgrade route stays outside compression.
    Router::new()
        .route("/ws", get(ws::handle_ws))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
