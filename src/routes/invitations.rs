//! Invitation routes: single-use links that add a collaborator to a project.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;

use crate::routes::auth::AuthUser;
use crate::routes::projects::project_error_to_status;
use crate::services::project;
use crate::state::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInvitationBody {
    #[serde(alias = "projectID")]
    pub project_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptInvitationBody {
    pub invite_link: String,
}

/// `POST /api/invitations`: mint a link for a project the caller belongs to.
pub async fn create_invitation(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<CreateInvitationBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), StatusCode> {
    let row = project::create_invitation(&state.pool, &body.project_id, auth.user.id)
        .await
        .map_err(project_error_to_status)?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "inviteLink": row.link, "projectId": row.project_id })),
    ))
}

/// `POST /api/invitations/accept`: consume a link and join its project.
pub async fn accept_invitation(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<AcceptInvitationBody>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let link = body.invite_link.trim();
    if link.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let project_id = project::accept_invitation(&state.pool, link, auth.user.id)
        .await
        .map_err(project_error_to_status)?;
    tracing::info!(%project_id, user_id = %auth.user.id, "invitation accepted");
    Ok(Json(serde_json::json!({ "projectId": project_id })))
}

#[cfg(test)]
#[path = "invitations_test.rs"]
mod tests;
