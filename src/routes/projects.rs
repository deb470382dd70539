//! Project routes: CRUD, lookup by name, and the workboard snapshot.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use protocol::Canvas;
use serde::Deserialize;

use crate::routes::auth::AuthUser;
use crate::services::project::{self, ProjectError, ProjectRow};
use crate::state::AppState;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectBody {
    pub name: String,
    #[serde(default)]
    pub creation_date: Option<String>,
}

/// `POST /api/projects`: create a project owned by the caller.
pub async fn create_project(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<CreateProjectBody>,
) -> Result<(StatusCode, Json<ProjectRow>), StatusCode> {
    let creation_date = body.creation_date.unwrap_or_default();
    let row = project::create_project(&state.pool, auth.user.id, &body.name, &creation_date)
        .await
        .map_err(project_error_to_status)?;
    tracing::info!(project_id = %row.id, owner_id = %auth.user.id, "project created");
    Ok((StatusCode::CREATED, Json(row)))
}

/// `GET /api/projects`: projects the caller owns or collaborates on.
pub async fn list_projects(State(state): State<AppState>, auth: AuthUser) -> Result<Json<Vec<ProjectRow>>, StatusCode> {
    let rows = project::list_projects(&state.pool, auth.user.id)
        .await
        .map_err(project_error_to_status)?;
    Ok(Json(rows))
}

/// `GET /api/projects/by-name/{name}`: first visible project with this name.
pub async fn find_project(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(name): Path<String>,
) -> Result<Json<ProjectRow>, StatusCode> {
    let row = project::find_project_by_name(&state.pool, auth.user.id, &name)
        .await
        .map_err(project_error_to_status)?;
    Ok(Json(row))
}

/// `GET /api/projects/{id}`: fetch one project.
pub async fn get_project(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(project_id): Path<String>,
) -> Result<Json<ProjectRow>, StatusCode> {
    let row = project::get_member_project(&state.pool, &project_id, auth.user.id)
        .await
        .map_err(project_error_to_status)?;
    Ok(Json(row))
}

/// `DELETE /api/projects/{id}`: owner-only delete.
pub async fn delete_project(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(project_id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    project::delete_project(&state.pool, &project_id, auth.user.id)
        .await
        .map_err(project_error_to_status)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/projects/{id}/workboard`: live canvases when the project's hub
/// is running, else the stored snapshot.
pub async fn workboard(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(project_id): Path<String>,
) -> Result<Json<Vec<Canvas>>, StatusCode> {
    project::get_member_project(&state.pool, &project_id, auth.user.id)
        .await
        .map_err(project_error_to_status)?;

    if let Some(hub) = state.hubs.get(&project_id) {
        return Ok(Json(hub.workboard().await));
    }

    let canvases = project::get_canvas_snapshot(&state.pool, &project_id)
        .await
        .map_err(project_error_to_status)?
        .unwrap_or_default();
    Ok(Json(canvases))
}

pub(crate) fn project_error_to_status(err: ProjectError) -> StatusCode {
    match err {
        ProjectError::NotFound(_) | ProjectError::InvitationNotFound => StatusCode::NOT_FOUND,
        ProjectError::Forbidden(_) => StatusCode::FORBIDDEN,
        ProjectError::InvalidName => StatusCode::BAD_REQUEST,
        ProjectError::InvitationUsed => StatusCode::GONE,
        ProjectError::Snapshot(e) => {
            tracing::error!(error = %e, "snapshot encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
        ProjectError::Database(e) => {
            tracing::error!(error = %e, "project query failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
#[path = "projects_test.rs"]
mod tests;
