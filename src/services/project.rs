//! Project store: project metadata, invitations and the canvas snapshot column.
//!
//! DESIGN
//! ======
//! A project is owned by one user and shared with a set of collaborators
//! (`projects.collaborators UUID[]`). Its canvases are stored as a single
//! JSONB document (`projects.canvases_data`) that the persistence bridge
//! overwrites whole on every flush.
//!
//! Invitations are single-use links. Accepting one flips `used` and appends
//! the caller to the collaborator set in one transaction; the append is a
//! set insert, so accepting twice (or as the owner) never duplicates a row.

use protocol::{Canvas, parse_canvases};
use rand::Rng;
use rand::distr::Alphanumeric;
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

const ID_LEN: usize = 32;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ProjectError {
    #[error("project not found: {0}")]
    NotFound(String),
    #[error("not permitted on project {0}")]
    Forbidden(String),
    #[error("project name must not be empty")]
    InvalidName,
    #[error("invitation not found")]
    InvitationNotFound,
    #[error("invitation already used")]
    InvitationUsed,
    #[error("snapshot encoding error: {0}")]
    Snapshot(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRow {
    pub id: String,
    pub owner_id: Uuid,
    pub name: String,
    pub creation_date: String,
    pub collaborators: Vec<Uuid>,
}

impl ProjectRow {
    #[must_use]
    pub fn is_member(&self, user_id: Uuid) -> bool {
        self.owner_id == user_id || self.collaborators.contains(&user_id)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvitationRow {
    pub link: String,
    pub creator_id: Uuid,
    pub project_id: String,
    pub used: bool,
}

/// Random 32-character alphanumeric identifier for projects and invitation links.
#[must_use]
pub fn generate_id() -> String {
    rand::rng().sample_iter(&Alphanumeric).take(ID_LEN).map(char::from).collect()
}

fn project_from_row(row: &PgRow) -> ProjectRow {
    ProjectRow {
        id: row.get("id"),
        owner_id: row.get("owner_id"),
        name: row.get("name"),
        creation_date: row.get("creation_date"),
        collaborators: row.get("collaborators"),
    }
}

const PROJECT_COLUMNS: &str = "id, owner_id, name, creation_date, collaborators";

// =============================================================================
// PROJECTS
// =============================================================================

/// Create a project owned by `owner_id`.
///
/// # Errors
///
/// Returns [`ProjectError::InvalidName`] for a blank name, or a database error.
pub async fn create_project(
    pool: &PgPool,
    owner_id: Uuid,
    name: &str,
    creation_date: &str,
) -> Result<ProjectRow, ProjectError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ProjectError::InvalidName);
    }

    let id = generate_id();
    let row = sqlx::query(&format!(
        "INSERT INTO projects (id, owner_id, name, creation_date) VALUES ($1, $2, $3, $4) RETURNING {PROJECT_COLUMNS}"
    ))
    .bind(&id)
    .bind(owner_id)
    .bind(name)
    .bind(creation_date)
    .fetch_one(pool)
    .await?;

    Ok(project_from_row(&row))
}

/// Projects the user owns or collaborates on, oldest first.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn list_projects(pool: &PgPool, user_id: Uuid) -> Result<Vec<ProjectRow>, ProjectError> {
    let rows = sqlx::query(&format!(
        "SELECT {PROJECT_COLUMNS} FROM projects WHERE owner_id = $1 OR $1 = ANY(collaborators) ORDER BY created_at, id"
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(rows.iter().map(project_from_row).collect())
}

/// # Errors
///
/// Returns [`ProjectError::NotFound`] if no such project exists.
pub async fn get_project(pool: &PgPool, project_id: &str) -> Result<ProjectRow, ProjectError> {
    let row = sqlx::query(&format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = $1"))
        .bind(project_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ProjectError::NotFound(project_id.to_owned()))?;
    Ok(project_from_row(&row))
}

/// Fetch a project and require that `user_id` is its owner or a collaborator.
///
/// # Errors
///
/// Returns [`ProjectError::NotFound`] or [`ProjectError::Forbidden`].
pub async fn get_member_project(pool: &PgPool, project_id: &str, user_id: Uuid) -> Result<ProjectRow, ProjectError> {
    let project = get_project(pool, project_id).await?;
    if !project.is_member(user_id) {
        return Err(ProjectError::Forbidden(project_id.to_owned()));
    }
    Ok(project)
}

/// Look up a project by exact name among the projects visible to `user_id`.
///
/// # Errors
///
/// Returns [`ProjectError::NotFound`] when no visible project has that name.
pub async fn find_project_by_name(pool: &PgPool, user_id: Uuid, name: &str) -> Result<ProjectRow, ProjectError> {
    let row = sqlx::query(&format!(
        "SELECT {PROJECT_COLUMNS} FROM projects
         WHERE name = $1 AND (owner_id = $2 OR $2 = ANY(collaborators))
         ORDER BY created_at, id
         LIMIT 1"
    ))
    .bind(name)
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ProjectError::NotFound(name.to_owned()))?;
    Ok(project_from_row(&row))
}

/// Delete a project. Only the owner may delete.
///
/// # Errors
///
/// Returns [`ProjectError::NotFound`] or [`ProjectError::Forbidden`].
pub async fn delete_project(pool: &PgPool, project_id: &str, user_id: Uuid) -> Result<(), ProjectError> {
    let project = get_project(pool, project_id).await?;
    if project.owner_id != user_id {
        return Err(ProjectError::Forbidden(project_id.to_owned()));
    }
    sqlx::query("DELETE FROM projects WHERE id = $1").bind(project_id).execute(pool).await?;
    Ok(())
}

// =============================================================================
// CANVAS SNAPSHOT
// =============================================================================

/// Stored canvases for a project. A missing project yields `None`.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn get_canvas_snapshot(pool: &PgPool, project_id: &str) -> Result<Option<Vec<Canvas>>, ProjectError> {
    let value: Option<serde_json::Value> = sqlx::query_scalar("SELECT canvases_data FROM projects WHERE id = $1")
        .bind(project_id)
        .fetch_optional(pool)
        .await?;
    Ok(value.map(parse_canvases))
}

/// Overwrite the stored canvases. Returns `false` if the project row does not exist.
///
/// # Errors
///
/// Returns an error if the snapshot fails to encode or the update fails.
pub async fn set_canvas_snapshot(pool: &PgPool, project_id: &str, canvases: &[Canvas]) -> Result<bool, ProjectError> {
    let data = serde_json::to_value(canvases)?;
    let result = sqlx::query("UPDATE projects SET canvases_data = $2, updated_at = now() WHERE id = $1")
        .bind(project_id)
        .bind(data)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// =============================================================================
// INVITATIONS
// =============================================================================

/// Create a single-use invitation link for a project the creator belongs to.
///
/// # Errors
///
/// Returns [`ProjectError::NotFound`] or [`ProjectError::Forbidden`].
pub async fn create_invitation(pool: &PgPool, project_id: &str, creator_id: Uuid) -> Result<InvitationRow, ProjectError> {
    get_member_project(pool, project_id, creator_id).await?;

    let link = generate_id();
    sqlx::query("INSERT INTO invitations (link, creator_id, project_id) VALUES ($1, $2, $3)")
        .bind(&link)
        .bind(creator_id)
        .bind(project_id)
        .execute(pool)
        .await?;

    Ok(InvitationRow { link, creator_id, project_id: project_id.to_owned(), used: false })
}

/// Consume an invitation and add `user_id` to the project's collaborators.
/// Returns the project id.
///
/// # Errors
///
/// Returns [`ProjectError::InvitationNotFound`] or
/// [`ProjectError::InvitationUsed`] when the link cannot be consumed.
pub async fn accept_invitation(pool: &PgPool, link: &str, user_id: Uuid) -> Result<String, ProjectError> {
    let mut tx = pool.begin().await?;

    let claimed: Option<String> =
        sqlx::query_scalar("UPDATE invitations SET used = TRUE WHERE link = $1 AND used = FALSE RETURNING project_id")
            .bind(link)
            .fetch_optional(&mut *tx)
            .await?;

    let Some(project_id) = claimed else {
        let exists: Option<bool> = sqlx::query_scalar("SELECT used FROM invitations WHERE link = $1")
            .bind(link)
            .fetch_optional(&mut *tx)
            .await?;
        return Err(if exists.is_some() { ProjectError::InvitationUsed } else { ProjectError::InvitationNotFound });
    };

    sqlx::query(
        "UPDATE projects SET collaborators = array_append(collaborators, $2), updated_at = now()
         WHERE id = $1 AND owner_id <> $2 AND NOT ($2 = ANY(collaborators))",
    )
    .bind(&project_id)
    .bind(user_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(project_id)
}

#[cfg(test)]
#[path = "project_test.rs"]
mod tests;
