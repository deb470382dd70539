//! Persistence bridge: load and save whole-project canvas snapshots.
//!
//! DESIGN
//! ======
//! Hubs talk to durable storage through the `SnapshotStore` trait only. A hub
//! loads its snapshot once when it is created and saves the full canvas set
//! whenever a session's keep-alive ticks or a session ends. Saves overwrite;
//! there is no diffing, so the stored copy lags the live store by at most one
//! keep-alive interval.
//!
//! ERROR HANDLING
//! ==============
//! Nothing here is fatal to a hub. A failed load starts the hub empty, a
//! failed save is logged and retried on the next tick.

use std::sync::Arc;

use async_trait::async_trait;
use protocol::Canvas;
use sqlx::PgPool;

use crate::services::project::{self, ProjectError};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error(transparent)]
    Project(#[from] ProjectError),
    #[error("snapshot store unavailable: {0}")]
    Unavailable(String),
}

/// Durable home for each project's canvas set.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Stored canvases for `project_id`. A project with no snapshot yields an empty list.
    async fn load_snapshot(&self, project_id: &str) -> Result<Vec<Canvas>, PersistenceError>;

    /// Replace the stored canvases for `project_id`.
    async fn save_snapshot(&self, project_id: &str, canvases: &[Canvas]) -> Result<(), PersistenceError>;
}

/// `SnapshotStore` backed by the `projects.canvases_data` column.
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn shared(pool: PgPool) -> Arc<dyn SnapshotStore> {
        Arc::new(Self::new(pool))
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn load_snapshot(&self, project_id: &str) -> Result<Vec<Canvas>, PersistenceError> {
        Ok(project::get_canvas_snapshot(&self.pool, project_id).await?.unwrap_or_default())
    }

    async fn save_snapshot(&self, project_id: &str, canvases: &[Canvas]) -> Result<(), PersistenceError> {
        if !project::set_canvas_snapshot(&self.pool, project_id, canvases).await? {
            tracing::debug!(%project_id, "snapshot save skipped: no project row");
        }
        Ok(())
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "persistence_test.rs"]
mod tests;
