//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the database pool and the hub registry. All live drawing state
//! sits behind the registry; handlers never touch a canvas store directly.

use sqlx::PgPool;

use crate::config::HubConfig;
use crate::services::persistence::PgSnapshotStore;
use crate::services::registry::HubRegistry;

/// Shared application state. Clone is required by Axum; every field is a
/// cheap handle.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub hubs: HubRegistry,
}

impl AppState {
    /// State whose hubs persist snapshots to the `projects` table.
    #[must_use]
    pub fn new(pool: PgPool, hub_config: HubConfig) -> Self {
        let hubs = HubRegistry::new(PgSnapshotStore::shared(pool.clone()), hub_config);
        Self { pool, hubs }
    }

    #[must_use]
    pub fn with_registry(pool: PgPool, hubs: HubRegistry) -> Self {
        Self { pool, hubs }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
#[path = "state_helpers_test.rs"]
pub mod test_helpers;

#[cfg(test)]
#[path = "state_test.rs"]
mod tests;
