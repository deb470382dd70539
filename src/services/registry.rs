//! Hub registry: lazily creates exactly one live hub per project.
//!
//! DESIGN
//! ======
//! The registry maps project id to an `Arc<OnceCell<Hub>>`. The std mutex
//! around the map is held only to find or insert the cell; the slow part of
//! hub creation (loading the snapshot) runs inside `OnceCell::get_or_init`,
//! so concurrent joiners for one project wait on the same initialization
//! while other projects proceed.
//!
//! A retired hub removes its own entry through the retire hook. Lookups that
//! still see a closed hub (the hook has not run yet) drop the entry and build
//! a replacement.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::{OnceCell, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::services::canvas::CanvasStore;
use crate::services::hub::{Hub, HubError, Payload, RetireHook, SessionHandle};
use crate::services::persistence::SnapshotStore;

const MAX_JOIN_ATTEMPTS: usize = 5;

type HubCell = Arc<OnceCell<Hub>>;

struct RegistryInner {
    hubs: Mutex<HashMap<String, HubCell>>,
    snapshots: Arc<dyn SnapshotStore>,
    config: HubConfig,
}

#[derive(Clone)]
pub struct HubRegistry {
    inner: Arc<RegistryInner>,
}

/// A session that has been accepted by a hub.
pub struct Joined {
    pub hub: Hub,
    pub session_id: Uuid,
    /// Outbound queue; the workboard snapshot is already its first message.
    pub outbound: mpsc::Receiver<Payload>,
}

impl RegistryInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, HubCell>> {
        self.hubs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn retire(&self, project_id: &str, hub_id: Uuid) {
        let mut hubs = self.lock();
        let current = hubs.get(project_id).and_then(|cell| cell.get()).map(Hub::id);
        if current == Some(hub_id) {
            hubs.remove(project_id);
            info!(%project_id, %hub_id, "registry: hub removed");
        }
    }
}

impl HubRegistry {
    #[must_use]
    pub fn new(snapshots: Arc<dyn SnapshotStore>, config: HubConfig) -> Self {
        Self { inner: Arc::new(RegistryInner { hubs: Mutex::new(HashMap::new()), snapshots, config }) }
    }

    #[must_use]
    pub fn config(&self) -> HubConfig {
        self.inner.config
    }

    /// The live hub for `project_id`, if one is running.
    #[must_use]
    pub fn get(&self, project_id: &str) -> Option<Hub> {
        let hubs = self.inner.lock();
        hubs.get(project_id).and_then(|cell| cell.get()).filter(|hub| !hub.is_closed()).cloned()
    }

    /// Number of projects with a registry entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The live hub for `project_id`, creating and loading it on first use.
    pub async fn hub(&self, project_id: &str) -> Hub {
        loop {
            let cell = {
                let mut hubs = self.inner.lock();
                hubs.entry(project_id.to_owned()).or_default().clone()
            };

            let hub = cell.get_or_init(|| self.create_hub(project_id)).await.clone();
            if !hub.is_closed() {
                return hub;
            }

            let mut hubs = self.inner.lock();
            if hubs.get(project_id).is_some_and(|current| Arc::ptr_eq(current, &cell)) {
                hubs.remove(project_id);
                debug!(%project_id, hub_id = %hub.id(), "registry: replacing closed hub");
            }
        }
    }

    /// Register a new session on the project's hub, retrying when the hub
    /// retires underneath the join.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Retired`] if every attempt lands on a retiring hub.
    pub async fn join(&self, project_id: &str, user_id: &str, username: &str) -> Result<Joined, HubError> {
        for attempt in 1..=MAX_JOIN_ATTEMPTS {
            let hub = self.hub(project_id).await;
            let (tx, outbound) = mpsc::channel(self.inner.config.session_queue_capacity);
            let session = SessionHandle::new(user_id, username, tx);
            let session_id = session.id;

            match hub.register(session).await {
                Ok(()) => return Ok(Joined { hub, session_id, outbound }),
                Err(e) => debug!(%project_id, attempt, error = %e, "registry: join raced hub retirement"),
            }
        }
        Err(HubError::Retired(project_id.to_owned()))
    }

    async fn create_hub(&self, project_id: &str) -> Hub {
        let canvases = match self.inner.snapshots.load_snapshot(project_id).await {
            Ok(canvases) => canvases,
            Err(e) => {
                warn!(%project_id, error = %e, "registry: snapshot load failed; starting empty");
                Vec::new()
            }
        };
        let loaded = canvases.len();

        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let owned_project_id = project_id.to_owned();
        let on_retire: RetireHook = Box::new(move |hub_id: Uuid| {
            if let Some(inner) = weak.upgrade() {
                inner.retire(&owned_project_id, hub_id);
            }
        });

        let hub = Hub::spawn(
            project_id,
            CanvasStore::with_canvases(canvases),
            Arc::clone(&self.inner.snapshots),
            self.inner.config,
            on_retire,
        );
        info!(%project_id, hub_id = %hub.id(), canvases = loaded, "registry: hub created");
        hub
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
