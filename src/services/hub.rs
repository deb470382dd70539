//! Hub: one event loop per project that owns its canvases, sessions and presence.
//!
//! DESIGN
//! ======
//! A hub is a spawned task selecting over three bounded queues:
//! registrations, unregistrations and inbound messages. It handles one item
//! at a time and is the only code that touches the session map and the
//! presence roster, so neither needs a lock. The canvas store does carry a
//! lock because persistence flushes and HTTP reads snapshot it concurrently.
//!
//! Every inbound message is parsed into a typed `Inbound`, applied, and then
//! relayed verbatim to every session, whether or not it parsed.
//!
//! BACKPRESSURE
//! ============
//! Fan-out never waits. Each session has a bounded outbound queue; a full (or
//! closed) queue marks that session unresponsive and it is dropped on the
//! spot. Dropping the `SessionHandle` closes the queue, which the outbound
//! pump turns into a websocket close frame. Any drop triggers a fresh
//! `users_state` broadcast so peers see the roster shrink.
//!
//! LIFECYCLE
//! =========
//! When the last session leaves, an idle timer is armed. A registration that
//! arrives before it fires cancels it. When it fires the hub flushes its
//! snapshot, closes its registration queue and asks the registry to forget
//! it. Joiners racing that shutdown see a closed queue and retry against a
//! fresh hub.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::extract::ws::Utf8Bytes;
use protocol::{Canvas, Envelope, Inbound, Operation, UserPresence, UsersState};
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HubConfig;
use crate::services::canvas::CanvasStore;
use crate::services::persistence::SnapshotStore;

/// One websocket text payload. Cheap to clone for fan-out.
pub type Payload = Utf8Bytes;

/// Called once with the hub id when the hub retires.
pub type RetireHook = Box<dyn FnOnce(Uuid) + Send>;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("hub for project {0} has retired")]
    Retired(String),
}

/// The hub's view of one connected session.
pub struct SessionHandle {
    pub id: Uuid,
    pub user_id: String,
    pub username: String,
    tx: mpsc::Sender<Payload>,
}

impl SessionHandle {
    #[must_use]
    pub fn new(user_id: impl Into<String>, username: impl Into<String>, tx: mpsc::Sender<Payload>) -> Self {
        Self { id: Uuid::new_v4(), user_id: user_id.into(), username: username.into(), tx }
    }
}

struct Registration {
    session: SessionHandle,
    ack: oneshot::Sender<()>,
}

struct HubInner {
    id: Uuid,
    project_id: String,
    canvases: CanvasStore,
    snapshots: Arc<dyn SnapshotStore>,
    register_tx: mpsc::Sender<Registration>,
    unregister_tx: mpsc::Sender<Uuid>,
    inbound_tx: mpsc::Sender<Payload>,
    flushing: AtomicBool,
    flush_pending: AtomicBool,
}

/// Cloneable handle to a running hub.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

// =============================================================================
// HANDLE
// =============================================================================

impl Hub {
    /// Start a hub for `project_id` over an already-loaded canvas store.
    #[must_use]
    pub fn spawn(
        project_id: impl Into<String>,
        canvases: CanvasStore,
        snapshots: Arc<dyn SnapshotStore>,
        config: HubConfig,
        on_retire: RetireHook,
    ) -> Self {
        let (register_tx, register_rx) = mpsc::channel(config.inbound_capacity);
        let (unregister_tx, unregister_rx) = mpsc::channel(config.inbound_capacity);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity);

        let hub = Self {
            inner: Arc::new(HubInner {
                id: Uuid::new_v4(),
                project_id: project_id.into(),
                canvases,
                snapshots,
                register_tx,
                unregister_tx,
                inbound_tx,
                flushing: AtomicBool::new(false),
                flush_pending: AtomicBool::new(false),
            }),
        };

        let queues = Queues { register: register_rx, unregister: unregister_rx, inbound: inbound_rx };
        tokio::spawn(run(hub.clone(), queues, config, on_retire));
        hub
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.inner.project_id
    }

    #[must_use]
    pub fn canvases(&self) -> &CanvasStore {
        &self.inner.canvases
    }

    /// `true` once the hub has stopped accepting registrations.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.register_tx.is_closed()
    }

    /// Current canvases, as sent to a joining session.
    pub async fn workboard(&self) -> Vec<Canvas> {
        self.inner.canvases.list_all().await
    }

    /// Join `session` to the hub. Resolves once the hub loop has added it, so
    /// the workboard snapshot is already queued on the session's channel.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Retired`] if the hub shut down first.
    pub async fn register(&self, session: SessionHandle) -> Result<(), HubError> {
        let (ack, acked) = oneshot::channel();
        self.inner.register_tx.send(Registration { session, ack }).await.map_err(|_| self.retired())?;
        acked.await.map_err(|_| self.retired())
    }

    /// Queue removal of a session. A no-op if the hub is gone or the session unknown.
    pub async fn unregister(&self, session_id: Uuid) {
        if self.inner.unregister_tx.send(session_id).await.is_err() {
            debug!(project_id = %self.inner.project_id, %session_id, "hub: unregister after retirement");
        }
    }

    /// Queue one raw inbound message for dispatch.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::Retired`] if the hub loop has stopped.
    pub async fn publish(&self, payload: Payload) -> Result<(), HubError> {
        self.inner.inbound_tx.send(payload).await.map_err(|_| self.retired())
    }

    /// Save the snapshot in the background. Requests that arrive while a
    /// save is running are coalesced into one more save once it finishes, so
    /// the latest state always lands.
    pub fn request_flush(&self) {
        let inner = &self.inner;
        inner.flush_pending.store(true, Ordering::Release);
        if inner.flushing.swap(true, Ordering::AcqRel) {
            return;
        }
        let hub = self.clone();
        tokio::spawn(async move {
            let inner = &hub.inner;
            loop {
                while inner.flush_pending.swap(false, Ordering::AcqRel) {
                    hub.flush().await;
                }
                inner.flushing.store(false, Ordering::Release);
                // A request may have landed between the last check and the release.
                if !inner.flush_pending.load(Ordering::Acquire) || inner.flushing.swap(true, Ordering::AcqRel) {
                    break;
                }
            }
        });
    }

    /// Save the snapshot now. Failures are logged; the next tick retries.
    pub async fn flush(&self) {
        let canvases = self.inner.canvases.list_all().await;
        match self.inner.snapshots.save_snapshot(&self.inner.project_id, &canvases).await {
            Ok(()) => debug!(project_id = %self.inner.project_id, canvases = canvases.len(), "hub: snapshot saved"),
            Err(e) => warn!(project_id = %self.inner.project_id, error = %e, "hub: snapshot save failed"),
        }
    }

    fn retired(&self) -> HubError {
        HubError::Retired(self.inner.project_id.clone())
    }
}

// =============================================================================
// EVENT LOOP
// =============================================================================

struct Queues {
    register: mpsc::Receiver<Registration>,
    unregister: mpsc::Receiver<Uuid>,
    inbound: mpsc::Receiver<Payload>,
}

async fn run(hub: Hub, mut queues: Queues, config: HubConfig, on_retire: RetireHook) {
    let mut state = HubState::new(hub.project_id().to_owned(), hub.canvases().clone());
    info!(project_id = %hub.project_id(), hub_id = %hub.id(), "hub: started");

    let idle = tokio::time::sleep(config.idle_grace);
    tokio::pin!(idle);
    let mut idle_armed = true;

    loop {
        tokio::select! {
            Some(registration) = queues.register.recv() => {
                state.register(registration.session).await;
                let _ = registration.ack.send(());
            }
            Some(session_id) = queues.unregister.recv() => {
                state.unregister(session_id);
            }
            Some(payload) = queues.inbound.recv() => {
                state.dispatch(payload).await;
            }
            () = &mut idle, if idle_armed => {
                idle_armed = false;
                // EDGE: a joiner may have queued just as the timer fired. If it
                // is rejected the hub is still empty and the timer re-arms below.
                if let Ok(registration) = queues.register.try_recv() {
                    state.register(registration.session).await;
                    let _ = registration.ack.send(());
                } else {
                    hub.flush().await;
                    queues.register.close();
                    on_retire(hub.id());
                    info!(project_id = %hub.project_id(), hub_id = %hub.id(), "hub: retired after idle grace");
                    break;
                }
            }
            else => break,
        }

        if state.clients.is_empty() {
            if !idle_armed {
                idle.as_mut().reset(Instant::now() + config.idle_grace);
                idle_armed = true;
            }
        } else {
            idle_armed = false;
        }
    }
}

/// State owned exclusively by the hub loop.
pub(crate) struct HubState {
    project_id: String,
    canvases: CanvasStore,
    pub(crate) clients: HashMap<Uuid, SessionHandle>,
    pub(crate) users: UsersState,
}

impl HubState {
    pub(crate) fn new(project_id: String, canvases: CanvasStore) -> Self {
        Self { project_id, canvases, clients: HashMap::new(), users: UsersState::new() }
    }

    /// Queue the workboard for the joiner, add it, and broadcast the roster.
    pub(crate) async fn register(&mut self, session: SessionHandle) {
        let workboard = match Envelope::workboard(&self.canvases.list_all().await).and_then(|e| e.to_text()) {
            Ok(text) => Payload::from(text),
            Err(e) => {
                warn!(project_id = %self.project_id, error = %e, "hub: workboard encode failed");
                return;
            }
        };
        if session.tx.try_send(workboard).is_err() {
            warn!(project_id = %self.project_id, session_id = %session.id, "hub: joiner queue unavailable");
            return;
        }

        // A repeat registration for the same user replaces the presence row.
        self.users.insert(
            session.user_id.clone(),
            UserPresence::new(&session.user_id, &session.username, OffsetDateTime::now_utc()),
        );
        info!(
            project_id = %self.project_id,
            session_id = %session.id,
            user_id = %session.user_id,
            clients = self.clients.len() + 1,
            "hub: session registered"
        );
        self.clients.insert(session.id, session);
        self.broadcast_users_state();
    }

    /// Remove a session, closing its queue. Unknown ids are ignored.
    pub(crate) fn unregister(&mut self, session_id: Uuid) {
        if !self.remove_session(session_id) {
            return;
        }
        info!(project_id = %self.project_id, %session_id, clients = self.clients.len(), "hub: session unregistered");
        self.broadcast_users_state();
    }

    /// Apply one inbound message, then relay it to every session.
    pub(crate) async fn dispatch(&mut self, payload: Payload) {
        match Inbound::parse(payload.as_str()) {
            Ok(inbound) => self.apply(inbound).await,
            Err(e) => warn!(project_id = %self.project_id, error = %e, "hub: dropping malformed message"),
        }
        debug!(project_id = %self.project_id, clients = self.clients.len(), "hub: relaying message");
        self.fan_out(&payload);
    }

    async fn apply(&mut self, inbound: Inbound) {
        match inbound {
            Inbound::Operation(op) => self.apply_operation(op).await,
            Inbound::CursorMove { user_id, position, is_drawing } => {
                let presence = user_id.as_deref().and_then(|id| self.users.get_mut(id));
                match presence {
                    Some(presence) => presence.move_cursor(position, is_drawing, OffsetDateTime::now_utc()),
                    None => debug!(project_id = %self.project_id, ?user_id, "hub: cursor for unknown user"),
                }
            }
            Inbound::UsersState => debug!(project_id = %self.project_id, "hub: ignoring client users_state"),
        }
    }

    async fn apply_operation(&self, op: Operation) {
        let store = &self.canvases;
        let (subtype, applied) = match op {
            Operation::Load(canvases) => {
                for canvas in canvases {
                    store.upsert(canvas).await;
                }
                ("load", true)
            }
            Operation::Shape { canvas_id, element } => {
                store.upsert_element(&canvas_id, element).await;
                ("shape", true)
            }
            Operation::Background { canvas_id, background } => ("canvas", store.set_background(&canvas_id, background).await),
            Operation::Remove { canvas_id } => ("remove", store.remove(&canvas_id).await),
            Operation::Action { canvas_id, element_id, action } => {
                ("action", store.attach_action(&canvas_id, &element_id, action).await)
            }
        };
        if !applied {
            debug!(project_id = %self.project_id, subtype, "hub: operation matched nothing");
        }
    }

    fn broadcast_users_state(&mut self) {
        match Envelope::users_state(&self.users).and_then(|e| e.to_text()) {
            Ok(text) => self.fan_out(&Payload::from(text)),
            Err(e) => warn!(project_id = %self.project_id, error = %e, "hub: users_state encode failed"),
        }
    }

    /// Send to every session, dropping the unresponsive ones. A drop changes
    /// the roster, so the new roster goes out too.
    fn fan_out(&mut self, payload: &Payload) {
        if self.send_all(payload) {
            self.broadcast_users_state();
        }
    }

    /// Returns `true` if any session was dropped.
    fn send_all(&mut self, payload: &Payload) -> bool {
        let stale: Vec<Uuid> = self
            .clients
            .values()
            .filter(|session| session.tx.try_send(payload.clone()).is_err())
            .map(|session| session.id)
            .collect();

        for session_id in &stale {
            warn!(project_id = %self.project_id, %session_id, "hub: dropping unresponsive session");
            self.remove_session(*session_id);
        }
        !stale.is_empty()
    }

    /// Drop the session (closing its queue) and its presence when no other
    /// session belongs to the same user.
    fn remove_session(&mut self, session_id: Uuid) -> bool {
        let Some(session) = self.clients.remove(&session_id) else {
            return false;
        };
        if !self.clients.values().any(|other| other.user_id == session.user_id) {
            self.users.remove(&session.user_id);
        }
        true
    }
}

#[cfg(test)]
#[path = "hub_test.rs"]
mod tests;
