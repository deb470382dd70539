//! Canvas store: the in-memory canvas set owned by one hub.
//!
//! DESIGN
//! ======
//! A `HashMap<canvas id, Canvas>` behind a `tokio::sync::RwLock`. The hub
//! loop is the only writer; persistence flushes and connecting sessions read
//! snapshots concurrently. Every mutation takes the write lock for its whole
//! duration, so a snapshot never observes a half-applied operation.
//!
//! Missing ids are never an error: mutations on unknown canvases or elements
//! return `false` and leave the store untouched. The one exception is
//! `upsert_element`, which creates the canvas on first reference.

use std::collections::HashMap;
use std::sync::Arc;

use protocol::{Action, Canvas, VectorElement};
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct CanvasStore {
    canvases: Arc<RwLock<HashMap<String, Canvas>>>,
}

impl CanvasStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `canvases` (later duplicates win).
    #[must_use]
    pub fn with_canvases(canvases: Vec<Canvas>) -> Self {
        let map = canvases.into_iter().map(|c| (c.id.clone(), c)).collect();
        Self { canvases: Arc::new(RwLock::new(map)) }
    }

    pub async fn get(&self, id: &str) -> Option<Canvas> {
        self.canvases.read().await.get(id).cloned()
    }

    /// Insert or wholly replace a canvas.
    pub async fn upsert(&self, canvas: Canvas) {
        self.canvases.write().await.insert(canvas.id.clone(), canvas);
    }

    /// Returns `true` when a canvas was removed.
    pub async fn remove(&self, id: &str) -> bool {
        self.canvases.write().await.remove(id).is_some()
    }

    /// Copy of every canvas, ordered by id so snapshots are stable.
    pub async fn list_all(&self) -> Vec<Canvas> {
        let guard = self.canvases.read().await;
        let mut all: Vec<Canvas> = guard.values().cloned().collect();
        drop(guard);
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub async fn len(&self) -> usize {
        self.canvases.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.canvases.read().await.is_empty()
    }

    /// Replace a canvas's element list and stamp it. Returns `false` for an unknown canvas.
    pub async fn replace_elements(&self, id: &str, elements: Vec<VectorElement>, timestamp: String, version: String) -> bool {
        let mut guard = self.canvases.write().await;
        let Some(canvas) = guard.get_mut(id) else {
            return false;
        };
        canvas.vector_data.elements = elements;
        canvas.vector_data.timestamp = timestamp;
        canvas.vector_data.version = version;
        true
    }

    /// Returns `false` for an unknown canvas.
    pub async fn set_background(&self, id: &str, fill: String) -> bool {
        let mut guard = self.canvases.write().await;
        let Some(canvas) = guard.get_mut(id) else {
            return false;
        };
        canvas.vector_data.background_fill = fill;
        true
    }

    /// Replace the element with the same id or append it. A canvas referenced
    /// here for the first time is created empty.
    pub async fn upsert_element(&self, canvas_id: &str, element: VectorElement) {
        let mut guard = self.canvases.write().await;
        guard
            .entry(canvas_id.to_owned())
            .or_insert_with(|| Canvas::new(canvas_id))
            .upsert_element(element);
    }

    /// Returns `false` when either the canvas or the element is unknown.
    pub async fn attach_action(&self, canvas_id: &str, element_id: &str, action: Action) -> bool {
        let mut guard = self.canvases.write().await;
        guard.get_mut(canvas_id).is_some_and(|canvas| canvas.attach_action(element_id, action))
    }
}

#[cfg(test)]
#[path = "canvas_test.rs"]
mod tests;
