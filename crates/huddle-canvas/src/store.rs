//! Canvas Store
//!
//! Owns the canonical element state and version of every live canvas. Each
//! canvas sits behind its own mutex so mutations against one canvas are
//! applied strictly in the order they acquire it, while different canvases
//! never contend. The outer map lock is only held long enough to clone the
//! per-canvas handle, and a canvas leaves the map only while its lock is
//! held, so a canvas guard is always the live one.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::error::{Error, Result};
use crate::model::{AppliedChange, Canvas, CanvasElement, CanvasUpdate};

/// Exclusive access to one canvas
pub type CanvasGuard = OwnedMutexGuard<Canvas>;

/// In-memory canvas store with per-canvas serialization
#[derive(Default)]
pub struct CanvasStore {
    canvases: RwLock<HashMap<String, Arc<Mutex<Canvas>>>>,
}

impl CanvasStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a canvas unless one with the same id is already live.
    /// Returns `true` when the canvas was inserted.
    pub async fn insert_if_absent(&self, canvas: Canvas) -> bool {
        let mut canvases = self.canvases.write().await;
        if canvases.contains_key(&canvas.id) {
            return false;
        }
        canvases.insert(canvas.id.clone(), Arc::new(Mutex::new(canvas)));
        true
    }

    /// Check if a canvas is live
    pub async fn contains(&self, canvas_id: &str) -> bool {
        self.canvases.read().await.contains_key(canvas_id)
    }

    /// Acquire the canvas for a multi-step mutation. A canvas evicted while
    /// the caller waited is never handed out.
    pub async fn lock(&self, canvas_id: &str) -> Result<CanvasGuard> {
        loop {
            let handle = {
                let canvases = self.canvases.read().await;
                canvases
                    .get(canvas_id)
                    .cloned()
                    .ok_or_else(|| Error::CanvasNotFound(canvas_id.to_string()))?
            };
            let guard = handle.lock_owned().await;
            if self.is_live(canvas_id, &guard).await {
                return Ok(guard);
            }
        }
    }

    async fn is_live(&self, canvas_id: &str, guard: &CanvasGuard) -> bool {
        self.canvases
            .read()
            .await
            .get(canvas_id)
            .is_some_and(|handle| Arc::ptr_eq(handle, OwnedMutexGuard::mutex(guard)))
    }

    /// Apply a single update; the single mutation entry point for callers
    /// that do not batch
    pub async fn apply(&self, canvas_id: &str, update: &CanvasUpdate) -> Result<AppliedChange> {
        let mut canvas = self.lock(canvas_id).await?;
        canvas.apply(update)
    }

    /// Elements of a canvas in order
    pub async fn get_elements(&self, canvas_id: &str) -> Result<Vec<CanvasElement>> {
        let canvas = self.lock(canvas_id).await?;
        Ok(canvas.elements.clone())
    }

    /// Point-in-time copy of a canvas
    pub async fn snapshot(&self, canvas_id: &str) -> Result<Canvas> {
        let canvas = self.lock(canvas_id).await?;
        Ok(canvas.clone())
    }

    /// Current version of a canvas
    pub async fn version(&self, canvas_id: &str) -> Result<u64> {
        let canvas = self.lock(canvas_id).await?;
        Ok(canvas.version)
    }

    /// Drop a held canvas from memory, returning its final state. Waiters
    /// on the same canvas find it gone once the guard is released.
    pub async fn evict(&self, guard: CanvasGuard) -> Canvas {
        let mut canvases = self.canvases.write().await;
        let live = canvases
            .get(&guard.id)
            .is_some_and(|handle| Arc::ptr_eq(handle, OwnedMutexGuard::mutex(&guard)));
        if live {
            canvases.remove(&guard.id);
        }
        guard.clone()
    }

    /// Number of live canvases
    pub async fn canvas_count(&self) -> usize {
        self.canvases.read().await.len()
    }
}
