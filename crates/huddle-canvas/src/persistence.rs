//! Canvas persistence
//!
//! The collaboration core writes canvas deltas and the conflict resolution
//! audit log through [`CanvasPersistence`]. Writes are queued in a
//! [`PersistenceOutbox`] and drained after the canvas lock is released, so a
//! slow or failing store never blocks a flush; failed writes stay queued and
//! are retried on the next drain.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::conflict::Conflict;
use crate::error::{Error, Result};
use crate::model::{AppliedChange, Canvas};
use crate::resolver::ConflictResolution;

/// Changes applied by one flush together with the resulting canvas
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanvasDelta {
    /// Canvas state after the changes
    pub canvas: Canvas,
    /// Applied changes in version order
    pub changes: Vec<AppliedChange>,
}

impl CanvasDelta {
    /// Canvas id
    #[must_use]
    pub fn canvas_id(&self) -> &str {
        &self.canvas.id
    }

    /// Fold a later delta of the same canvas into this one
    pub fn absorb(&mut self, later: CanvasDelta) {
        self.canvas = later.canvas;
        self.changes.extend(later.changes);
    }
}

/// Audit record of one resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionLogEntry {
    /// Session the conflict occurred in
    pub session_id: String,
    /// The conflict
    pub conflict: Conflict,
    /// Its resolution
    pub resolution: ConflictResolution,
    /// When the entry was produced
    pub logged_at: DateTime<Utc>,
}

impl ResolutionLogEntry {
    /// Create an entry stamped now
    #[must_use]
    pub fn new(session_id: impl Into<String>, conflict: Conflict, resolution: ConflictResolution) -> Self {
        Self {
            session_id: session_id.into(),
            conflict,
            resolution,
            logged_at: Utc::now(),
        }
    }
}

/// Durable store for canvases and resolution records
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CanvasPersistence: Send + Sync {
    /// Load the last saved state of a canvas
    async fn load_canvas(&self, canvas_id: &str) -> Result<Option<Canvas>>;

    /// Save the changes of one flush; must tolerate being retried
    async fn save_canvas_delta(&self, delta: &CanvasDelta) -> Result<()>;

    /// Append a resolution record; must tolerate being retried
    async fn append_resolution_log(&self, entry: &ResolutionLogEntry) -> Result<()>;
}

/// In-process persistence, lost on restart
#[derive(Default)]
pub struct MemoryPersistence {
    canvases: RwLock<HashMap<String, Canvas>>,
    resolutions: RwLock<Vec<ResolutionLogEntry>>,
}

impl MemoryPersistence {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolution records of a session in append order
    #[cfg(test)]
    pub async fn resolutions(&self, session_id: &str) -> Vec<ResolutionLogEntry> {
        let resolutions = self.resolutions.read().await;
        resolutions
            .iter()
            .filter(|entry| entry.session_id == session_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CanvasPersistence for MemoryPersistence {
    async fn load_canvas(&self, canvas_id: &str) -> Result<Option<Canvas>> {
        let canvases = self.canvases.read().await;
        Ok(canvases.get(canvas_id).cloned())
    }

    async fn save_canvas_delta(&self, delta: &CanvasDelta) -> Result<()> {
        let mut canvases = self.canvases.write().await;
        let newer = canvases
            .get(delta.canvas_id())
            .map_or(true, |saved| saved.version <= delta.canvas.version);
        if newer {
            canvases.insert(delta.canvas_id().to_string(), delta.canvas.clone());
        }
        Ok(())
    }

    async fn append_resolution_log(&self, entry: &ResolutionLogEntry) -> Result<()> {
        let mut resolutions = self.resolutions.write().await;
        if !resolutions
            .iter()
            .any(|e| e.resolution.id == entry.resolution.id)
        {
            resolutions.push(entry.clone());
        }
        Ok(())
    }
}

/// SQLite-based canvas persistence
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new store with the given database pool
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Initialize the database schema
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS canvases (
                id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                canvas_json TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS canvas_changes (
                canvas_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                operation TEXT NOT NULL,
                element_id TEXT NOT NULL,
                participant_id TEXT NOT NULL,
                change_json TEXT NOT NULL,
                applied_at TEXT NOT NULL,
                PRIMARY KEY (canvas_id, version)
            );

            CREATE TABLE IF NOT EXISTS resolution_log (
                id TEXT PRIMARY KEY,
                conflict_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                conflict_type TEXT NOT NULL,
                strategy TEXT NOT NULL,
                applied INTEGER NOT NULL,
                entry_json TEXT NOT NULL,
                logged_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_resolution_log_session ON resolution_log(session_id);
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
impl SqlitePersistence {
    /// Changes of a canvas after the given version, oldest first
    pub async fn changes_since(&self, canvas_id: &str, version: u64) -> Result<Vec<AppliedChange>> {
        let rows = sqlx::query(
            r#"
            SELECT change_json FROM canvas_changes
            WHERE canvas_id = ? AND version > ?
            ORDER BY version ASC
            "#,
        )
        .bind(canvas_id)
        .bind(to_i64(version))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let json: String = row.get("change_json");
                serde_json::from_str(&json).map_err(Error::from)
            })
            .collect()
    }

    /// Resolution records of a session in append order
    pub async fn resolutions(&self, session_id: &str) -> Result<Vec<ResolutionLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT entry_json FROM resolution_log
            WHERE session_id = ?
            ORDER BY logged_at ASC, rowid ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let json: String = row.get("entry_json");
                serde_json::from_str(&json).map_err(Error::from)
            })
            .collect()
    }
}

#[async_trait]
impl CanvasPersistence for SqlitePersistence {
    async fn load_canvas(&self, canvas_id: &str) -> Result<Option<Canvas>> {
        let row = sqlx::query(
            r#"
            SELECT canvas_json FROM canvases WHERE id = ?
            "#,
        )
        .bind(canvas_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let json: String = row.get("canvas_json");
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    async fn save_canvas_delta(&self, delta: &CanvasDelta) -> Result<()> {
        let canvas_json = serde_json::to_string(&delta.canvas)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO canvases (id, version, canvas_json, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                version = excluded.version,
                canvas_json = excluded.canvas_json,
                updated_at = excluded.updated_at
            WHERE excluded.version >= canvases.version
            "#,
        )
        .bind(delta.canvas_id())
        .bind(to_i64(delta.canvas.version))
        .bind(&canvas_json)
        .bind(delta.canvas.last_modified_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        for change in &delta.changes {
            let change_json = serde_json::to_string(change)?;
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO canvas_changes
                (canvas_id, version, operation, element_id, participant_id, change_json, applied_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(delta.canvas_id())
            .bind(to_i64(change.version))
            .bind(change.operation.as_str())
            .bind(&change.element.id)
            .bind(&change.participant_id)
            .bind(&change_json)
            .bind(change.applied_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn append_resolution_log(&self, entry: &ResolutionLogEntry) -> Result<()> {
        let entry_json = serde_json::to_string(entry)?;
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO resolution_log
            (id, conflict_id, session_id, conflict_type, strategy, applied, entry_json, logged_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.resolution.id.to_string())
        .bind(entry.conflict.id.to_string())
        .bind(&entry.session_id)
        .bind(entry.resolution.conflict_type.as_str())
        .bind(entry.resolution.strategy.as_str())
        .bind(entry.resolution.applied)
        .bind(&entry_json)
        .bind(entry.logged_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Pending persistence write
#[derive(Debug, Clone)]
pub enum OutboxItem {
    /// Canvas delta
    Delta(CanvasDelta),
    /// Resolution record
    Resolution(ResolutionLogEntry),
}

/// Writes queued for one canvas
#[derive(Default)]
struct PendingWrites {
    items: VecDeque<OutboxItem>,
    /// The front item is being written and must not change
    writing: bool,
}

impl PendingWrites {
    /// Queue an item, folding a delta into a directly preceding one.
    /// Returns the number of items dropped to stay within `capacity`.
    fn push(&mut self, item: OutboxItem, capacity: usize) -> usize {
        let settled = usize::from(self.writing);
        let fold = self.items.len() > settled
            && matches!(self.items.back(), Some(OutboxItem::Delta(_)));
        match item {
            OutboxItem::Delta(delta) if fold => {
                if let Some(OutboxItem::Delta(back)) = self.items.back_mut() {
                    back.absorb(delta);
                }
            }
            item => self.items.push_back(item),
        }

        let mut dropped = 0;
        while self.items.len() > capacity.max(1) && self.items.len() > settled {
            self.items.remove(settled);
            dropped += 1;
        }
        dropped
    }
}

/// Queue and drain turn of one canvas
#[derive(Default)]
struct CanvasQueue {
    writes: std::sync::Mutex<PendingWrites>,
    /// One drainer per canvas keeps its writes in order
    turn: Mutex<()>,
}

impl CanvasQueue {
    fn writes(&self) -> std::sync::MutexGuard<'_, PendingWrites> {
        self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Write-behind queue in front of a persistence backend
pub struct PersistenceOutbox {
    backend: Arc<dyn CanvasPersistence>,
    queues: std::sync::Mutex<HashMap<String, Arc<CanvasQueue>>>,
    capacity: usize,
}

impl PersistenceOutbox {
    /// Create an outbox over a backend
    #[must_use]
    pub fn new(backend: Arc<dyn CanvasPersistence>) -> Self {
        Self {
            backend,
            queues: std::sync::Mutex::new(HashMap::new()),
            capacity: usize::MAX,
        }
    }

    /// Limit the unsaved writes kept per canvas; past it the oldest
    /// unsent write is dropped
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Backend the outbox writes to
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn CanvasPersistence> {
        &self.backend
    }

    fn queues(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<CanvasQueue>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self, canvas_id: &str) -> Option<Arc<CanvasQueue>> {
        self.queues().get(canvas_id).cloned()
    }

    /// Queue a write for a canvas. Consecutive deltas are folded into one.
    pub fn push(&self, canvas_id: &str, item: OutboxItem) {
        let dropped = {
            let mut queues = self.queues();
            let queue = queues.entry(canvas_id.to_string()).or_default();
            let dropped = queue.writes().push(item, self.capacity);
            dropped
        };
        if dropped > 0 {
            error!(
                canvas_id = %canvas_id,
                dropped,
                capacity = self.capacity,
                "Persistence backlog full, dropping oldest unsaved writes"
            );
        }
    }

    /// Writes waiting for a canvas
    #[must_use]
    pub fn pending(&self, canvas_id: &str) -> usize {
        self.queue(canvas_id)
            .map_or(0, |queue| queue.writes().items.len())
    }

    /// Canvas state of the newest unsaved delta, ahead of what the backend
    /// holds
    #[must_use]
    pub fn latest_canvas(&self, canvas_id: &str) -> Option<Canvas> {
        let queue = self.queue(canvas_id)?;
        let writes = queue.writes();
        writes.items.iter().rev().find_map(|item| match item {
            OutboxItem::Delta(delta) => Some(delta.canvas.clone()),
            OutboxItem::Resolution(_) => None,
        })
    }

    /// Writes waiting across all canvases
    #[must_use]
    pub fn pending_total(&self) -> usize {
        self.queues()
            .values()
            .map(|queue| queue.writes().items.len())
            .sum()
    }

    /// Forget a canvas queue once it is empty
    fn release(&self, canvas_id: &str, queue: &Arc<CanvasQueue>) {
        let mut queues = self.queues();
        let idle = queues
            .get(canvas_id)
            .is_some_and(|q| Arc::ptr_eq(q, queue) && q.writes().items.is_empty());
        if idle {
            queues.remove(canvas_id);
        }
    }

    /// Write queued items of a canvas in order, stopping at the first
    /// failure. Returns the number of items written.
    pub async fn drain(&self, canvas_id: &str) -> Result<usize> {
        let Some(queue) = self.queue(canvas_id) else {
            return Ok(0);
        };
        let _turn = queue.turn.lock().await;

        let mut written = 0;
        loop {
            let item = {
                let mut writes = queue.writes();
                let Some(item) = writes.items.front().cloned() else {
                    break;
                };
                writes.writing = true;
                item
            };
            let result = match &item {
                OutboxItem::Delta(delta) => self.backend.save_canvas_delta(delta).await,
                OutboxItem::Resolution(entry) => self.backend.append_resolution_log(entry).await,
            };

            let mut writes = queue.writes();
            writes.writing = false;
            match result {
                Ok(()) => {
                    writes.items.pop_front();
                    written += 1;
                }
                Err(e) => {
                    warn!(
                        canvas_id = %canvas_id,
                        pending = writes.items.len(),
                        error = %e,
                        "Persistence write failed; will retry"
                    );
                    return Err(e);
                }
            }
        }

        self.release(canvas_id, &queue);
        if written > 0 {
            debug!(canvas_id = %canvas_id, written, "Persistence outbox drained");
        }
        Ok(written)
    }

    /// Drain every canvas; failures are logged and left queued
    pub async fn drain_all(&self) -> usize {
        let canvas_ids: Vec<String> = self.queues().keys().cloned().collect();
        let mut written = 0;
        for canvas_id in canvas_ids {
            if let Ok(n) = self.drain(&canvas_id).await {
                written += n;
            }
        }
        written
    }
}
