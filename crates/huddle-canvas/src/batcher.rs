//! Update Batcher
//!
//! Coalesces rapid-fire canvas updates per session. Every enqueue restarts
//! the session's idle timer (debounce); when the window elapses without new
//! arrivals the flush handler runs for that session. Each session's slot owns
//! its pending updates and its timer handle, and closing the slot cancels the
//! timer and rejects further enqueues.

use chrono::Utc;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::model::CanvasUpdate;

/// Callback run when a session's batch window elapses
pub type FlushHandler = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Per-session batch state
#[derive(Default)]
struct BatchSlot {
    pending: Vec<CanvasUpdate>,
    timer: Option<JoinHandle<()>>,
}

impl BatchSlot {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for BatchSlot {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}

/// Result of an enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Enqueued {
    /// Server receipt sequence assigned to the update
    pub sequence: u64,
    /// Updates now pending for the session
    pub pending: usize,
}

/// Debouncing per-session update batcher
pub struct UpdateBatcher {
    window: Duration,
    max_batch_size: usize,
    slots: Mutex<HashMap<String, BatchSlot>>,
    sequence: AtomicU64,
    on_flush: FlushHandler,
}

impl UpdateBatcher {
    /// Create a batcher with an idle window and a flush callback
    #[must_use]
    pub fn new(window: Duration, on_flush: FlushHandler) -> Self {
        Self {
            window,
            max_batch_size: usize::MAX,
            slots: Mutex::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            on_flush,
        }
    }

    /// Flush immediately once this many updates are pending
    #[must_use]
    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = max.max(1);
        self
    }

    /// Idle window
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, BatchSlot>> {
        // A poisoned map only means a panic elsewhere mid-insert; the data is still usable.
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Make sure later receipt sequences are greater than `floor`, e.g.
    /// the sequences recorded in a canvas loaded from storage
    pub fn observe_sequence(&self, floor: u64) {
        self.sequence.fetch_max(floor, Ordering::SeqCst);
    }

    /// Open a slot for a session. Returns `false` if it was already open.
    pub fn open(&self, session_id: &str) -> bool {
        let mut slots = self.slots();
        if slots.contains_key(session_id) {
            return false;
        }
        slots.insert(session_id.to_string(), BatchSlot::default());
        true
    }

    /// Check if a session accepts updates
    #[must_use]
    pub fn is_open(&self, session_id: &str) -> bool {
        self.slots().contains_key(session_id)
    }

    /// Buffer an update, stamping its server receipt time and sequence, and
    /// restart the session's idle timer
    pub fn enqueue(&self, session_id: &str, mut update: CanvasUpdate) -> Result<Enqueued> {
        let mut slots = self.slots();
        let slot = slots
            .get_mut(session_id)
            .ok_or_else(|| Error::BatchClosed(session_id.to_string()))?;

        update.received_at = Utc::now();
        update.sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let sequence = update.sequence;
        slot.pending.push(update);
        slot.cancel_timer();

        let pending = slot.pending.len();
        let sid = session_id.to_string();
        let on_flush = self.on_flush.clone();
        if pending >= self.max_batch_size {
            debug!(session_id = %sid, pending, "Batch size limit reached, flushing now");
            tokio::spawn(on_flush(sid));
        } else {
            let window = self.window;
            slot.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(window).await;
                trace!(session_id = %sid, "Batch window elapsed");
                // Detached so a later enqueue cannot abort a flush in progress
                tokio::spawn(on_flush(sid));
            }));
        }

        Ok(Enqueued { sequence, pending })
    }

    /// Take every pending update of a session in submission order and cancel
    /// its timer. Empty when nothing is pending or the slot is closed.
    pub fn flush(&self, session_id: &str) -> Vec<CanvasUpdate> {
        let mut slots = self.slots();
        match slots.get_mut(session_id) {
            Some(slot) => {
                slot.cancel_timer();
                std::mem::take(&mut slot.pending)
            }
            None => Vec::new(),
        }
    }

    /// Close a session's slot, cancelling its timer. Returns updates that
    /// were still pending.
    pub fn close(&self, session_id: &str) -> Vec<CanvasUpdate> {
        let slot = self.slots().remove(session_id);
        match slot {
            Some(mut slot) => {
                slot.cancel_timer();
                std::mem::take(&mut slot.pending)
            }
            None => Vec::new(),
        }
    }

    /// Number of updates waiting for a session
    #[must_use]
    pub fn pending_len(&self, session_id: &str) -> usize {
        self.slots()
            .get(session_id)
            .map_or(0, |slot| slot.pending.len())
    }

    /// Sessions with an open slot
    #[must_use]
    pub fn open_sessions(&self) -> Vec<String> {
        self.slots().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ElementPatch, Position, UpdateOperation, UpdateRequest};
    use futures::FutureExt;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    fn recording_handler() -> (FlushHandler, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: FlushHandler = Arc::new(move |sid: String| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(sid);
            }
            .boxed()
        });
        (handler, rx)
    }

    fn moved(id: &str, x: f64) -> CanvasUpdate {
        CanvasUpdate::from_request(
            UpdateRequest::new(
                UpdateOperation::Moved,
                ElementPatch::id(id).with_position(Position::new(x, 0.0)),
            ),
            "s1",
            "p1",
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_resets_idle_timer() {
        let (handler, mut rx) = recording_handler();
        let batcher = UpdateBatcher::new(Duration::from_millis(100), handler);
        batcher.open("s1");
        let start = Instant::now();

        batcher.enqueue("s1", moved("e1", 1.0)).unwrap();
        tokio::time::advance(Duration::from_millis(60)).await;
        batcher.enqueue("s1", moved("e1", 2.0)).unwrap();
        tokio::time::advance(Duration::from_millis(60)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err(), "timer should have been reset");

        assert_eq!(rx.recv().await.as_deref(), Some("s1"));
        assert!(start.elapsed() >= Duration::from_millis(160));
        assert_eq!(batcher.pending_len("s1"), 2);
    }

    #[tokio::test]
    async fn test_flush_preserves_submission_order() {
        let (handler, _rx) = recording_handler();
        let batcher = UpdateBatcher::new(Duration::from_secs(60), handler);
        batcher.open("s1");

        for x in [1.0, 2.0, 3.0] {
            batcher.enqueue("s1", moved("e1", x)).unwrap();
        }
        let batch = batcher.flush("s1");
        let xs: Vec<f64> = batch
            .iter()
            .map(|u| u.element.position.unwrap().x)
            .collect();
        assert_eq!(xs, vec![1.0, 2.0, 3.0]);
        assert!(batch.windows(2).all(|w| w[0].sequence < w[1].sequence));

        assert!(batcher.flush("s1").is_empty());
    }

    #[tokio::test]
    async fn test_closed_slot_rejects_enqueue() {
        let (handler, _rx) = recording_handler();
        let batcher = UpdateBatcher::new(Duration::from_secs(60), handler);
        batcher.open("s1");
        batcher.enqueue("s1", moved("e1", 1.0)).unwrap();

        let leftovers = batcher.close("s1");
        assert_eq!(leftovers.len(), 1);
        let err = batcher.enqueue("s1", moved("e1", 2.0)).unwrap_err();
        assert_eq!(err.code(), "batch_closed");
        assert!(!batcher.is_open("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_timer() {
        let (handler, mut rx) = recording_handler();
        let batcher = UpdateBatcher::new(Duration::from_millis(100), handler);
        batcher.open("s1");
        batcher.enqueue("s1", moved("e1", 1.0)).unwrap();
        batcher.close("s1");

        tokio::time::advance(Duration::from_millis(500)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_max_batch_size_flushes_immediately() {
        let (handler, mut rx) = recording_handler();
        let batcher =
            UpdateBatcher::new(Duration::from_secs(60), handler).with_max_batch_size(2);
        batcher.open("s1");

        batcher.enqueue("s1", moved("e1", 1.0)).unwrap();
        let enqueued = batcher.enqueue("s1", moved("e1", 2.0)).unwrap();
        assert_eq!(enqueued.pending, 2);
        assert_eq!(rx.recv().await.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_sequence_continues_past_observed_floor() {
        let (handler, _rx) = recording_handler();
        let batcher = UpdateBatcher::new(Duration::from_secs(60), handler);
        batcher.open("s1");
        batcher.observe_sequence(40);
        batcher.observe_sequence(12);

        assert_eq!(batcher.enqueue("s1", moved("e1", 1.0)).unwrap().sequence, 41);
    }

    #[test]
    fn test_open_is_idempotent() {
        let (handler, _rx) = recording_handler();
        let batcher = UpdateBatcher::new(Duration::from_millis(100), handler);
        assert!(batcher.open("s1"));
        assert!(!batcher.open("s1"));
        assert_eq!(batcher.open_sessions(), vec!["s1".to_string()]);
    }
}
