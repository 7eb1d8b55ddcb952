//! Background task startup functions

use chrono::Utc;
use huddle_canvas::SessionCoordinator;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Start the idle sweeper: drops silent participants, evicts idle sessions
pub fn start_sweeper(
    coordinator: Arc<SessionCoordinator>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let period = coordinator.config().sweep_interval();
    info!(interval_secs = period.as_secs(), "Idle sweeper started");

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Idle sweeper stopping");
                    break;
                }
                _ = interval.tick() => {
                    let report = coordinator.sweep(Utc::now()).await;
                    if !report.is_empty() {
                        info!(
                            timed_out = report.timed_out.len(),
                            idle = report.idle.len(),
                            evicted = report.evicted.len(),
                            purged_tombstones = report.purged_tombstones,
                            "Idle sweep"
                        );
                    }
                }
            }
        }
    })
}

/// Start the persistence retry loop: writes canvas changes a failing
/// backend left in the outbox
pub fn start_persistence_retry(
    coordinator: Arc<SessionCoordinator>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let period = coordinator.config().persistence_retry();
    info!(interval_secs = period.as_secs(), "Persistence retry started");

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Persistence retry stopping");
                    break;
                }
                _ = interval.tick() => {
                    if coordinator.outbox().pending_total() == 0 {
                        continue;
                    }
                    let written = coordinator.retry_persistence().await;
                    let pending = coordinator.outbox().pending_total();
                    if pending > 0 {
                        warn!(written, pending, "Persistence backlog remains");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use huddle_canvas::{
        Canvas, CanvasDelta, CanvasPersistence, ClientMessage, CollaborationConfig, Error,
        ElementPatch, MemoryTransport, ParticipantRole, Position, ResolutionLogEntry,
        UpdateOperation, UpdateRequest,
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    /// Backend that refuses writes until it is switched back on
    #[derive(Default)]
    struct FlakyPersistence {
        online: AtomicBool,
        saved: std::sync::Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl CanvasPersistence for FlakyPersistence {
        async fn load_canvas(&self, _canvas_id: &str) -> huddle_canvas::Result<Option<Canvas>> {
            Ok(None)
        }

        async fn save_canvas_delta(&self, delta: &CanvasDelta) -> huddle_canvas::Result<()> {
            if !self.online.load(Ordering::SeqCst) {
                return Err(Error::persistence("database is locked"));
            }
            self.saved.lock().unwrap().push(delta.canvas.version);
            Ok(())
        }

        async fn append_resolution_log(&self, _entry: &ResolutionLogEntry) -> huddle_canvas::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_cancel() {
        let coordinator = SessionCoordinator::builder(
            CollaborationConfig::default(),
            Arc::new(MemoryTransport::new()),
        )
        .build();
        let token = CancellationToken::new();
        let handle = start_sweeper(coordinator, token.clone());

        token.cancel();
        let joined = tokio::time::timeout(std::time::Duration::from_secs(1), handle).await;
        assert!(matches!(joined, Ok(Ok(()))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistence_retry_writes_backlog() {
        let backend = Arc::new(FlakyPersistence::default());
        let config = CollaborationConfig {
            persistence_retry_secs: 5,
            ..CollaborationConfig::default()
        };
        let coordinator = SessionCoordinator::builder(config, Arc::new(MemoryTransport::new()))
            .with_persistence(backend.clone())
            .build();

        let connection = Uuid::new_v4();
        coordinator
            .dispatch(
                connection,
                ClientMessage::JoinSession {
                    session_id: "s1".to_string(),
                    participant_id: "p1".to_string(),
                    role: ParticipantRole::Contributor,
                },
            )
            .await;
        let update = UpdateRequest::new(
            UpdateOperation::Added,
            ElementPatch::id("e1")
                .with_type("note")
                .with_position(Position::new(0.0, 0.0)),
        );
        coordinator.submit_update(connection, update).await.unwrap();
        let report = coordinator.flush_session("s1").await.unwrap();
        assert_eq!(report.pending_writes, 1);

        let token = CancellationToken::new();
        let handle = start_persistence_retry(coordinator.clone(), token.clone());
        backend.online.store(true, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(6)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(coordinator.outbox().pending_total(), 0);
        assert_eq!(*backend.saved.lock().unwrap(), vec![1]);

        token.cancel();
        assert!(matches!(handle.await, Ok(())));
    }
}
