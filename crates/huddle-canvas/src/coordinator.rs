//! Session Coordinator
//!
//! Owns every collaboration component and runs the control flow: inbound
//! messages are dispatched per connection, canvas updates go through the
//! batcher, and each flush runs detect → resolve → apply → broadcast while
//! holding the session's canvas lock. Persistence is queued inside the lock
//! and written after it is released.
//!
//! The canvas lock also serializes a session's lifecycle. Joins open the
//! batch slot under it, and ending or evicting a session closes the slot and
//! drops the canvas under it, so no accepted update is lost to a concurrent
//! end and no rejoin is left with a closed slot.
//!
//! The coordinator is created once at process start and handed to the
//! transport layer by `Arc`; [`SessionCoordinator::shutdown`] ends every
//! live session and flushes the persistence outbox.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::advisor::{NoopAdvisor, SuggestionAdvisor, SuggestionRequest};
use crate::batcher::{FlushHandler, UpdateBatcher};
use crate::broadcast::{BroadcastGateway, Transport};
use crate::config::CollaborationConfig;
use crate::conflict::{Conflict, ConflictDetector};
use crate::error::{Error, Result};
use crate::model::{AppliedChange, Canvas, CanvasUpdate, UpdateRequest};
use crate::persistence::{
    CanvasDelta, CanvasPersistence, MemoryPersistence, OutboxItem, PersistenceOutbox,
    ResolutionLogEntry,
};
use crate::protocol::{ClientMessage, LeaveReason, ServerMessage};
use crate::resolver::{ConflictResolution, ConflictResolver, ResolutionContext};
use crate::session::{
    ParticipantRole, Session, SessionRegistry, SessionStats, SessionSummary, SweepReport,
};
use crate::store::{CanvasGuard, CanvasStore};

/// Outcome of one flush
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Updates taken from the batcher
    pub received: usize,
    /// Changes applied to the canvas
    pub applied: usize,
    /// Conflicts detected
    pub conflicts: usize,
    /// Operations rejected by the store
    pub rejected: usize,
    /// Canvas version after the flush
    pub version: u64,
    /// Persistence writes of the session still unsaved after the flush
    pub pending_writes: usize,
}

/// Builder for [`SessionCoordinator`]
pub struct CoordinatorBuilder {
    config: CollaborationConfig,
    transport: Arc<dyn Transport>,
    persistence: Arc<dyn CanvasPersistence>,
    advisor: Arc<dyn SuggestionAdvisor>,
}

impl CoordinatorBuilder {
    /// Use a persistence backend (defaults to in-memory)
    #[must_use]
    pub fn with_persistence(mut self, persistence: Arc<dyn CanvasPersistence>) -> Self {
        self.persistence = persistence;
        self
    }

    /// Use a suggestion advisor (defaults to [`NoopAdvisor`])
    #[must_use]
    pub fn with_advisor(mut self, advisor: Arc<dyn SuggestionAdvisor>) -> Self {
        self.advisor = advisor;
        self
    }

    /// Build the coordinator
    #[must_use]
    pub fn build(self) -> Arc<SessionCoordinator> {
        Arc::new_cyclic(|weak: &Weak<SessionCoordinator>| {
            let registry = Arc::new(SessionRegistry::from_config(&self.config));
            let batcher = UpdateBatcher::new(self.config.batch_window(), flush_handler(weak.clone()))
                .with_max_batch_size(self.config.max_batch_size);
            SessionCoordinator {
                gateway: BroadcastGateway::new(registry.clone(), self.transport),
                registry,
                store: CanvasStore::new(),
                batcher,
                detector: ConflictDetector::new(),
                resolver: ConflictResolver::new(),
                outbox: PersistenceOutbox::new(self.persistence)
                    .with_capacity(self.config.outbox_capacity),
                advisor: self.advisor,
                config: self.config,
            }
        })
    }
}

fn flush_handler(coordinator: Weak<SessionCoordinator>) -> FlushHandler {
    Arc::new(move |session_id: String| {
        let coordinator = coordinator.clone();
        async move {
            let Some(coordinator) = coordinator.upgrade() else {
                return;
            };
            if let Err(e) = coordinator.flush_session(&session_id).await {
                debug!(session_id = %session_id, error = %e, "Timed flush skipped");
            }
        }
        .boxed()
    })
}

/// One ordered step of a flush
enum Step {
    Clean(CanvasUpdate),
    Resolved(Conflict, ConflictResolution),
}

/// What one batch did to a canvas
#[derive(Default)]
struct BatchOutcome {
    received: usize,
    applied: usize,
    conflicts: usize,
    stats: SessionStats,
    /// Store rejections per submitting participant
    rejected: Vec<(String, Error)>,
    version: u64,
}

impl BatchOutcome {
    fn report(&self, rejected: usize, pending_writes: usize) -> FlushReport {
        FlushReport {
            received: self.received,
            applied: self.applied,
            conflicts: self.conflicts,
            rejected,
            version: self.version,
            pending_writes,
        }
    }
}

/// Collaboration pipeline for all sessions
pub struct SessionCoordinator {
    config: CollaborationConfig,
    registry: Arc<SessionRegistry>,
    store: CanvasStore,
    batcher: UpdateBatcher,
    detector: ConflictDetector,
    resolver: ConflictResolver,
    gateway: BroadcastGateway,
    outbox: PersistenceOutbox,
    advisor: Arc<dyn SuggestionAdvisor>,
}

impl SessionCoordinator {
    /// Start building a coordinator that delivers through `transport`
    #[must_use]
    pub fn builder(config: CollaborationConfig, transport: Arc<dyn Transport>) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            transport,
            persistence: Arc::new(MemoryPersistence::new()),
            advisor: Arc::new(NoopAdvisor),
        }
    }

    /// Collaboration settings
    #[must_use]
    pub fn config(&self) -> &CollaborationConfig {
        &self.config
    }

    /// Session registry
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Canvas store
    #[must_use]
    pub fn store(&self) -> &CanvasStore {
        &self.store
    }

    /// Update batcher
    #[must_use]
    pub fn batcher(&self) -> &UpdateBatcher {
        &self.batcher
    }

    /// Persistence outbox
    #[must_use]
    pub fn outbox(&self) -> &PersistenceOutbox {
        &self.outbox
    }

    /// Handle a message and report any failure to the sending connection
    pub async fn dispatch(&self, connection_id: Uuid, message: ClientMessage) {
        if let Err(e) = self.handle_message(connection_id, message).await {
            debug!(connection_id = %connection_id, code = e.code(), error = %e, "Message rejected");
            self.reject(connection_id, &e);
        }
    }

    /// Send an error message to a connection
    pub fn reject(&self, connection_id: Uuid, error: &Error) {
        self.gateway.send_to(connection_id, ServerMessage::from(error));
    }

    /// Handle one inbound message
    pub async fn handle_message(&self, connection_id: Uuid, message: ClientMessage) -> Result<()> {
        match message {
            ClientMessage::JoinSession {
                session_id,
                participant_id,
                role,
            } => self.join(connection_id, &session_id, &participant_id, role).await,
            ClientMessage::LeaveSession => self.leave(connection_id).await,
            ClientMessage::CanvasUpdate { update } => {
                self.submit_update(connection_id, update).await.map(|_| ())
            }
            ClientMessage::RequestSuggestions { prompt } => {
                self.request_suggestions(connection_id, prompt).await
            }
            ClientMessage::ResolveConflict { conflict, winner } => {
                self.resolve_conflict(connection_id, conflict, winner).await
            }
            ClientMessage::StartSession => {
                let (session_id, _) = self.caller(connection_id).await?;
                self.start_session(&session_id).await
            }
            ClientMessage::PauseSession => {
                let (session_id, _) = self.caller(connection_id).await?;
                self.pause_session(&session_id).await
            }
            ClientMessage::EndSession => {
                let (session_id, _) = self.caller(connection_id).await?;
                self.end_session(&session_id).await.map(|_| ())
            }
            ClientMessage::Ping => {
                self.registry.touch(connection_id).await;
                self.gateway.send_to(connection_id, ServerMessage::Pong);
                Ok(())
            }
        }
    }

    async fn caller(&self, connection_id: Uuid) -> Result<(String, String)> {
        self.registry
            .lookup(connection_id)
            .await
            .ok_or(Error::NotJoined)
    }

    /// Join a participant and send it the session snapshot. A canvas that
    /// cannot be loaded fails the join.
    pub async fn join(
        &self,
        connection_id: Uuid,
        session_id: &str,
        participant_id: &str,
        role: ParticipantRole,
    ) -> Result<()> {
        let loaded = if self.store.contains(session_id).await {
            None
        } else {
            Some(self.load_canvas(session_id).await?)
        };
        let joined = self
            .registry
            .join(session_id, participant_id, connection_id, role)
            .await?;

        if let Some(previous) = &joined.left_session {
            self.gateway
                .publish(
                    previous,
                    ServerMessage::ParticipantLeft {
                        session_id: previous.clone(),
                        participant_id: participant_id.to_string(),
                        reason: LeaveReason::Replaced,
                    },
                )
                .await;
        }

        let (canvas, session) = match self.attach_canvas(session_id, participant_id, loaded).await {
            Ok(attached) => attached,
            Err(e) => {
                self.registry.withdraw(session_id, participant_id).await;
                return Err(e);
            }
        };
        self.batcher.open(session_id);
        // Snapshot under the canvas lock so no flush interleaves with it
        self.gateway
            .send_to(connection_id, ServerMessage::session_state(&session, &canvas));
        drop(canvas);

        info!(
            session_id = %session_id,
            participant_id = %participant_id,
            connection_id = %connection_id,
            created = joined.created,
            rejoined = joined.rejoined,
            "Participant joined"
        );

        if let Some(participant) = session.participant(participant_id).cloned() {
            self.gateway
                .publish_except(
                    session_id,
                    connection_id,
                    ServerMessage::ParticipantJoined {
                        session_id: session_id.to_string(),
                        participant,
                    },
                )
                .await;
        }
        Ok(())
    }

    /// Latest known state of a canvas: unsaved writes first, then storage
    async fn load_canvas(&self, session_id: &str) -> Result<Canvas> {
        if let Some(canvas) = self.outbox.latest_canvas(session_id) {
            return Ok(canvas);
        }
        match self.outbox.backend().load_canvas(session_id).await {
            Ok(Some(mut canvas)) => {
                canvas.id = session_id.to_string();
                Ok(canvas)
            }
            Ok(None) => Ok(Canvas::new(session_id)),
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to load canvas");
                Err(e)
            }
        }
    }

    async fn install_canvas(&self, canvas: Canvas) {
        self.batcher.observe_sequence(canvas.last_sequence());
        self.store.insert_if_absent(canvas).await;
    }

    /// Lock the session canvas for a joiner, installing it if needed, and
    /// confirm under the lock that the join still stands
    async fn attach_canvas(
        &self,
        session_id: &str,
        participant_id: &str,
        loaded: Option<Canvas>,
    ) -> Result<(CanvasGuard, Session)> {
        if let Some(canvas) = loaded {
            self.install_canvas(canvas).await;
        }
        let canvas = match self.store.lock(session_id).await {
            Ok(canvas) => canvas,
            Err(Error::CanvasNotFound(_)) => {
                // Evicted between the check and the join
                let canvas = self.load_canvas(session_id).await?;
                self.install_canvas(canvas).await;
                self.store.lock(session_id).await?
            }
            Err(e) => return Err(e),
        };

        self.registry
            .record_batch(session_id, SessionStats::default(), canvas.version)
            .await;
        match self.registry.ensure_member(session_id, participant_id).await {
            Ok(session) => Ok((canvas, session)),
            Err(e) => {
                if self.registry.status(session_id).await.is_err() {
                    self.store.evict(canvas).await;
                }
                Err(e)
            }
        }
    }

    /// Remove the caller from its session
    pub async fn leave(&self, connection_id: Uuid) -> Result<()> {
        let (session_id, participant_id) = self.caller(connection_id).await?;
        self.registry.leave(&session_id, &participant_id).await?;
        info!(session_id = %session_id, participant_id = %participant_id, "Participant left");
        self.gateway
            .publish(
                &session_id,
                ServerMessage::ParticipantLeft {
                    session_id: session_id.clone(),
                    participant_id,
                    reason: LeaveReason::Left,
                },
            )
            .await;
        Ok(())
    }

    /// Handle a closed transport connection
    pub async fn disconnect(&self, connection_id: Uuid) {
        let Some(departure) = self.registry.disconnect(connection_id).await else {
            return;
        };
        info!(
            session_id = %departure.session_id,
            participant_id = %departure.participant.id,
            "Participant disconnected"
        );
        self.gateway
            .publish(
                &departure.session_id,
                ServerMessage::ParticipantLeft {
                    session_id: departure.session_id.clone(),
                    participant_id: departure.participant.id,
                    reason: LeaveReason::Disconnected,
                },
            )
            .await;
    }

    /// Validate an update and hand it to the batcher. Returns the server
    /// receipt sequence.
    pub async fn submit_update(&self, connection_id: Uuid, mut request: UpdateRequest) -> Result<u64> {
        let (session_id, participant_id) = self.caller(connection_id).await?;
        request.validate()?;
        self.registry.ensure_can_edit(&session_id, &participant_id).await?;
        self.registry.touch(connection_id).await;

        let update = CanvasUpdate::from_request(request, &session_id, &participant_id);
        let enqueued = self.batcher.enqueue(&session_id, update)?;
        Ok(enqueued.sequence)
    }

    /// Run the pipeline over everything pending for a session. Flushing an
    /// empty batch does nothing and broadcasts nothing.
    pub async fn flush_session(&self, session_id: &str) -> Result<FlushReport> {
        let mut canvas = self.store.lock(session_id).await?;
        let pending = self.batcher.flush(session_id);
        if pending.is_empty() {
            return Ok(FlushReport {
                version: canvas.version,
                pending_writes: self.outbox.pending(session_id),
                ..FlushReport::default()
            });
        }

        let mut outcome = self.run_batch(&mut canvas, pending).await;
        drop(canvas);

        let rejected = self.settle(session_id, &mut outcome).await;
        let pending_writes = self.persist(session_id).await;
        debug!(
            session_id = %session_id,
            received = outcome.received,
            applied = outcome.applied,
            conflicts = outcome.conflicts,
            rejected,
            version = outcome.version,
            pending_writes,
            "Batch flushed"
        );
        Ok(outcome.report(rejected, pending_writes))
    }

    /// Detect, resolve and apply one batch, then queue its persistence and
    /// broadcast it. Runs under the canvas lock.
    async fn run_batch(&self, canvas: &mut CanvasGuard, pending: Vec<CanvasUpdate>) -> BatchOutcome {
        let mut outcome = BatchOutcome {
            version: canvas.version,
            ..BatchOutcome::default()
        };
        if pending.is_empty() {
            return outcome;
        }

        let session_id = canvas.id.clone();
        outcome.received = pending.len();
        let facilitator = self.registry.facilitator(&session_id).await;
        let detection = self.detector.detect(canvas, pending);
        outcome.conflicts = detection.conflicts.len();

        let mut steps: Vec<(u64, Step)> = detection
            .clean
            .into_iter()
            .map(|op| (op.sequence, Step::Clean(op)))
            .collect();
        for conflict in detection.conflicts {
            let context = ResolutionContext::default()
                .with_current(canvas.element(&conflict.element_id).cloned())
                .with_facilitator(facilitator.clone());
            let resolution = self.resolver.resolve(&conflict, &context);
            steps.push((conflict.last_sequence(), Step::Resolved(conflict, resolution)));
        }
        steps.sort_by_key(|(sequence, _)| *sequence);

        outcome.stats = SessionStats {
            updates_received: outcome.received as u64,
            conflicts_detected: outcome.conflicts as u64,
            ..SessionStats::default()
        };
        let mut changes = Vec::new();
        let mut resolved = Vec::new();
        for (_, step) in steps {
            match step {
                Step::Clean(op) => match canvas.apply(&op) {
                    Ok(change) => changes.push(change),
                    Err(e) => outcome.rejected.push((op.participant_id.clone(), e)),
                },
                Step::Resolved(conflict, resolution) => {
                    let resolution = self
                        .apply_resolution(canvas, &conflict, resolution, &mut changes, &mut outcome.stats)
                        .await;
                    resolved.push((conflict, resolution));
                }
            }
        }
        outcome.applied = changes.len();
        outcome.stats.operations_applied = changes.len() as u64;
        outcome.version = canvas.version;

        self.publish_outcome(&session_id, canvas, resolved, changes).await;
        outcome
    }

    /// Record a batch in the session and tell participants whose operations
    /// were rejected. Returns the number of rejections.
    async fn settle(&self, session_id: &str, outcome: &mut BatchOutcome) -> usize {
        self.registry
            .record_batch(session_id, outcome.stats, outcome.version)
            .await;
        let rejected = std::mem::take(&mut outcome.rejected);
        let count = rejected.len();
        for (participant_id, error) in rejected {
            self.notify_participant(session_id, &participant_id, &error).await;
        }
        count
    }

    /// Write queued persistence of a session. Failed writes stay queued for
    /// the retry loop; returns how many are still waiting.
    async fn persist(&self, session_id: &str) -> usize {
        if let Err(e) = self.outbox.drain(session_id).await {
            debug!(session_id = %session_id, code = e.code(), "Persistence deferred to retry");
        }
        self.outbox.pending(session_id)
    }

    /// Apply a resolution outcome; deferred resolutions are parked for a
    /// manual decision
    async fn apply_resolution(
        &self,
        canvas: &mut CanvasGuard,
        conflict: &Conflict,
        mut resolution: ConflictResolution,
        changes: &mut Vec<AppliedChange>,
        stats: &mut SessionStats,
    ) -> ConflictResolution {
        if resolution.applied {
            if let Some(outcome) = &resolution.outcome {
                match canvas.apply(outcome) {
                    Ok(change) => changes.push(change),
                    Err(e) => {
                        warn!(
                            session_id = %canvas.id,
                            conflict_id = %conflict.id,
                            error = %e,
                            "Resolution outcome could not be applied"
                        );
                        resolution.applied = false;
                    }
                }
            }
        }

        if resolution.applied {
            stats.resolutions_applied += 1;
        } else {
            stats.resolutions_deferred += 1;
            self.registry.park_conflict(&canvas.id, conflict.clone()).await;
        }
        resolution
    }

    /// Queue persistence and broadcast: resolutions first, then one
    /// canvas-updates message
    async fn publish_outcome(
        &self,
        session_id: &str,
        canvas: &Canvas,
        resolved: Vec<(Conflict, ConflictResolution)>,
        changes: Vec<AppliedChange>,
    ) {
        if !changes.is_empty() {
            self.outbox.push(
                session_id,
                OutboxItem::Delta(CanvasDelta {
                    canvas: canvas.clone(),
                    changes: changes.clone(),
                }),
            );
        }
        for (conflict, resolution) in resolved {
            self.outbox.push(
                session_id,
                OutboxItem::Resolution(ResolutionLogEntry::new(
                    session_id,
                    conflict.clone(),
                    resolution.clone(),
                )),
            );
            if resolution.requires_notification {
                self.gateway
                    .publish(
                        session_id,
                        ServerMessage::ConflictResolved {
                            session_id: session_id.to_string(),
                            conflict,
                            resolution,
                        },
                    )
                    .await;
            }
        }
        if !changes.is_empty() {
            self.gateway
                .publish(
                    session_id,
                    ServerMessage::CanvasUpdates {
                        session_id: session_id.to_string(),
                        version: canvas.version,
                        changes,
                    },
                )
                .await;
        }
    }

    async fn notify_participant(&self, session_id: &str, participant_id: &str, error: &Error) {
        let connection = self
            .registry
            .get(session_id)
            .await
            .ok()
            .and_then(|s| s.participant(participant_id).map(|p| p.connection_id));
        if let Some(connection_id) = connection {
            self.reject(connection_id, error);
        }
    }

    /// Settle a conflict on request. With a winner, a facilitator decides a
    /// parked conflict. Without one, a parked conflict is resolved again
    /// with the current context; an unknown conflict only gets a preview
    /// sent back to the caller.
    pub async fn resolve_conflict(
        &self,
        connection_id: Uuid,
        conflict: Conflict,
        winner: Option<String>,
    ) -> Result<()> {
        let (session_id, participant_id) = self.caller(connection_id).await?;
        if conflict
            .operations
            .iter()
            .any(|op| op.session_id != session_id)
        {
            return Err(Error::PermissionDenied(
                "conflict belongs to another session".to_string(),
            ));
        }

        let parked = self.registry.take_conflict(&session_id, conflict.id).await;
        let Some(parked) = parked else {
            if winner.is_some() {
                return Err(Error::invalid_message(format!(
                    "conflict {} is not awaiting a decision",
                    conflict.id
                )));
            }
            let context = self.resolution_context(&session_id, &conflict.element_id).await;
            let preview = self.resolver.resolve(&conflict, &context);
            self.gateway.send_to(
                connection_id,
                ServerMessage::ConflictResolved {
                    session_id,
                    conflict,
                    resolution: preview,
                },
            );
            return Ok(());
        };

        let resolution = match winner {
            Some(winner) => {
                if self.registry.role(&session_id, &participant_id).await
                    != Some(ParticipantRole::Facilitator)
                {
                    self.registry.park_conflict(&session_id, parked).await;
                    return Err(Error::PermissionDenied(
                        "only a facilitator can decide conflicts".to_string(),
                    ));
                }
                match self.resolver.resolve_manually(&parked, &winner, &participant_id) {
                    Ok(resolution) => resolution,
                    Err(e) => {
                        self.registry.park_conflict(&session_id, parked).await;
                        return Err(e);
                    }
                }
            }
            None => {
                let context = self.resolution_context(&session_id, &parked.element_id).await;
                self.resolver.resolve(&parked, &context)
            }
        };

        info!(
            session_id = %session_id,
            conflict_id = %parked.id,
            strategy = %resolution.strategy,
            decided_by = %participant_id,
            "Conflict decision"
        );

        let mut canvas = self.store.lock(&session_id).await?;
        let mut changes = Vec::new();
        let mut stats = SessionStats::default();
        let resolution = self
            .apply_resolution(&mut canvas, &parked, resolution, &mut changes, &mut stats)
            .await;
        stats.operations_applied = changes.len() as u64;
        let version = canvas.version;
        self.publish_outcome(&session_id, &canvas, vec![(parked, resolution)], changes)
            .await;
        drop(canvas);

        self.registry.record_batch(&session_id, stats, version).await;
        self.persist(&session_id).await;
        Ok(())
    }

    async fn resolution_context(&self, session_id: &str, element_id: &str) -> ResolutionContext {
        let current = match self.store.lock(session_id).await {
            Ok(canvas) => canvas.element(element_id).cloned(),
            Err(_) => None,
        };
        ResolutionContext::default()
            .with_current(current)
            .with_facilitator(self.registry.facilitator(session_id).await)
    }

    /// Ask the advisor for suggestions; the answer goes to the caller only
    pub async fn request_suggestions(&self, connection_id: Uuid, prompt: Option<String>) -> Result<()> {
        let (session_id, participant_id) = self.caller(connection_id).await?;
        self.registry.touch(connection_id).await;
        let canvas = self.store.snapshot(&session_id).await?;
        let elements = canvas.elements;
        let request = SuggestionRequest {
            session_id: session_id.clone(),
            participant_id,
            elements: elements.clone(),
            canvas_version: canvas.version,
            prompt,
        };

        let advisor = self.advisor.clone();
        let gateway = self.gateway.clone();
        tokio::spawn(async move {
            let message = match advisor.suggest(request).await {
                Ok(suggestions) => ServerMessage::AiSuggestions {
                    session_id,
                    suggestions: suggestions
                        .into_iter()
                        .map(|s| s.checked_against(&elements))
                        .collect(),
                },
                Err(e) => {
                    warn!(advisor = advisor.name(), error = %e, "Suggestion request failed");
                    ServerMessage::from(&e)
                }
            };
            gateway.send_to(connection_id, message);
        });
        Ok(())
    }

    /// Start or resume a session
    pub async fn start_session(&self, session_id: &str) -> Result<()> {
        let session = self.registry.start(session_id).await?;
        info!(session_id = %session_id, "Session started");
        self.gateway
            .publish(
                session_id,
                ServerMessage::SessionStarted {
                    session_id: session_id.to_string(),
                    started_at: session.started_at,
                },
            )
            .await;
        Ok(())
    }

    /// Pause a session
    pub async fn pause_session(&self, session_id: &str) -> Result<()> {
        self.registry.pause(session_id).await?;
        info!(session_id = %session_id, "Session paused");
        self.gateway
            .publish(
                session_id,
                ServerMessage::SessionPaused {
                    session_id: session_id.to_string(),
                },
            )
            .await;
        Ok(())
    }

    /// End a session. It stops taking joins and edits first; then, under
    /// the canvas lock, the batch slot is closed and whatever it still held
    /// goes through the pipeline before the summary is taken and the canvas
    /// is released. The last participants get the summary.
    pub async fn end_session(&self, session_id: &str) -> Result<SessionSummary> {
        self.registry.begin_end(session_id).await?;

        let ended = match self.store.lock(session_id).await {
            Ok(mut canvas) => {
                let pending = self.batcher.close(session_id);
                let mut outcome = self.run_batch(&mut canvas, pending).await;
                self.settle(session_id, &mut outcome).await;
                let ended = self.registry.end(session_id).await;
                self.store.evict(canvas).await;
                ended?
            }
            Err(e) => {
                debug!(session_id = %session_id, error = %e, "No live canvas to flush");
                let dropped = self.batcher.close(session_id);
                if !dropped.is_empty() {
                    warn!(session_id = %session_id, dropped = dropped.len(), "Updates without a canvas were dropped");
                }
                self.registry.end(session_id).await?
            }
        };
        let pending_writes = self.persist(session_id).await;

        info!(
            session_id = %session_id,
            final_version = ended.summary.final_version,
            duration_secs = ended.summary.duration_secs,
            pending_writes,
            "Session ended"
        );
        self.gateway.publish_to(
            &ended.connections,
            ServerMessage::SessionEnded {
                session_id: session_id.to_string(),
                summary: ended.summary.clone(),
            },
        );
        Ok(ended.summary)
    }

    /// Send a fresh snapshot to a connection that missed messages
    pub async fn resync(&self, connection_id: Uuid) -> Result<()> {
        let (session_id, _) = self.caller(connection_id).await?;
        let canvas = self.store.lock(&session_id).await?;
        let session = self.registry.get(&session_id).await?;
        self.gateway
            .send_to(connection_id, ServerMessage::session_state(&session, &canvas));
        Ok(())
    }

    /// Remove silent participants and evict idle sessions
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = self.registry.sweep_idle(now).await;
        for departure in &report.timed_out {
            info!(
                session_id = %departure.session_id,
                participant_id = %departure.participant.id,
                "Participant timed out"
            );
            self.gateway
                .publish(
                    &departure.session_id,
                    ServerMessage::ParticipantLeft {
                        session_id: departure.session_id.clone(),
                        participant_id: departure.participant.id.clone(),
                        reason: LeaveReason::TimedOut,
                    },
                )
                .await;
        }
        for session_id in &report.idle {
            if self.evict_idle(session_id, now).await {
                report.evicted.push(session_id.clone());
            }
        }
        report
    }

    /// Evict a session if it is still empty and idle once its canvas lock is
    /// held; a participant that rejoined in the meantime keeps it alive
    async fn evict_idle(&self, session_id: &str, now: DateTime<Utc>) -> bool {
        let canvas = self.store.lock(session_id).await.ok();
        if !self.registry.evict_if_idle(session_id, now).await {
            debug!(session_id = %session_id, "Idle session became active, not evicted");
            return false;
        }
        let pending = self.batcher.close(session_id);
        if let Some(mut canvas) = canvas {
            self.run_batch(&mut canvas, pending).await;
            self.store.evict(canvas).await;
        }
        let pending_writes = self.persist(session_id).await;
        info!(session_id = %session_id, pending_writes, "Idle session evicted");
        true
    }

    /// Retry unsaved persistence writes of every canvas. Returns the number
    /// of writes that went through.
    pub async fn retry_persistence(&self) -> usize {
        let written = self.outbox.drain_all().await;
        if written > 0 {
            info!(written, pending = self.outbox.pending_total(), "Retried persistence writes");
        }
        written
    }

    /// End every live session and flush persistence
    pub async fn shutdown(&self) {
        let session_ids = self.registry.session_ids().await;
        info!(sessions = session_ids.len(), "Draining sessions");
        for session_id in session_ids {
            if let Err(e) = self.end_session(&session_id).await {
                warn!(session_id = %session_id, error = %e, "Failed to end session during shutdown");
            }
        }
        let written = self.outbox.drain_all().await;
        let pending = self.outbox.pending_total();
        if pending > 0 {
            warn!(pending, "Persistence writes left unsaved at shutdown");
        } else {
            debug!(written, "Persistence outbox flushed");
        }
    }
}
