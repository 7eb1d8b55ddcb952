//! Session Registry
//!
//! Tracks live sessions, their participants and lifecycle state. The
//! registry is an owned object handed to request handlers. Each session sits
//! behind its own mutex, so per-message bookkeeping on one session never
//! waits on another. Membership changes (join, leave, end, eviction) also
//! take the membership lock, which keeps the connection index and the
//! session limit consistent with the session map.
//!
//! Lock order: membership, then the session map, then a single session.
//! Session locks are never held across anything but the registry's own
//! bookkeeping.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::CollaborationConfig;
use crate::conflict::Conflict;
use crate::error::{Error, Result};

/// Session lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Created, not yet started
    #[default]
    Inactive,
    /// Running
    Active,
    /// Temporarily halted; canvas updates are rejected
    Paused,
    /// Ended (terminal)
    Completed,
}

impl SessionStatus {
    /// Get the string representation
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Participant role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    /// Runs the session; escalation target for permission conflicts
    Facilitator,
    /// Regular editor
    #[default]
    Contributor,
    /// Read-only
    Observer,
}

impl ParticipantRole {
    /// Whether the role may change the canvas
    #[must_use]
    pub fn can_edit(&self) -> bool {
        !matches!(self, Self::Observer)
    }
}

/// A participant connected to a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    /// Participant id
    pub id: String,
    /// Transport connection currently carrying this participant
    pub connection_id: Uuid,
    /// Role
    pub role: ParticipantRole,
    /// When the participant joined
    pub joined_at: DateTime<Utc>,
    /// Last message received from the participant
    pub last_seen: DateTime<Utc>,
}

impl Participant {
    /// Create a participant joining now
    #[must_use]
    pub fn new(id: impl Into<String>, connection_id: Uuid, role: ParticipantRole) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            connection_id,
            role,
            joined_at: now,
            last_seen: now,
        }
    }
}

/// Running counters of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    /// Updates accepted into the batcher
    pub updates_received: u64,
    /// Operations applied to the canvas
    pub operations_applied: u64,
    /// Conflicts detected
    pub conflicts_detected: u64,
    /// Resolutions that changed or confirmed the canvas
    pub resolutions_applied: u64,
    /// Resolutions left for a human decision
    pub resolutions_deferred: u64,
}

impl SessionStats {
    fn absorb(&mut self, other: &SessionStats) {
        self.updates_received += other.updates_received;
        self.operations_applied += other.operations_applied;
        self.conflicts_detected += other.conflicts_detected;
        self.resolutions_applied += other.resolutions_applied;
        self.resolutions_deferred += other.resolutions_deferred;
    }
}

/// A live collaboration session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Session id (also the canvas id)
    pub id: String,
    /// Lifecycle state
    pub status: SessionStatus,
    /// Participants in join order
    pub participants: Vec<Participant>,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// First start
    pub started_at: Option<DateTime<Utc>>,
    /// End time, set only on the summary path
    pub ended_at: Option<DateTime<Utc>>,
    /// Last join, leave, message or flush
    pub last_activity: DateTime<Utc>,
    /// Counters
    pub stats: SessionStats,
    /// Canvas version after the last flush
    pub canvas_version: u64,
    /// Conflicts waiting for a facilitator or manual decision
    #[serde(skip)]
    pub pending_conflicts: Vec<Conflict>,
    /// Set once the session started ending; it takes no more joins or edits
    #[serde(skip)]
    pub closing: bool,
}

impl Session {
    /// Create an inactive session
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: SessionStatus::Inactive,
            participants: Vec::new(),
            created_at: now,
            started_at: None,
            ended_at: None,
            last_activity: now,
            stats: SessionStats::default(),
            canvas_version: 0,
            pending_conflicts: Vec::new(),
            closing: false,
        }
    }

    /// Get a participant by id
    #[must_use]
    pub fn participant(&self, participant_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == participant_id)
    }

    /// First facilitator in join order
    #[must_use]
    pub fn facilitator(&self) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.role == ParticipantRole::Facilitator)
    }

    /// Connection ids of all participants
    #[must_use]
    pub fn connections(&self) -> Vec<Uuid> {
        self.participants.iter().map(|p| p.connection_id).collect()
    }

    fn remove_participant(&mut self, participant_id: &str) -> Result<Participant> {
        let pos = self
            .participants
            .iter()
            .position(|p| p.id == participant_id)
            .ok_or_else(|| Error::ParticipantNotFound(participant_id.to_string()))?;
        self.last_activity = Utc::now();
        Ok(self.participants.remove(pos))
    }

    fn is_idle(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        !self.closing && self.participants.is_empty() && now - self.last_activity > timeout
    }

    fn transition(&mut self, to: SessionStatus) -> Result<()> {
        let allowed = matches!(
            (self.status, to),
            (SessionStatus::Inactive | SessionStatus::Paused, SessionStatus::Active)
                | (SessionStatus::Active, SessionStatus::Paused)
                | (
                    SessionStatus::Inactive | SessionStatus::Active | SessionStatus::Paused,
                    SessionStatus::Completed
                )
        );
        if !allowed {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        let now = Utc::now();
        if to == SessionStatus::Active && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if to == SessionStatus::Completed {
            self.ended_at = Some(now);
        }
        self.status = to;
        self.last_activity = now;
        Ok(())
    }
}

/// Final report produced when a session ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session id
    pub session_id: String,
    /// First start, if the session was ever started
    pub started_at: Option<DateTime<Utc>>,
    /// End time
    pub ended_at: DateTime<Utc>,
    /// Seconds between first start (or creation) and end
    pub duration_secs: i64,
    /// Participants present at the end
    pub participants: Vec<String>,
    /// Updates accepted into the batcher
    pub updates_received: u64,
    /// Operations applied to the canvas
    pub operations_applied: u64,
    /// Conflicts detected
    pub conflicts_detected: u64,
    /// Resolutions that changed or confirmed the canvas
    pub resolutions_applied: u64,
    /// Resolutions left for a human decision
    pub resolutions_deferred: u64,
    /// Canvas version at the end
    pub final_version: u64,
}

impl SessionSummary {
    fn of(session: &Session) -> Self {
        let ended_at = session.ended_at.unwrap_or_else(Utc::now);
        let began = session.started_at.unwrap_or(session.created_at);
        Self {
            session_id: session.id.clone(),
            started_at: session.started_at,
            ended_at,
            duration_secs: (ended_at - began).num_seconds().max(0),
            participants: session.participants.iter().map(|p| p.id.clone()).collect(),
            updates_received: session.stats.updates_received,
            operations_applied: session.stats.operations_applied,
            conflicts_detected: session.stats.conflicts_detected,
            resolutions_applied: session.stats.resolutions_applied,
            resolutions_deferred: session.stats.resolutions_deferred,
            final_version: session.canvas_version,
        }
    }
}

/// Result of a join
#[derive(Debug, Clone)]
pub struct Joined {
    /// Session after the join
    pub session: Session,
    /// Whether the session record was created by this join
    pub created: bool,
    /// Whether the participant id was already present (reconnect)
    pub rejoined: bool,
    /// Connection replaced by a reconnect
    pub replaced_connection: Option<Uuid>,
    /// Session the connection left in order to join this one
    pub left_session: Option<String>,
}

/// Result of an end
#[derive(Debug, Clone)]
pub struct Ended {
    /// Summary of the session
    pub summary: SessionSummary,
    /// Connections that were attached at the end
    pub connections: Vec<Uuid>,
}

/// Participant removed because its connection went away
#[derive(Debug, Clone)]
pub struct Departure {
    /// Session the participant belonged to
    pub session_id: String,
    /// Removed participant
    pub participant: Participant,
}

/// Outcome of an idle sweep
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Participants removed for silence
    pub timed_out: Vec<Departure>,
    /// Empty sessions idle past the timeout, still registered
    pub idle: Vec<String>,
    /// Sessions removed by eviction
    pub evicted: Vec<String>,
    /// Expired tombstones purged
    pub purged_tombstones: usize,
}

impl SweepReport {
    /// Whether the sweep changed nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.timed_out.is_empty()
            && self.idle.is_empty()
            && self.evicted.is_empty()
            && self.purged_tombstones == 0
    }
}

type SessionHandle = Arc<Mutex<Session>>;

#[derive(Default)]
struct Membership {
    /// connection id -> (session id, participant id)
    connections: HashMap<Uuid, (String, String)>,
    /// ended session id -> end time
    tombstones: HashMap<String, DateTime<Utc>>,
}

/// Registry of live sessions
pub struct SessionRegistry {
    membership: RwLock<Membership>,
    sessions: RwLock<HashMap<String, SessionHandle>>,
    max_sessions: usize,
    max_participants: usize,
    participant_timeout: Duration,
    session_idle_timeout: Duration,
    tombstone_retention: Duration,
}

impl SessionRegistry {
    /// Create a registry with default limits
    #[must_use]
    pub fn new() -> Self {
        Self::from_config(&CollaborationConfig::default())
    }

    /// Create a registry from collaboration settings
    #[must_use]
    pub fn from_config(config: &CollaborationConfig) -> Self {
        Self {
            membership: RwLock::new(Membership::default()),
            sessions: RwLock::new(HashMap::new()),
            max_sessions: config.max_sessions,
            max_participants: config.max_participants_per_session,
            participant_timeout: secs(config.participant_timeout_secs),
            session_idle_timeout: secs(config.session_idle_timeout_secs),
            tombstone_retention: secs(config.ended_session_retention_secs),
        }
    }

    /// Configure the session limit
    #[must_use]
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Configure the per-session participant limit
    #[must_use]
    pub fn with_max_participants(mut self, max: usize) -> Self {
        self.max_participants = max;
        self
    }

    async fn handle(&self, session_id: &str) -> Result<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))
    }

    /// Get or create a session record; callers hold the membership lock
    async fn open_session(&self, session_id: &str) -> Result<(SessionHandle, bool)> {
        if let Ok(handle) = self.handle(session_id).await {
            return Ok((handle, false));
        }
        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(session_id) {
            return Ok((handle.clone(), false));
        }
        if sessions.len() >= self.max_sessions {
            return Err(Error::MaxSessionsExceeded(self.max_sessions));
        }
        let handle = Arc::new(Mutex::new(Session::new(session_id)));
        sessions.insert(session_id.to_string(), handle.clone());
        Ok((handle, true))
    }

    /// Add a participant, creating the session record on first join
    pub async fn join(
        &self,
        session_id: &str,
        participant_id: &str,
        connection_id: Uuid,
        role: ParticipantRole,
    ) -> Result<Joined> {
        if session_id.is_empty() || participant_id.is_empty() {
            return Err(Error::invalid_message("session and participant ids are required"));
        }

        let mut membership = self.membership.write().await;
        if membership.tombstones.contains_key(session_id) {
            return Err(Error::SessionNotFound(session_id.to_string()));
        }

        // A connection carries one participant of one session at a time
        let previous = membership.connections.get(&connection_id).cloned();
        let previous_handle = match &previous {
            Some((prev_session, _)) if prev_session != session_id => self.handle(prev_session).await.ok(),
            _ => None,
        };

        let (handle, created) = self.open_session(session_id).await?;
        let mut session = handle.lock().await;
        if session.closing {
            return Err(Error::SessionNotFound(session_id.to_string()));
        }
        if session.participant(participant_id).is_none()
            && session.participants.len() >= self.max_participants
        {
            return Err(Error::SessionFull(session_id.to_string()));
        }

        let mut left_session = None;
        if let Some((prev_session, prev_participant)) = previous {
            if prev_session != session_id {
                if let Some(previous_handle) = previous_handle {
                    let _ = previous_handle.lock().await.remove_participant(&prev_participant);
                }
                left_session = Some(prev_session);
            } else if prev_participant != participant_id {
                let _ = session.remove_participant(&prev_participant);
            }
        }

        let now = Utc::now();
        let mut replaced_connection = None;
        let rejoined = match session.participants.iter_mut().find(|p| p.id == participant_id) {
            Some(existing) => {
                if existing.connection_id != connection_id {
                    replaced_connection = Some(existing.connection_id);
                }
                existing.connection_id = connection_id;
                existing.role = role;
                existing.last_seen = now;
                true
            }
            None => {
                session
                    .participants
                    .push(Participant::new(participant_id, connection_id, role));
                false
            }
        };
        session.last_activity = now;
        let snapshot = session.clone();

        if let Some(old) = replaced_connection {
            membership.connections.remove(&old);
        }
        membership.connections.insert(
            connection_id,
            (session_id.to_string(), participant_id.to_string()),
        );

        Ok(Joined {
            session: snapshot,
            created,
            rejoined,
            replaced_connection,
            left_session,
        })
    }

    /// Remove a participant by id
    pub async fn leave(&self, session_id: &str, participant_id: &str) -> Result<Participant> {
        let mut membership = self.membership.write().await;
        let handle = self.handle(session_id).await?;
        let participant = handle.lock().await.remove_participant(participant_id)?;
        membership.connections.remove(&participant.connection_id);
        Ok(participant)
    }

    /// Undo a join that could not be completed. The session record goes
    /// too when nobody else is left in it.
    pub async fn withdraw(&self, session_id: &str, participant_id: &str) {
        let mut membership = self.membership.write().await;
        let mut sessions = self.sessions.write().await;
        let Some(handle) = sessions.get(session_id).cloned() else {
            return;
        };
        let mut session = handle.lock().await;
        if let Ok(participant) = session.remove_participant(participant_id) {
            membership.connections.remove(&participant.connection_id);
        }
        if session.participants.is_empty() && !session.closing {
            sessions.remove(session_id);
        }
    }

    /// Remove whichever participant the connection carried
    pub async fn disconnect(&self, connection_id: Uuid) -> Option<Departure> {
        let mut membership = self.membership.write().await;
        let (session_id, participant_id) = membership.connections.get(&connection_id).cloned()?;
        let handle = self.handle(&session_id).await.ok()?;
        let participant = handle.lock().await.remove_participant(&participant_id).ok()?;
        membership.connections.remove(&connection_id);
        Some(Departure {
            session_id,
            participant,
        })
    }

    /// Transition to active
    pub async fn start(&self, session_id: &str) -> Result<Session> {
        self.transition(session_id, SessionStatus::Active).await
    }

    /// Transition to paused
    pub async fn pause(&self, session_id: &str) -> Result<Session> {
        self.transition(session_id, SessionStatus::Paused).await
    }

    async fn transition(&self, session_id: &str, to: SessionStatus) -> Result<Session> {
        let handle = self.handle(session_id).await?;
        let mut session = handle.lock().await;
        if session.closing {
            return Err(Error::SessionNotFound(session_id.to_string()));
        }
        session.transition(to)?;
        Ok(session.clone())
    }

    /// Mark a session as ending. From here on it refuses joins and edits;
    /// only one caller gets to end it.
    pub async fn begin_end(&self, session_id: &str) -> Result<()> {
        let handle = self.handle(session_id).await?;
        let mut session = handle.lock().await;
        if session.closing {
            return Err(Error::SessionNotFound(session_id.to_string()));
        }
        session.closing = true;
        Ok(())
    }

    /// End a session: produce its summary, then forget it
    pub async fn end(&self, session_id: &str) -> Result<Ended> {
        let mut membership = self.membership.write().await;
        let mut sessions = self.sessions.write().await;
        let handle = sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        let mut session = handle.lock().await;
        session.transition(SessionStatus::Completed)?;
        sessions.remove(session_id);
        drop(sessions);

        let summary = SessionSummary::of(&session);
        let connections = session.connections();
        for connection_id in &connections {
            membership.connections.remove(connection_id);
        }
        membership
            .tombstones
            .insert(session_id.to_string(), summary.ended_at);

        Ok(Ended {
            summary,
            connections,
        })
    }

    /// Current lifecycle state
    pub async fn status(&self, session_id: &str) -> Result<SessionStatus> {
        let handle = self.handle(session_id).await?;
        let status = handle.lock().await.status;
        Ok(status)
    }

    /// Copy of a session record
    pub async fn get(&self, session_id: &str) -> Result<Session> {
        let handle = self.handle(session_id).await?;
        let session = handle.lock().await.clone();
        Ok(session)
    }

    /// Copy of a session record, provided the participant is still in it
    /// and the session is not ending
    pub async fn ensure_member(&self, session_id: &str, participant_id: &str) -> Result<Session> {
        let handle = self.handle(session_id).await?;
        let session = handle.lock().await;
        if session.closing {
            return Err(Error::SessionNotFound(session_id.to_string()));
        }
        if session.participant(participant_id).is_none() {
            return Err(Error::ParticipantNotFound(participant_id.to_string()));
        }
        Ok(session.clone())
    }

    /// Session and participant carried by a connection
    pub async fn lookup(&self, connection_id: Uuid) -> Option<(String, String)> {
        let membership = self.membership.read().await;
        membership.connections.get(&connection_id).cloned()
    }

    /// Refresh activity for the participant behind a connection
    pub async fn touch(&self, connection_id: Uuid) -> bool {
        let Some((session_id, participant_id)) = self.lookup(connection_id).await else {
            return false;
        };
        let Ok(handle) = self.handle(&session_id).await else {
            return false;
        };
        let mut session = handle.lock().await;
        let now = Utc::now();
        session.last_activity = now;
        match session.participants.iter_mut().find(|p| p.id == participant_id) {
            Some(participant) => {
                participant.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Check that a participant may submit canvas updates now
    pub async fn ensure_can_edit(&self, session_id: &str, participant_id: &str) -> Result<()> {
        let handle = self.handle(session_id).await?;
        let session = handle.lock().await;
        let participant = session
            .participant(participant_id)
            .ok_or_else(|| Error::ParticipantNotFound(participant_id.to_string()))?;
        if !participant.role.can_edit() {
            return Err(Error::PermissionDenied(format!(
                "{participant_id} is an observer"
            )));
        }
        if session.closing {
            return Err(Error::BatchClosed(session_id.to_string()));
        }
        match session.status {
            SessionStatus::Paused => Err(Error::SessionPaused(session_id.to_string())),
            SessionStatus::Completed => Err(Error::SessionNotFound(session_id.to_string())),
            SessionStatus::Inactive | SessionStatus::Active => Ok(()),
        }
    }

    /// Role of a participant
    pub async fn role(&self, session_id: &str, participant_id: &str) -> Option<ParticipantRole> {
        let handle = self.handle(session_id).await.ok()?;
        let session = handle.lock().await;
        session.participant(participant_id).map(|p| p.role)
    }

    /// Facilitator of a session
    pub async fn facilitator(&self, session_id: &str) -> Option<String> {
        let handle = self.handle(session_id).await.ok()?;
        let session = handle.lock().await;
        session.facilitator().map(|p| p.id.clone())
    }

    /// Connections attached to a session at this moment
    pub async fn connections(&self, session_id: &str) -> Vec<Uuid> {
        match self.handle(session_id).await {
            Ok(handle) => handle.lock().await.connections(),
            Err(_) => Vec::new(),
        }
    }

    /// Add flush counters and record the resulting canvas version
    pub async fn record_batch(&self, session_id: &str, stats: SessionStats, canvas_version: u64) {
        if let Ok(handle) = self.handle(session_id).await {
            let mut session = handle.lock().await;
            session.stats.absorb(&stats);
            session.canvas_version = session.canvas_version.max(canvas_version);
            session.last_activity = Utc::now();
        }
    }

    /// Keep a conflict for a later manual decision
    pub async fn park_conflict(&self, session_id: &str, conflict: Conflict) {
        if let Ok(handle) = self.handle(session_id).await {
            let mut session = handle.lock().await;
            if !session.pending_conflicts.iter().any(|c| c.id == conflict.id) {
                session.pending_conflicts.push(conflict);
            }
        }
    }

    /// Take a parked conflict out of the session
    pub async fn take_conflict(&self, session_id: &str, conflict_id: Uuid) -> Option<Conflict> {
        let handle = self.handle(session_id).await.ok()?;
        let mut session = handle.lock().await;
        let pos = session
            .pending_conflicts
            .iter()
            .position(|c| c.id == conflict_id)?;
        Some(session.pending_conflicts.remove(pos))
    }

    /// Remove silent participants, report empty idle sessions and purge
    /// expired tombstones. Idle sessions stay registered until
    /// [`SessionRegistry::evict_if_idle`] removes them.
    pub async fn sweep_idle(&self, now: DateTime<Utc>) -> SweepReport {
        let mut membership = self.membership.write().await;
        let mut report = SweepReport::default();

        let handles: Vec<SessionHandle> = self.sessions.read().await.values().cloned().collect();
        for handle in handles {
            let mut session = handle.lock().await;
            let silent: Vec<String> = session
                .participants
                .iter()
                .filter(|p| now - p.last_seen > self.participant_timeout)
                .map(|p| p.id.clone())
                .collect();
            for participant_id in silent {
                if let Ok(participant) = session.remove_participant(&participant_id) {
                    membership.connections.remove(&participant.connection_id);
                    report.timed_out.push(Departure {
                        session_id: session.id.clone(),
                        participant,
                    });
                }
            }
            if session.is_idle(now, self.session_idle_timeout) {
                report.idle.push(session.id.clone());
            }
        }

        let before = membership.tombstones.len();
        let retention = self.tombstone_retention;
        membership
            .tombstones
            .retain(|_, ended_at| now - *ended_at <= retention);
        report.purged_tombstones = before - membership.tombstones.len();

        report
    }

    /// Remove a session that is still empty and idle. Returns `false` when
    /// someone joined since the sweep or the session is ending.
    pub async fn evict_if_idle(&self, session_id: &str, now: DateTime<Utc>) -> bool {
        let _membership = self.membership.write().await;
        let mut sessions = self.sessions.write().await;
        let Some(handle) = sessions.get(session_id).cloned() else {
            return false;
        };
        let idle = handle.lock().await.is_idle(now, self.session_idle_timeout);
        if idle {
            sessions.remove(session_id);
        }
        idle
    }

    /// Ids of all live sessions
    pub async fn session_ids(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether an id belongs to an ended session
    pub async fn is_tombstoned(&self, session_id: &str) -> bool {
        let membership = self.membership.read().await;
        membership.tombstones.contains_key(session_id)
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1000))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn joined(registry: &SessionRegistry, session: &str, participant: &str) -> Uuid {
        let connection = Uuid::new_v4();
        registry
            .join(session, participant, connection, ParticipantRole::Contributor)
            .await
            .unwrap();
        connection
    }

    #[tokio::test]
    async fn test_join_creates_session() {
        let registry = SessionRegistry::new();
        let result = registry
            .join("s1", "p1", Uuid::new_v4(), ParticipantRole::Facilitator)
            .await
            .unwrap();

        assert!(result.created);
        assert!(!result.rejoined);
        assert_eq!(result.session.status, SessionStatus::Inactive);
        assert_eq!(registry.session_count().await, 1);
        assert_eq!(registry.facilitator("s1").await, Some("p1".to_string()));
    }

    #[tokio::test]
    async fn test_rejoin_replaces_connection() {
        let registry = SessionRegistry::new();
        let first = joined(&registry, "s1", "p1").await;
        let second = Uuid::new_v4();
        let result = registry
            .join("s1", "p1", second, ParticipantRole::Contributor)
            .await
            .unwrap();

        assert!(result.rejoined);
        assert_eq!(result.replaced_connection, Some(first));
        assert_eq!(result.session.participants.len(), 1);
        assert!(registry.lookup(first).await.is_none());
        assert_eq!(registry.connections("s1").await, vec![second]);
    }

    #[tokio::test]
    async fn test_stale_connection_disconnect_keeps_participant() {
        let registry = SessionRegistry::new();
        let first = joined(&registry, "s1", "p1").await;
        joined(&registry, "s1", "p1").await;

        assert!(registry.disconnect(first).await.is_none());
        assert_eq!(registry.get("s1").await.unwrap().participants.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_by_connection() {
        let registry = SessionRegistry::new();
        let connection = joined(&registry, "s1", "p1").await;
        joined(&registry, "s1", "p2").await;

        let departure = registry.disconnect(connection).await.unwrap();
        assert_eq!(departure.session_id, "s1");
        assert_eq!(departure.participant.id, "p1");
        let session = registry.get("s1").await.unwrap();
        assert_eq!(session.participants.len(), 1);
        assert_eq!(session.participants[0].id, "p2");
    }

    #[tokio::test]
    async fn test_connection_switching_sessions_leaves_previous() {
        let registry = SessionRegistry::new();
        let connection = joined(&registry, "s1", "p1").await;
        let result = registry
            .join("s2", "p1", connection, ParticipantRole::Contributor)
            .await
            .unwrap();

        assert_eq!(result.left_session, Some("s1".to_string()));
        assert!(registry.get("s1").await.unwrap().participants.is_empty());
        assert_eq!(
            registry.lookup(connection).await,
            Some(("s2".to_string(), "p1".to_string()))
        );
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let registry = SessionRegistry::new();
        joined(&registry, "s1", "p1").await;

        let err = registry.pause("s1").await.unwrap_err();
        assert_eq!(err.code(), "invalid_transition");

        registry.start("s1").await.unwrap();
        assert_eq!(registry.status("s1").await.unwrap(), SessionStatus::Active);
        registry.pause("s1").await.unwrap();
        assert_eq!(registry.status("s1").await.unwrap(), SessionStatus::Paused);
        let resumed = registry.start("s1").await.unwrap();
        assert_eq!(resumed.status, SessionStatus::Active);
        assert!(resumed.started_at.is_some());
    }

    #[tokio::test]
    async fn test_end_is_terminal() {
        let registry = SessionRegistry::new();
        let connection = joined(&registry, "s1", "p1").await;
        registry.start("s1").await.unwrap();
        registry
            .record_batch(
                "s1",
                SessionStats {
                    operations_applied: 3,
                    ..SessionStats::default()
                },
                3,
            )
            .await;

        let ended = registry.end("s1").await.unwrap();
        assert_eq!(ended.summary.participants, vec!["p1".to_string()]);
        assert_eq!(ended.summary.operations_applied, 3);
        assert_eq!(ended.summary.final_version, 3);
        assert_eq!(ended.connections, vec![connection]);

        assert!(registry.status("s1").await.unwrap_err().is_not_found());
        assert!(registry.end("s1").await.unwrap_err().is_not_found());
        let err = registry
            .join("s1", "p2", Uuid::new_v4(), ParticipantRole::Contributor)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "session_not_found");
        assert!(registry.lookup(connection).await.is_none());
    }

    #[tokio::test]
    async fn test_edit_permissions() {
        let registry = SessionRegistry::new();
        joined(&registry, "s1", "p1").await;
        registry
            .join("s1", "watcher", Uuid::new_v4(), ParticipantRole::Observer)
            .await
            .unwrap();

        assert!(registry.ensure_can_edit("s1", "p1").await.is_ok());
        assert_eq!(
            registry.ensure_can_edit("s1", "watcher").await.unwrap_err().code(),
            "permission_denied"
        );
        assert_eq!(
            registry.ensure_can_edit("s1", "ghost").await.unwrap_err().code(),
            "participant_not_found"
        );

        registry.start("s1").await.unwrap();
        registry.pause("s1").await.unwrap();
        assert_eq!(
            registry.ensure_can_edit("s1", "p1").await.unwrap_err().code(),
            "session_paused"
        );
    }

    #[tokio::test]
    async fn test_limits() {
        let registry = SessionRegistry::new()
            .with_max_sessions(1)
            .with_max_participants(1);
        joined(&registry, "s1", "p1").await;

        let err = registry
            .join("s1", "p2", Uuid::new_v4(), ParticipantRole::Contributor)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "session_full");

        let err = registry
            .join("s2", "p2", Uuid::new_v4(), ParticipantRole::Contributor)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "max_sessions_exceeded");
    }

    #[tokio::test]
    async fn test_sweep_idle() {
        let config = CollaborationConfig::default();
        let registry = SessionRegistry::from_config(&config);
        let quiet = joined(&registry, "s1", "p1").await;
        joined(&registry, "s2", "p2").await;
        registry.touch(quiet).await;

        let later = Utc::now() + Duration::seconds(120);
        let report = registry.sweep_idle(later).await;
        assert_eq!(report.timed_out.len(), 2);
        assert!(report.evicted.is_empty());

        let much_later = Utc::now() + Duration::seconds(7200);
        let report = registry.sweep_idle(much_later).await;
        assert_eq!(report.idle.len(), 2);
        assert_eq!(registry.session_count().await, 2);
        for session_id in &report.idle {
            assert!(registry.evict_if_idle(session_id, much_later).await);
        }
        assert_eq!(registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_rejoined_session_is_not_evicted() {
        let registry = SessionRegistry::new();
        joined(&registry, "s1", "p1").await;
        registry.leave("s1", "p1").await.unwrap();

        let much_later = Utc::now() + Duration::seconds(7200);
        let report = registry.sweep_idle(much_later).await;
        assert_eq!(report.idle, vec!["s1".to_string()]);

        joined(&registry, "s1", "p1").await;
        assert!(!registry.evict_if_idle("s1", much_later).await);
        assert_eq!(registry.get("s1").await.unwrap().participants.len(), 1);
    }

    #[tokio::test]
    async fn test_ending_session_refuses_joins_and_edits() {
        let registry = SessionRegistry::new();
        joined(&registry, "s1", "p1").await;
        registry.begin_end("s1").await.unwrap();

        assert_eq!(
            registry.ensure_can_edit("s1", "p1").await.unwrap_err().code(),
            "batch_closed"
        );
        let err = registry
            .join("s1", "p2", Uuid::new_v4(), ParticipantRole::Contributor)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "session_not_found");
        assert!(registry.begin_end("s1").await.unwrap_err().is_not_found());
        assert!(registry.ensure_member("s1", "p1").await.is_err());

        let ended = registry.end("s1").await.unwrap();
        assert_eq!(ended.summary.participants, vec!["p1".to_string()]);
    }

    #[tokio::test]
    async fn test_withdraw_drops_fresh_session() {
        let registry = SessionRegistry::new();
        let connection = joined(&registry, "s1", "p1").await;
        registry.withdraw("s1", "p1").await;

        assert_eq!(registry.session_count().await, 0);
        assert!(registry.lookup(connection).await.is_none());
    }

    #[tokio::test]
    async fn test_sessions_do_not_contend() {
        let registry = SessionRegistry::new();
        joined(&registry, "busy", "p1").await;
        let other = joined(&registry, "quiet", "p2").await;

        let busy = registry.handle("busy").await.unwrap();
        let _held = busy.lock().await;

        let deadline = std::time::Duration::from_secs(1);
        assert!(tokio::time::timeout(deadline, registry.touch(other)).await.unwrap());
        tokio::time::timeout(deadline, registry.ensure_can_edit("quiet", "p2"))
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(deadline, registry.record_batch("quiet", SessionStats::default(), 4))
            .await
            .unwrap();
        assert_eq!(
            tokio::time::timeout(deadline, registry.connections("quiet")).await.unwrap(),
            vec![other]
        );
    }

    #[tokio::test]
    async fn test_tombstones_expire() {
        let registry = SessionRegistry::new();
        joined(&registry, "s1", "p1").await;
        registry.end("s1").await.unwrap();
        assert!(registry.is_tombstoned("s1").await);

        let report = registry.sweep_idle(Utc::now() + Duration::seconds(7200)).await;
        assert_eq!(report.purged_tombstones, 1);
        assert!(registry
            .join("s1", "p1", Uuid::new_v4(), ParticipantRole::Contributor)
            .await
            .is_ok());
    }
}
