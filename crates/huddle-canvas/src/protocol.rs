//! WebSocket Protocol Messages
//!
//! Client/server message types for the collaboration WebSocket API. Every
//! message is a JSON object whose `type` field carries the kebab-case
//! variant name.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::advisor::Suggestion;
use crate::conflict::Conflict;
use crate::error::Error;
use crate::model::{AppliedChange, Canvas, CanvasElement, UpdateRequest};
use crate::resolver::ConflictResolution;
use crate::session::{Participant, ParticipantRole, Session, SessionStatus, SessionSummary};

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Join (and possibly create) a session
    JoinSession {
        /// Session to join
        session_id: String,
        /// Participant identity
        participant_id: String,
        /// Requested role
        #[serde(default)]
        role: ParticipantRole,
    },

    /// Leave the current session
    LeaveSession,

    /// Submit a canvas change
    CanvasUpdate {
        /// The change
        #[serde(flatten)]
        update: UpdateRequest,
    },

    /// Ask the advisor for suggestions on the current canvas
    RequestSuggestions {
        /// Optional prompt
        #[serde(default)]
        prompt: Option<String>,
    },

    /// Settle a conflict; with a winner this is a manual decision
    ResolveConflict {
        /// Conflict to settle
        conflict: Conflict,
        /// Participant whose operation should stand
        #[serde(default)]
        winner: Option<String>,
    },

    /// Start or resume the session
    StartSession,

    /// Pause the session
    PauseSession,

    /// End the session
    EndSession,

    /// Keepalive
    Ping,
}

/// Why a participant left
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LeaveReason {
    /// Sent `leave-session`
    Left,
    /// Transport connection closed
    Disconnected,
    /// Silent beyond the participant timeout
    TimedOut,
    /// Moved to another session or connection
    Replaced,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Full session snapshot (on join and on resync)
    SessionState {
        /// Session id
        session_id: String,
        /// Lifecycle state
        status: SessionStatus,
        /// Participants in join order
        participants: Vec<Participant>,
        /// Canvas elements in order
        elements: Vec<CanvasElement>,
        /// Canvas version of `elements`
        version: u64,
    },

    /// A participant joined
    ParticipantJoined {
        /// Session id
        session_id: String,
        /// The new participant
        participant: Participant,
    },

    /// A participant left
    ParticipantLeft {
        /// Session id
        session_id: String,
        /// Participant that left
        participant_id: String,
        /// Why
        reason: LeaveReason,
    },

    /// Changes applied by one flush, in version order
    CanvasUpdates {
        /// Session id
        session_id: String,
        /// Canvas version after the last change
        version: u64,
        /// Applied changes
        changes: Vec<AppliedChange>,
    },

    /// Suggestions for the requesting participant
    AiSuggestions {
        /// Session id
        session_id: String,
        /// Suggestions
        suggestions: Vec<Suggestion>,
    },

    /// A conflict was settled (or deferred)
    ConflictResolved {
        /// Session id
        session_id: String,
        /// The conflict
        conflict: Conflict,
        /// How it was settled
        resolution: ConflictResolution,
    },

    /// Session started or resumed
    SessionStarted {
        /// Session id
        session_id: String,
        /// First start
        started_at: Option<DateTime<Utc>>,
    },

    /// Session paused
    SessionPaused {
        /// Session id
        session_id: String,
    },

    /// Session ended
    SessionEnded {
        /// Session id
        session_id: String,
        /// Final report
        summary: SessionSummary,
    },

    /// Error message
    Error {
        /// Error code
        code: String,
        /// Error message
        message: String,
    },

    /// Pong response to ping
    Pong,
}

impl ServerMessage {
    /// Create an error message
    #[must_use]
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Snapshot of a session and its canvas
    #[must_use]
    pub fn session_state(session: &Session, canvas: &Canvas) -> Self {
        Self::SessionState {
            session_id: session.id.clone(),
            status: session.status,
            participants: session.participants.clone(),
            elements: canvas.elements.clone(),
            version: canvas.version,
        }
    }

    /// Wire name of the message type
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionState { .. } => "session-state",
            Self::ParticipantJoined { .. } => "participant-joined",
            Self::ParticipantLeft { .. } => "participant-left",
            Self::CanvasUpdates { .. } => "canvas-updates",
            Self::AiSuggestions { .. } => "ai-suggestions",
            Self::ConflictResolved { .. } => "conflict-resolved",
            Self::SessionStarted { .. } => "session-started",
            Self::SessionPaused { .. } => "session-paused",
            Self::SessionEnded { .. } => "session-ended",
            Self::Error { .. } => "error",
            Self::Pong => "pong",
        }
    }
}

impl From<&Error> for ServerMessage {
    fn from(err: &Error) -> Self {
        Self::error(err.code(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ElementPatch, Position, UpdateOperation};

    #[test]
    fn test_join_message_parsing() {
        let json = r#"{"type":"join-session","session_id":"s1","participant_id":"p1"}"#;
        match serde_json::from_str::<ClientMessage>(json).unwrap() {
            ClientMessage::JoinSession {
                session_id,
                participant_id,
                role,
            } => {
                assert_eq!(session_id, "s1");
                assert_eq!(participant_id, "p1");
                assert_eq!(role, ParticipantRole::Contributor);
            }
            other => unreachable!("Expected JoinSession message, got {:?}", other),
        }
    }

    #[test]
    fn test_canvas_update_is_flat() {
        let json = r#"{
            "type": "canvas-update",
            "operation": "moved",
            "element": {"id": "e1", "position": {"x": 30.0, "y": 30.0}},
            "base_version": 2
        }"#;
        match serde_json::from_str::<ClientMessage>(json).unwrap() {
            ClientMessage::CanvasUpdate { update } => {
                assert_eq!(update.operation, UpdateOperation::Moved);
                assert_eq!(update.element.position, Some(Position::new(30.0, 30.0)));
                assert_eq!(update.base_version, Some(2));
            }
            other => unreachable!("Expected CanvasUpdate message, got {:?}", other),
        }

        let outgoing = ClientMessage::CanvasUpdate {
            update: UpdateRequest::new(UpdateOperation::Removed, ElementPatch::id("e9")),
        };
        let json = serde_json::to_string(&outgoing).unwrap();
        assert!(json.contains("\"type\":\"canvas-update\""));
        assert!(json.contains("\"operation\":\"removed\""));
    }

    #[test]
    fn test_unit_messages() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"end-session"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::EndSession));
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"explode"}"#).is_err());
    }

    #[test]
    fn test_server_message_error() {
        let err = Error::SessionPaused("s1".to_string());
        let msg = ServerMessage::from(&err);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("\"code\":\"session_paused\""));
    }

    #[test]
    fn test_kind_matches_wire_tag() {
        let messages = [
            ServerMessage::Pong,
            ServerMessage::SessionPaused {
                session_id: "s1".to_string(),
            },
            ServerMessage::ParticipantLeft {
                session_id: "s1".to_string(),
                participant_id: "p1".to_string(),
                reason: LeaveReason::TimedOut,
            },
        ];
        for msg in messages {
            let value = serde_json::to_value(&msg).unwrap();
            assert_eq!(value["type"], msg.kind());
        }
    }
}
