//! Huddle Canvas - Collaborative Session Core
//!
//! This crate provides the real-time collaboration pipeline behind Huddle:
//! - Session: Session lifecycle and participant registry
//! - Store: Versioned canvas state per session
//! - Batcher: Debounced per-session update batches
//! - Conflict: Detection of competing updates within a batch
//! - Resolver: Strategy-based conflict resolution
//! - Broadcast: Fan-out of server messages to session connections
//! - Coordinator: The flush pipeline tying the above together
//! - Persistence: Write-behind canvas and resolution storage
//! - Protocol: WebSocket client/server message types
//! - WebSocket: Connection handler
//!
//! ## Usage
//!
//! ```ignore
//! use huddle_canvas::{
//!     collab_ws_handler, ChannelTransport, CollabState, CollaborationConfig,
//!     SessionCoordinator,
//! };
//! use axum::{routing::get, Router};
//! use std::sync::Arc;
//!
//! let config = CollaborationConfig::default();
//! let transport = Arc::new(ChannelTransport::new(config.broadcast_capacity));
//! let coordinator = SessionCoordinator::builder(config, transport.clone()).build();
//! let state = Arc::new(CollabState::new(coordinator, transport));
//!
//! let app: Router<()> = Router::new()
//!     .route("/ws", get(collab_ws_handler))
//!     .with_state(state);
//! ```
//!
//! ## Configuration
//!
//! ```toml
//! [collaboration]
//! batch_window_ms = 100
//! max_batch_size = 256
//! max_participants_per_session = 50
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod advisor;
pub mod batcher;
pub mod broadcast;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod error;
pub mod model;
pub mod persistence;
pub mod protocol;
pub mod resolver;
pub mod session;
pub mod store;
pub mod websocket;

// Re-export main types
pub use advisor::{DisabledAdvisor, NoopAdvisor, Suggestion, SuggestionAdvisor, SuggestionRequest};
pub use batcher::UpdateBatcher;
pub use broadcast::{BroadcastGateway, ChannelTransport, Envelope, MemoryTransport, Transport};
pub use config::CollaborationConfig;
pub use conflict::{Conflict, ConflictDetector, ConflictSeverity, ConflictType};
pub use coordinator::{FlushReport, SessionCoordinator};
pub use error::{Error, Result};
pub use model::{
    AppliedChange, Canvas, CanvasElement, CanvasUpdate, ElementPatch, Position, UpdateOperation,
    UpdateRequest,
};
pub use persistence::{
    CanvasDelta, CanvasPersistence, MemoryPersistence, PersistenceOutbox, ResolutionLogEntry,
    SqlitePersistence,
};
pub use protocol::{ClientMessage, LeaveReason, ServerMessage};
pub use resolver::{ConflictResolution, ConflictResolver, ResolutionPayload, ResolutionStrategy};
pub use session::{
    Participant, ParticipantRole, Session, SessionRegistry, SessionStatus, SessionSummary,
    SweepReport,
};
pub use store::CanvasStore;
pub use websocket::{collab_ws_handler, CollabState};
