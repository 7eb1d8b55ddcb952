//! WebSocket Handler
//!
//! One task per connection multiplexes the client socket, the broadcast
//! envelopes addressed to this connection and a protocol-level ping. A
//! lagging broadcast receiver is answered with a fresh session snapshot.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broadcast::{ChannelTransport, Envelope};
use crate::coordinator::SessionCoordinator;
use crate::error::Error;
use crate::protocol::ClientMessage;

/// Interval of protocol-level pings sent to idle clients
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Shared state for the WebSocket handler
pub struct CollabState {
    /// Collaboration pipeline
    pub coordinator: Arc<SessionCoordinator>,
    /// Transport the coordinator publishes through
    pub transport: Arc<ChannelTransport>,
    /// Closes every connection when cancelled
    pub shutdown: CancellationToken,
}

impl CollabState {
    /// Create the handler state
    #[must_use]
    pub fn new(coordinator: Arc<SessionCoordinator>, transport: Arc<ChannelTransport>) -> Self {
        Self {
            coordinator,
            transport,
            shutdown: CancellationToken::new(),
        }
    }

    /// Use an externally owned shutdown token
    #[must_use]
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Largest inbound text frame accepted
    #[must_use]
    pub fn max_message_bytes(&self) -> usize {
        self.coordinator.config().max_message_bytes()
    }
}

/// WebSocket upgrade handler
pub async fn collab_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<CollabState>>,
) -> impl IntoResponse {
    let limit = state.max_message_bytes();
    ws.max_message_size(limit)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Serialize an envelope if it is addressed to the connection
fn encode_for(envelope: &Envelope, connection_id: Uuid) -> Option<String> {
    if !envelope.is_for(connection_id) {
        return None;
    }
    serde_json::to_string(envelope.message.as_ref()).ok()
}

/// Parse an inbound text frame
fn decode(text: &str, limit: usize) -> Result<ClientMessage, Error> {
    if text.len() > limit {
        return Err(Error::invalid_message(format!(
            "message of {} bytes exceeds the {limit} byte limit",
            text.len()
        )));
    }
    serde_json::from_str(text).map_err(|e| Error::invalid_message(e.to_string()))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<CollabState>) {
    let connection_id = Uuid::new_v4();
    info!(connection_id = %connection_id, "WebSocket connected");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut envelopes = state.transport.subscribe();
    let coordinator = state.coordinator.clone();
    let limit = state.max_message_bytes();
    let shutdown = state.shutdown.clone();

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await;

    loop {
        // Pending envelopes go out before a shutdown closes the socket
        tokio::select! {
            biased;

            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match decode(&text, limit) {
                            Ok(message) => coordinator.dispatch(connection_id, message).await,
                            Err(e) => {
                                debug!(connection_id = %connection_id, error = %e, "Invalid message");
                                coordinator.reject(connection_id, &e);
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        coordinator.registry().touch(connection_id).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(connection_id = %connection_id, "WebSocket closed by client");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection_id = %connection_id, error = %e, "WebSocket error");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        coordinator.reject(
                            connection_id,
                            &Error::invalid_message("binary frames are not supported"),
                        );
                    }
                }
            }
            envelope = envelopes.recv() => {
                match envelope {
                    Ok(envelope) => {
                        if let Some(json) = encode_for(&envelope, connection_id) {
                            if ws_tx.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(connection_id = %connection_id, lagged = n, "Broadcast receiver lagged, resyncing");
                        if let Err(e) = coordinator.resync(connection_id).await {
                            debug!(connection_id = %connection_id, error = %e, "Resync skipped");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = ping_interval.tick() => {
                if ws_tx.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
            _ = shutdown.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }

    coordinator.disconnect(connection_id).await;
    info!(connection_id = %connection_id, "WebSocket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::Transport;
    use crate::config::CollaborationConfig;
    use crate::protocol::ServerMessage;

    fn state() -> CollabState {
        let transport = Arc::new(ChannelTransport::new(16));
        let coordinator =
            SessionCoordinator::builder(CollaborationConfig::default(), transport.clone()).build();
        CollabState::new(coordinator, transport)
    }

    #[tokio::test]
    async fn test_collab_state_creation() {
        let state = state();
        assert_eq!(state.transport.receiver_count(), 0);
        assert_eq!(state.max_message_bytes(), 256 * 1024);
        assert!(!state.shutdown.is_cancelled());

        let token = CancellationToken::new();
        let state = state.with_shutdown(token.clone());
        token.cancel();
        assert!(state.shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_envelopes_are_filtered_per_connection() {
        let state = state();
        let mut rx = state.transport.subscribe();
        let mine = Uuid::new_v4();
        state.transport.deliver(&[mine], ServerMessage::Pong);

        let envelope = rx.recv().await.unwrap();
        assert_eq!(encode_for(&envelope, mine).as_deref(), Some(r#"{"type":"pong"}"#));
        assert!(encode_for(&envelope, Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_decode_limits_and_errors() {
        assert!(matches!(decode(r#"{"type":"ping"}"#, 64), Ok(ClientMessage::Ping)));

        let err = decode(r#"{"type":"ping"}"#, 4).unwrap_err();
        assert_eq!(err.code(), "invalid_message");

        let err = decode("not json", 64).unwrap_err();
        assert_eq!(err.code(), "invalid_message");
    }
}
