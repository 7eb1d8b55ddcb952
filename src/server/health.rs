//! Health endpoint
//!
//! `/health` reports liveness, version and the number of live sessions.

use axum::extract::Extension;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use huddle_canvas::SessionCoordinator;
use serde::Serialize;
use std::sync::Arc;

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub active_sessions: usize,
    pub pending_writes: usize,
}

async fn health_check(
    Extension(coordinator): Extension<Arc<SessionCoordinator>>,
) -> Json<HealthResponse> {
    let pending_writes = coordinator.outbox().pending_total();
    Json(HealthResponse {
        // Writes waiting in the outbox mean the backend is failing
        status: if pending_writes == 0 { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        active_sessions: coordinator.registry().session_count().await,
        pending_writes,
    })
}

/// Health routes; expects an `Extension<Arc<SessionCoordinator>>` layer
pub fn health_routes() -> Router {
    Router::new().route("/health", get(health_check))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use huddle_canvas::{CollaborationConfig, MemoryTransport, ParticipantRole};
    use tower::ServiceExt;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_health_reports_sessions() {
        let coordinator = SessionCoordinator::builder(
            CollaborationConfig::default(),
            Arc::new(MemoryTransport::new()),
        )
        .build();
        coordinator
            .join(Uuid::new_v4(), "s1", "p1", ParticipantRole::Contributor)
            .await
            .unwrap();

        let app = health_routes().layer(Extension(coordinator));
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["active_sessions"], 1);
    }
}
