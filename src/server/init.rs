//! Server initialization
//!
//! Builds the persistence backend, the collaboration pipeline and the axum
//! router, then serves until a shutdown signal drains every session.

use super::background_tasks::{start_persistence_retry, start_sweeper};
use super::config::{AppConfig, PersistenceConfig};
use super::health::health_routes;
use super::loader::environment;
use super::validation::validate_config;
use anyhow::{Context, Result};
use axum::{extract::Extension, http::HeaderValue, routing::get, Router};
use huddle_canvas::{
    collab_ws_handler, CanvasPersistence, ChannelTransport, CollabState, DisabledAdvisor,
    MemoryPersistence, NoopAdvisor, SessionCoordinator, SqlitePersistence, SuggestionAdvisor,
};
use sqlx::sqlite::SqlitePoolOptions;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

/// Build the configured persistence backend
async fn build_persistence(config: &PersistenceConfig) -> Result<Arc<dyn CanvasPersistence>> {
    if config.backend != "sqlite" {
        info!("Using in-memory canvas persistence");
        return Ok(Arc::new(MemoryPersistence::new()));
    }

    if let Some(dir) = sqlite_parent_dir(&config.database_url) {
        std::fs::create_dir_all(dir).context("Failed to create database directory")?;
    }
    // Every connection to an in-memory database sees its own empty database
    let max_connections = if config.database_url.contains(":memory:") { 1 } else { 5 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to SQLite")?;
    let persistence = SqlitePersistence::new(pool);
    persistence
        .init()
        .await
        .context("Failed to initialize canvas tables")?;
    info!(database_url = %config.database_url, "Using SQLite canvas persistence");
    Ok(Arc::new(persistence))
}

/// Directory holding a file-backed SQLite database, if any
fn sqlite_parent_dir(url: &str) -> Option<&Path> {
    let path = url.strip_prefix("sqlite://").or_else(|| url.strip_prefix("sqlite:"))?;
    let path = path.split('?').next()?;
    if path.is_empty() || path.starts_with(":memory:") {
        return None;
    }
    Path::new(path)
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new().allow_origin(allowed)
}

/// Resolve on Ctrl+C or SIGTERM, then end every session before the
/// listener stops and open sockets are closed
async fn drain_on_signal(coordinator: Arc<SessionCoordinator>, shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => warn!(error = %e, "Ctrl+C handler failed, shutting down"),
        },
        _ = terminate => info!("Received SIGTERM signal"),
    }

    info!("Draining sessions");
    coordinator.shutdown().await;
    shutdown.cancel();
}

/// Build the HTTP router
fn build_router(state: Arc<CollabState>, config: &AppConfig) -> Router {
    let coordinator = state.coordinator.clone();
    Router::new()
        .route("/ws", get(collab_ws_handler))
        .with_state(state)
        .merge(health_routes())
        .layer(Extension(coordinator))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config.server.allowed_origins))
}

/// Run the server until a shutdown signal
pub async fn run(config: AppConfig) -> Result<()> {
    let environment = environment();
    validate_config(&config, &environment)?;
    info!(
        environment = %environment,
        "Starting Huddle v{}",
        env!("CARGO_PKG_VERSION")
    );

    let persistence = build_persistence(&config.persistence).await?;
    let advisor: Arc<dyn SuggestionAdvisor> = if config.advisor.enabled {
        Arc::new(NoopAdvisor)
    } else {
        Arc::new(DisabledAdvisor)
    };
    info!(advisor = advisor.name(), "Suggestion advisor configured");

    let transport = Arc::new(ChannelTransport::new(config.collaboration.broadcast_capacity));
    let coordinator = SessionCoordinator::builder(config.collaboration.clone(), transport.clone())
        .with_persistence(persistence)
        .with_advisor(advisor)
        .build();

    let shutdown = CancellationToken::new();
    let sweeper = start_sweeper(coordinator.clone(), shutdown.clone());
    let retry = start_persistence_retry(coordinator.clone(), shutdown.clone());
    let state = Arc::new(
        CollabState::new(coordinator.clone(), transport).with_shutdown(shutdown.clone()),
    );
    let app = build_router(state, &config);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("HTTP server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(drain_on_signal(coordinator.clone(), shutdown.clone()))
        .await
        .context("HTTP server error")?;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        warn!(error = %e, "Sweeper task ended abnormally");
    }
    if let Err(e) = retry.await {
        warn!(error = %e, "Persistence retry task ended abnormally");
    }

    let unwritten = coordinator.outbox().pending_total();
    if unwritten > 0 {
        warn!(pending = unwritten, "Shutting down with unwritten canvas changes");
    }
    info!("Huddle shutdown complete");
    Ok(())
}
