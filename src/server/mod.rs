//! HTTP and WebSocket server
//!
//! Exposes the voice conversation over a WebSocket endpoint plus a small
//! HTTP API for text chat and session bootstrap.

pub mod chat;
pub mod voice_ws;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::Config;
use crate::llm::ResponseGenerator;
use crate::retrieval::{ContextRetriever, NullIndex, RemoteVectorIndex, VectorIndex};
use crate::session::SessionStore;
use crate::voice::VoiceDeps;

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub deps: VoiceDeps,
}

/// Build the shared service dependencies from configuration. Missing
/// collaborators degrade the experience rather than failing startup: no
/// session store means no history, no vector index means no context.
pub async fn build_deps(config: &Config) -> VoiceDeps {
    let sessions = match SessionStore::open(
        config.session_db_path(),
        config.session.max_messages,
        config.session.ttl_seconds,
    )
    .await
    {
        Ok(store) => Some(Arc::new(store)),
        Err(e) => {
            warn!("Session store unavailable, continuing without history: {}", e);
            None
        }
    };

    let index: Arc<dyn VectorIndex> =
        match (&config.retrieval.index_url, &config.retrieval.index_token) {
            (Some(url), Some(token)) => Arc::new(RemoteVectorIndex::new(url.clone(), token.clone())),
            _ => {
                warn!("Vector index not configured, responses will have no background context");
                Arc::new(NullIndex)
            }
        };

    VoiceDeps {
        sessions,
        retriever: Arc::new(ContextRetriever::new(index, config.retrieval.clone())),
        generator: Arc::new(ResponseGenerator::new(config.llm.clone())),
    }
}

/// Bind and serve until the process is stopped.
pub async fn start(config: Config) -> Result<()> {
    let deps = build_deps(&config).await;
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid server host/port")?;
    let state = Arc::new(AppState { config, deps });

    let app = router(state);

    info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/session", post(chat::create_session))
        .route("/api/chat", post(chat::chat))
        .route("/ws/voice", get(voice_ws::voice_socket))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "session_store": state.deps.sessions.is_some(),
    }))
}
