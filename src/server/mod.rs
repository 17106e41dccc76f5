//! Web server: the `/ws/audio` voice endpoint plus the small HTTP
//! observability surface.

pub mod session;

use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::Response,
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::agent::{AnthropicClient, ChatProvider};
use crate::config::Config;
use crate::store::Store;
use crate::tools::ToolRegistry;
use crate::voice::{HttpStt, HttpTts, SpeechToText, TextToSpeech};

/// Shared server state, cloned per connection.
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub registry: Arc<ToolRegistry>,
    pub provider: Arc<dyn ChatProvider>,
    pub stt: Arc<dyn SpeechToText>,
    pub tts: Arc<dyn TextToSpeech>,
    pub connections: Arc<AtomicUsize>,
    pub shutdown: CancellationToken,
}

impl ServerState {
    /// Wire the full dependency graph from configuration.
    pub fn build(config: Config) -> Result<Self> {
        let store = Arc::new(if config.in_memory_store() {
            Store::open_in_memory()
        } else {
            Store::open(&config.server.db_path)
        }?);

        // The provider concurrency gate is the one genuinely process-wide
        // resource; every session's client shares this semaphore.
        let gate = Arc::new(Semaphore::new(config.llm.concurrency));
        let provider: Arc<dyn ChatProvider> = Arc::new(AnthropicClient::new(&config.llm, gate));

        let registry = Arc::new(ToolRegistry::new(store.clone()));
        let stt: Arc<dyn SpeechToText> = Arc::new(HttpStt::new(&config.engines.stt_url));
        let tts: Arc<dyn TextToSpeech> =
            Arc::new(HttpTts::new(&config.engines.tts_url, &config.engines.tts_voice));

        Ok(Self {
            config: Arc::new(config),
            store,
            registry,
            provider,
            stt,
            tts,
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        })
    }
}

/// Start the server and block until shutdown.
pub async fn start(config: Config) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("Invalid bind address")?;

    let state = ServerState::build(config)?;
    let shutdown = state.shutdown.clone();

    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    let app = Router::new()
        .route("/ws/audio", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);

    let ctrl_c_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            ctrl_c_shutdown.cancel();
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Server error")?;

    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ServerState>) -> Response {
    ws.on_upgrade(move |socket| session::handle_socket(socket, state))
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn status_handler(State(state): State<ServerState>) -> Json<serde_json::Value> {
    let connections = state.connections.load(Ordering::Relaxed);
    let store = state.store.clone();
    let (total_requests, avg_latency_ms) =
        tokio::task::spawn_blocking(move || store.turn_stats())
            .await
            .unwrap_or_else(|e| {
                warn!("Status query task failed: {}", e);
                Ok((0, 0.0))
            })
            .unwrap_or_else(|e| {
                warn!("Status query failed: {}", e);
                (0, 0.0)
            });

    Json(json!({
        "connections": connections,
        "total_requests": total_requests,
        "avg_latency_ms": avg_latency_ms,
    }))
}
