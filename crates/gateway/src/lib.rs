//! HTTP API gateway for MentorLink.
//!
//! Exposes the query pipeline over HTTP: JSON answers or SSE streams on
//! `/query`, tutoring and quiz endpoints, session inspection, and a health
//! check.
//!
//! Built on Axum.

pub mod api;
pub mod error;

#[cfg(test)]
pub(crate) mod test_helpers;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::{
    Router,
    extract::State,
    response::Json,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use mentorlink_config::AppConfig;
use mentorlink_core::SessionStore;
use mentorlink_pipeline::{Orchestrator, PipelineSettings, QuizGenerator};
use mentorlink_session::InMemorySessionStore;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

/// Default request body limit (1 MB).
const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared application state for the gateway.
pub struct GatewayState {
    pub orchestrator: Arc<Orchestrator>,
    pub quiz: QuizGenerator,
    pub started_at: DateTime<Utc>,
    pub max_body_bytes: usize,
}

impl GatewayState {
    pub fn new(orchestrator: Orchestrator, quiz: QuizGenerator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            quiz,
            started_at: Utc::now(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }
}

pub type SharedState = Arc<GatewayState>;

/// Build the Axum router with all gateway routes.
///
/// Layers applied:
/// - permissive CORS (any origin, method and header)
/// - request body size limit
/// - HTTP trace logging
pub fn build_router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/query", post(api::query_handler))
        .route("/tutor", post(api::tutor_handler))
        .route("/quiz", post(api::quiz_handler))
        .route(
            "/quiz-html/{subject}/{level}/{num_questions}",
            get(api::quiz_html_handler),
        )
        .route("/sessions", get(api::list_sessions_handler))
        .route(
            "/sessions/{id}",
            get(api::get_session_handler).delete(api::delete_session_handler),
        )
        .layer(DefaultBodyLimit::max(state.max_body_bytes))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Wire the pipeline from configuration.
///
/// Fails when no model provider is configured or the session database
/// cannot be opened.
pub async fn build_state(config: &AppConfig) -> Result<SharedState, Box<dyn std::error::Error>> {
    let router = mentorlink_providers::build_from_config(config);
    let provider = router.default().ok_or_else(|| {
        format!(
            "No provider '{}' configured. Set an API key with MENTORLINK_API_KEY or OPENAI_API_KEY",
            router.default_name()
        )
    })?;

    let store = build_store(config).await?;
    let retriever = mentorlink_retrieval::build_from_config(&config.retrieval).await;
    info!(
        provider = provider.name(),
        store = store.name(),
        retriever = retriever.name(),
        "Pipeline ready"
    );

    let orchestrator = Orchestrator::from_config(config, store, retriever, provider);
    let settings: &PipelineSettings = orchestrator.settings();
    let quiz = QuizGenerator::new(orchestrator.invoker().clone(), &settings.model, settings.budget_tokens)
        .with_temperature(settings.temperature)
        .with_max_tokens(settings.max_tokens);

    Ok(Arc::new(
        GatewayState::new(orchestrator, quiz).with_max_body_bytes(config.gateway.max_body_bytes),
    ))
}

async fn build_store(config: &AppConfig) -> Result<Arc<dyn SessionStore>, Box<dyn std::error::Error>> {
    match config.session.backend.as_str() {
        "sqlite" => {
            let path = config.session_db_path();
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let store = mentorlink_session::SqliteSessionStore::new(&path.to_string_lossy()).await?;
            Ok(Arc::new(store))
        }
        _ => Ok(Arc::new(InMemorySessionStore::with_capacity(config.session.max_sessions))),
    }
}

/// Start the gateway server.
pub async fn start(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let state = build_state(&config).await?;
    let app = build_router(state);

    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Could not listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

// --- Handlers ---

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub provider: String,
    pub retriever: String,
    pub store: String,
    pub uptime_secs: i64,
}

async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    let orchestrator = &state.orchestrator;
    Json(HealthResponse {
        status: "healthy".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        provider: orchestrator.invoker().provider_name().to_string(),
        retriever: orchestrator.retriever_name().to_string(),
        store: orchestrator.store().name().to_string(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}
