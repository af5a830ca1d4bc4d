//! HTTP API: translation runs, progress polling, the queue, relationships
//! and logs. Localhost only by default.

mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::engine::{EngineError, TranslationEngine};
use crate::queue::QueueStore;
use crate::storage::StoreError;

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<TranslationEngine>,
    pub queue: Arc<QueueStore>,
    /// Used when a request names no languages.
    pub default_languages: Vec<String>,
    pub default_priority: u8,
    pub default_max_attempts: u32,
}

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/translate", post(handlers::translate))
        .route("/api/progress/{id}", get(handlers::progress))
        .route("/api/progress/{id}/resume", post(handlers::resume))
        .route("/api/progress/{id}/cancel", post(handlers::cancel))
        .route(
            "/api/queue",
            post(handlers::enqueue)
                .get(handlers::list_queue)
                .delete(handlers::clear_queue),
        )
        .route("/api/queue/stats", get(handlers::queue_stats))
        .route("/api/queue/pause", post(handlers::pause_queue))
        .route("/api/queue/resume", post(handlers::resume_queue))
        .route("/api/queue/{id}/retry", post(handlers::retry_item))
        .route("/api/posts/{id}/translations", get(handlers::translations))
        .route(
            "/api/posts/{id}/translations/{lang}",
            delete(handlers::unlink),
        )
        .route("/api/logs", get(handlers::logs))
        .route("/api/metrics", get(handlers::metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until `shutdown` fires.
pub async fn serve(state: ApiState, bind: &str, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr: SocketAddr = bind
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address '{bind}': {e}"))?;
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| {
            error!(error = %e, "API server error");
            anyhow::anyhow!("API server error: {e}")
        })
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub ok: bool,
    pub error: String,
}

/// Handler error mapped onto an HTTP status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
            StoreError::Invalid { .. } => StatusCode::BAD_REQUEST,
            StoreError::Sqlite(_) | StoreError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Store(inner) => inner.into(),
            EngineError::PostNotFound(_) | EngineError::UnknownProgress(_) => {
                Self::not_found(e.to_string())
            }
            EngineError::NoLanguages => Self::new(StatusCode::BAD_REQUEST, e.to_string()),
            EngineError::RunInProgress(_) => Self::new(StatusCode::CONFLICT, e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!(status = %self.status, error = %self.message, "request failed");
        }
        (
            self.status,
            Json(ErrorResponse {
                ok: false,
                error: self.message,
            }),
        )
            .into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
