//! HTTP surface of the queue manager.
//!
//! Thin routing over [`JobQueue`]: every handler validates its input, makes
//! one queue call, and renders the result or an [`ApiError`] envelope.

use std::net::SocketAddr;

use axum::{
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::scheduler::JobQueue;

pub mod error;
mod handlers;
pub mod preview;

pub use error::{ApiError, ApiResult};

#[derive(Clone)]
pub struct ApiState {
    pub queue: JobQueue,
    /// Log full payloads/results instead of one-line previews
    pub debug_payloads: bool,
}

impl ApiState {
    pub fn new(queue: JobQueue) -> Self {
        Self {
            queue,
            debug_payloads: false,
        }
    }

    pub fn with_debug_payloads(mut self, enabled: bool) -> Self {
        self.debug_payloads = enabled;
        self
    }
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/submit_job", post(handlers::submit_job))
        .route("/get_job", post(handlers::get_job))
        .route("/complete_job", post(handlers::complete_job))
        .route("/get_result/{job_id}", get(handlers::get_result))
        .route("/stats", get(handlers::stats))
        .route("/health", get(handlers::health))
        .route("/recent_jobs", get(handlers::recent_jobs))
        .route("/register_worker", post(handlers::register_worker))
        .route("/deregister_worker", post(handlers::deregister_worker))
        .route("/workers", get(handlers::list_workers))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn run_api_server(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting queue API server");

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
        e
    })?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await?;

    tracing::info!("Queue API server stopped");
    Ok(())
}
