//! HTTP surface for the pipeline
//!
//! Three routes: `POST /ingest` takes a JSON array of `{time, log}` records,
//! `GET /query?start=&end=&text=` returns matching records as a JSON array,
//! and `GET /list` returns every remote segment key.

pub mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::signal;

use crate::error::Result;
use crate::Pipeline;

pub use handlers::{ApiError, QueryParams};

/// Build the router over a shared pipeline
pub fn router(pipeline: Arc<Pipeline>) -> Router {
    Router::new()
        .route("/ingest", post(handlers::handle_ingest))
        .route("/query", get(handlers::handle_query))
        .route("/list", get(handlers::handle_list))
        .with_state(pipeline)
}

/// HTTP server for the pipeline
pub struct LogServer {
    pipeline: Arc<Pipeline>,
    port: u16,
}

impl LogServer {
    /// Create a server listening on `port` on all interfaces
    pub fn new(pipeline: Arc<Pipeline>, port: u16) -> Self {
        Self { pipeline, port }
    }

    /// Serve until SIGINT or SIGTERM
    ///
    /// In-flight requests complete before this returns. The pipeline itself
    /// is left running; shutting it down is the caller's job.
    pub async fn run(self) -> Result<()> {
        let app = router(self.pipeline);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Starting segment-log HTTP server on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        tracing::info!("Server shut down gracefully");
        Ok(())
    }
}

/// Listen for SIGTERM and SIGINT (Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, starting graceful shutdown"),
        _ = terminate => tracing::info!("Received SIGTERM, starting graceful shutdown"),
    }
}
