//! Operational HTTP surface: liveness and per-chain progress.
//!
//! The generated query API over the application schema is served
//! separately; this crate only exposes what an operator needs to watch the
//! pipeline.

pub mod routes;
pub mod state;

use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use kyomei_common::error::{KyomeiError, Result};
use state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(routes::health::router())
        .merge(routes::status::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until cancelled. Binds all interfaces on the configured port
/// (default 42069).
pub async fn serve(state: AppState, port: u16, cancel: CancellationToken) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| KyomeiError::Config(format!("cannot bind api port {port}: {e}")))?;

    tracing::info!(port, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| KyomeiError::Internal(format!("api server: {e}")))
}
