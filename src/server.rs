//! Axum HTTP transport.
//!
//! Every method and path lands in a single fallback handler that hands the
//! request to [`MockEngine`] and serializes the result as JSON.

use crate::catalog::Catalog;
use crate::config::MockServerConfig;
use crate::engine::{MockEngine, RawRequest};
use crate::matcher::decode_path;
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, Method, Uri},
    response::{IntoResponse, Response},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Build the axum application for `engine`.
pub fn router(engine: Arc<MockEngine>, max_body_bytes: usize) -> Router {
    Router::new()
        .fallback(mock_handler)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(engine)
}

/// Bind the configured address and serve until Ctrl-C.
pub async fn serve(config: &MockServerConfig, catalog: Catalog) -> std::io::Result<()> {
    let engine = Arc::new(MockEngine::new(
        Arc::new(catalog),
        &config.template_extension,
        config.settings.clone(),
    ));
    let app = router(engine, config.max_body_bytes);

    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    info!(addr = %listener.local_addr()?, "Mock data server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Catch-all handler: any method, any path.
async fn mock_handler(
    State(engine): State<Arc<MockEngine>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = RawRequest {
        path: decode_path(uri.path()),
        headers,
        body,
    };
    let path = request.path.clone();

    match engine.handle(request).await {
        Ok(resolution) => Json(resolution.into_payload()).into_response(),
        Err(e) => {
            let status = e.status_code();
            if status.is_server_error() {
                error!(method = %method, path = %path, error = %e, "Failed to render mock response");
            } else {
                warn!(method = %method, path = %path, error = %e, "Rejected request body");
            }
            (status, Json(json!({ "error": e.to_string() }))).into_response()
        }
    }
}
