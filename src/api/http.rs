use anyhow::{Context, Result};
use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use prometheus::TEXT_FORMAT;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::api::metrics::MetricsRegistry;

#[derive(Clone)]
struct HttpState {
    registry: Arc<MetricsRegistry>,
    metrics_path: Arc<str>,
}

/// Render the current metric set in the Prometheus text format
async fn metrics_handler(State(state): State<HttpState>) -> Response {
    match state.registry.render() {
        Ok(body) => ([(header::CONTENT_TYPE, TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response()
        }
    }
}

/// Landing page pointing at the metrics path
async fn root_handler(State(state): State<HttpState>) -> Html<String> {
    Html(format!(
        "<html>\n\
         <head><title>Clash Prometheus Exporter</title></head>\n\
         <body>\n\
         <h1>Clash Prometheus Exporter</h1>\n\
         <p><a href='{}'>Metrics</a></p>\n\
         </body>\n\
         </html>\n",
        state.metrics_path
    ))
}

/// Create the exporter router
pub fn create_router(registry: Arc<MetricsRegistry>, metrics_path: &str) -> Router {
    let state = HttpState {
        registry,
        metrics_path: Arc::from(metrics_path),
    };

    Router::new()
        .route("/", get(root_handler))
        .route(metrics_path, get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `router` on an already bound listener until `shutdown` fires
pub async fn serve(listener: TcpListener, router: Router, shutdown: CancellationToken) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("Starting listen on http://{}", addr);
    }

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;

    info!("HTTP server stopped");
    Ok(())
}
