//! HTTP server: route table and axum bootstrap (spec §6).

pub mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use axum::routing::{delete, get, post};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::store::Store;

pub use routes::AppState;

/// Builds the full route table over a shared store handle (spec §6
/// "External Interfaces"). Mirrors the teacher's `Router::new().route(...)`
/// assembly in `api/server.rs`, trimmed to this domain's endpoints and
/// without its auth/rate-limit/CORS middleware stack.
pub fn router(store: Arc<dyn Store>) -> Router {
    Router::new()
        .route("/v1/traces", post(routes::export_traces))
        .route("/api/conversations", get(routes::list_conversations))
        .route(
            "/api/conversations/{id}",
            delete(routes::delete_conversation),
        )
        .route(
            "/api/trace-groups/{id}",
            get(routes::list_trace_group_spans),
        )
        .route("/api/spans", get(routes::list_spans))
        .route("/api/spans/import", post(routes::import_spans))
        .route("/api/traces", get(routes::list_legacy_traces))
        .route("/health", get(routes::health))
        .layer(TraceLayer::new_for_http())
        .with_state(store)
}

/// Binds and serves the router until the process receives a shutdown
/// signal, matching the teacher's `axum::serve(...).await` shape in
/// `api/server.rs` minus the graceful-shutdown channel (spec §5: "no
/// internal task queues or background workers").
pub async fn serve(store: Arc<dyn Store>, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, router(store)).await?;
    Ok(())
}
