//! HTTP routing — §4.12/§6. `axum::Router` covering exactly the endpoint
//! list in spec.md §6, bearer-token gated via `auth::require_auth`. Grounded
//! on the daemon's `rest::build_router` module shape (one file per route
//! group under `http::routes`, one `Sse` bridge for the tail-follow stream).

pub mod auth;
pub mod routes;
pub mod sse;

use anyhow::Result;
use axum::{
    middleware,
    routing::{get, patch, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

use crate::AppState;

pub async fn serve(state: Arc<AppState>, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse()?;
    let router = build_router(state);

    info!(%addr, "archon HTTP server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/v1/sessions", get(routes::sessions::list_sessions).post(routes::sessions::create_session))
        .route(
            "/v1/sessions/{id}",
            patch(routes::sessions::update_session).delete(routes::sessions::delete_session),
        )
        .route("/v1/sessions/{id}/send", post(routes::sessions::send))
        .route("/v1/sessions/{id}/approve", post(routes::sessions::approve))
        .route("/v1/sessions/{id}/interrupt", post(routes::sessions::interrupt))
        .route("/v1/sessions/{id}/tail", get(sse::tail))
        .route("/v1/workflows/runs", get(routes::workflows::list_runs).post(routes::workflows::start_run))
        .route("/v1/workflows/runs/{id}/start", post(routes::workflows::start))
        .route("/v1/workflows/runs/{id}/pause", post(routes::workflows::pause))
        .route("/v1/workflows/runs/{id}/stop", post(routes::workflows::stop))
        .route("/v1/workflows/runs/{id}/resume", post(routes::workflows::resume))
        .route("/v1/workflows/runs/{id}/dismiss", post(routes::workflows::dismiss))
        .route("/v1/workflows/runs/{id}/undismiss", post(routes::workflows::undismiss))
        .route("/v1/workflows/runs/{id}/rename", post(routes::workflows::rename))
        .route("/v1/workflows/runs/{id}/decision", post(routes::workflows::decision))
        .route("/v1/workflows/templates", get(routes::workflows::list_templates))
        .route("/v1/workflows/metrics", get(routes::workflows::metrics))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_auth));

    Router::new()
        .route("/health", get(routes::health::health))
        .merge(protected)
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}
