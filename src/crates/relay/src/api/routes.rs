//! Route table and middleware stack.

use crate::auth;
use crate::state::AppState;
use axum::http::{HeaderValue, Method};
use axum::middleware;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::{chat, graph, report, threads};

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

fn cors_layer(state: &AppState) -> CorsLayer {
    let origins = &state.settings.server.cors_allow_origins;
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);
    if origins.iter().any(|origin| origin == "*") {
        layer.allow_origin(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        layer.allow_origin(AllowOrigin::list(parsed))
    }
}

/// Build the complete router. Everything except `/health` requires a valid
/// bearer token.
pub fn create_router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/chat", post(chat::chat))
        .route("/threads", get(threads::list_threads))
        .route("/report/start", post(report::start))
        .route("/report/:thread_id/stop", post(report::stop))
        .route("/report/:thread_id/resume", post(report::resume))
        .route("/report/:thread_id/load", get(report::load))
        .route("/report/:thread_id/status", get(report::status))
        .route("/report/:thread_id/snapshots", get(report::snapshots))
        .route("/report/:thread_id/restore", post(report::restore))
        .route(
            "/report/:thread_id/chapters/download",
            get(report::download_chapters),
        )
        .route(
            "/report/:thread_id/final-report/download",
            get(report::download_final_report),
        )
        .route("/graph/structure", get(graph::structure))
        .route("/graph/state", get(graph::state))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(authed)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state))
        .with_state(state)
}
