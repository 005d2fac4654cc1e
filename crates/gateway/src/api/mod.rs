pub mod auth;
pub mod runs;
pub mod webhooks;

use axum::middleware;
use axum::routing::get;
use axum::Router;

use crate::state::AppState;

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "ok": true }))
}

/// Build the full API router.
///
/// Routes are split into **public** (no auth required — the health probe
/// and provider webhooks, which authenticate via per-provider HMAC instead
/// of the bearer token) and **protected** (gated behind the API bearer
/// token middleware).
///
/// `state` is needed to wire up the auth middleware at build time.
pub fn router(state: AppState) -> Router<AppState> {
    let public = Router::new()
        .route("/v1/health", get(health))
        .route("/webhooks/:provider_name", axum::routing::post(webhooks::receive_webhook))
        .route("/webhooks/events", get(webhooks::list_events));

    let protected = Router::new()
        // Run streaming (C8/C9): reconnectable SSE by thread_id + run_id.
        .route("/v1/threads/:thread_id/runs/:run_id/events", get(runs::run_events_sse))
        // Apply API auth middleware to all protected routes.
        .route_layer(middleware::from_fn_with_state(state, auth::require_api_token));

    public
        .merge(protected)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
