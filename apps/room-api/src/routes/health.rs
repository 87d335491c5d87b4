use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}

/// Shallow health check: one store round-trip plus the live hub count,
/// so a dead cache shows up here before it shows up as failed joins.
async fn health(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    match state.store.exists("healthcheck").await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "live_sessions": state.hubs.live_sessions(),
            })),
        ),
        Err(err) => {
            tracing::error!(?err, "health check store round-trip failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "status": "degraded" })),
            )
        }
    }
}
