//! Session creation: captcha-gated, per-IP rate limited.

use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{ConnectInfo, State};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;

use crate::error::ApiError;
use crate::interview::Interview;
use crate::AppState;

/// Sessions one IP may create inside the rate window.
const CREATE_LIMIT: i64 = 5;
const CREATE_WINDOW: Duration = Duration::from_secs(60 * 60);

pub fn router() -> Router<AppState> {
    Router::new().route("/session", post(create_session))
}

#[derive(Debug, Deserialize)]
struct CreateSessionBody {
    captcha: String,
}

async fn create_session(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<CreateSessionBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.captcha.verify(&body.captcha).await {
        return Err(ApiError::bad_request("Captcha error"));
    }

    let limit_key = format!("ratelimit:create:{}", addr.ip());
    let created = state.store.incr(&limit_key, CREATE_WINDOW).await?;
    if created > CREATE_LIMIT {
        return Err(ApiError::too_many_requests("Too many sessions"));
    }

    let session_id = coderoom_common::prefixed_ulid(coderoom_common::id::prefix::ROOM);
    let interview =
        Interview::create(state.store.clone(), &session_id, &state.config.languages).await?;

    tracing::info!(session_id = %interview.session_id, ip = %addr.ip(), "session created");
    Ok(Json(serde_json::json!({ "session_id": interview.session_id })))
}
