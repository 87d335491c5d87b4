use axum::Router;

use crate::AppState;

pub mod health;
pub mod session;

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(session::router())
        .merge(crate::gateway::socket::router())
}
