pub mod cache;
pub mod captcha;
pub mod config;
pub mod error;
pub mod gateway;
pub mod interview;
pub mod routes;
pub mod runner;

use std::sync::Arc;

use cache::SessionStore;
use captcha::CaptchaClient;
use config::Config;
use gateway::hub::HubRegistry;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn SessionStore>,
    pub config: Arc<Config>,
    pub hubs: Arc<HubRegistry>,
    pub captcha: Arc<CaptchaClient>,
}
