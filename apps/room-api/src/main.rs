use std::net::SocketAddr;
use std::sync::Arc;

use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use room_api::cache::{RedisStore, SessionStore};
use room_api::captcha::CaptchaClient;
use room_api::config::Config;
use room_api::gateway::hub::HubRegistry;
use room_api::AppState;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing — env vars may be set externally)
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let port = config.port;

    tokio::fs::create_dir_all(&config.code_work_dir)
        .await
        .expect("failed to create code work dir");

    let store: Arc<dyn SessionStore> = Arc::new(
        RedisStore::connect(&config.redis_url)
            .await
            .expect("failed to connect to Redis"),
    );

    tracing::info!(
        mode = %config.application_mode,
        languages = ?config.languages,
        "room-api configured"
    );

    let captcha = Arc::new(CaptchaClient::new(config.captcha_secret.clone()));
    let state = AppState {
        store,
        config: Arc::new(config),
        hubs: Arc::new(HubRegistry::new()),
        captcha,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = room_api::routes::router()
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "room-api listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("server error");
}
