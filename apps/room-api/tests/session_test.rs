//! Session creation endpoint tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use room_api::cache::{MemoryStore, SessionStore};
use room_api::captcha::CaptchaClient;
use room_api::config::Config;
use room_api::gateway::hub::HubRegistry;
use room_api::AppState;

fn test_config() -> Config {
    Config {
        port: 0,
        redis_url: String::new(),
        application_mode: "test".to_string(),
        languages: vec!["python".to_string(), "go".to_string()],
        code_work_dir: "/tmp/coderoom-test".into(),
        run_timeout: Duration::from_secs(5),
        captcha_secret: None,
    }
}

async fn start_server() -> (SocketAddr, AppState) {
    let store: Arc<dyn SessionStore> = Arc::new(MemoryStore::new());
    let state = AppState {
        store,
        config: Arc::new(test_config()),
        hubs: Arc::new(HubRegistry::new()),
        captcha: Arc::new(CaptchaClient::new(None)),
    };

    let app = room_api::routes::router().with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    (addr, state)
}

#[tokio::test]
async fn create_session_returns_a_room_id() {
    let (addr, state) = start_server().await;

    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{addr}/session"))
        .json(&serde_json::json!({ "captcha": "test" }))
        .send()
        .await
        .expect("create request");
    assert!(resp.status().is_success());

    let body: Value = resp.json().await.expect("json body");
    let session_id = body["session_id"].as_str().expect("session_id present");
    assert!(session_id.starts_with("room_"));

    // The session is now addressable in the store.
    let key = format!("session:{session_id}:state");
    assert!(state.store.exists(&key).await.unwrap());
}

#[tokio::test]
async fn creation_is_rate_limited_per_ip() {
    let (addr, _state) = start_server().await;
    let client = reqwest::Client::new();

    for _ in 0..5 {
        let resp = client
            .post(format!("http://{addr}/session"))
            .json(&serde_json::json!({ "captcha": "test" }))
            .send()
            .await
            .expect("create request");
        assert!(resp.status().is_success());
    }

    let resp = client
        .post(format!("http://{addr}/session"))
        .json(&serde_json::json!({ "captcha": "test" }))
        .send()
        .await
        .expect("create request");
    assert_eq!(resp.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn health_endpoint_probes_the_store() {
    let (addr, _state) = start_server().await;

    let resp = reqwest::get(format!("http://{addr}/health"))
        .await
        .expect("health request");
    assert!(resp.status().is_success());

    let body: Value = resp.json().await.expect("json body");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["live_sessions"], 0);
}
