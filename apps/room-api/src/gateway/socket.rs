//! Websocket admission and the reader half: upgrade checks, username
//! assignment, session expiry, and inbound message demultiplexing.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;

use crate::error::ApiError;
use crate::gateway::client::{write_pump, Client, MAX_MESSAGE_SIZE, PONG_WAIT};
use crate::gateway::hub::Hub;
use crate::gateway::messages::{self, CursorSelect, EditLang, Envelope};
use crate::interview::{state_key, AppendOutcome, CodePatch, COMPACT_EVERY};
use crate::runner::{self, RunOutcome, RunRequest};
use crate::AppState;

/// Hard cap on concurrent participants per session.
const MAX_SESSION_CLIENTS: usize = 300;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_upgrade))
}

#[derive(Debug, Deserialize)]
struct WsParams {
    session_id: Option<String>,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let Some(session_id) = params.session_id.filter(|id| !id.is_empty()) else {
        return ApiError::bad_request("session_id query parameter is required").into_response();
    };

    if state.hubs.population(&session_id) >= MAX_SESSION_CLIENTS {
        return ApiError::bad_request("Too many users").into_response();
    }

    match state.store.exists(&state_key(&session_id)).await {
        Ok(true) => {}
        Ok(false) => {
            return ApiError::bad_request("Session does not exist").into_response();
        }
        Err(err) => {
            tracing::error!(?err, "session existence check failed");
            return ApiError::internal("cache unavailable").into_response();
        }
    }

    let remaining = state
        .store
        .ttl(&state_key(&session_id))
        .await
        .ok()
        .flatten();

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, session_id, remaining))
        .into_response()
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    session_id: String,
    remaining_ttl: Option<Duration>,
) {
    let hub = match state.hubs.get_or_create(state.store.clone(), &session_id).await {
        Ok(hub) => hub,
        Err(err) => {
            tracing::error!(%session_id, ?err, "failed to get hub");
            let mut socket = socket;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let username = pick_username(&hub);
    let (client, outbound_rx) = Client::new(username);
    let client = Arc::new(client);

    let (sink, stream) = socket.split();
    tokio::spawn(write_pump(sink, outbound_rx, client.cancel_token()));

    // The whole session shares one TTL; when it lapses the connection is
    // closed regardless of activity.
    let expiry = remaining_ttl.map(|ttl| {
        let expiring = client.clone();
        let session_id = hub.session_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            tracing::info!(%session_id, "session expired, closing connection");
            expiring.close();
        })
    });

    hub.register(client.clone()).await;
    send_session_init(&hub, &client).await;

    read_pump(stream, &state, &hub, &client).await;

    hub.unregister(client.clone()).await;
    client.close();
    if let Some(timer) = expiry {
        timer.abort();
    }
}

/// Draws an unused name from the `User1..=User360` namespace, widening
/// it rather than spinning forever if the room is improbably crowded.
fn pick_username(hub: &Hub) -> String {
    let mut rng = rand::thread_rng();
    for _ in 0..1000 {
        let candidate = format!("User{}", rng.gen_range(1..=360));
        if !hub.has_client(&candidate) {
            return candidate;
        }
    }
    format!("User{}", rng.gen_range(1_000..=1_000_000))
}

async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    state: &AppState,
    hub: &Arc<Hub>,
    client: &Arc<Client>,
) {
    let cancel = client.cancel_token();
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            next = tokio::time::timeout(PONG_WAIT, stream.next()) => match next {
                Err(_) => {
                    tracing::debug!(username = %client.username, "read deadline exceeded");
                    break;
                }
                Ok(None) | Ok(Some(Err(_))) => break,
                Ok(Some(Ok(msg))) => msg,
            },
        };

        match msg {
            Message::Text(text) => {
                let Ok(envelope) = serde_json::from_str::<Envelope>(text.as_str()) else {
                    // Decode errors terminate the connection, mirroring the
                    // transport error policy.
                    break;
                };
                dispatch(state, hub, client, envelope).await;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            _ => break,
        }
    }
}

async fn dispatch(state: &AppState, hub: &Arc<Hub>, client: &Arc<Client>, envelope: Envelope) {
    match envelope.kind.as_str() {
        "code_patch" => handle_code_patch(hub, client, envelope.data).await,
        "code_run" => handle_code_run(state, hub, client).await,
        "cursor_select" => handle_cursor_select(hub, client, envelope.data),
        "edit_lang" => handle_edit_lang(state, hub, client, envelope.data).await,
        "refresh" => send_session_init(hub, client).await,
        other => {
            tracing::debug!(
                username = %client.username,
                kind = %other,
                "ignoring unknown message type"
            );
        }
    }
}

async fn handle_code_patch(hub: &Arc<Hub>, client: &Arc<Client>, data: Value) {
    let patch: CodePatch = match serde_json::from_value(data) {
        Ok(patch) => patch,
        Err(err) => {
            tracing::debug!(username = %client.username, %err, "rejected malformed patch");
            client.try_send(
                messages::error("invalid code patch", Some("code_patch_error")).to_json(),
            );
            return;
        }
    };

    let outcome = {
        let mut interview = hub.interview.lock().await;
        interview.append_patch(&patch).await
    };

    match outcome {
        Err(err) => {
            tracing::debug!(username = %client.username, %err, "patch append failed");
            client.try_send(messages::error(&err.to_string(), Some("code_patch_error")).to_json());
        }
        Ok(AppendOutcome::VersionMismatch) => {
            // Stale base: silently resynchronise the sender and let it
            // rebase. Nothing is broadcast.
            send_session_init(hub, client).await;
        }
        Ok(AppendOutcome::Committed(version)) => {
            if version % COMPACT_EVERY == 0 {
                let hub = hub.clone();
                tokio::spawn(async move {
                    let mut interview = hub.interview.lock().await;
                    if let Err(err) = interview.compact().await {
                        tracing::warn!(session_id = %hub.session_id, ?err, "compaction failed");
                    }
                });
            }

            let mut stamped = patch;
            stamped.version = version;
            hub.broadcast_to_others(
                &client.username,
                &messages::code_patch(&client.username, &stamped).to_json(),
            );
        }
    }
}

async fn handle_code_run(state: &AppState, hub: &Arc<Hub>, client: &Arc<Client>) {
    let admitted = {
        let interview = hub.interview.lock().await;
        interview.can_run().await
    };
    match admitted {
        Ok(true) => {}
        Ok(false) => {
            client.send(messages::error("Rate limit exceeded", None).to_json()).await;
            return;
        }
        Err(err) => {
            tracing::error!(session_id = %hub.session_id, ?err, "run gate check failed");
            client.send(messages::error("Rate limit exceeded", None).to_json()).await;
            return;
        }
    }

    // Compacting here both folds the log and hands us the full buffer.
    let compacted = {
        let mut interview = hub.interview.lock().await;
        interview
            .compact()
            .await
            .map(|code| (code, interview.language.clone()))
    };
    let (code, language) = match compacted {
        Ok(pair) => pair,
        Err(err) => {
            tracing::error!(session_id = %hub.session_id, ?err, "failed to load code for run");
            let outcome = RunOutcome {
                exit_code: -1,
                error: "failed to load code".to_string(),
                duration: "0.00s".to_string(),
                ..RunOutcome::default()
            };
            client.send(messages::code_res(&outcome).to_json()).await;
            return;
        }
    };

    if code.is_empty() {
        let outcome = RunOutcome {
            exit_code: -1,
            error: "empty code".to_string(),
            duration: "0.00s".to_string(),
            ..RunOutcome::default()
        };
        client.send(messages::code_res(&outcome).to_json()).await;
        return;
    }

    let req = RunRequest { language, code };
    let outcome =
        runner::run_user_code(&state.config.code_work_dir, state.config.run_timeout, &req).await;

    // The result goes to the whole room, the sender included.
    let frame = messages::code_res(&outcome).to_json();
    client.send(frame.clone()).await;
    hub.broadcast_to_others(&client.username, &frame);
}

fn handle_cursor_select(hub: &Arc<Hub>, client: &Arc<Client>, data: Value) {
    let Ok(cursor) = serde_json::from_value::<CursorSelect>(data) else {
        tracing::debug!(username = %client.username, "ignoring malformed cursor_select");
        return;
    };
    hub.broadcast_to_others(
        &client.username,
        &messages::cursor_select(
            &client.username,
            cursor.start_pos as i64,
            cursor.end_pos as i64,
        )
        .to_json(),
    );
}

async fn handle_edit_lang(state: &AppState, hub: &Arc<Hub>, client: &Arc<Client>, data: Value) {
    let Ok(payload) = serde_json::from_value::<EditLang>(data) else {
        client.try_send(messages::error("Missing lang data", Some("edit_lang_error")).to_json());
        return;
    };

    let result = {
        let mut interview = hub.interview.lock().await;
        interview
            .edit_language(&payload.lang, &state.config.languages)
            .await
    };

    match result {
        Err(err) => {
            client.try_send(messages::error(&err.to_string(), Some("edit_lang_error")).to_json());
        }
        Ok(()) => {
            hub.broadcast_to_others(&client.username, &messages::edit_lang(&payload.lang).to_json());
        }
    }
}

/// Sends the sender a full state dump: current snapshot, residual
/// patches, language, version, and the live user list.
async fn send_session_init(hub: &Arc<Hub>, client: &Arc<Client>) {
    let snapshot = {
        let interview = hub.interview.lock().await;
        interview
            .get_current_code()
            .await
            .map(|(code, patches, version)| (code, patches, version, interview.language.clone()))
    };

    let frame = match snapshot {
        Ok((code, patches, version, lang)) => messages::session_init(
            &hub.session_id,
            &code,
            &lang,
            version,
            &patches,
            &hub.usernames(),
            &client.username,
        ),
        Err(err) => {
            tracing::error!(session_id = %hub.session_id, ?err, "failed to load session state");
            messages::session_init_error(&hub.session_id)
        }
    };

    client.send(frame.to_json()).await;
}
