//! Per-client connection state and the writer half of the transport.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How long a client may go silent before the read side gives up.
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Ping cadence; must beat the pong wait.
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// Per-write deadline.
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Inbound frame size cap.
pub const MAX_MESSAGE_SIZE: usize = 2048;

/// Outbound queue capacity; a client that falls this far behind a
/// broadcast is evicted rather than stalling its peers.
pub const SEND_BUFFER_SIZE: usize = 2048;

/// One live participant. The hub holds it in its client map; the reader
/// and writer tasks each hold a handle too.
#[derive(Debug)]
pub struct Client {
    pub username: String,
    outbound: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl Client {
    /// Creates the client plus the receiver its writer task drains.
    pub fn new(username: String) -> (Self, mpsc::Receiver<String>) {
        let (outbound, rx) = mpsc::channel(SEND_BUFFER_SIZE);
        (
            Self {
                username,
                outbound,
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    /// Non-blocking enqueue. `false` means the queue is full or closed —
    /// the broadcast path treats that as grounds for eviction.
    pub fn try_send(&self, frame: String) -> bool {
        self.outbound.try_send(frame).is_ok()
    }

    /// Bounded-patience enqueue for direct replies (state dumps, errors).
    pub async fn send(&self, frame: String) -> bool {
        tokio::time::timeout(Duration::from_secs(5), self.outbound.send(frame))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Tells the writer to emit a close frame and both pumps to stop.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Writer pump: owns the sink half, so data frames, pings, and the final
/// close frame can never interleave. Runs until the queue closes, the
/// client is cancelled, or a write fails.
pub async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.tick().await; // the first tick fires immediately

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let write = tokio::time::timeout(
                    WRITE_WAIT,
                    sink.send(Message::Text(frame.into())),
                )
                .await;
                if !matches!(write, Ok(Ok(()))) {
                    break;
                }
            }
            _ = ping.tick() => {
                let write = tokio::time::timeout(
                    WRITE_WAIT,
                    sink.send(Message::Ping(Vec::new().into())),
                )
                .await;
                if !matches!(write, Ok(Ok(()))) {
                    break;
                }
            }
            _ = cancel.cancelled() => {
                let _ = tokio::time::timeout(WRITE_WAIT, sink.send(Message::Close(None))).await;
                break;
            }
        }
    }
}
