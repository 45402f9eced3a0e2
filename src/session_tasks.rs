//! The three cooperating tasks that make up one client session's lifetime
//! (§4.8): read, write, and heartbeat. All three are cancelled together
//! through `session.cancellation`, and `run` does not return until every
//! one of them has — the leak-free-shutdown invariant (P6) depends on
//! that.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;

use service::{Hub, Session};

/// §5: "Read: 60s per frame; refreshed by pong."
const READ_DEADLINE: Duration = Duration::from_secs(60);
/// §5: "Write: 10s per frame."
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// §5: "Heartbeat: 25s interval, 7s pong deadline."
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const PONG_DEADLINE: Duration = Duration::from_secs(7);

fn now_nanos() -> i64 {
    crate::now_nanos()
}

/// Runs a session to completion. The caller is expected to have already
/// registered `session` with the hub (and sent the auth-result) before
/// calling this, and to unregister it once this returns.
pub async fn run(socket: WebSocket, session: Arc<Session>, hub: Arc<Hub>, outbound_rx: mpsc::Receiver<Vec<u8>>) {
    let (sink, stream) = socket.split();
    let sink = Arc::new(Mutex::new(sink));
    let (pong_tx, pong_rx) = watch::channel(Instant::now());

    let read = tokio::spawn(read_task(stream, session.clone(), hub, pong_tx));
    let write = tokio::spawn(write_task(sink.clone(), outbound_rx, session.cancellation.clone()));
    let heartbeat = tokio::spawn(heartbeat_task(sink, pong_rx, session.cancellation.clone()));

    let _ = tokio::join!(read, write, heartbeat);

    // Every path above cancels the token before returning, but a task
    // panicking (rather than returning) would not; cancel unconditionally
    // so the outbound buffer is always closed by the time we get here.
    session.cancel();
}

type Stream = futures_util::stream::SplitStream<WebSocket>;

async fn read_task(mut stream: Stream, session: Arc<Session>, hub: Arc<Hub>, pong_tx: watch::Sender<Instant>) {
    loop {
        let next = tokio::select! {
            _ = session.cancellation.cancelled() => break,
            next = timeout(READ_DEADLINE, stream.next()) => next,
        };

        let message = match next {
            Ok(Some(Ok(message))) => message,
            // Timeout, stream error, or stream end all mean the same thing
            // here: stop reading and let the session tear down.
            _ => break,
        };

        match message {
            Message::Binary(bytes) => {
                hub.route_message(&session, &bytes, now_nanos());
            }
            Message::Pong(_) => {
                let _ = pong_tx.send(Instant::now());
            }
            Message::Close(_) => break,
            Message::Text(_) | Message::Ping(_) => {}
        }
    }

    session.cancel();
}

async fn write_task(
    sink: Arc<Mutex<SplitSink<WebSocket, Message>>>,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
    cancellation: tokio_util::sync::CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = cancellation.cancelled() => break,
            frame = outbound_rx.recv() => frame,
        };

        let Some(frame) = frame else { break };

        let mut guard = sink.lock().await;
        match timeout(WRITE_DEADLINE, guard.send(Message::Binary(frame.into()))).await {
            Ok(Ok(())) => {}
            _ => break,
        }
    }

    cancellation.cancel();
}

async fn heartbeat_task(
    sink: Arc<Mutex<SplitSink<WebSocket, Message>>>,
    mut pong_rx: watch::Receiver<Instant>,
    cancellation: tokio_util::sync::CancellationToken,
) {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    interval.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = cancellation.cancelled() => break,
            _ = interval.tick() => {}
        }

        let sent_at = Instant::now();
        {
            let mut guard = sink.lock().await;
            if timeout(WRITE_DEADLINE, guard.send(Message::Ping(Vec::new().into()))).await.is_err() {
                break;
            }
        }

        let waited = timeout(PONG_DEADLINE, async {
            loop {
                if *pong_rx.borrow() >= sent_at {
                    return;
                }
                if pong_rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;

        if waited.is_err() || *pong_rx.borrow() < sent_at {
            break;
        }
    }

    cancellation.cancel();
}
