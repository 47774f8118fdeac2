//! WebSocket upgrade handler and per-connection delivery loop.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};

use crate::AppState;

use super::events::OutboundMessage;
use super::registry::{Connection, ConnectionRegistry, OUTBOX_CAPACITY};

/// Interval between server-sent PING frames.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Longest a single frame may take to reach the client before the
/// connection is treated as failed.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the writer gets to send its Close frame before it is aborted.
const WRITER_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/ws/updates", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.connections, state.shutdown))
}

async fn handle_socket(
    socket: WebSocket,
    registry: Arc<ConnectionRegistry>,
    shutdown: watch::Receiver<bool>,
) {
    let (ws_tx, ws_rx) = socket.split();
    serve_connection(ws_tx, ws_rx, registry, HEARTBEAT_INTERVAL, shutdown).await;
}

/// Drive one client connection until it closes, a send fails or the server
/// shuts down.
///
/// Sends `CONNECTION_ESTABLISHED`, registers the connection, then runs the
/// writer (heartbeat + broadcast frames) as its own task while this task
/// reads inbound frames. Whichever side ends first ends the connection:
/// the writer is stopped and awaited, the connection is deregistered, and
/// the transport halves are dropped. No frame is written after this
/// function returns.
pub async fn serve_connection<S, R, E>(
    mut ws_tx: S,
    mut ws_rx: R,
    registry: Arc<ConnectionRegistry>,
    heartbeat: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let opened_at = Instant::now();

    let welcome = send_message(&mut ws_tx, &OutboundMessage::connection_established()).await;
    if let Err(e) = welcome {
        tracing::debug!(error = %e, "client went away before CONNECTION_ESTABLISHED");
        return;
    }

    let (conn, outbox) = Connection::channel(OUTBOX_CAPACITY);
    let conn_id = conn.id().to_string();
    registry.register(conn);

    let (stop_tx, stop_rx) = oneshot::channel();
    let mut writer = tokio::spawn(write_loop(
        ws_tx,
        outbox,
        stop_rx,
        heartbeat,
        opened_at,
        conn_id.clone(),
    ));

    let writer_finished = tokio::select! {
        _ = read_loop(&mut ws_rx, &conn_id) => false,
        _ = server_shutdown(&mut shutdown) => {
            tracing::debug!(%conn_id, "closing realtime connection for shutdown");
            false
        }
        _ = &mut writer => true,
    };

    if !writer_finished {
        let _ = stop_tx.send(());
        if time::timeout(WRITER_SHUTDOWN_GRACE, &mut writer).await.is_err() {
            writer.abort();
            let _ = writer.await;
        }
    }

    registry.deregister(&conn_id);

    tracing::info!(
        %conn_id,
        open_for_secs = opened_at.elapsed().as_secs(),
        "realtime connection closed"
    );
}

async fn server_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender means the server is going away as well.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Read inbound frames until the client closes or the transport fails.
/// Client text frames carry no meaning yet and are only logged.
async fn read_loop<R, E>(ws_rx: &mut R, conn_id: &str)
where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                tracing::debug!(%conn_id, len = text.as_str().len(), "ignoring client message");
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(%conn_id, error = %e, "ws read error");
                break;
            }
        }
    }
}

/// Sole writer for a connection: heartbeat ticks and queued broadcast frames.
async fn write_loop<S>(
    mut ws_tx: S,
    mut outbox: mpsc::Receiver<Arc<str>>,
    mut stop: oneshot::Receiver<()>,
    heartbeat: Duration,
    opened_at: Instant,
    conn_id: String,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut ticker = time::interval_at(opened_at + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut stop => {
                let _ = send_frame(&mut ws_tx, Message::Close(None)).await;
                break;
            }

            _ = ticker.tick() => {
                let ping = OutboundMessage::ping(opened_at.elapsed());
                if let Err(e) = send_message(&mut ws_tx, &ping).await {
                    tracing::debug!(%conn_id, error = %e, "heartbeat send failed");
                    break;
                }
            }

            frame = outbox.recv() => {
                match frame {
                    Some(frame) => {
                        let sent = send_frame(&mut ws_tx, Message::Text(frame.to_string().into())).await;
                        if let Err(e) = sent {
                            tracing::debug!(%conn_id, error = %e, "broadcast send failed");
                            break;
                        }
                    }
                    // Dropped from the registry (stalled), so nothing more will arrive.
                    None => {
                        let _ = send_frame(&mut ws_tx, Message::Close(None)).await;
                        break;
                    }
                }
            }
        }
    }
}

async fn send_message<S>(ws_tx: &mut S, message: &OutboundMessage) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let frame = message.encode().map_err(|e| e.to_string())?;
    send_frame(ws_tx, Message::Text(frame.to_string().into())).await
}

/// Send one frame, failing if the client does not accept it within
/// [`SEND_TIMEOUT`].
async fn send_frame<S>(ws_tx: &mut S, frame: Message) -> Result<(), String>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match time::timeout(SEND_TIMEOUT, ws_tx.send(frame)).await {
        Ok(result) => result.map_err(|e| e.to_string()),
        Err(_) => Err(format!("send timed out after {}s", SEND_TIMEOUT.as_secs())),
    }
}
