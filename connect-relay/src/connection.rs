use std::error::Error as _;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use connect_proto::{decode, Envelope, NotificationBroadcast, ServerMessage, StatusResponse};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite;
use warp::ws::{Message, WebSocket};

use crate::activity::Activity;
use crate::registry::ConnectionId;
use crate::State;

/// Channel buffer size - prevents unbounded memory growth
pub const CHANNEL_BUFFER_SIZE: usize = 1024;

pub const FILE_RECEIVED: &str = "File received";
pub const NOTIFICATION_RECEIVED: &str = "Notification received";

/// Close code for a message over the configured size limit.
pub const CLOSE_MESSAGE_TOO_BIG: u16 = 1009;

/// Drives one client socket until it closes, errors or goes silent.
///
/// Liveness is judged on raw bytes read from the socket, so a client in
/// the middle of a long upload is never mistaken for a dead one.
pub async fn client_connection(
    ws: WebSocket,
    peer: SocketAddr,
    activity: Activity,
    state: Arc<State>,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(CHANNEL_BUFFER_SIZE);

    let mut writer = tokio::task::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let id = state.registry.add(out_tx.clone());
    log::info!(
        "client connected id={} peer={} active={}",
        id,
        peer,
        state.registry.len()
    );

    let mut ticker = interval(state.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            next = ws_rx.next() => {
                let msg = match next {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        match oversized(&e) {
                            // The rest of the frame is never read, so the
                            // stream cannot be resynchronised.
                            Some(reason) => {
                                log::warn!("closing {}: {}", id, reason);
                                let reply = ServerMessage::from(StatusResponse::error(reason)).to_json();
                                let _ = out_tx.send(Message::text(reply)).await;
                                let _ = out_tx
                                    .send(Message::close_with(CLOSE_MESSAGE_TOO_BIG, "message too large"))
                                    .await;
                            }
                            None => log::warn!("socket error id={}: {}", id, e),
                        }
                        break;
                    }
                    None => break,
                };

                if msg.is_close() {
                    break;
                }
                if !(msg.is_text() || msg.is_binary()) {
                    continue;
                }

                let reply = match std::str::from_utf8(msg.as_bytes()) {
                    Ok(raw) => handle_message(&state, id, raw).await,
                    Err(_) => StatusResponse::error("binary frame is not utf-8 text"),
                };
                let reply = ServerMessage::from(reply).to_json();
                if out_tx.send(Message::text(reply)).await.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if activity.idle() > state.heartbeat_timeout {
                    log::warn!("client {} timed out (no heartbeat)", id);
                    let _ = out_tx.try_send(Message::close());
                    break;
                }
                if out_tx.send(Message::ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.registry.remove(&id);
    drop(out_tx);
    // Let queued replies drain, but don't wait on a dead peer forever.
    if tokio::time::timeout(Duration::from_secs(1), &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    log::info!(
        "client disconnected id={} peer={} active={}",
        id,
        peer,
        state.registry.len()
    );
}

/// The error text for a frame rejected by the size limit, if that is what
/// `err` is.
fn oversized(err: &warp::Error) -> Option<String> {
    match err.source()?.downcast_ref::<tungstenite::Error>()? {
        tungstenite::Error::Capacity(e) => Some(format!("message too large: {e}")),
        _ => None,
    }
}

/// Decodes one frame, performs its side effect and produces the status
/// reply for the sender. Never fails: every error becomes a status.
pub async fn handle_message(state: &State, sender: ConnectionId, raw: &str) -> StatusResponse {
    let envelope = match decode(raw) {
        Ok(e) => e,
        Err(e) => {
            log::warn!("undecodable message from {}: {}", sender, e);
            return StatusResponse::error(e.to_string());
        }
    };

    match envelope {
        Envelope::Notification(payload) => {
            log::info!(
                "notification from {} package={} title={:?}",
                sender,
                payload.package(),
                payload.title()
            );
            let except = (!state.echo_to_sender).then_some(sender);
            let msg = Message::text(ServerMessage::from(NotificationBroadcast::new(payload)).to_json());
            let delivered = state.registry.broadcast(&msg, except);
            log::debug!("notification broadcast to {} client(s)", delivered);
            StatusResponse::success(NOTIFICATION_RECEIVED)
        }
        Envelope::FileUpload(upload) => match state.downloads.store(&upload).await {
            Ok(path) => {
                log::info!("received file from {} -> {}", sender, path.display());
                StatusResponse::success(FILE_RECEIVED)
            }
            Err(e) => {
                log::warn!("rejected upload {:?} from {}: {}", upload.filename, sender, e);
                StatusResponse::error(e.to_string())
            }
        },
    }
}
