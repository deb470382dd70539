//! WebSocket handler: joins a project hub and pumps messages both ways.
//!
//! DESIGN
//! ======
//! Each connection runs two pumps. The inbound pump reads frames from the
//! socket and publishes them to the hub; it never writes. The outbound pump
//! owns the socket's write half and drains the session queue the hub fills.
//! It also sends a keep-alive ping every interval and uses the same tick to
//! request a snapshot flush.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade (requires a non-empty `projectId`) → join the hub; the
//!    workboard snapshot is already the first queued message.
//! 2. Inbound frames → `hub.publish`; outbound queue → socket.
//! 3. Read error or close frame → unregister. The hub drops the session's
//!    queue, which the outbound pump turns into a close frame. The
//!    connection waits for that before it reports the disconnect.
//! 4. Write error, write deadline, or hub drop → outbound pump exits with a
//!    final flush request; the connection unregisters.

use std::fmt::Display;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::services::hub::{Hub, Payload};
use crate::services::registry::Joined;
use crate::state::AppState;

const ANONYMOUS_USERNAME: &str = "anonymous";

// =============================================================================
// UPGRADE
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    #[serde(rename = "projectId", alias = "projectID", default)]
    pub project_id: Option<String>,
    #[serde(rename = "userId", alias = "userID", default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

/// Who is connecting, and to which project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Identity {
    pub project_id: String,
    pub user_id: String,
    pub username: String,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_owned()).filter(|v| !v.is_empty())
}

/// Resolve query parameters into an identity. `None` when `projectId` is
/// missing or blank; missing user fields become an anonymous presence.
pub(crate) fn resolve_identity(params: WsParams) -> Option<Identity> {
    let project_id = non_blank(params.project_id)?;
    let user_id = non_blank(params.user_id).unwrap_or_else(|| format!("user_{}", Uuid::new_v4().simple()));
    let username = non_blank(params.username).unwrap_or_else(|| ANONYMOUS_USERNAME.to_owned());
    Some(Identity { project_id, user_id, username })
}

pub async fn handle_ws(State(state): State<AppState>, Query(params): Query<WsParams>, ws: WebSocketUpgrade) -> Response {
    let Some(identity) = resolve_identity(params) else {
        return (StatusCode::BAD_REQUEST, "projectId is required").into_response();
    };
    ws.on_upgrade(move |socket| run_ws(socket, state, identity))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, identity: Identity) {
    let Identity { project_id, user_id, username } = identity;

    let joined = match state.hubs.join(&project_id, &user_id, &username).await {
        Ok(joined) => joined,
        Err(e) => {
            warn!(%project_id, %user_id, error = %e, "ws: join failed");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    let Joined { hub, session_id, outbound } = joined;
    info!(%project_id, %user_id, %session_id, "ws: session connected");

    let config = state.hubs.config();
    let (sink, stream) = socket.split();
    let writer = tokio::spawn(outbound_pump(sink, outbound, hub.clone(), config.ping_interval, config.write_wait));
    drive_session(stream, writer, &hub, session_id).await;

    info!(%project_id, %user_id, %session_id, "ws: session disconnected");
}

// =============================================================================
// PUMPS
// =============================================================================

/// Run the inbound pump against an already spawned outbound pump. Returns
/// only after the outbound pump has finished, so its close frame and final
/// flush request have gone out.
pub(crate) async fn drive_session<St, E>(stream: St, mut writer: JoinHandle<()>, hub: &Hub, session_id: Uuid)
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let writer_done = tokio::select! {
        () = inbound_pump(stream, hub, session_id) => false,
        _ = &mut writer => true,
    };

    if writer_done {
        hub.unregister(session_id).await;
    } else if let Err(e) = writer.await {
        warn!(%session_id, error = %e, "ws: outbound pump failed");
    }
}

/// Relay socket frames to the hub until the peer closes or the read fails,
/// then unregister. Text and UTF-8 binary frames are relayed; control frames
/// are skipped.
pub(crate) async fn inbound_pump<St, E>(mut stream: St, hub: &Hub, session_id: Uuid)
where
    St: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    while let Some(frame) = stream.next().await {
        let payload = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => Payload::from(text),
                Err(_) => {
                    warn!(%session_id, len = bytes.len(), "ws: dropping non-utf8 binary frame");
                    continue;
                }
            },
            Ok(Message::Ping(_) | Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!(%session_id, error = %e, "ws: read failed");
                break;
            }
        };

        if hub.publish(payload).await.is_err() {
            break;
        }
    }

    hub.unregister(session_id).await;
}

/// Drain the session queue into the socket under a write deadline. Sends a
/// ping and requests a flush on every tick. When the hub closes the queue a
/// close frame goes out and the pump stops.
pub(crate) async fn outbound_pump<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<Payload>,
    hub: Hub,
    ping_interval: Duration,
    write_wait: Duration,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);

    loop {
        tokio::select! {
            queued = outbound.recv() => {
                let Some(payload) = queued else {
                    let _ = timeout(write_wait, sink.send(Message::Close(None))).await;
                    break;
                };
                if !write(&mut sink, Message::Text(payload), write_wait).await {
                    break;
                }
            }
            _ = ticker.tick() => {
                if !write(&mut sink, Message::Ping(Bytes::new()), write_wait).await {
                    break;
                }
                hub.request_flush();
            }
        }
    }

    hub.request_flush();
}

async fn write<S>(sink: &mut S, message: Message, write_wait: Duration) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match timeout(write_wait, sink.send(message)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(error = %e, "ws: write failed");
            false
        }
        Err(_) => {
            warn!(?write_wait, "ws: write deadline exceeded");
            false
        }
    }
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
