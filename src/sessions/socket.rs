use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rocket::{get, State};
use rocket_ws::frame::{CloseCode, CloseFrame};
use rocket_ws::{Message as WsMessage, WebSocket};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::bridge::UpstreamBridge;
use crate::metrics::Metrics;
use crate::models::{InboundMessage, SenderKind};
use crate::registry::AgentRegistry;
use crate::sessions::{SessionRegistry, SocketHandle};

const AUTH_DEADLINE: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(30);

pub const CLOSE_REPLACED: u16 = 4000;
pub const CLOSE_AUTH_TIMEOUT: u16 = 4001;
pub const CLOSE_AUTH_FAILURE: u16 = 4003;
pub const CLOSE_GRACEFUL: u16 = 1001;

/// Deregisters the socket on drop, not just on a clean `break` out of the
/// select loop — `ws.channel`'s future can be dropped mid-poll if the
/// transport cancels it, in which case code after the loop never runs.
/// Same shape as `StreamGuard` in `sessions/stream.rs`, itself grounded on
/// the teacher's `PresenceGuard` in `routes/mod.rs`.
struct SocketGuard {
    sessions: Arc<SessionRegistry>,
    metrics: Arc<Metrics>,
    principal_id: String,
    tx: mpsc::UnboundedSender<InboundMessage>,
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        self.sessions.remove_socket_if_current(&self.principal_id, &self.tx);
        self.metrics.record_disconnect("socket");
    }
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Auth { token: String },
    Message { room: String, content: String },
    Pong,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerFrame<'a> {
    AuthOk {
        agent: AgentSummary,
        rooms: Vec<RoomSummary>,
    },
    AuthError {
        code: &'a str,
        message: &'a str,
    },
    Message {
        room: String,
        sender: String,
        sender_type: SenderKind,
        content: String,
        timestamp: String,
    },
    MessageSent {
        room: String,
    },
    Error {
        code: &'a str,
        message: String,
    },
    Ping,
}

#[derive(Serialize)]
struct AgentSummary {
    principal_id: String,
    username: String,
    display_name: String,
}

#[derive(Serialize)]
struct RoomSummary {
    id: String,
    name: String,
}

fn frame(s: &ServerFrame) -> WsMessage {
    WsMessage::Text(serde_json::to_string(s).unwrap_or_default())
}

fn close_with(code: u16, reason: &str) -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code: CloseCode::Library(code),
        reason: reason.into(),
    }))
}

/// Persistent bidirectional agent session. Route registration and
/// handshake/auth deadline shaped on the write-loop pattern common to
/// websocket gateways: split the socket, spawn a dedicated writer fed by
/// an mpsc channel, and drive the reader loop on the calling task.
#[get("/byoa/ws")]
pub fn socket_route(
    ws: WebSocket,
    registry: &State<Arc<AgentRegistry>>,
    sessions: &State<Arc<SessionRegistry>>,
    bridge: &State<Arc<UpstreamBridge>>,
    metrics: &State<Arc<Metrics>>,
) -> rocket_ws::Channel<'static> {
    let registry = registry.inner().clone();
    let sessions = sessions.inner().clone();
    let bridge = bridge.inner().clone();
    let metrics = metrics.inner().clone();

    ws.channel(move |stream| {
        Box::pin(async move {
            let (mut ws_tx, mut ws_rx) = stream.split();

            let first = match tokio::time::timeout(AUTH_DEADLINE, ws_rx.next()).await {
                Ok(Some(Ok(WsMessage::Text(text)))) => text,
                _ => {
                    let _ = ws_tx.send(close_with(CLOSE_AUTH_TIMEOUT, "auth timeout")).await;
                    return Ok(());
                }
            };

            let auth_frame: Option<ClientFrame> = serde_json::from_str(&first).ok();
            let token = match auth_frame {
                Some(ClientFrame::Auth { token }) => token,
                _ => {
                    metrics.record_auth_failure();
                    let _ = ws_tx
                        .send(frame(&ServerFrame::Error {
                            code: "UNKNOWN_EVENT",
                            message: "first frame must be auth".to_string(),
                        }))
                        .await;
                    let _ = ws_tx.send(close_with(CLOSE_AUTH_FAILURE, "first frame must be auth")).await;
                    return Ok(());
                }
            };

            let Some(agent) = registry.authenticate(&token) else {
                metrics.record_auth_failure();
                let _ = ws_tx
                    .send(frame(&ServerFrame::AuthError {
                        code: "AUTH_FAILURE",
                        message: "invalid or inactive token",
                    }))
                    .await;
                let _ = ws_tx.send(close_with(CLOSE_AUTH_FAILURE, "auth failure")).await;
                return Ok(());
            };

            let rooms = bridge
                .rooms_for(&agent.token, &agent.username)
                .await
                .unwrap_or_default();

            let (deliver_tx, mut deliver_rx) = mpsc::unbounded_channel::<InboundMessage>();
            let (replaced_tx, mut replaced_rx) = mpsc::unbounded_channel::<()>();
            let mut shutdown_rx = sessions.subscribe_shutdown();
            let handle = SocketHandle {
                tx: deliver_tx.clone(),
                replaced_tx,
            };

            // Install before replying so the router can't miss a message
            // in the gap between auth_ok and registration. Never close the
            // prior session while holding the map lock.
            let prior = sessions.install_socket(&agent.principal_id, handle);
            if let Some(prior) = prior {
                let _ = prior.replaced_tx.send(());
            }

            metrics.record_connect("socket");
            let _guard = SocketGuard {
                sessions: Arc::clone(&sessions),
                metrics: Arc::clone(&metrics),
                principal_id: agent.principal_id.clone(),
                tx: deliver_tx.clone(),
            };

            let _ = ws_tx
                .send(frame(&ServerFrame::AuthOk {
                    agent: AgentSummary {
                        principal_id: agent.principal_id.clone(),
                        username: agent.username.clone(),
                        display_name: agent.display_name.clone(),
                    },
                    rooms: rooms
                        .into_iter()
                        .map(|(id, name)| RoomSummary { id, name })
                        .collect(),
                }))
                .await;

            let mut ping_ticker = tokio::time::interval(PING_INTERVAL);
            ping_ticker.tick().await; // first tick fires immediately

            let close_reason = loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        break close_with(CLOSE_GRACEFUL, "shutdown");
                    }
                    _ = replaced_rx.recv() => {
                        let _ = ws_tx.send(frame(&ServerFrame::Error {
                            code: "REPLACED",
                            message: "session replaced by a newer connection".to_string(),
                        })).await;
                        break close_with(CLOSE_REPLACED, "replaced");
                    }
                    _ = ping_ticker.tick() => {
                        if ws_tx.send(frame(&ServerFrame::Ping)).await.is_err() {
                            break close_with(CLOSE_GRACEFUL, "write failed");
                        }
                    }
                    delivered = deliver_rx.recv() => {
                        match delivered {
                            Some(msg) => {
                                if ws_tx.send(frame(&ServerFrame::Message {
                                    room: msg.room_id,
                                    sender: msg.sender_username,
                                    sender_type: msg.sender_kind,
                                    content: msg.content,
                                    timestamp: msg.timestamp,
                                })).await.is_err() {
                                    break close_with(CLOSE_GRACEFUL, "write failed");
                                }
                            }
                            None => break close_with(CLOSE_GRACEFUL, "channel closed"),
                        }
                    }
                    incoming = ws_rx.next() => {
                        match incoming {
                            Some(Ok(WsMessage::Text(text))) => {
                                match serde_json::from_str::<ClientFrame>(&text) {
                                    Ok(ClientFrame::Message { room, content }) => {
                                        match bridge.send_as(&agent.token, &room, &content).await {
                                            Ok(_id) => {
                                                metrics.record_message_sent();
                                                let _ = ws_tx.send(frame(&ServerFrame::MessageSent { room })).await;
                                            }
                                            Err(e) => {
                                                let _ = ws_tx.send(frame(&ServerFrame::Error {
                                                    code: "SEND_FAILED",
                                                    message: e,
                                                })).await;
                                            }
                                        }
                                    }
                                    Ok(ClientFrame::Pong) => {}
                                    Ok(ClientFrame::Auth { .. }) => {
                                        let _ = ws_tx.send(frame(&ServerFrame::Error {
                                            code: "UNKNOWN_EVENT",
                                            message: "already authenticated".to_string(),
                                        })).await;
                                    }
                                    Err(_) => {
                                        let _ = ws_tx.send(frame(&ServerFrame::Error {
                                            code: "UNKNOWN_EVENT",
                                            message: "unrecognized frame".to_string(),
                                        })).await;
                                    }
                                }
                            }
                            Some(Ok(WsMessage::Close(_))) | None => {
                                break close_with(CLOSE_GRACEFUL, "peer closed");
                            }
                            Some(Ok(_)) => {}
                            Some(Err(_)) => break close_with(CLOSE_GRACEFUL, "transport error"),
                        }
                    }
                }
            };

            // Cleanup happens in `SocketGuard::drop`, which runs whether this
            // loop exits via `break` above or the channel future is cancelled.
            let _ = ws_tx.send(close_reason).await;
            drop(_guard);
            Ok(())
        })
    })
}
