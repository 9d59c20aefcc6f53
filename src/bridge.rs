use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use futures_util::StreamExt as _;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::models::{InboundMessage, SenderKind};

const RECONNECT_BASE_SECS: u64 = 2;
const RECONNECT_CAP_SECS: u64 = 30;
const SILENT_CONNECTION_TIMEOUT_SECS: i64 = 60;
const CREDENTIAL_SKEW_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Disconnected,
    Authenticating,
    Connected,
    Closing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Credential {
    token: String,
    expires_at: i64,
}

#[derive(Debug, Deserialize)]
struct RoomRef {
    id: String,
    name: String,
}

/// One authenticated session to the chat server, shared by every gateway
/// component that needs to read or write upstream.
///
/// Shaped like this crate's other background-task owners: a long-lived
/// `tokio::spawn`ed loop owns the network I/O, coordinating with the rest
/// of the gateway only through shared atomics and a credential cache
/// file.
pub struct UpstreamBridge {
    client: reqwest::Client,
    base_url: String,
    gateway_token: String,
    gateway_username: String,
    credential_cache_path: String,
    credential: RwLock<Option<Credential>>,
    state: RwLock<BridgeState>,
    reconnecting: AtomicBool,
    last_activity_unix: AtomicI64,
}

impl UpstreamBridge {
    pub fn new(
        base_url: String,
        gateway_token: String,
        gateway_username: String,
        credential_cache_path: String,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build upstream HTTP client");

        let credential = load_cached_credential(&credential_cache_path);

        UpstreamBridge {
            client,
            base_url,
            gateway_token,
            gateway_username,
            credential_cache_path,
            credential: RwLock::new(credential),
            state: RwLock::new(BridgeState::Disconnected),
            reconnecting: AtomicBool::new(false),
            last_activity_unix: AtomicI64::new(0),
        }
    }

    pub fn state(&self) -> BridgeState {
        *self.state.read().unwrap()
    }

    fn set_state(&self, s: BridgeState) {
        *self.state.write().unwrap() = s;
    }

    fn touch_activity(&self) {
        self.last_activity_unix.store(now_unix(), Ordering::SeqCst);
    }

    /// Acquire a valid session credential, refreshing if absent or within
    /// 60s of expiry — cached with an explicit expiry minus a 60s skew
    /// buffer.
    async fn ensure_credential(&self) -> Result<String, String> {
        {
            let guard = self.credential.read().unwrap();
            if let Some(cred) = guard.as_ref() {
                if cred.expires_at - CREDENTIAL_SKEW_SECS > now_unix() {
                    return Ok(cred.token.clone());
                }
            }
        }
        self.reauthenticate().await
    }

    async fn reauthenticate(&self) -> Result<String, String> {
        self.set_state(BridgeState::Authenticating);
        #[derive(Serialize)]
        struct AuthBody<'a> {
            username: &'a str,
            token: &'a str,
            kind: &'a str,
        }
        #[derive(Deserialize)]
        struct AuthResponse {
            token: String,
            expires_at: i64,
        }

        let resp = self
            .client
            .post(format!("{}/api/v1/gateway/session", self.base_url))
            .json(&AuthBody {
                username: &self.gateway_username,
                token: &self.gateway_token,
                kind: "gateway",
            })
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !resp.status().is_success() {
            return Err(format!("upstream auth failed: {}", resp.status()));
        }

        let parsed: AuthResponse = resp.json().await.map_err(|e| e.to_string())?;
        let cred = Credential {
            token: parsed.token.clone(),
            expires_at: parsed.expires_at,
        };
        *self.credential.write().unwrap() = Some(cred.clone());
        save_cached_credential(&self.credential_cache_path, &cred);
        Ok(cred.token)
    }

    /// Drop the cached credential — called when a disconnect reason
    /// indicates a server-side close such as token invalidation.
    fn invalidate_credential(&self) {
        *self.credential.write().unwrap() = None;
    }

    pub async fn rooms_for(&self, agent_token: &str, username: &str) -> Result<Vec<(String, String)>, String> {
        self.rooms_for_classified(agent_token, username)
            .await
            .map_err(|(_, msg)| msg)
    }

    /// Same request as [`Self::rooms_for`], but classified by whether the
    /// failure looks like a server-side rejection of the credential (401/403
    /// — token invalidation) versus a transient failure (network error,
    /// 5xx) — the bridge's reconnect loop uses this to decide whether to
    /// drop the cached credential before reauthenticating.
    async fn rooms_for_classified(
        &self,
        agent_token: &str,
        username: &str,
    ) -> Result<Vec<(String, String)>, (DisconnectReason, String)> {
        let resp = self
            .client
            .get(format!("{}/api/v1/rooms", self.base_url))
            .bearer_auth(agent_token)
            .query(&[("participant", username)])
            .send()
            .await
            .map_err(|e| (DisconnectReason::Transient, e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err((DisconnectReason::ServerClosed, format!("roomsFor rejected: {status}")));
        }
        if !status.is_success() {
            return Err((DisconnectReason::Transient, format!("roomsFor failed: {status}")));
        }
        let rooms: Vec<RoomRef> = resp
            .json()
            .await
            .map_err(|e| (DisconnectReason::Transient, e.to_string()))?;
        Ok(rooms.into_iter().map(|r| (r.id, r.name)).collect())
    }

    /// Forward a send under the *agent's* credentials, not the gateway's.
    pub async fn send_as(&self, agent_token: &str, room_id: &str, content: &str) -> Result<String, String> {
        #[derive(Serialize)]
        struct SendBody<'a> {
            content: &'a str,
            sender_type: &'a str,
        }
        #[derive(Deserialize)]
        struct SendResponse {
            id: String,
        }

        let resp = self
            .client
            .post(format!("{}/api/v1/rooms/{}/messages", self.base_url, room_id))
            .bearer_auth(agent_token)
            .json(&SendBody { content, sender_type: "ai" })
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if resp.status().is_client_error() {
            return Err(format!("rejected: {}", resp.status()));
        }
        if !resp.status().is_success() {
            return Err(format!("send failed: {}", resp.status()));
        }

        let parsed: SendResponse = resp.json().await.map_err(|e| e.to_string())?;
        Ok(parsed.id)
    }

    /// Fetch unread history for context materialization.
    pub async fn fetch_since(
        &self,
        agent_token: &str,
        room_id: &str,
        after_message_id: &str,
        limit: usize,
    ) -> Result<Vec<InboundMessage>, String> {
        #[derive(Deserialize)]
        struct WireMessage {
            id: String,
            room_id: String,
            room_name: Option<String>,
            sender: String,
            sender_type: Option<String>,
            content: String,
            created_at: String,
        }

        let resp = self
            .client
            .get(format!("{}/api/v1/rooms/{}/messages", self.base_url, room_id))
            .bearer_auth(agent_token)
            .query(&[("after", after_message_id), ("limit", &limit.to_string())])
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if !resp.status().is_success() {
            return Err(format!("fetchSince failed: {}", resp.status()));
        }

        let wire: Vec<WireMessage> = resp.json().await.map_err(|e| e.to_string())?;
        Ok(wire
            .into_iter()
            .map(|m| InboundMessage {
                message_id: m.id,
                room_id: m.room_id,
                room_name: m.room_name.unwrap_or_default(),
                sender_username: m.sender,
                sender_principal_id: None,
                sender_kind: if m.sender_type.as_deref() == Some("ai") {
                    SenderKind::Ai
                } else {
                    SenderKind::Human
                },
                content: m.content,
                timestamp: m.created_at,
            })
            .collect())
    }

    /// Run the reconnection state machine forever, delivering inbound
    /// messages to `tx` in the order received from upstream. A single
    /// in-flight reconnect at a time — concurrent disconnect signals are
    /// coalesced via `reconnecting`.
    pub async fn run(self: std::sync::Arc<Self>, tx: mpsc::Sender<InboundMessage>) {
        loop {
            if self.reconnecting.swap(true, Ordering::SeqCst) {
                // Another reconnect attempt already in flight; this caller
                // just waits for it to settle.
                tokio::time::sleep(Duration::from_millis(500)).await;
                continue;
            }

            let mut backoff = RECONNECT_BASE_SECS;
            loop {
                match self.connect_and_stream(tx.clone()).await {
                    Ok(()) => {
                        // Graceful close requested (shutdown); stop entirely.
                        self.reconnecting.store(false, Ordering::SeqCst);
                        return;
                    }
                    Err(DisconnectReason::ServerClosed) => {
                        self.invalidate_credential();
                    }
                    Err(DisconnectReason::Transient) => {}
                }
                self.set_state(BridgeState::Disconnected);
                eprintln!("🔌 Upstream bridge disconnected, retrying in {backoff}s");
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                backoff = (backoff * 2).min(RECONNECT_CAP_SECS);
            }
        }
    }

    /// Authenticate, discover rooms, and stream inbound messages until a
    /// disconnect or silent-connection timeout fires.
    async fn connect_and_stream(&self, tx: mpsc::Sender<InboundMessage>) -> Result<(), DisconnectReason> {
        let token = self
            .ensure_credential()
            .await
            .map_err(|_| DisconnectReason::Transient)?;

        let rooms = self
            .rooms_for_classified(&token, &self.gateway_username)
            .await
            .map_err(|(reason, _)| reason)?;

        self.set_state(BridgeState::Connected);
        self.touch_activity();
        self.reconnecting.store(false, Ordering::SeqCst);

        let mut room_streams: Vec<_> = rooms
            .iter()
            .map(|(id, _name)| self.open_room_stream(&token, id))
            .collect();

        let idle_check = tokio::time::sleep(Duration::from_secs(SILENT_CONNECTION_TIMEOUT_SECS));
        tokio::pin!(idle_check);

        loop {
            tokio::select! {
                maybe_msg = next_from_any(&mut room_streams) => {
                    match maybe_msg {
                        Some(msg) => {
                            self.touch_activity();
                            idle_check.as_mut().reset(tokio::time::Instant::now() + Duration::from_secs(SILENT_CONNECTION_TIMEOUT_SECS));
                            if tx.send(msg).await.is_err() {
                                return Ok(());
                            }
                        }
                        None => return Err(DisconnectReason::Transient),
                    }
                }
                _ = &mut idle_check => {
                    eprintln!("⚠️ Upstream bridge: no activity for {SILENT_CONNECTION_TIMEOUT_SECS}s, reconnecting");
                    return Err(DisconnectReason::Transient);
                }
            }
        }
    }

    fn open_room_stream(&self, token: &str, room_id: &str) -> RoomEventSource {
        RoomEventSource::new(self.client.clone(), self.base_url.clone(), token.to_string(), room_id.to_string())
    }
}

#[derive(Debug, Clone, Copy)]
enum DisconnectReason {
    ServerClosed,
    Transient,
}

/// One room's SSE connection to the upstream chat server, parsed from the
/// same `id:`/`event:`/`data:` wire format this gateway's own stream route
/// serves — here consumed as a client instead of produced as a server.
struct RoomEventSource {
    #[allow(dead_code)]
    room_id: String,
    inner: std::pin::Pin<Box<dyn futures_util::Stream<Item = InboundMessage> + Send>>,
}

impl RoomEventSource {
    fn new(client: reqwest::Client, base_url: String, token: String, room_id: String) -> Self {
        let room_id_for_stream = room_id.clone();
        let stream = async_stream::stream! {
            let resp = match client
                .get(format!("{base_url}/api/v1/rooms/{room_id_for_stream}/stream"))
                .bearer_auth(&token)
                .send()
                .await
            {
                Ok(r) => r,
                Err(_) => return,
            };
            let mut byte_stream = resp.bytes_stream();
            let mut buf = String::new();
            while let Some(chunk) = byte_stream.next().await {
                let Ok(chunk) = chunk else { break };
                buf.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(idx) = buf.find("\n\n") {
                    let frame = buf[..idx].to_string();
                    buf.drain(..idx + 2);
                    if let Some(msg) = parse_sse_message_frame(&frame) {
                        yield msg;
                    }
                }
            }
        };
        RoomEventSource {
            room_id,
            inner: Box::pin(stream),
        }
    }
}

fn parse_sse_message_frame(frame: &str) -> Option<InboundMessage> {
    let mut event_name = None;
    let mut data_line = None;
    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("event: ") {
            event_name = Some(rest.to_string());
        } else if let Some(rest) = line.strip_prefix("data: ") {
            data_line = Some(rest.to_string());
        }
    }
    if event_name.as_deref() != Some("message") {
        return None;
    }
    serde_json::from_str(&data_line?).ok()
}

/// Poll every open room stream for the next message without favoring any
/// one room — this only linearizes upstream delivery into the router's
/// single mpsc queue; no cross-room ordering is implied or required.
async fn next_from_any(streams: &mut [RoomEventSource]) -> Option<InboundMessage> {
    use futures_util::FutureExt;
    if streams.is_empty() {
        std::future::pending::<()>().await;
        return None;
    }
    let futs: Vec<_> = streams.iter_mut().map(|s| s.inner.next().boxed()).collect();
    let (result, _index, _) = futures_util::future::select_all(futs).await;
    result
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

fn load_cached_credential(path: &str) -> Option<Credential> {
    let data = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&data).ok()
}

fn save_cached_credential(path: &str, cred: &Credential) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        std::fs::create_dir_all(parent).ok();
    }
    if let Ok(json) = serde_json::to_string(cred) {
        std::fs::write(path, json).ok();
    }
}
