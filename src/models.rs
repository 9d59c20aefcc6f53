use serde::{Deserialize, Serialize};

/// Trust level gates whether an agent receives AI-authored traffic at all
/// (`Standard`) or is subject to the loop guard instead (`Elevated`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Standard,
    Elevated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveMode {
    Mentions,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Socket,
    Webhook,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    Webhook,
    LocalInject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Active,
    Suspended,
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderKind {
    Human,
    Ai,
}

/// The principal. Identity is `principal_id`; `token` is a separate
/// projection — one current bearer token per agent, indexed for O(1) auth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub principal_id: String,
    pub username: String,
    pub display_name: String,
    #[serde(default)]
    pub emoji: String,
    pub mention_key: String,
    pub trust_level: TrustLevel,
    pub receive_mode: ReceiveMode,
    pub connection_type: ConnectionType,
    pub delivery_mode: DeliveryMode,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_secret: Option<String>,
    pub status: AgentStatus,
    pub token: String,
}

impl Agent {
    pub fn is_active(&self) -> bool {
        matches!(self.status, AgentStatus::Active)
    }
}

/// Normalized inbound message from the upstream bridge. Immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub message_id: String,
    pub room_id: String,
    pub room_name: String,
    pub sender_username: String,
    #[serde(default)]
    pub sender_principal_id: Option<String>,
    pub sender_kind: SenderKind,
    pub content: String,
    pub timestamp: String,
}

/// A send request made by an agent (socket, SSE POST, or webhook reply).
#[derive(Debug, Clone, Deserialize)]
pub struct OutboundMessage {
    pub room_id: String,
    pub content: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

/// Classified outcome of a send, either freshly produced or replayed from
/// the idempotency cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendResult {
    pub message_id: String,
    pub room_id: String,
}

/// Errors a send can fail with, distinct from transport-level `GatewayError`
/// so the socket/SSE/HTTP surfaces can each render it in their own wire
/// format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SendError {
    BridgeUnavailable,
    UpstreamRejected(String),
}

/// One context-window entry attached to a webhook dispatch when a mention
/// triggers unread-history materialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextMessage {
    pub sender: String,
    pub sender_type: SenderKind,
    pub content: String,
    pub timestamp: String,
}

/// Body POSTed to an agent's webhook URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub message_id: String,
    pub sender: String,
    pub sender_type: SenderKind,
    pub content: String,
    pub room: String,
    pub timestamp: String,
    #[serde(default)]
    pub context: Vec<ContextMessage>,
}
