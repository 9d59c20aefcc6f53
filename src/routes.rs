use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::json::Json;
use rocket::{get, post, State};
use serde::{Deserialize, Serialize};

use crate::bridge::UpstreamBridge;
use crate::db::Db;
use crate::error::{GatewayError, GatewayResult};
use crate::metrics::Metrics;
use crate::models::{Agent, SendResult, TrustLevel};
use crate::rate_limit::{RateLimited, RateLimitedError, RateLimiter};
use crate::registry::AgentRegistry;
use crate::sessions::SessionRegistry;

const MAX_CONTENT_CHARS: usize = 4000;

/// Raw bearer token lifted off the `Authorization` header, unauthenticated —
/// never fails the request on its own; each handler authenticates
/// explicitly so it can render the exact `GatewayError` variant the
/// situation calls for.
pub struct BearerToken(pub Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for BearerToken {
    type Error = std::convert::Infallible;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let token = req
            .headers()
            .get_one("Authorization")
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|v| v.to_string());
        Outcome::Success(BearerToken(token))
    }
}

fn authenticate(registry: &AgentRegistry, bearer: &BearerToken) -> GatewayResult<Agent> {
    let token = bearer
        .0
        .as_deref()
        .ok_or_else(|| GatewayError::AuthFailure("missing bearer token".to_string()))?;
    registry
        .authenticate(token)
        .ok_or_else(|| GatewayError::AuthFailure("invalid or inactive token".to_string()))
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

#[derive(Deserialize)]
pub struct SendRequest {
    pub room_id: String,
    pub content: String,
    #[serde(default)]
    pub idempotency_key: Option<String>,
}

fn rate_limit_for(trust: TrustLevel, config: &crate::config::Config) -> usize {
    match trust {
        TrustLevel::Standard => config.standard_rate_limit_per_min,
        TrustLevel::Elevated => config.elevated_rate_limit_per_min,
    }
}

/// POST /byoa/sse/messages — send as the authenticated agent.
/// Idempotency-key replay and the per-principal trust-tiered rate limit
/// both gate this endpoint before the bridge is ever consulted.
#[post("/byoa/sse/messages", data = "<body>")]
pub async fn send_as_agent(
    body: Json<SendRequest>,
    registry: &State<Arc<AgentRegistry>>,
    bridge: &State<Arc<UpstreamBridge>>,
    db: &State<Arc<Db>>,
    limiter: &State<Arc<RateLimiter>>,
    config: &State<crate::config::Config>,
    metrics: &State<Arc<Metrics>>,
    bearer: BearerToken,
) -> Result<RateLimited<SendResult>, SendAsAgentError> {
    let agent = authenticate(registry, &bearer).map_err(|e| {
        metrics.record_auth_failure();
        SendAsAgentError::Gateway(e)
    })?;

    let limit = rate_limit_for(agent.trust_level, config);
    let key = format!("sse-messages:{}", agent.principal_id);
    let info = limiter.check_with_info(&key, limit, 60);
    if !info.allowed {
        return Err(SendAsAgentError::RateLimited(RateLimitedError { info: info.clone() }));
    }

    if body.content.is_empty() {
        return Err(SendAsAgentError::Gateway(GatewayError::InvalidInput(
            "content must not be empty".to_string(),
        )));
    }
    if body.content.chars().count() > MAX_CONTENT_CHARS {
        return Err(SendAsAgentError::Gateway(GatewayError::InvalidInput(format!(
            "content exceeds {MAX_CONTENT_CHARS} characters"
        ))));
    }

    if let Some(ref idem_key) = body.idempotency_key {
        if let Some(cached) = db.get_idempotent(&agent.principal_id, idem_key) {
            if let Ok(result) = serde_json::from_str::<SendResult>(&cached) {
                return Ok(RateLimited::new(Json(result), info));
            }
        }
    }

    if !matches!(bridge.state(), crate::bridge::BridgeState::Connected) {
        return Err(SendAsAgentError::Gateway(GatewayError::BridgeUnavailable));
    }

    let result = bridge
        .send_as(&agent.token, &body.room_id, &body.content)
        .await
        .map(|message_id| SendResult {
            message_id,
            room_id: body.room_id.clone(),
        })
        .map_err(|e| SendAsAgentError::Gateway(GatewayError::UpstreamSendFailed(e)))?;

    metrics.record_message_sent();

    if let Some(ref idem_key) = body.idempotency_key {
        if let Ok(json) = serde_json::to_string(&result) {
            db.put_idempotent(&agent.principal_id, idem_key, &json, now_unix());
        }
    }

    Ok(RateLimited::new(Json(result), info))
}

/// Wraps either a `GatewayError` or a 429 so the single route signature can
/// return both kinds of failure through one `Responder`.
pub enum SendAsAgentError {
    Gateway(GatewayError),
    RateLimited(RateLimitedError),
}

impl<'r, 'o: 'r> rocket::response::Responder<'r, 'o> for SendAsAgentError {
    fn respond_to(self, req: &'r rocket::Request<'_>) -> rocket::response::Result<'o> {
        match self {
            SendAsAgentError::Gateway(e) => e.respond_to(req),
            SendAsAgentError::RateLimited(e) => e.respond_to(req),
        }
    }
}

#[derive(Serialize)]
pub struct SessionStatus {
    principal_id: String,
    username: String,
    has_socket: bool,
    stream_count: usize,
    trust_level: TrustLevel,
}

/// GET /byoa/sse/status — session status for the authenticated agent.
#[get("/byoa/sse/status")]
pub fn session_status(
    registry: &State<Arc<AgentRegistry>>,
    sessions: &State<Arc<SessionRegistry>>,
    bearer: BearerToken,
) -> GatewayResult<Json<SessionStatus>> {
    let agent = authenticate(registry, &bearer)?;
    Ok(Json(SessionStatus {
        has_socket: sessions.has_socket(&agent.principal_id),
        stream_count: sessions.stream_count(&agent.principal_id),
        principal_id: agent.principal_id,
        username: agent.username,
        trust_level: agent.trust_level,
    }))
}

/// GET /byoa/sse/health — unauthenticated liveness probe for the SSE
/// surface specifically.
#[get("/byoa/sse/health")]
pub fn sse_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

#[derive(Deserialize)]
pub struct LegacySendRequest {
    pub room: String,
    pub content: String,
}

/// POST /send — legacy send surface, same bridge path as
/// `/byoa/sse/messages` without idempotency or rate limiting.
#[post("/send", data = "<body>")]
pub async fn legacy_send(
    body: Json<LegacySendRequest>,
    registry: &State<Arc<AgentRegistry>>,
    bridge: &State<Arc<UpstreamBridge>>,
    metrics: &State<Arc<Metrics>>,
    bearer: BearerToken,
) -> GatewayResult<Json<SendResult>> {
    let agent = authenticate(registry, &bearer).map_err(|e| {
        metrics.record_auth_failure();
        e
    })?;

    if !matches!(bridge.state(), crate::bridge::BridgeState::Connected) {
        return Err(GatewayError::BridgeUnavailable);
    }

    let message_id = bridge
        .send_as(&agent.token, &body.room, &body.content)
        .await
        .map_err(GatewayError::UpstreamSendFailed)?;

    metrics.record_message_sent();

    Ok(Json(SendResult {
        message_id,
        room_id: body.room.clone(),
    }))
}

#[derive(Serialize)]
pub struct HealthReport {
    status: &'static str,
    bridge_connected: bool,
    connected_agents: Vec<String>,
}

/// GET /health — liveness + connected agent list.
#[get("/health")]
pub fn health(
    bridge: &State<Arc<UpstreamBridge>>,
    registry: &State<Arc<AgentRegistry>>,
    sessions: &State<Arc<SessionRegistry>>,
) -> Json<HealthReport> {
    let connected_agents = registry
        .get_all()
        .into_iter()
        .filter(|a| sessions.has_socket(&a.principal_id) || sessions.has_stream(&a.principal_id))
        .map(|a| a.username)
        .collect();

    Json(HealthReport {
        status: "ok",
        bridge_connected: matches!(bridge.state(), crate::bridge::BridgeState::Connected),
        connected_agents,
    })
}

/// GET /metrics — human-readable operational report.
#[get("/metrics")]
pub fn metrics_report(metrics: &State<Arc<Metrics>>) -> String {
    metrics.human_report()
}

/// GET /metrics/json — structured snapshot.
#[get("/metrics/json")]
pub fn metrics_json(metrics: &State<Arc<Metrics>>) -> Json<crate::metrics::MetricsSnapshot> {
    Json(metrics.snapshot())
}

#[rocket::catch(429)]
pub fn too_many_requests() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "RATE_LIMITED", "message": "too many requests", "code": "RATE_LIMITED"}))
}

#[rocket::catch(404)]
pub fn not_found() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "not found", "message": "not found", "code": "NOT_FOUND"}))
}
