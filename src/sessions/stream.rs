use std::sync::Arc;

use rocket::response::stream::{Event, EventStream};
use rocket::{get, Request};
use rocket::request::{FromRequest, Outcome};
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

use crate::db::Db;
use crate::metrics::Metrics;
use crate::registry::AgentRegistry;
use crate::sessions::{SessionRegistry, StreamHandle, MAX_STREAMS_PER_PRINCIPAL};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

/// Deregisters the stream on drop, not just on a clean `break` out of the
/// select loop — an `EventStream!` generator can be dropped mid-poll if the
/// peer disconnects abruptly, in which case code after the loop never
/// runs. Same shape as the teacher's `PresenceGuard` in `routes/mod.rs`,
/// which exists for the identical reason (a cancelled stream must still
/// release presence).
struct StreamGuard {
    sessions: Arc<SessionRegistry>,
    metrics: Arc<Metrics>,
    principal_id: String,
    tx: mpsc::UnboundedSender<(i64, crate::models::InboundMessage)>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.sessions.remove_stream(&self.principal_id, &self.tx);
        self.metrics.record_disconnect("stream");
    }
}

/// `Last-Event-ID` request header, defaulting to 0.
pub struct LastEventId(pub i64);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for LastEventId {
    type Error = std::convert::Infallible;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let id = req
            .headers()
            .get_one("Last-Event-ID")
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        Outcome::Success(LastEventId(id))
    }
}

/// Unidirectional downstream event stream. Replays the event log past
/// `Last-Event-ID`, then stays open relaying live fanout from the router
/// plus a 25s heartbeat comment to defeat proxy idle timeouts — the same
/// `EventStream!`/replay-query/heartbeat shape used for the live message
/// feed elsewhere in this stack, reading from the gateway's own event log
/// instead of a chat room's message table.
#[get("/byoa/sse/stream")]
pub fn stream_route(
    registry: &rocket::State<Arc<AgentRegistry>>,
    sessions: &rocket::State<Arc<SessionRegistry>>,
    db: &rocket::State<Arc<Db>>,
    metrics: &rocket::State<Arc<Metrics>>,
    auth: crate::routes::BearerToken,
    last_event_id: LastEventId,
) -> EventStream![] {
    let registry = registry.inner().clone();
    let sessions = sessions.inner().clone();
    let db = db.inner().clone();
    let metrics = metrics.inner().clone();
    let after_id = last_event_id.0;

    let agent = auth.0.and_then(|token| registry.authenticate(&token));

    EventStream! {
        let Some(agent) = agent else {
            metrics.record_auth_failure();
            yield Event::json(&serde_json::json!({"code": "AUTH_FAILURE"})).event("error");
            return;
        };

        if sessions.stream_count(&agent.principal_id) >= MAX_STREAMS_PER_PRINCIPAL {
            yield Event::json(&serde_json::json!({"code": "TOO_MANY_CONNECTIONS"})).event("error");
            return;
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        sessions.add_stream(&agent.principal_id, StreamHandle { tx: tx.clone() });
        metrics.record_connect("stream");
        let _guard = StreamGuard {
            sessions: Arc::clone(&sessions),
            metrics: Arc::clone(&metrics),
            principal_id: agent.principal_id.clone(),
            tx: tx.clone(),
        };
        let mut shutdown_rx = sessions.subscribe_shutdown();

        yield Event::json(&serde_json::json!({
            "agent": agent.username,
            "trustLevel": agent.trust_level,
            "serverTime": chrono::Utc::now().to_rfc3339(),
        })).event("connected");

        if after_id > 0 {
            for (id, msg) in db.replay_since(after_id, 500) {
                yield Event::json(&msg).id(id.to_string()).event("message");
            }
        }

        let mut heartbeat = interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    yield Event::json(&serde_json::json!({})).event("shutdown");
                    break;
                }
                delivered = rx.recv() => {
                    match delivered {
                        Some((id, msg)) => {
                            yield Event::json(&msg).id(id.to_string()).event("message");
                        }
                        None => break,
                    }
                }
                _ = heartbeat.tick() => {
                    yield Event::comment("");
                }
            }
        }

        // Cleanup happens in `StreamGuard::drop`, which runs whether this
        // loop exits via `break` above or the generator is dropped mid-poll.
        drop(_guard);
    }
}
