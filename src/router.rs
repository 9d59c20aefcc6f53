use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

use crate::bridge::UpstreamBridge;
use crate::db::Db;
use crate::loop_guard::LoopGuard;
use crate::metrics::Metrics;
use crate::models::{Agent, ConnectionType, ContextMessage, DeliveryMode, InboundMessage, ReceiveMode, WebhookPayload};
use crate::read_tracker::ReadTracker;
use crate::registry::AgentRegistry;
use crate::sessions::SessionRegistry;
use crate::webhook_dispatcher::WebhookDispatcher;

const CONTEXT_LIMIT: usize = 50;

/// Everything the router needs to turn one inbound message into per-agent
/// deliveries. Bundled into one struct so `run` can be spawned once with a
/// single clone-able handle.
pub struct RouterDeps {
    pub registry: Arc<AgentRegistry>,
    pub sessions: Arc<SessionRegistry>,
    pub bridge: Arc<UpstreamBridge>,
    pub db: Arc<Db>,
    pub loop_guard: Arc<LoopGuard>,
    pub read_tracker: Arc<ReadTracker>,
    pub webhooks: Arc<WebhookDispatcher>,
    pub metrics: Arc<Metrics>,
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn is_mentioned(content: &str, candidate: &Agent) -> bool {
    let lower = content.to_lowercase();
    lower.contains(&format!("@{}", candidate.mention_key.to_lowercase()))
        || lower.contains(&format!("@{}", candidate.username.to_lowercase()))
}

/// The single consumer of the bridge's inbound channel. Processes
/// messages strictly in arrival order to preserve upstream ordering;
/// per-candidate side effects (webhook POST, stream write) are launched
/// without awaiting each other so one slow candidate can't stall the
/// rest.
pub async fn run(mut rx: mpsc::Receiver<InboundMessage>, deps: RouterDeps) {
    while let Some(message) = rx.recv().await {
        route_one(&message, &deps).await;
    }
}

async fn route_one(message: &InboundMessage, deps: &RouterDeps) {
    for candidate in deps.registry.get_all() {
        if !candidate.is_active() {
            continue;
        }
        if candidate.username == message.sender_username
            || message
                .sender_principal_id
                .as_deref()
                .is_some_and(|id| id == candidate.principal_id)
        {
            continue;
        }

        let mentioned = is_mentioned(&message.content, &candidate);
        if matches!(candidate.receive_mode, ReceiveMode::Mentions) && !mentioned {
            continue;
        }

        if !mentioned {
            let sender_key = message
                .sender_principal_id
                .clone()
                .unwrap_or_else(|| message.sender_username.clone());
            let allowed = deps.loop_guard.allow(
                &sender_key,
                message.sender_kind,
                &candidate.principal_id,
                candidate.trust_level,
            );
            if !allowed {
                continue;
            }
        }

        deliver_to(&candidate, message, mentioned, deps).await;
    }
}

async fn deliver_to(candidate: &Agent, message: &InboundMessage, mentioned: bool, deps: &RouterDeps) {
    let principal_id = &candidate.principal_id;

    if deps.sessions.has_socket(principal_id) && !matches!(candidate.delivery_mode, DeliveryMode::LocalInject) {
        // No context bundle travels over the socket, so the cursor can
        // advance immediately — there's no pending fetch whose `after`
        // cursor this would clobber.
        if mentioned {
            deps.read_tracker.advance(principal_id, &message.room_id, &message.message_id, now_unix());
        }
        deps.sessions.deliver_socket(principal_id, message);
        return;
    }

    if deps.sessions.has_stream(principal_id) {
        if mentioned {
            deps.read_tracker.advance(principal_id, &message.room_id, &message.message_id, now_unix());
        }
        let event_id = deps.db.append_event(&message.room_id, message, now_unix());
        deps.sessions.deliver_streams(principal_id, event_id, message);
        return;
    }

    if matches!(candidate.delivery_mode, DeliveryMode::LocalInject) {
        let context = if mentioned {
            materialize_context(candidate, message, deps).await
        } else {
            Vec::new()
        };
        local_inject(candidate, message, context);
        return;
    }

    if mentioned && candidate.webhook_url.is_some() && matches!(candidate.connection_type, ConnectionType::Webhook | ConnectionType::Both) {
        let context = materialize_context(candidate, message, deps).await;
        let payload = WebhookPayload {
            message_id: message.message_id.clone(),
            sender: message.sender_username.clone(),
            sender_type: message.sender_kind,
            content: message.content.clone(),
            room: message.room_id.clone(),
            timestamp: message.timestamp.clone(),
            context,
        };
        deps.webhooks.dispatch(candidate.clone(), payload, Arc::clone(&deps.metrics));
    }
}

/// Fetch unread history since the candidate's *current* read cursor,
/// excluding the triggering message itself, then advance the cursor to it.
/// The fetch must read the old cursor before it moves — advancing first
/// would make every fetch resolve to "nothing newer than the message that
/// just arrived".
async fn materialize_context(candidate: &Agent, message: &InboundMessage, deps: &RouterDeps) -> Vec<ContextMessage> {
    let after = deps
        .read_tracker
        .get(&candidate.principal_id, &message.room_id)
        .map(|c| c.last_seen_message_id)
        .unwrap_or_else(|| "0".to_string());

    let history = deps
        .bridge
        .fetch_since(&candidate.token, &message.room_id, &after, CONTEXT_LIMIT)
        .await
        .unwrap_or_default();

    deps.read_tracker.advance(&candidate.principal_id, &message.room_id, &message.message_id, now_unix());

    history
        .into_iter()
        .filter(|m| m.message_id != message.message_id)
        .map(|m| ContextMessage {
            sender: m.sender_username,
            sender_type: m.sender_kind,
            content: m.content,
            timestamp: m.timestamp,
        })
        .collect()
}

/// Fire-and-forget local side-channel for injecting text into a
/// co-located agent runtime — out of scope beyond this interface, since
/// there is no co-located runtime in this deployment, so the sink just
/// logs.
fn local_inject(candidate: &Agent, message: &InboundMessage, context: Vec<ContextMessage>) {
    println!(
        "💉 local-inject → {} [{} queued] room={} content={:?}",
        candidate.username,
        context.len(),
        message.room_id,
        message.content
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentStatus, ConnectionType, DeliveryMode, ReceiveMode, TrustLevel};

    fn candidate(username: &str, mention_key: &str) -> Agent {
        Agent {
            principal_id: format!("p-{username}"),
            username: username.to_string(),
            display_name: username.to_string(),
            emoji: String::new(),
            mention_key: mention_key.to_string(),
            trust_level: TrustLevel::Standard,
            receive_mode: ReceiveMode::Mentions,
            connection_type: ConnectionType::Webhook,
            delivery_mode: DeliveryMode::Webhook,
            webhook_url: None,
            webhook_secret: None,
            status: AgentStatus::Active,
            token: "tok".to_string(),
        }
    }

    #[test]
    fn mention_matches_mention_key_case_insensitive() {
        let bob = candidate("bob-the-agent", "bob");
        assert!(is_mentioned("hey @BOB status?", &bob));
        assert!(is_mentioned("hey @bob status?", &bob));
    }

    #[test]
    fn mention_matches_username_when_distinct_from_mention_key() {
        let bob = candidate("bob-the-agent", "bob");
        assert!(is_mentioned("hey @bob-the-agent status?", &bob));
    }

    #[test]
    fn mention_requires_at_prefix() {
        let bob = candidate("bob-the-agent", "bob");
        assert!(!is_mentioned("bob status?", &bob));
    }

    #[test]
    fn no_mention_when_neither_key_nor_username_present() {
        let bob = candidate("bob-the-agent", "bob");
        assert!(!is_mentioned("hey @carol status?", &bob));
    }
}
