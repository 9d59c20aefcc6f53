use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::metrics::Metrics;
use crate::models::Agent;

const REFRESH_INTERVAL_SECS: u64 = 60;

/// Immutable point-in-time index over the agent roster. Rebuilt wholesale
/// on every refresh and swapped in behind one write-lock acquisition so
/// readers never observe a partially-rebuilt index.
struct Snapshot {
    by_token: HashMap<String, Agent>,
    by_principal: HashMap<String, Agent>,
    by_username: HashMap<String, Agent>,
}

impl Snapshot {
    fn build(agents: Vec<Agent>) -> Self {
        let mut by_token = HashMap::with_capacity(agents.len());
        let mut by_principal = HashMap::with_capacity(agents.len());
        let mut by_username = HashMap::with_capacity(agents.len());
        for agent in agents {
            by_token.insert(agent.token.clone(), agent.clone());
            by_principal.insert(agent.principal_id.clone(), agent.clone());
            by_username.insert(agent.username.clone(), agent);
        }
        Snapshot {
            by_token,
            by_principal,
            by_username,
        }
    }
}

/// Loads and indexes the agent roster; authenticates bearer tokens in O(1).
///
/// `authenticate` must be called fresh on every request — its result must
/// not be cached across requests, since a refresh may drop or rotate a
/// token between calls. This is the core security property the registry
/// targets.
pub struct AgentRegistry {
    snapshot: RwLock<Arc<Snapshot>>,
}

impl AgentRegistry {
    /// Bootstrap: try the upstream endpoint once, fall back to the local
    /// file. Fails fast if neither source produces a roster, matching the
    /// teacher's fail-fast `Db::new` pattern for unrecoverable setup
    /// errors.
    pub async fn bootstrap(
        upstream_base_url: &str,
        upstream_token: &str,
        agent_config_path: &str,
    ) -> Result<Self, String> {
        let agents = match fetch_from_upstream(upstream_base_url, upstream_token).await {
            Ok(agents) => agents,
            Err(e) => {
                eprintln!("⚠️ Agent registry: upstream bootstrap failed ({e}), trying local file");
                load_from_file(agent_config_path)
                    .map_err(|fe| format!("no upstream and no local agent config: {fe}"))?
            }
        };

        Ok(Self::from_agents(agents))
    }

    /// Build a registry directly from an already-loaded roster, bypassing
    /// both network and file I/O — used by `bootstrap` after resolving a
    /// source, and by tests that don't need either.
    fn from_agents(agents: Vec<Agent>) -> Self {
        AgentRegistry {
            snapshot: RwLock::new(Arc::new(Snapshot::build(agents))),
        }
    }

    pub fn authenticate(&self, bearer: &str) -> Option<Agent> {
        let snapshot = self.snapshot.read().unwrap().clone();
        snapshot
            .by_token
            .get(bearer)
            .filter(|a| a.is_active())
            .cloned()
    }

    pub fn get_by_principal(&self, principal_id: &str) -> Option<Agent> {
        self.snapshot.read().unwrap().by_principal.get(principal_id).cloned()
    }

    pub fn get_by_username(&self, username: &str) -> Option<Agent> {
        self.snapshot.read().unwrap().by_username.get(username).cloned()
    }

    pub fn get_webhook_agents(&self) -> Vec<Agent> {
        self.snapshot
            .read()
            .unwrap()
            .by_principal
            .values()
            .filter(|a| matches!(a.connection_type, crate::models::ConnectionType::Webhook | crate::models::ConnectionType::Both))
            .cloned()
            .collect()
    }

    pub fn get_all(&self) -> Vec<Agent> {
        self.snapshot.read().unwrap().by_principal.values().cloned().collect()
    }

    /// Spawn the 60s refresh loop. A refresh failure never invalidates the
    /// current index; it only increments the staleness counters exposed on
    /// `metrics`.
    pub fn spawn_refresh_loop(self: Arc<Self>, upstream_base_url: String, upstream_token: String, metrics: Arc<Metrics>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(REFRESH_INTERVAL_SECS)).await;
                match fetch_from_upstream(&upstream_base_url, &upstream_token).await {
                    Ok(agents) => {
                        let snapshot = Arc::new(Snapshot::build(agents));
                        *self.snapshot.write().unwrap() = snapshot;
                        metrics.record_registry_refresh_ok();
                    }
                    Err(e) => {
                        eprintln!("⚠️ Agent registry: refresh failed, keeping prior snapshot ({e})");
                        metrics.record_registry_refresh_failure();
                    }
                }
            }
        });
    }
}

async fn fetch_from_upstream(base_url: &str, token: &str) -> Result<Vec<Agent>, String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| e.to_string())?;

    let resp = client
        .get(format!("{base_url}/api/v1/agents"))
        .bearer_auth(token)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if !resp.status().is_success() {
        return Err(format!("upstream returned {}", resp.status()));
    }

    resp.json::<Vec<Agent>>().await.map_err(|e| e.to_string())
}

fn load_from_file(path: &str) -> Result<Vec<Agent>, String> {
    let data = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&data).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AgentStatus, ConnectionType, DeliveryMode, ReceiveMode, TrustLevel};

    fn agent(principal_id: &str, token: &str, status: AgentStatus) -> Agent {
        Agent {
            principal_id: principal_id.to_string(),
            username: format!("user-{principal_id}"),
            display_name: principal_id.to_string(),
            emoji: String::new(),
            mention_key: principal_id.to_string(),
            trust_level: TrustLevel::Standard,
            receive_mode: ReceiveMode::Mentions,
            connection_type: ConnectionType::Webhook,
            delivery_mode: DeliveryMode::Webhook,
            webhook_url: None,
            webhook_secret: None,
            status,
            token: token.to_string(),
        }
    }

    #[test]
    fn authenticate_finds_active_agent_by_token() {
        let registry = AgentRegistry::from_agents(vec![agent("p1", "tok-1", AgentStatus::Active)]);
        let found = registry.authenticate("tok-1").expect("agent found");
        assert_eq!(found.principal_id, "p1");
    }

    #[test]
    fn authenticate_rejects_unknown_token() {
        let registry = AgentRegistry::from_agents(vec![agent("p1", "tok-1", AgentStatus::Active)]);
        assert!(registry.authenticate("tok-unknown").is_none());
    }

    #[test]
    fn authenticate_rejects_inactive_status() {
        let registry = AgentRegistry::from_agents(vec![agent("p1", "tok-1", AgentStatus::Suspended)]);
        assert!(registry.authenticate("tok-1").is_none());
    }

    #[test]
    fn refresh_replaces_index_atomically() {
        let registry = AgentRegistry::from_agents(vec![agent("p1", "tok-1", AgentStatus::Active)]);
        assert!(registry.authenticate("tok-1").is_some());

        // Simulate what `spawn_refresh_loop` does on a successful poll:
        // a token rotation drops the old token entirely.
        *registry.snapshot.write().unwrap() = Arc::new(Snapshot::build(vec![agent("p1", "tok-2", AgentStatus::Active)]));

        assert!(registry.authenticate("tok-1").is_none());
        assert!(registry.authenticate("tok-2").is_some());
    }

    #[test]
    fn get_by_principal_and_username_use_current_snapshot() {
        let registry = AgentRegistry::from_agents(vec![agent("p1", "tok-1", AgentStatus::Active)]);
        assert_eq!(registry.get_by_principal("p1").unwrap().token, "tok-1");
        assert_eq!(registry.get_by_username("user-p1").unwrap().principal_id, "p1");
        assert!(registry.get_by_principal("missing").is_none());
    }
}
