use agent_gateway::config::Config;
use agent_gateway::models::{
    Agent, AgentStatus, ConnectionType, DeliveryMode, ReceiveMode, TrustLevel,
};
use rocket::local::blocking::Client;

/// Wrapper around `Client` that cleans up the throwaway per-test storage on
/// drop: a directory of flat files plus a SQLite file, removed recursively
/// once the test ends.
pub struct TestClient {
    client: Option<Client>,
    data_dir: String,
}

impl Drop for TestClient {
    fn drop(&mut self) {
        drop(self.client.take());
        std::fs::remove_dir_all(&self.data_dir).ok();
    }
}

impl std::ops::Deref for TestClient {
    type Target = Client;
    fn deref(&self) -> &Client {
        self.client.as_ref().unwrap()
    }
}

fn unique_dir(label: &str) -> String {
    format!(
        "/tmp/agent_gateway_test_{label}_{}",
        uuid::Uuid::new_v4().to_string().split('-').next().unwrap()
    )
}

/// One agent's token for callers that want to exercise an authenticated
/// route without reaching into the roster fixture themselves.
pub const BOB_TOKEN: &str = "tok-bob";
pub const CAROL_TOKEN: &str = "tok-carol-elevated";
pub const SUSPENDED_TOKEN: &str = "tok-zed-suspended";

fn fixture_agents() -> Vec<Agent> {
    vec![
        Agent {
            principal_id: "p-bob".to_string(),
            username: "bob".to_string(),
            display_name: "Bob".to_string(),
            emoji: "🤖".to_string(),
            mention_key: "bob".to_string(),
            trust_level: TrustLevel::Standard,
            receive_mode: ReceiveMode::Mentions,
            connection_type: ConnectionType::Webhook,
            delivery_mode: DeliveryMode::Webhook,
            webhook_url: Some("http://127.0.0.1:1/webhook".to_string()),
            webhook_secret: Some("shh".to_string()),
            status: AgentStatus::Active,
            token: BOB_TOKEN.to_string(),
        },
        Agent {
            principal_id: "p-carol".to_string(),
            username: "carol".to_string(),
            display_name: "Carol".to_string(),
            emoji: "🐱".to_string(),
            mention_key: "carol".to_string(),
            trust_level: TrustLevel::Elevated,
            receive_mode: ReceiveMode::All,
            connection_type: ConnectionType::Both,
            delivery_mode: DeliveryMode::Webhook,
            webhook_url: None,
            webhook_secret: None,
            status: AgentStatus::Active,
            token: CAROL_TOKEN.to_string(),
        },
        Agent {
            principal_id: "p-zed".to_string(),
            username: "zed".to_string(),
            display_name: "Zed".to_string(),
            emoji: "💤".to_string(),
            mention_key: "zed".to_string(),
            trust_level: TrustLevel::Standard,
            receive_mode: ReceiveMode::Mentions,
            connection_type: ConnectionType::Webhook,
            delivery_mode: DeliveryMode::Webhook,
            webhook_url: None,
            webhook_secret: None,
            status: AgentStatus::Suspended,
            token: SUSPENDED_TOKEN.to_string(),
        },
    ]
}

/// Build a gateway with every persisted path under a fresh temp directory
/// and an unreachable upstream, so `AgentRegistry::bootstrap`'s local-file
/// fallback runs immediately instead of depending on a live chat server.
pub fn test_client() -> TestClient {
    let data_dir = unique_dir("gw");
    std::fs::create_dir_all(&data_dir).expect("create temp data dir");

    let agent_config_path = format!("{data_dir}/agents.json");
    std::fs::write(
        &agent_config_path,
        serde_json::to_string(&fixture_agents()).unwrap(),
    )
    .expect("write fixture agent config");

    let config = Config {
        port: 0,
        upstream_base_url: "http://127.0.0.1:1".to_string(),
        upstream_gateway_token: "gateway-token".to_string(),
        upstream_gateway_username: "agent-gateway".to_string(),
        storage_path: format!("{data_dir}/gateway.db"),
        agent_config_path,
        read_tracker_path: format!("{data_dir}/read_tracker.json"),
        credential_cache_path: format!("{data_dir}/credential_cache.json"),
        metrics_log_path: format!("{data_dir}/metrics.jsonl"),
        standard_rate_limit_per_min: 10,
        elevated_rate_limit_per_min: 30,
    };

    let rocket = agent_gateway::build_with_config_blocking(config);
    let client = Client::tracked(rocket).expect("valid rocket instance");
    TestClient {
        client: Some(client),
        data_dir,
    }
}
