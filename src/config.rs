use std::env;

/// Gateway-wide configuration, loaded once at startup from environment
/// variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub upstream_base_url: String,
    pub upstream_gateway_token: String,
    pub upstream_gateway_username: String,
    pub storage_path: String,
    pub agent_config_path: String,
    pub read_tracker_path: String,
    pub credential_cache_path: String,
    pub metrics_log_path: String,
    pub standard_rate_limit_per_min: usize,
    pub elevated_rate_limit_per_min: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            upstream_base_url: "http://localhost:8000".to_string(),
            upstream_gateway_token: String::new(),
            upstream_gateway_username: "agent-gateway".to_string(),
            storage_path: "data/gateway.db".to_string(),
            agent_config_path: "data/agents.json".to_string(),
            read_tracker_path: "data/read_tracker.json".to_string(),
            credential_cache_path: "data/credential_cache.json".to_string(),
            metrics_log_path: "data/metrics.jsonl".to_string(),
            standard_rate_limit_per_min: 10,
            elevated_rate_limit_per_min: 30,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("GATEWAY_PORT")
            && let Ok(n) = val.parse::<u16>()
        {
            config.port = n;
        }
        if let Ok(val) = env::var("UPSTREAM_BASE_URL") {
            config.upstream_base_url = val;
        }
        if let Ok(val) = env::var("UPSTREAM_GATEWAY_TOKEN") {
            config.upstream_gateway_token = val;
        }
        if let Ok(val) = env::var("UPSTREAM_GATEWAY_USERNAME") {
            config.upstream_gateway_username = val;
        }
        if let Ok(val) = env::var("GATEWAY_STORAGE_PATH") {
            config.storage_path = val;
        }
        if let Ok(val) = env::var("AGENT_CONFIG_PATH") {
            config.agent_config_path = val;
        }
        if let Ok(val) = env::var("READ_TRACKER_PATH") {
            config.read_tracker_path = val;
        }
        if let Ok(val) = env::var("CREDENTIAL_CACHE_PATH") {
            config.credential_cache_path = val;
        }
        if let Ok(val) = env::var("METRICS_LOG_PATH") {
            config.metrics_log_path = val;
        }

        config
    }
}
