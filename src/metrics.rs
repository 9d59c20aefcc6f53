use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

const FLUSH_INTERVAL_SECS: u64 = 60;

/// Operational counters for the gateway. Plain atomics rather than a
/// metrics-framework registry — there's no aggregation or export need
/// beyond the flat JSONL log and the human-readable report below.
#[derive(Default)]
pub struct Metrics {
    pub active_connections: AtomicU64,
    pub total_connections: AtomicU64,
    pub disconnects: AtomicU64,
    pub auth_failures: AtomicU64,
    pub token_revocation_while_connected: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_lost: AtomicU64,
    pub message_retries: AtomicU64,
    by_transport: Mutex<HashMap<&'static str, u64>>,
    pub registry_last_refresh_ok: AtomicBool,
    pub registry_consecutive_failures: AtomicU64,
}

#[derive(Serialize)]
pub struct MetricsSnapshot {
    pub active_connections: u64,
    pub total_connections: u64,
    pub disconnects: u64,
    pub auth_failures: u64,
    pub token_revocation_while_connected: u64,
    pub messages_sent: u64,
    pub messages_lost: u64,
    pub message_retries: u64,
    pub agents_by_transport: HashMap<String, u64>,
    pub registry_last_refresh_ok: bool,
    pub registry_consecutive_failures: u64,
    pub snapshot_time: String,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connect(&self, transport: &'static str) {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
        self.total_connections.fetch_add(1, Ordering::SeqCst);
        let mut by_transport = self.by_transport.lock().unwrap();
        *by_transport.entry(transport).or_insert(0) += 1;
    }

    pub fn record_disconnect(&self, transport: &'static str) {
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        let mut by_transport = self.by_transport.lock().unwrap();
        if let Some(count) = by_transport.get_mut(transport) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_revocation_while_connected(&self) {
        self.token_revocation_while_connected.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_message_sent(&self) {
        self.messages_sent.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_message_lost(&self) {
        self.messages_lost.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_retry(&self) {
        self.message_retries.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_registry_refresh_ok(&self) {
        self.registry_last_refresh_ok.store(true, Ordering::SeqCst);
        self.registry_consecutive_failures.store(0, Ordering::SeqCst);
    }

    pub fn record_registry_refresh_failure(&self) {
        self.registry_last_refresh_ok.store(false, Ordering::SeqCst);
        self.registry_consecutive_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let by_transport = self
            .by_transport
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();

        MetricsSnapshot {
            active_connections: self.active_connections.load(Ordering::SeqCst),
            total_connections: self.total_connections.load(Ordering::SeqCst),
            disconnects: self.disconnects.load(Ordering::SeqCst),
            auth_failures: self.auth_failures.load(Ordering::SeqCst),
            token_revocation_while_connected: self
                .token_revocation_while_connected
                .load(Ordering::SeqCst),
            messages_sent: self.messages_sent.load(Ordering::SeqCst),
            messages_lost: self.messages_lost.load(Ordering::SeqCst),
            message_retries: self.message_retries.load(Ordering::SeqCst),
            agents_by_transport: by_transport,
            registry_last_refresh_ok: self.registry_last_refresh_ok.load(Ordering::SeqCst),
            registry_consecutive_failures: self.registry_consecutive_failures.load(Ordering::SeqCst),
            snapshot_time: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn human_report(&self) -> String {
        let s = self.snapshot();
        format!(
            "Agent Gateway — {}\n\
             active connections: {}\n\
             total connections:  {}\n\
             disconnects:        {}\n\
             auth failures:      {}\n\
             revocation-while-connected: {}\n\
             messages sent:      {}\n\
             messages lost:      {}\n\
             message retries:    {}\n\
             registry last refresh ok: {}\n\
             registry consecutive failures: {}\n",
            s.snapshot_time,
            s.active_connections,
            s.total_connections,
            s.disconnects,
            s.auth_failures,
            s.token_revocation_while_connected,
            s.messages_sent,
            s.messages_lost,
            s.message_retries,
            s.registry_last_refresh_ok,
            s.registry_consecutive_failures,
        )
    }

    fn flush_to_disk(&self, path: &str) {
        let snapshot = self.snapshot();
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let Ok(line) = serde_json::to_string(&snapshot) else {
            return;
        };
        use std::io::Write;
        if let Ok(mut file) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
            let _ = writeln!(file, "{line}");
        }
    }

    /// Flush once immediately, for shutdown.
    pub fn flush_now(&self, path: &str) {
        self.flush_to_disk(path);
    }

    pub fn spawn_flush_loop(self: std::sync::Arc<Self>, path: String) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(std::time::Duration::from_secs(FLUSH_INTERVAL_SECS)).await;
                self.flush_to_disk(&path);
            }
        });
    }
}
