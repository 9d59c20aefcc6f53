use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::models::{SenderKind, TrustLevel};

const COOLDOWN: Duration = Duration::from_secs(30);
const RATE_WINDOW: Duration = Duration::from_secs(60);
const RATE_CAP: u32 = 5;
/// Sweep interval for stale pairs — not on the hot path.
const SWEEP_INTERVAL: Duration = Duration::from_secs(600);
const SWEEP_STALE_AFTER: Duration = Duration::from_secs(600);

struct PairState {
    last_exchange: Instant,
    window_start: Instant,
    count: u32,
}

/// Pure in-memory loop-guard policy: pairwise cooldown and rolling rate cap
/// for agent-to-agent traffic that was not a direct mention. Shaped
/// directly on this crate's own `RateLimiter`
/// (`Mutex<HashMap<String, Vec<Instant>>>`), but keyed by an unordered pair
/// and carrying a cooldown timestamp instead of a sliding window of
/// instants — a single last-exchange time plus a rolling count, not a full
/// history.
pub struct LoopGuard {
    pairs: Mutex<HashMap<(String, String), PairState>>,
}

impl Default for LoopGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopGuard {
    pub fn new() -> Self {
        LoopGuard {
            pairs: Mutex::new(HashMap::new()),
        }
    }

    fn pair_key(a: &str, b: &str) -> (String, String) {
        if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        }
    }

    /// Decide whether a delivery from `sender` to `target` is permitted.
    /// Only consulted when the candidate was *not* directly mentioned —
    /// callers must apply the mention-bypass themselves.
    pub fn allow(
        &self,
        sender_principal_id: &str,
        sender_kind: SenderKind,
        target_principal_id: &str,
        target_trust: TrustLevel,
    ) -> bool {
        if !matches!(sender_kind, SenderKind::Ai) {
            return true;
        }
        if sender_principal_id == target_principal_id {
            return false;
        }
        if matches!(target_trust, TrustLevel::Standard) {
            return false;
        }

        let now = Instant::now();
        let key = Self::pair_key(sender_principal_id, target_principal_id);
        let mut pairs = self.pairs.lock().unwrap();
        let entry = pairs.entry(key).or_insert_with(|| PairState {
            last_exchange: now - COOLDOWN - Duration::from_secs(1),
            window_start: now,
            count: 0,
        });

        if now.duration_since(entry.last_exchange) < COOLDOWN {
            return false;
        }

        if now.duration_since(entry.window_start) >= RATE_WINDOW {
            entry.window_start = now;
            entry.count = 0;
        }

        if entry.count >= RATE_CAP {
            return false;
        }

        entry.count += 1;
        entry.last_exchange = now;
        true
    }

    /// Drop pairs whose window reset time is long past.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut pairs = self.pairs.lock().unwrap();
        pairs.retain(|_, state| now.duration_since(state.window_start) < SWEEP_STALE_AFTER);
    }

    pub fn spawn_sweeper(self: std::sync::Arc<Self>) {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                self.sweep();
            }
        });
    }
}
