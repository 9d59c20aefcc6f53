use rusqlite::{params, Connection};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use crate::models::InboundMessage;

/// Retention window for event-log entries: 24 hours.
pub const EVENT_LOG_TTL_SECS: i64 = 24 * 3600;

/// Owns the gateway's own SQLite database: the resumable event log backing
/// SSE replay, and the idempotency cache for `/byoa/sse/messages`. This is
/// a distinct database from whatever the upstream chat server persists —
/// the bridge never touches this file.
pub struct Db {
    pub conn: Mutex<Connection>,
    next_event_id: AtomicI64,
}

impl Db {
    pub fn new(path: &str) -> Self {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path).expect("failed to open gateway storage");
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .expect("failed to set pragmas");
        let db = Db {
            conn: Mutex::new(conn),
            next_event_id: AtomicI64::new(0),
        };
        db.migrate();
        let seed = db.max_event_id();
        db.next_event_id.store(seed, Ordering::SeqCst);
        db
    }

    fn migrate(&self) {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS event_log (
                id INTEGER PRIMARY KEY,
                room_id TEXT NOT NULL,
                message_json TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_event_log_id ON event_log(id);
            CREATE INDEX IF NOT EXISTS idx_event_log_expires ON event_log(expires_at);

            CREATE TABLE IF NOT EXISTS idempotency_cache (
                principal_id TEXT NOT NULL,
                idempotency_key TEXT NOT NULL,
                result_json TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (principal_id, idempotency_key)
            );
            CREATE INDEX IF NOT EXISTS idx_idempotency_created ON idempotency_cache(created_at);",
        )
        .expect("failed to run gateway storage migrations");
    }

    fn max_event_id(&self) -> i64 {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT COALESCE(MAX(id), 0) FROM event_log", [], |r| r.get(0))
            .unwrap_or(0)
    }

    /// Allocate the next strictly-increasing event id and persist the entry
    /// before the caller writes it to the peer stream, so a crash between
    /// the two never produces a gap the peer can observe.
    pub fn append_event(&self, room_id: &str, message: &InboundMessage, now_unix: i64) -> i64 {
        let id = self.next_event_id.fetch_add(1, Ordering::SeqCst) + 1;
        let message_json = serde_json::to_string(message).unwrap_or_default();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO event_log (id, room_id, message_json, created_at, expires_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, room_id, message_json, now_unix, now_unix + EVENT_LOG_TTL_SECS],
        )
        .ok();
        id
    }

    /// Replay entries with `id > after_id`, ascending, regardless of room —
    /// the stream session itself decides which rooms it cares about if it
    /// ever becomes room-scoped; today the gateway fans every mention/all
    /// delivery to a single per-agent stream.
    pub fn replay_since(&self, after_id: i64, limit: i64) -> Vec<(i64, InboundMessage)> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = match conn.prepare(
            "SELECT id, message_json FROM event_log WHERE id > ?1 ORDER BY id ASC LIMIT ?2",
        ) {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };
        stmt.query_map(params![after_id, limit], |row| {
            let id: i64 = row.get(0)?;
            let json: String = row.get(1)?;
            Ok((id, json))
        })
        .ok()
        .map(|rows| {
            rows.filter_map(|r| r.ok())
                .filter_map(|(id, json)| {
                    serde_json::from_str::<InboundMessage>(&json)
                        .ok()
                        .map(|m| (id, m))
                })
                .collect()
        })
        .unwrap_or_default()
    }

    /// Drop event-log entries past their 24h TTL. Not on the hot path —
    /// called from a periodic sweep task.
    pub fn sweep_expired_events(&self, now_unix: i64) -> i64 {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM event_log WHERE expires_at < ?1", params![now_unix])
            .unwrap_or(0) as i64
    }

    pub fn get_idempotent(&self, principal_id: &str, key: &str) -> Option<String> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT result_json FROM idempotency_cache WHERE principal_id = ?1 AND idempotency_key = ?2",
            params![principal_id, key],
            |r| r.get(0),
        )
        .ok()
    }

    pub fn put_idempotent(&self, principal_id: &str, key: &str, result_json: &str, now_unix: i64) {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO idempotency_cache (principal_id, idempotency_key, result_json, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![principal_id, key, result_json, now_unix],
        )
        .ok();
    }

    /// Idempotency entries are kept for 1h.
    pub fn sweep_expired_idempotency(&self, now_unix: i64) -> i64 {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM idempotency_cache WHERE created_at < ?1",
            params![now_unix - 3600],
        )
        .unwrap_or(0) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SenderKind;

    fn temp_db() -> Db {
        let path = format!("/tmp/agent_gateway_test_db_{}.db", uuid::Uuid::new_v4());
        Db::new(&path)
    }

    fn sample_message(id: &str) -> InboundMessage {
        InboundMessage {
            message_id: id.to_string(),
            room_id: "room-1".to_string(),
            room_name: "general".to_string(),
            sender_username: "alice".to_string(),
            sender_principal_id: None,
            sender_kind: SenderKind::Human,
            content: "hello".to_string(),
            timestamp: "2026-07-27T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn event_ids_are_strictly_increasing() {
        let db = temp_db();
        let id1 = db.append_event("room-1", &sample_message("m1"), 0);
        let id2 = db.append_event("room-1", &sample_message("m2"), 0);
        let id3 = db.append_event("room-1", &sample_message("m3"), 0);
        assert!(id2 > id1);
        assert!(id3 > id2);
    }

    #[test]
    fn replay_since_returns_ascending_ids_after_cursor() {
        let db = temp_db();
        let id1 = db.append_event("room-1", &sample_message("m1"), 0);
        let id2 = db.append_event("room-1", &sample_message("m2"), 0);
        let id3 = db.append_event("room-1", &sample_message("m3"), 0);

        let replayed = db.replay_since(id1, 500);
        let ids: Vec<i64> = replayed.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![id2, id3]);
        assert_eq!(replayed[0].1.message_id, "m2");
        assert_eq!(replayed[1].1.message_id, "m3");
        assert_eq!(id3, id2 + 1);
    }

    #[test]
    fn replay_since_beyond_any_id_is_empty() {
        let db = temp_db();
        let id1 = db.append_event("room-1", &sample_message("m1"), 0);
        assert!(db.replay_since(id1 + 1000, 500).is_empty());
    }

    #[test]
    fn sweep_expired_events_drops_only_past_ttl() {
        let db = temp_db();
        db.append_event("room-1", &sample_message("old"), 1000);
        db.append_event("room-1", &sample_message("new"), 5000);
        // "old" expires at 1000 + TTL; past that horizon it should be swept.
        let pruned = db.sweep_expired_events(1000 + EVENT_LOG_TTL_SECS + 1);
        assert_eq!(pruned, 1);
        let remaining = db.replay_since(0, 500);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].1.message_id, "new");
    }

    #[test]
    fn idempotency_cache_round_trips_and_sweeps() {
        let db = temp_db();
        db.put_idempotent("agent-1", "key-1", r#"{"message_id":"m1","room_id":"r1"}"#, 1000);
        assert_eq!(
            db.get_idempotent("agent-1", "key-1"),
            Some(r#"{"message_id":"m1","room_id":"r1"}"#.to_string())
        );
        assert!(db.get_idempotent("agent-1", "key-missing").is_none());

        let pruned = db.sweep_expired_idempotency(1000 + 3600 + 1);
        assert_eq!(pruned, 1);
        assert!(db.get_idempotent("agent-1", "key-1").is_none());
    }
}
