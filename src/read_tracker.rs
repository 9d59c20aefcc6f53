use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadCursor {
    pub last_seen_message_id: String,
    pub updated_at: i64,
}

/// Durable (principal id, room id) → last-seen cursor, used to materialize
/// unread context on mention. Persisted as one JSON document rewritten
/// wholesale on each update — deliberately not the SQLite store behind
/// [`crate::db::Db`], the way the credential cache and metrics log are
/// also kept as flat files rather than tables.
pub struct ReadTracker {
    path: String,
    cursors: Mutex<HashMap<(String, String), ReadCursor>>,
}

type WireMap = HashMap<String, HashMap<String, ReadCursor>>;

impl ReadTracker {
    pub fn load(path: &str) -> Self {
        let cursors = std::fs::read_to_string(path)
            .ok()
            .and_then(|data| serde_json::from_str::<WireMap>(&data).ok())
            .map(|wire| {
                let mut map = HashMap::new();
                for (principal_id, rooms) in wire {
                    for (room_id, cursor) in rooms {
                        map.insert((principal_id.clone(), room_id), cursor);
                    }
                }
                map
            })
            .unwrap_or_default();

        ReadTracker {
            path: path.to_string(),
            cursors: Mutex::new(cursors),
        }
    }

    pub fn get(&self, principal_id: &str, room_id: &str) -> Option<ReadCursor> {
        self.cursors
            .lock()
            .unwrap()
            .get(&(principal_id.to_string(), room_id.to_string()))
            .cloned()
    }

    /// Advance the cursor and rewrite the document. Last-writer-wins;
    /// single-process gateway makes this safe without finer locking.
    pub fn advance(&self, principal_id: &str, room_id: &str, message_id: &str, now_unix: i64) {
        let mut cursors = self.cursors.lock().unwrap();
        cursors.insert(
            (principal_id.to_string(), room_id.to_string()),
            ReadCursor {
                last_seen_message_id: message_id.to_string(),
                updated_at: now_unix,
            },
        );
        self.write_locked(&cursors);
    }

    fn write_locked(&self, cursors: &HashMap<(String, String), ReadCursor>) {
        let mut wire: WireMap = HashMap::new();
        for ((principal_id, room_id), cursor) in cursors.iter() {
            wire.entry(principal_id.clone())
                .or_default()
                .insert(room_id.clone(), cursor.clone());
        }
        if let Some(parent) = std::path::Path::new(&self.path).parent() {
            std::fs::create_dir_all(parent).ok();
        }
        if let Ok(json) = serde_json::to_string_pretty(&wire) {
            std::fs::write(&self.path, json).ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> String {
        format!("/tmp/agent_gateway_test_read_tracker_{name}_{}.json", uuid::Uuid::new_v4())
    }

    #[test]
    fn missing_file_loads_empty() {
        let path = temp_path("missing");
        let tracker = ReadTracker::load(&path);
        assert!(tracker.get("agent-1", "room-1").is_none());
    }

    #[test]
    fn advance_then_get_round_trips() {
        let path = temp_path("roundtrip");
        let tracker = ReadTracker::load(&path);
        tracker.advance("agent-1", "room-1", "msg-103", 1_700_000_000);
        let cursor = tracker.get("agent-1", "room-1").expect("cursor present");
        assert_eq!(cursor.last_seen_message_id, "msg-103");
        assert_eq!(cursor.updated_at, 1_700_000_000);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn persists_across_reload() {
        let path = temp_path("persist");
        {
            let tracker = ReadTracker::load(&path);
            tracker.advance("agent-1", "room-1", "msg-5", 1_700_000_100);
        }
        let reloaded = ReadTracker::load(&path);
        let cursor = reloaded.get("agent-1", "room-1").expect("cursor present after reload");
        assert_eq!(cursor.last_seen_message_id, "msg-5");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn distinct_rooms_track_independently() {
        let path = temp_path("rooms");
        let tracker = ReadTracker::load(&path);
        tracker.advance("agent-1", "room-a", "msg-1", 1);
        tracker.advance("agent-1", "room-b", "msg-9", 2);
        assert_eq!(tracker.get("agent-1", "room-a").unwrap().last_seen_message_id, "msg-1");
        assert_eq!(tracker.get("agent-1", "room-b").unwrap().last_seen_message_id, "msg-9");
        std::fs::remove_file(&path).ok();
    }
}
