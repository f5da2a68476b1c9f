use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// A non-expired presence entry, as reported to clients
#[derive(Debug, Clone, Serialize)]
pub struct PresenceEntry {
    pub user_id: String,
    pub display_name: String,
    pub color: String,
    pub cursor: Value,
    pub last_activity: f64,
}

/// One presence entry destined for the audit snapshot job
#[derive(Debug, Clone)]
pub struct PresenceSnapshot {
    pub document_id: String,
    pub user_id: String,
    pub state: Value,
}

#[derive(Debug)]
struct PresenceRecord {
    display_name: String,
    color: String,
    cursor: Value,
    awareness: Value,
    last_activity: f64,
    expires_at: Instant,
}

/// Ephemeral per-document awareness state, keyed by (document_id, user_id).
///
/// Entries self-expire: every read skips (and drops) entries past their TTL,
/// and a periodic sweep keeps memory bounded. Expiry never requires explicit
/// cleanup for correctness, only for promptness.
pub struct PresenceStore {
    ttl: Duration,
    entries: Mutex<HashMap<(String, String), PresenceRecord>>,
}

impl PresenceStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Add a user to a document's active set
    pub fn join(&self, document_id: &str, user_id: &str, display_name: &str, color: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            (document_id.to_string(), user_id.to_string()),
            PresenceRecord {
                display_name: display_name.to_string(),
                color: color.to_string(),
                cursor: json!({}),
                awareness: json!({}),
                last_activity: now_seconds(),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Overwrite the cursor blob and refresh the TTL
    pub fn update_cursor(&self, document_id: &str, user_id: &str, cursor: Value) {
        self.touch(document_id, user_id, |record| record.cursor = cursor);
    }

    /// Overwrite the awareness blob and refresh the TTL
    pub fn update_awareness(&self, document_id: &str, user_id: &str, state: Value) {
        self.touch(document_id, user_id, |record| record.awareness = state);
    }

    /// Refresh the TTL only (keep-alive)
    pub fn update_activity(&self, document_id: &str, user_id: &str) {
        self.touch(document_id, user_id, |_| {});
    }

    /// Remove a user from a document's active set
    pub fn leave(&self, document_id: &str, user_id: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(&(document_id.to_string(), user_id.to_string()));
    }

    /// All non-expired entries for a document.
    ///
    /// An entry observed past its TTL is dropped here and never returned.
    pub fn list_active(&self, document_id: &str) -> Vec<PresenceEntry> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|(doc, _), record| doc != document_id || record.expires_at > now);

        let mut active: Vec<PresenceEntry> = entries
            .iter()
            .filter(|((doc, _), _)| doc == document_id)
            .map(|((_, user_id), record)| PresenceEntry {
                user_id: user_id.clone(),
                display_name: record.display_name.clone(),
                color: record.color.clone(),
                cursor: record.cursor.clone(),
                last_activity: record.last_activity,
            })
            .collect();
        active.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        active
    }

    /// Drop all expired entries, returning how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, record| record.expires_at > now);
        let removed = before - entries.len();
        if removed > 0 {
            debug!("Swept {} expired presence entries", removed);
        }
        removed
    }

    /// Current non-expired entries for the off-path audit snapshot job
    pub fn snapshot(&self) -> Vec<PresenceSnapshot> {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .filter(|(_, record)| record.expires_at > now)
            .map(|((document_id, user_id), record)| PresenceSnapshot {
                document_id: document_id.clone(),
                user_id: user_id.clone(),
                state: json!({
                    "cursor": record.cursor,
                    "awareness": record.awareness,
                    "color": record.color,
                    "last_activity": record.last_activity,
                }),
            })
            .collect()
    }

    fn touch(&self, document_id: &str, user_id: &str, apply: impl FnOnce(&mut PresenceRecord)) {
        let mut entries = self.entries.lock().unwrap();
        if let Some(record) = entries.get_mut(&(document_id.to_string(), user_id.to_string())) {
            apply(record);
            record.last_activity = now_seconds();
            record.expires_at = Instant::now() + self.ttl;
        }
    }
}

fn now_seconds() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_and_list_active() {
        let store = PresenceStore::new(Duration::from_secs(60));
        store.join("doc", "u1", "Alice", "#ef4444");
        store.join("doc", "u2", "Bob", "#3b82f6");
        store.join("other", "u3", "Carol", "#10b981");

        let active = store.list_active("doc");
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].display_name, "Alice");
        assert_eq!(active[0].cursor, json!({}));
    }

    #[test]
    fn test_cursor_update_is_overwrite() {
        let store = PresenceStore::new(Duration::from_secs(60));
        store.join("doc", "u1", "Alice", "#ef4444");

        store.update_cursor("doc", "u1", json!({"position": 5, "selection": null}));
        store.update_cursor("doc", "u1", json!({"position": 9}));

        let active = store.list_active("doc");
        assert_eq!(active[0].cursor, json!({"position": 9}));
    }

    #[test]
    fn test_update_ignores_absent_entry() {
        let store = PresenceStore::new(Duration::from_secs(60));
        store.update_cursor("doc", "ghost", json!({"position": 1}));
        assert!(store.list_active("doc").is_empty());
    }

    #[test]
    fn test_leave_removes_entry() {
        let store = PresenceStore::new(Duration::from_secs(60));
        store.join("doc", "u1", "Alice", "#ef4444");
        store.leave("doc", "u1");
        assert!(store.list_active("doc").is_empty());
    }

    #[test]
    fn test_entries_expire_without_refresh() {
        let store = PresenceStore::new(Duration::from_millis(30));
        store.join("doc", "u1", "Alice", "#ef4444");
        assert_eq!(store.list_active("doc").len(), 1);

        std::thread::sleep(Duration::from_millis(50));
        assert!(store.list_active("doc").is_empty());
    }

    #[test]
    fn test_refresh_extends_ttl() {
        let store = PresenceStore::new(Duration::from_millis(80));
        store.join("doc", "u1", "Alice", "#ef4444");

        std::thread::sleep(Duration::from_millis(50));
        store.update_activity("doc", "u1");
        std::thread::sleep(Duration::from_millis(50));

        // Still active: the keep-alive reset the clock
        assert_eq!(store.list_active("doc").len(), 1);
    }

    #[test]
    fn test_sweep_drops_expired() {
        let store = PresenceStore::new(Duration::from_millis(20));
        store.join("doc", "u1", "Alice", "#ef4444");
        store.join("doc", "u2", "Bob", "#3b82f6");

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(store.sweep(), 2);
        assert_eq!(store.sweep(), 0);
    }

    #[test]
    fn test_snapshot_reflects_state() {
        let store = PresenceStore::new(Duration::from_secs(60));
        store.join("doc", "u1", "Alice", "#ef4444");
        store.update_cursor("doc", "u1", json!({"position": 3}));
        store.update_awareness("doc", "u1", json!({"selection": [1, 4]}));

        let snapshots = store.snapshot();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].document_id, "doc");
        assert_eq!(snapshots[0].state["cursor"], json!({"position": 3}));
        assert_eq!(snapshots[0].state["awareness"], json!({"selection": [1, 4]}));
    }
}
