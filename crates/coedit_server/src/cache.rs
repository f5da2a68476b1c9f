use crate::sync::protocol::DocumentState;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Cached read-view of document state for initial sync.
///
/// The sequencer invalidates an entry on every committed operation, so a hit
/// is never stale with respect to acknowledged versions.
pub struct DocumentCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (DocumentState, Instant)>>,
}

impl DocumentCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, document_id: &str) -> Option<DocumentState> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(document_id) {
            Some((state, cached_at)) if cached_at.elapsed() < self.ttl => Some(state.clone()),
            Some(_) => {
                entries.remove(document_id);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, document_id: &str, state: DocumentState) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(document_id.to_string(), (state, Instant::now()));
    }

    pub fn invalidate(&self, document_id: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(document_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(version: i64) -> DocumentState {
        DocumentState {
            document_id: "doc".to_string(),
            version,
            updates: Vec::new(),
        }
    }

    #[test]
    fn test_put_get_invalidate() {
        let cache = DocumentCache::new(Duration::from_secs(300));

        assert!(cache.get("doc").is_none());
        cache.put("doc", state(3));
        assert_eq!(cache.get("doc").unwrap().version, 3);

        cache.invalidate("doc");
        assert!(cache.get("doc").is_none());
    }

    #[test]
    fn test_entries_expire() {
        let cache = DocumentCache::new(Duration::from_millis(20));
        cache.put("doc", state(1));

        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get("doc").is_none());
    }
}
