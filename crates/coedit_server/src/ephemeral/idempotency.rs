use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Tracks recently processed message ids to absorb client retransmits.
///
/// First line of defense for at-least-once delivery, ahead of the operation
/// log's deterministic-id dedup. Markers self-expire after a short TTL.
pub struct IdempotencyGuard {
    ttl: Duration,
    seen: Mutex<HashMap<String, Instant>>,
}

impl IdempotencyGuard {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Whether this message id was already processed within the TTL
    pub fn is_duplicate(&self, message_id: &str) -> bool {
        let mut seen = self.seen.lock().unwrap();
        match seen.get(message_id) {
            Some(expires_at) if *expires_at > Instant::now() => true,
            Some(_) => {
                seen.remove(message_id);
                false
            }
            None => false,
        }
    }

    /// Mark a message id as processed
    pub fn mark_processed(&self, message_id: &str) {
        let mut seen = self.seen.lock().unwrap();
        seen.insert(message_id.to_string(), Instant::now() + self.ttl);
    }

    /// Run `f` only if the message id has not been processed, then mark it.
    /// Returns the result (if run) and whether it was run.
    pub fn process_once<T>(&self, message_id: &str, f: impl FnOnce() -> T) -> (Option<T>, bool) {
        if self.is_duplicate(message_id) {
            return (None, false);
        }
        let result = f();
        self.mark_processed(message_id);
        (Some(result), true)
    }

    /// Drop all expired markers, returning how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut seen = self.seen.lock().unwrap();
        let before = seen.len();
        seen.retain(|_, expires_at| *expires_at > now);
        let removed = before - seen.len();
        if removed > 0 {
            debug!("Swept {} expired idempotency markers", removed);
        }
        removed
    }
}
