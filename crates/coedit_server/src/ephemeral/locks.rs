use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug)]
struct Lease {
    owner_id: String,
    expires_at: Instant,
}

/// Advisory lease-based mutex per (document_id, block_id).
///
/// Coordinates which user is editing a block; it is not required for the
/// correctness of operation ordering. An owner that disconnects without
/// releasing loses the lock at lease expiry, with no cleanup handshake.
pub struct BlockLockManager {
    lease: Duration,
    locks: Mutex<HashMap<(String, String), Lease>>,
}

impl BlockLockManager {
    pub fn new(lease: Duration) -> Self {
        Self {
            lease,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Atomic set-if-absent with expiry: returns whether the caller became
    /// the owner. Re-acquiring a lock you already hold renews the lease.
    pub fn acquire(&self, document_id: &str, block_id: &str, owner_id: &str) -> bool {
        let now = Instant::now();
        let mut locks = self.locks.lock().unwrap();
        let key = (document_id.to_string(), block_id.to_string());

        if let Some(lease) = locks.get(&key) {
            if lease.expires_at > now && lease.owner_id != owner_id {
                return false;
            }
        }

        locks.insert(
            key,
            Lease {
                owner_id: owner_id.to_string(),
                expires_at: now + self.lease,
            },
        );
        true
    }

    /// Atomic compare-and-delete: removes the lock only if `owner_id` holds
    /// it. A non-owner release is a no-op, so a lock reassigned after an
    /// earlier lease expiry can never be released out from under its owner.
    pub fn release(&self, document_id: &str, block_id: &str, owner_id: &str) -> bool {
        let now = Instant::now();
        let mut locks = self.locks.lock().unwrap();
        let key = (document_id.to_string(), block_id.to_string());

        match locks.get(&key) {
            Some(lease) if lease.expires_at > now && lease.owner_id == owner_id => {
                locks.remove(&key);
                true
            }
            _ => false,
        }
    }

    /// Current owner of a block's lock, if the lease is live
    pub fn owner_of(&self, document_id: &str, block_id: &str) -> Option<String> {
        let now = Instant::now();
        let mut locks = self.locks.lock().unwrap();
        let key = (document_id.to_string(), block_id.to_string());

        match locks.get(&key) {
            Some(lease) if lease.expires_at > now => Some(lease.owner_id.clone()),
            Some(_) => {
                locks.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Drop all expired leases, returning how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut locks = self.locks.lock().unwrap();
        let before = locks.len();
        locks.retain(|_, lease| lease.expires_at > now);
        let removed = before - locks.len();
        if removed > 0 {
            debug!("Swept {} expired block locks", removed);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutual_exclusion() {
        let locks = BlockLockManager::new(Duration::from_secs(30));

        assert!(locks.acquire("doc", "b1", "alice"));
        assert!(!locks.acquire("doc", "b1", "bob"));
        assert_eq!(locks.owner_of("doc", "b1"), Some("alice".to_string()));

        // A different block is independent
        assert!(locks.acquire("doc", "b2", "bob"));
    }

    #[test]
    fn test_reacquire_renews_own_lease() {
        let locks = BlockLockManager::new(Duration::from_secs(30));
        assert!(locks.acquire("doc", "b1", "alice"));
        assert!(locks.acquire("doc", "b1", "alice"));
    }

    #[test]
    fn test_release_is_owner_checked() {
        let locks = BlockLockManager::new(Duration::from_secs(30));
        locks.acquire("doc", "b1", "alice");

        // Non-owner release is a no-op
        assert!(!locks.release("doc", "b1", "bob"));
        assert_eq!(locks.owner_of("doc", "b1"), Some("alice".to_string()));

        assert!(locks.release("doc", "b1", "alice"));
        assert_eq!(locks.owner_of("doc", "b1"), None);

        // Releasing an unheld lock is a no-op too
        assert!(!locks.release("doc", "b1", "alice"));
    }

    #[test]
    fn test_lease_expiry_frees_lock() {
        let locks = BlockLockManager::new(Duration::from_millis(30));
        assert!(locks.acquire("doc", "b1", "alice"));

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(locks.owner_of("doc", "b1"), None);
        assert!(locks.acquire("doc", "b1", "bob"));
    }

    #[test]
    fn test_release_after_expiry_cannot_steal() {
        let locks = BlockLockManager::new(Duration::from_millis(30));
        locks.acquire("doc", "b1", "alice");
        std::thread::sleep(Duration::from_millis(50));

        // Bob takes over after alice's lease lapsed; alice's stale release
        // must not remove bob's lock.
        assert!(locks.acquire("doc", "b1", "bob"));
        assert!(!locks.release("doc", "b1", "alice"));
        assert_eq!(locks.owner_of("doc", "b1"), Some("bob".to_string()));
    }

    #[test]
    fn test_sweep_drops_expired_leases() {
        let locks = BlockLockManager::new(Duration::from_millis(20));
        locks.acquire("doc", "b1", "alice");
        locks.acquire("doc", "b2", "bob");

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(locks.sweep(), 2);
    }
}
