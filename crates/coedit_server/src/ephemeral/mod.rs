//! TTL-bound in-memory state: presence, block locks, and idempotency markers.
//!
//! Each store exposes only single-step atomic operations (set-if-absent,
//! compare-and-delete, refresh) so no caller ever needs a multi-step
//! transaction, and every entry expires on its own.

mod idempotency;
mod locks;
mod presence;

pub use idempotency::IdempotencyGuard;
pub use locks::BlockLockManager;
pub use presence::{PresenceEntry, PresenceSnapshot, PresenceStore};
