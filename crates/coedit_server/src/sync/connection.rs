use super::room::{DocumentRoom, Outbound};
use crate::sync::protocol::ServerMessage;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// One live connection's session state. Never persisted; the session id is
/// also the channel identity used to filter this session out of fan-out.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub document_id: String,
    pub user_id: String,
    pub display_name: String,
    pub color: String,
    pub created_at: DateTime<Utc>,
    /// Unix seconds of the last inbound message
    last_activity: AtomicI64,
}

impl Session {
    pub fn new(document_id: &str, user_id: &str, display_name: &str, color: &str) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            color: color.to_string(),
            created_at: now,
            last_activity: AtomicI64::new(now.timestamp()),
        }
    }

    /// Record inbound activity
    pub fn touch(&self) {
        self.last_activity.store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    /// Seconds since the last inbound message
    pub fn idle_seconds(&self) -> i64 {
        Utc::now().timestamp() - self.last_activity.load(Ordering::Relaxed)
    }
}

/// Represents a connected client subscribed to a document room
pub struct ClientConnection {
    pub session: Session,
    room: Arc<DocumentRoom>,
    broadcast_rx: broadcast::Receiver<Outbound>,
}

impl ClientConnection {
    /// Create a new client connection, subscribing it to the room
    pub fn new(session: Session, room: Arc<DocumentRoom>) -> Self {
        let broadcast_rx = room.subscribe();
        Self {
            session,
            room,
            broadcast_rx,
        }
    }

    /// Fan a message out to the rest of the room (never echoed back here)
    pub fn publish(&self, message: &ServerMessage) {
        self.room.publish(&self.session.id, message);
    }

    /// Receive the next broadcast frame originating from another session.
    ///
    /// Frames this session published are filtered out. A lagged receiver
    /// skips the dropped frames; with no resume protocol, the client's
    /// recovery path is to reconnect for a fresh initial sync.
    pub async fn recv_broadcast(&mut self) -> Option<Arc<String>> {
        loop {
            match self.broadcast_rx.recv().await {
                Ok(out) if out.sender == self.session.id => continue,
                Ok(out) => return Some(out.frame),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        "Session {} lagged {} broadcast frames on document {}",
                        self.session.id,
                        n,
                        self.session.document_id
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.room.unsubscribe();
        debug!(
            "Session closed: session={}, user={}, document={}",
            self.session.id, self.session.user_id, self.session.document_id
        );
    }
}
