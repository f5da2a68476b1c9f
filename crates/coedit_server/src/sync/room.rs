use crate::sync::protocol::ServerMessage;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{RwLock, broadcast};
use tracing::{error, info};

/// Capacity of each room's broadcast channel
const BROADCAST_CAPACITY: usize = 1024;

/// A frame fanned out to a document's subscribers.
///
/// The sender tag identifies the originating session and is used purely to
/// filter it out of delivery; it grants no authority.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub sender: String,
    pub frame: Arc<String>,
}

/// Statistics about the live rooms
#[derive(Debug, Clone, Default)]
pub struct RoomStats {
    pub active_connections: usize,
    pub active_rooms: usize,
}

/// Global registry of document rooms
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<DocumentRoom>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the room for a document
    pub async fn get_or_create_room(&self, document_id: &str) -> Arc<DocumentRoom> {
        // Check if room exists
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(document_id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;

        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(document_id) {
            return room.clone();
        }

        let room = Arc::new(DocumentRoom::new(document_id));
        rooms.insert(document_id.to_string(), room.clone());
        info!("Created room for document: {}", document_id);

        room
    }

    /// Remove a room if it has no active connections
    pub async fn maybe_remove_room(&self, document_id: &str) {
        let mut rooms = self.rooms.write().await;

        if let Some(room) = rooms.get(document_id) {
            if room.connection_count() == 0 {
                rooms.remove(document_id);
                info!("Removed idle room: {}", document_id);
            }
        }
    }

    /// Get statistics about the live rooms
    pub async fn stats(&self) -> RoomStats {
        let rooms = self.rooms.read().await;
        let active_connections = rooms.values().map(|r| r.connection_count()).sum();

        RoomStats {
            active_connections,
            active_rooms: rooms.len(),
        }
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Broadcast group for a single document's sessions
pub struct DocumentRoom {
    document_id: String,
    broadcast_tx: broadcast::Sender<Outbound>,
    /// Number of active subscriptions
    connection_count: AtomicUsize,
}

impl DocumentRoom {
    fn new(document_id: &str) -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            document_id: document_id.to_string(),
            broadcast_tx,
            connection_count: AtomicUsize::new(0),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Subscribe to this room's fan-out
    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.connection_count.fetch_add(1, Ordering::SeqCst);
        self.broadcast_tx.subscribe()
    }

    /// Unsubscribe from this room's fan-out
    pub fn unsubscribe(&self) {
        self.connection_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// Get the number of active connections
    pub fn connection_count(&self) -> usize {
        self.connection_count.load(Ordering::SeqCst)
    }

    /// Fan a message out to every subscriber except the sending session.
    ///
    /// Delivery is best-effort: a send into an empty or lagging channel never
    /// blocks the caller.
    pub fn publish(&self, sender_session: &str, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => {
                let _ = self.broadcast_tx.send(Outbound {
                    sender: sender_session.to_string(),
                    frame: Arc::new(json),
                });
            }
            Err(e) => {
                error!(
                    "Failed to serialize broadcast for document {}: {}",
                    self.document_id, e
                );
            }
        }
    }
}
