use crate::ephemeral::PresenceEntry;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Inbound envelope: `{type, id?, data}`.
///
/// The optional `id` is the client's message id, consulted by the
/// idempotency guard and folded into the deterministic operation id.
#[derive(Debug, Deserialize)]
pub struct ClientEnvelope {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(flatten)]
    pub message: ClientMessage,
}

/// The closed set of inbound message kinds.
///
/// Anything else fails deserialization, so "unknown type" is a malformed
/// message rather than a dispatch branch.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "operation")]
    Operation(OperationSubmit),
    #[serde(rename = "cursor")]
    Cursor(CursorData),
    #[serde(rename = "awareness")]
    Awareness(AwarenessData),
    #[serde(rename = "block.lock")]
    BlockLock(BlockRef),
    #[serde(rename = "block.unlock")]
    BlockUnlock(BlockRef),
    #[serde(rename = "typing.start")]
    TypingStart(TypingRef),
    #[serde(rename = "typing.stop")]
    TypingStop(TypingRef),
    #[serde(rename = "ping")]
    Ping,
}

/// `operation` message data
#[derive(Debug, Clone, Deserialize)]
pub struct OperationSubmit {
    pub operation: OperationInput,
    /// The version the client believes it is at; informational only — the
    /// server assigns the authoritative version.
    #[serde(default)]
    pub version: Option<i64>,
}

/// The operation itself: an opaque hex-encoded payload plus its kind
#[derive(Debug, Clone, Deserialize)]
pub struct OperationInput {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub payload: Option<String>,
    /// Client-chosen id for this submission, used for storage-level dedup
    #[serde(default)]
    pub client_id: Option<String>,
}

/// `cursor` message data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorData {
    #[serde(default)]
    pub position: Option<Value>,
    #[serde(default)]
    pub selection: Option<Value>,
    #[serde(default)]
    pub block_id: Option<String>,
}

/// `awareness` message data
#[derive(Debug, Clone, Deserialize)]
pub struct AwarenessData {
    #[serde(default)]
    pub state: Value,
}

/// `block.lock` / `block.unlock` message data
#[derive(Debug, Clone, Deserialize)]
pub struct BlockRef {
    pub block_id: String,
}

/// `typing.start` / `typing.stop` message data
#[derive(Debug, Clone, Deserialize)]
pub struct TypingRef {
    #[serde(default)]
    pub block_id: Option<String>,
}

/// Outbound messages, in the exact wire shapes clients expect.
///
/// Relays wrap their payload in `data`; `operation.ack`, `pong` and `error`
/// carry their fields at the top level.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "connection.established")]
    ConnectionEstablished { data: InitialSync },
    #[serde(rename = "operation.ack")]
    OperationAck { id: Option<String>, version: i64 },
    #[serde(rename = "operation")]
    Operation { data: OperationBroadcast },
    #[serde(rename = "cursor.update")]
    CursorUpdate { data: CursorBroadcast },
    #[serde(rename = "awareness")]
    Awareness { data: AwarenessBroadcast },
    #[serde(rename = "user.joined")]
    UserJoined { data: JoinedUser },
    #[serde(rename = "user.left")]
    UserLeft { data: UserRef },
    #[serde(rename = "block.locked")]
    BlockLocked { data: BlockEvent },
    #[serde(rename = "block.unlocked")]
    BlockUnlocked { data: BlockEvent },
    #[serde(rename = "typing.start")]
    TypingStart { data: TypingEvent },
    #[serde(rename = "typing.stop")]
    TypingStop { data: TypingEvent },
    #[serde(rename = "pong")]
    Pong { timestamp: String },
    #[serde(rename = "error")]
    Error { error: ErrorBody },
}

impl ServerMessage {
    /// Per-message error reply; the connection stays open
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: ErrorBody {
                message: message.into(),
            },
        }
    }
}

/// Initial-sync payload sent on `connection.established`
#[derive(Debug, Clone, Serialize)]
pub struct InitialSync {
    pub session_id: String,
    pub user_color: String,
    pub document_state: DocumentState,
    pub active_users: Vec<PresenceEntry>,
}

/// Read-view of a document: authoritative version plus a recent window of
/// operations for client-side sync
#[derive(Debug, Clone, Serialize)]
pub struct DocumentState {
    pub document_id: String,
    pub version: i64,
    pub updates: Vec<OperationSummary>,
}

/// One operation in a sync payload, payload hex-encoded for JSON transport
#[derive(Debug, Clone, Serialize)]
pub struct OperationSummary {
    pub operation_id: String,
    pub version: i64,
    pub payload: String,
    pub timestamp: i64,
}

/// An operation relayed to the rest of the document group
#[derive(Debug, Clone, Serialize)]
pub struct OperationBroadcast {
    pub operation: RelayedOperation,
    pub version: i64,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayedOperation {
    pub id: String,
    pub payload: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CursorBroadcast {
    pub user_id: String,
    pub cursor: CursorData,
}

#[derive(Debug, Clone, Serialize)]
pub struct AwarenessBroadcast {
    pub user_id: String,
    pub state: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinedUser {
    pub user_id: String,
    pub display_name: String,
    pub color: String,
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserRef {
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockEvent {
    pub block_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TypingEvent {
    pub user_id: String,
    pub block_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_operation_envelope() {
        let envelope: ClientEnvelope = serde_json::from_str(
            r#"{"type":"operation","id":"m1","data":{"operation":{"type":"update","payload":"deadbeef","client_id":"c1"},"version":4}}"#,
        )
        .unwrap();

        assert_eq!(envelope.id.as_deref(), Some("m1"));
        match envelope.message {
            ClientMessage::Operation(submit) => {
                assert_eq!(submit.operation.kind.as_deref(), Some("update"));
                assert_eq!(submit.operation.payload.as_deref(), Some("deadbeef"));
                assert_eq!(submit.operation.client_id.as_deref(), Some("c1"));
                assert_eq!(submit.version, Some(4));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_parse_each_kind() {
        let frames = [
            r#"{"type":"cursor","data":{"position":5,"block_id":"b1"}}"#,
            r#"{"type":"awareness","data":{"state":{"selection":[1,2]}}}"#,
            r#"{"type":"block.lock","data":{"block_id":"b1"}}"#,
            r#"{"type":"block.unlock","data":{"block_id":"b1"}}"#,
            r#"{"type":"typing.start","data":{"block_id":"b1"}}"#,
            r#"{"type":"typing.stop","data":{}}"#,
            r#"{"type":"ping"}"#,
        ];
        for frame in frames {
            let parsed: Result<ClientEnvelope, _> = serde_json::from_str(frame);
            assert!(parsed.is_ok(), "failed to parse {frame}");
        }
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let parsed: Result<ClientEnvelope, _> =
            serde_json::from_str(r#"{"type":"subscribe","data":{}}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_missing_block_id_is_rejected() {
        let parsed: Result<ClientEnvelope, _> =
            serde_json::from_str(r#"{"type":"block.lock","data":{}}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_ack_shape() {
        let ack = ServerMessage::OperationAck {
            id: Some("m1".to_string()),
            version: 7,
        };
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({"type": "operation.ack", "id": "m1", "version": 7})
        );
    }

    #[test]
    fn test_relay_is_data_wrapped() {
        let relay = ServerMessage::Operation {
            data: OperationBroadcast {
                operation: RelayedOperation {
                    id: "op1".to_string(),
                    payload: "deadbeef".to_string(),
                },
                version: 2,
                user_id: "u1".to_string(),
            },
        };
        assert_eq!(
            serde_json::to_value(&relay).unwrap(),
            json!({
                "type": "operation",
                "data": {
                    "operation": {"id": "op1", "payload": "deadbeef"},
                    "version": 2,
                    "user_id": "u1"
                }
            })
        );
    }

    #[test]
    fn test_error_shape() {
        let error = ServerMessage::error("Invalid message");
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({"type": "error", "error": {"message": "Invalid message"}})
        );
    }
}
