use crate::error::SubmitError;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use sha2::{Digest, Sha256};
use std::sync::{Arc, Mutex};

/// User information
#[derive(Debug, Clone)]
pub struct UserInfo {
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

/// Session information
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub token: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Document information
#[derive(Debug, Clone)]
pub struct DocumentInfo {
    pub id: String,
    pub title: String,
    pub current_version: i64,
    pub last_edited_by: Option<String>,
    pub last_edited_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A member's role on a document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Viewer,
    Editor,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Editor => "editor",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "viewer" => Some(Role::Viewer),
            "editor" => Some(Role::Editor),
            _ => None,
        }
    }

    /// Whether this role may submit operations and take block locks
    pub fn can_edit(&self) -> bool {
        matches!(self, Role::Editor)
    }
}

/// A persisted operation row
#[derive(Debug, Clone)]
pub struct OperationRecord {
    pub operation_id: String,
    pub document_id: String,
    pub author_id: String,
    pub kind: String,
    pub payload: Vec<u8>,
    pub version: i64,
    pub client_message_id: Option<String>,
    pub timestamp: i64,
}

/// Result of a committed append
#[derive(Debug, Clone)]
pub struct AppendedOperation {
    pub operation_id: String,
    pub version: i64,
    pub timestamp: i64,
}

/// Identity and permission repository
#[derive(Clone)]
pub struct AuthRepo {
    conn: Arc<Mutex<Connection>>,
}

impl AuthRepo {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    // ===== User operations =====

    /// Create a user, returning its id
    pub fn create_user(&self, email: &str, display_name: &str) -> Result<String, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO users (id, email, display_name, created_at) VALUES (?, ?, ?, ?)",
            params![id, email, display_name, Utc::now().timestamp()],
        )?;
        Ok(id)
    }

    /// Get a user by ID
    pub fn get_user(&self, user_id: &str) -> Result<Option<UserInfo>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, email, display_name, created_at, last_login_at FROM users WHERE id = ?",
            [user_id],
            |row| {
                Ok(UserInfo {
                    id: row.get(0)?,
                    email: row.get(1)?,
                    display_name: row.get(2)?,
                    created_at: timestamp_to_datetime(row.get(3)?),
                    last_login_at: row.get::<_, Option<i64>>(4)?.map(timestamp_to_datetime),
                })
            },
        )
        .optional()
    }

    /// Record a successful authentication
    pub fn touch_last_login(&self, user_id: &str) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE users SET last_login_at = ? WHERE id = ?",
            params![Utc::now().timestamp(), user_id],
        )?;
        Ok(())
    }

    // ===== Session operations =====

    /// Create a session token for a user
    pub fn create_session(
        &self,
        user_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<String, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let token = uuid::Uuid::new_v4().simple().to_string();
        conn.execute(
            "INSERT INTO auth_sessions (token, user_id, expires_at, created_at) VALUES (?, ?, ?, ?)",
            params![token, user_id, expires_at.timestamp(), Utc::now().timestamp()],
        )?;
        Ok(token)
    }

    /// Validate a session token, returning the session if current
    pub fn validate_session(&self, token: &str) -> Result<Option<SessionInfo>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT token, user_id, expires_at, created_at FROM auth_sessions
             WHERE token = ? AND expires_at > ?",
            params![token, Utc::now().timestamp()],
            |row| {
                Ok(SessionInfo {
                    token: row.get(0)?,
                    user_id: row.get(1)?,
                    expires_at: timestamp_to_datetime(row.get(2)?),
                    created_at: timestamp_to_datetime(row.get(3)?),
                })
            },
        )
        .optional()
    }

    /// Delete expired session tokens, returning the number removed
    pub fn cleanup_expired_sessions(&self) -> Result<usize, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM auth_sessions WHERE expires_at <= ?",
            params![Utc::now().timestamp()],
        )
    }

    // ===== Permission operations =====

    /// Grant (or change) a user's role on a document
    pub fn grant_role(
        &self,
        document_id: &str,
        user_id: &str,
        role: Role,
    ) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO document_members (document_id, user_id, role) VALUES (?, ?, ?)
             ON CONFLICT (document_id, user_id) DO UPDATE SET role = excluded.role",
            params![document_id, user_id, role.as_str()],
        )?;
        Ok(())
    }

    /// Get a user's role on a document, if any
    pub fn document_role(
        &self,
        document_id: &str,
        user_id: &str,
    ) -> Result<Option<Role>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let role: Option<String> = conn
            .query_row(
                "SELECT role FROM document_members WHERE document_id = ? AND user_id = ?",
                params![document_id, user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(role.as_deref().and_then(Role::from_str))
    }
}

/// Document and operation-log repository
#[derive(Clone)]
pub struct DocumentRepo {
    conn: Arc<Mutex<Connection>>,
}

impl DocumentRepo {
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    // ===== Document operations =====

    /// Create a document at version 0, returning its id
    pub fn create_document(&self, title: &str) -> Result<String, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let id = uuid::Uuid::new_v4().to_string();
        conn.execute(
            "INSERT INTO documents (id, title, current_version, created_at) VALUES (?, ?, 0, ?)",
            params![id, title, Utc::now().timestamp()],
        )?;
        Ok(id)
    }

    /// Get a document by ID
    pub fn get_document(&self, document_id: &str) -> Result<Option<DocumentInfo>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, title, current_version, last_edited_by, last_edited_at, created_at
             FROM documents WHERE id = ?",
            [document_id],
            |row| {
                Ok(DocumentInfo {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    current_version: row.get(2)?,
                    last_edited_by: row.get(3)?,
                    last_edited_at: row.get::<_, Option<i64>>(4)?.map(timestamp_to_datetime),
                    created_at: timestamp_to_datetime(row.get(5)?),
                })
            },
        )
        .optional()
    }

    /// List all document ids (for the out-of-band compaction pass)
    pub fn list_document_ids(&self) -> Result<Vec<String>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id FROM documents")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    // ===== Operation log =====

    /// Append an operation and advance the document version in one atomic unit.
    ///
    /// Runs as a single IMMEDIATE transaction: the write lock it takes is what
    /// serializes version assignment across processes sharing the database.
    /// On any failure the transaction aborts and the counter does not advance.
    pub fn append_operation(
        &self,
        document_id: &str,
        author_id: &str,
        kind: &str,
        payload: &[u8],
        client_message_id: Option<&str>,
    ) -> Result<AppendedOperation, SubmitError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current_version: i64 = tx
            .query_row(
                "SELECT current_version FROM documents WHERE id = ?",
                [document_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(SubmitError::DocumentNotFound)?;

        // A resubmission carrying the same client message id is the same
        // logical operation, whatever version it would now be assigned.
        if let Some(message_id) = client_message_id {
            let resubmitted: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM operations
                 WHERE document_id = ? AND author_id = ? AND client_message_id = ?)",
                params![document_id, author_id, message_id],
                |row| row.get(0),
            )?;
            if resubmitted {
                return Err(SubmitError::DuplicateOperation);
            }
        }

        let version = current_version + 1;
        let operation_id =
            derive_operation_id(document_id, author_id, client_message_id.unwrap_or(""), version);

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM operations WHERE operation_id = ?)",
            [&operation_id],
            |row| row.get(0),
        )?;
        if exists {
            return Err(SubmitError::DuplicateOperation);
        }

        let now = Utc::now();
        let timestamp = now.timestamp_micros();
        tx.execute(
            "INSERT INTO operations
             (operation_id, document_id, author_id, kind, payload, version, client_message_id, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                operation_id,
                document_id,
                author_id,
                kind,
                payload,
                version,
                client_message_id,
                timestamp
            ],
        )?;
        tx.execute(
            "UPDATE documents SET current_version = ?, last_edited_by = ?, last_edited_at = ?
             WHERE id = ?",
            params![version, author_id, now.timestamp(), document_id],
        )?;

        tx.commit()?;

        Ok(AppendedOperation {
            operation_id,
            version,
            timestamp,
        })
    }

    /// Operations with version > `after_version`, ascending, at most `limit`
    pub fn operations_since(
        &self,
        document_id: &str,
        after_version: i64,
        limit: usize,
    ) -> Result<Vec<OperationRecord>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT operation_id, document_id, author_id, kind, payload, version,
                    client_message_id, timestamp
             FROM operations
             WHERE document_id = ? AND version > ?
             ORDER BY version ASC, timestamp ASC
             LIMIT ?",
        )?;
        let rows = stmt
            .query_map(params![document_id, after_version, limit as i64], row_to_operation)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The most recent `limit` operations, in ascending version order
    pub fn recent_operations(
        &self,
        document_id: &str,
        limit: usize,
    ) -> Result<Vec<OperationRecord>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT operation_id, document_id, author_id, kind, payload, version,
                    client_message_id, timestamp
             FROM operations
             WHERE document_id = ?
             ORDER BY version DESC
             LIMIT ?",
        )?;
        let mut rows = stmt
            .query_map(params![document_id, limit as i64], row_to_operation)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    /// The oldest retained version for a document, if any operations remain
    pub fn min_retained_version(
        &self,
        document_id: &str,
    ) -> Result<Option<i64>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT MIN(version) FROM operations WHERE document_id = ?",
            [document_id],
            |row| row.get::<_, Option<i64>>(0),
        )
    }

    /// Number of retained operations for a document
    pub fn count_operations(&self, document_id: &str) -> Result<usize, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM operations WHERE document_id = ?",
            [document_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Drop all but the most recent `retain` operations once the log exceeds
    /// `threshold`. Returns the number of rows deleted.
    pub fn compact_operations(
        &self,
        document_id: &str,
        threshold: usize,
        retain: usize,
    ) -> Result<usize, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM operations WHERE document_id = ?",
            [document_id],
            |row| row.get(0),
        )?;
        if count as usize <= threshold {
            return Ok(0);
        }

        let max_version: i64 = conn.query_row(
            "SELECT MAX(version) FROM operations WHERE document_id = ?",
            [document_id],
            |row| row.get(0),
        )?;
        conn.execute(
            "DELETE FROM operations WHERE document_id = ? AND version <= ?",
            params![document_id, max_version - retain as i64],
        )
    }

    // ===== Presence snapshots =====

    /// Upsert an audit snapshot of one presence entry
    pub fn upsert_presence_snapshot(
        &self,
        document_id: &str,
        user_id: &str,
        state: &str,
    ) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO presence_snapshots (id, document_id, user_id, state, updated_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
            params![
                format!("{document_id}:{user_id}"),
                document_id,
                user_id,
                state,
                Utc::now().timestamp()
            ],
        )?;
        Ok(())
    }
}

fn row_to_operation(row: &rusqlite::Row<'_>) -> Result<OperationRecord, rusqlite::Error> {
    Ok(OperationRecord {
        operation_id: row.get(0)?,
        document_id: row.get(1)?,
        author_id: row.get(2)?,
        kind: row.get(3)?,
        payload: row.get(4)?,
        version: row.get(5)?,
        client_message_id: row.get(6)?,
        timestamp: row.get(7)?,
    })
}

/// Deterministic operation id: two submissions with identical inputs yield
/// the same id, enabling storage-level dedup below the idempotency guard.
pub fn derive_operation_id(
    document_id: &str,
    author_id: &str,
    client_message_id: &str,
    version: i64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{document_id}:{author_id}:{client_message_id}:{version}").as_bytes());
    hex::encode(hasher.finalize())[..32].to_string()
}

/// Convert Unix timestamp to DateTime<Utc>
fn timestamp_to_datetime(timestamp: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(timestamp, 0).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_database;

    fn setup() -> (AuthRepo, DocumentRepo) {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();
        let conn = Arc::new(Mutex::new(conn));
        (AuthRepo::new(conn.clone()), DocumentRepo::new(conn))
    }

    #[test]
    fn test_user_and_session_flow() {
        let (auth, _) = setup();

        let user_id = auth.create_user("alice@example.com", "Alice").unwrap();
        let user = auth.get_user(&user_id).unwrap().unwrap();
        assert_eq!(user.email, "alice@example.com");
        assert_eq!(user.display_name, "Alice");

        let token = auth
            .create_session(&user_id, Utc::now() + chrono::Duration::days(30))
            .unwrap();
        let session = auth.validate_session(&token).unwrap().unwrap();
        assert_eq!(session.user_id, user_id);

        // Unknown tokens do not validate
        assert!(auth.validate_session("bogus").unwrap().is_none());
    }

    #[test]
    fn test_expired_sessions_are_rejected_and_cleaned() {
        let (auth, _) = setup();
        let user_id = auth.create_user("bob@example.com", "Bob").unwrap();

        let token = auth
            .create_session(&user_id, Utc::now() - chrono::Duration::minutes(1))
            .unwrap();
        assert!(auth.validate_session(&token).unwrap().is_none());

        let removed = auth.cleanup_expired_sessions().unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn test_document_roles() {
        let (auth, docs) = setup();
        let user_id = auth.create_user("carol@example.com", "Carol").unwrap();
        let doc_id = docs.create_document("Notes").unwrap();

        assert!(auth.document_role(&doc_id, &user_id).unwrap().is_none());

        auth.grant_role(&doc_id, &user_id, Role::Viewer).unwrap();
        let role = auth.document_role(&doc_id, &user_id).unwrap().unwrap();
        assert_eq!(role, Role::Viewer);
        assert!(!role.can_edit());

        // Upgrading the role overwrites the row
        auth.grant_role(&doc_id, &user_id, Role::Editor).unwrap();
        let role = auth.document_role(&doc_id, &user_id).unwrap().unwrap();
        assert!(role.can_edit());
    }

    #[test]
    fn test_append_assigns_sequential_versions() {
        let (auth, docs) = setup();
        let user_id = auth.create_user("dave@example.com", "Dave").unwrap();
        let doc_id = docs.create_document("Draft").unwrap();

        for expected in 1..=5 {
            let appended = docs
                .append_operation(&doc_id, &user_id, "update", b"payload", None)
                .unwrap();
            assert_eq!(appended.version, expected);
        }

        let doc = docs.get_document(&doc_id).unwrap().unwrap();
        assert_eq!(doc.current_version, 5);
        assert_eq!(doc.last_edited_by.as_deref(), Some(user_id.as_str()));
    }

    #[test]
    fn test_append_rejects_duplicate_message_id() {
        let (auth, docs) = setup();
        let user_id = auth.create_user("erin@example.com", "Erin").unwrap();
        let doc_id = docs.create_document("Draft").unwrap();

        let first = docs
            .append_operation(&doc_id, &user_id, "update", b"p", Some("m1"))
            .unwrap();
        assert_eq!(first.version, 1);

        // A retransmit must not consume a version
        let second = docs.append_operation(&doc_id, &user_id, "update", b"p", Some("m1"));
        assert!(matches!(second, Err(SubmitError::DuplicateOperation)));
        assert_eq!(docs.get_document(&doc_id).unwrap().unwrap().current_version, 1);

        // The same message id from a different author is a different operation
        let other = auth.create_user("frank@example.com", "Frank").unwrap();
        let third = docs
            .append_operation(&doc_id, &other, "update", b"p", Some("m1"))
            .unwrap();
        assert_eq!(third.version, 2);
    }

    #[test]
    fn test_append_to_missing_document() {
        let (auth, docs) = setup();
        let user_id = auth.create_user("gina@example.com", "Gina").unwrap();

        let result = docs.append_operation("nope", &user_id, "update", b"p", None);
        assert!(matches!(result, Err(SubmitError::DocumentNotFound)));
    }

    #[test]
    fn test_operation_id_is_deterministic() {
        let a = derive_operation_id("d", "u", "m", 3);
        let b = derive_operation_id("d", "u", "m", 3);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert_ne!(a, derive_operation_id("d", "u", "m", 4));
    }

    #[test]
    fn test_operations_since_and_recent() {
        let (auth, docs) = setup();
        let user_id = auth.create_user("hank@example.com", "Hank").unwrap();
        let doc_id = docs.create_document("Draft").unwrap();

        for i in 0..10 {
            docs.append_operation(&doc_id, &user_id, "update", format!("p{i}").as_bytes(), None)
                .unwrap();
        }

        let since = docs.operations_since(&doc_id, 7, 100).unwrap();
        assert_eq!(
            since.iter().map(|op| op.version).collect::<Vec<_>>(),
            vec![8, 9, 10]
        );

        let bounded = docs.operations_since(&doc_id, 0, 4).unwrap();
        assert_eq!(bounded.len(), 4);
        assert_eq!(bounded[0].version, 1);

        let recent = docs.recent_operations(&doc_id, 3).unwrap();
        assert_eq!(
            recent.iter().map(|op| op.version).collect::<Vec<_>>(),
            vec![8, 9, 10]
        );
    }

    #[test]
    fn test_compaction_retains_recent_window() {
        let (auth, docs) = setup();
        let user_id = auth.create_user("iris@example.com", "Iris").unwrap();
        let doc_id = docs.create_document("Draft").unwrap();

        for _ in 0..20 {
            docs.append_operation(&doc_id, &user_id, "update", b"p", None)
                .unwrap();
        }

        // Below threshold: nothing happens
        assert_eq!(docs.compact_operations(&doc_id, 30, 5).unwrap(), 0);
        assert_eq!(docs.count_operations(&doc_id).unwrap(), 20);

        let deleted = docs.compact_operations(&doc_id, 10, 5).unwrap();
        assert_eq!(deleted, 15);
        assert_eq!(docs.min_retained_version(&doc_id).unwrap(), Some(16));

        // The document version is untouched by compaction
        assert_eq!(docs.get_document(&doc_id).unwrap().unwrap().current_version, 20);
    }

    #[test]
    fn test_presence_snapshot_upsert() {
        let (_, docs) = setup();

        docs.upsert_presence_snapshot("d1", "u1", r#"{"cursor":{}}"#).unwrap();
        docs.upsert_presence_snapshot("d1", "u1", r#"{"cursor":{"position":5}}"#)
            .unwrap();

        let conn = docs.conn.lock().unwrap();
        let (count, state): (i64, String) = conn
            .query_row(
                "SELECT COUNT(*), state FROM presence_snapshots WHERE document_id = 'd1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert!(state.contains("position"));
    }
}
