use rusqlite::Connection;

/// SQL schema for the collaboration store
const SCHEMA: &str = r#"
-- Users table (identity collaborator)
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    email TEXT UNIQUE NOT NULL,
    display_name TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    last_login_at INTEGER
);

-- Auth sessions (token -> user)
CREATE TABLE IF NOT EXISTS auth_sessions (
    token TEXT PRIMARY KEY,
    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    expires_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_user_id ON auth_sessions(user_id);
CREATE INDEX IF NOT EXISTS idx_sessions_expires ON auth_sessions(expires_at);

-- Documents: current_version is advanced only by the operation sequencer
CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    current_version INTEGER NOT NULL DEFAULT 0,
    last_edited_by TEXT,
    last_edited_at INTEGER,
    created_at INTEGER NOT NULL
);

-- Document membership (permission collaborator): role is 'viewer' or 'editor'
CREATE TABLE IF NOT EXISTS document_members (
    document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    role TEXT NOT NULL CHECK (role IN ('viewer', 'editor')),
    PRIMARY KEY (document_id, user_id)
);

-- Append-only operation log, totally ordered per document by version
CREATE TABLE IF NOT EXISTS operations (
    operation_id TEXT PRIMARY KEY,
    document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    author_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload BLOB NOT NULL,
    version INTEGER NOT NULL,
    client_message_id TEXT,
    timestamp INTEGER NOT NULL,
    UNIQUE (document_id, version)
);

CREATE INDEX IF NOT EXISTS idx_operations_doc_version ON operations(document_id, version);
CREATE INDEX IF NOT EXISTS idx_operations_submission
    ON operations(document_id, author_id, client_message_id);

-- Periodic off-path snapshots of ephemeral presence, for audit
CREATE TABLE IF NOT EXISTS presence_snapshots (
    id TEXT PRIMARY KEY,
    document_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    state TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_presence_snapshots_doc ON presence_snapshots(document_id);
"#;

/// Initialize the database with the collaboration schema
pub fn init_database(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_database() {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();

        // Verify tables exist
        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "users",
            "auth_sessions",
            "documents",
            "document_members",
            "operations",
            "presence_snapshots",
        ] {
            assert!(tables.contains(&table.to_string()), "missing table {table}");
        }
    }

    #[test]
    fn test_init_database_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();
        init_database(&conn).unwrap();
    }
}
