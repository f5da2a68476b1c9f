use crate::db::{AuthRepo, UserInfo};

/// Resolve a session token to its user.
///
/// Returns `None` for unknown or expired tokens; storage errors are treated
/// as failed authentication rather than surfaced to the client.
pub fn validate_token(repo: &AuthRepo, token: &str) -> Option<UserInfo> {
    let session = repo.validate_session(token).ok()??;
    let _ = repo.touch_last_login(&session.user_id);
    repo.get_user(&session.user_id).ok()?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_database;
    use chrono::Utc;
    use rusqlite::Connection;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_validate_token() {
        let conn = Connection::open_in_memory().unwrap();
        init_database(&conn).unwrap();
        let repo = AuthRepo::new(Arc::new(Mutex::new(conn)));

        let user_id = repo.create_user("alice@example.com", "Alice").unwrap();
        let token = repo
            .create_session(&user_id, Utc::now() + chrono::Duration::days(1))
            .unwrap();

        let user = validate_token(&repo, &token).unwrap();
        assert_eq!(user.id, user_id);
        assert!(validate_token(&repo, "nope").is_none());
    }
}
