use log::debug;
use rand::RngCore;
use sqlx::Row;

use crate::server::db::Database;
use crate::server::error::ChatResult;

/// Resolve a bearer session token to its user id, if valid and unexpired.
pub async fn validate_session(db: &Database, session_token: &str) -> ChatResult<Option<String>> {
    let now = chrono::Utc::now().timestamp();
    let row = sqlx::query(
        "SELECT user_id FROM sessions WHERE session_token = ? AND expires_at > ?",
    )
    .bind(session_token)
    .bind(now)
    .fetch_optional(&db.pool)
    .await?;

    match row {
        Some(row) => {
            let user_id: String = row.get("user_id");
            debug!("session valid for user {}", user_id);
            Ok(Some(user_id))
        }
        None => {
            debug!("session not found or expired");
            Ok(None)
        }
    }
}

/// Mint a session token for a user. Credential issuance normally belongs to
/// the platform's auth flow; this is used by the probe binary and by tests.
pub async fn issue_session(
    db: &Database,
    user_id: &str,
    expiry_days: u32,
) -> ChatResult<String> {
    let mut raw = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut raw);
    let token: String = raw.iter().map(|b| format!("{:02x}", b)).collect();

    let now = chrono::Utc::now().timestamp();
    let expires_at = now + i64::from(expiry_days) * 86_400;
    sqlx::query(
        "INSERT INTO sessions (session_token, user_id, created_at, expires_at) VALUES (?, ?, ?, ?)",
    )
    .bind(&token)
    .bind(user_id)
    .bind(now)
    .bind(expires_at)
    .execute(&db.pool)
    .await?;
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn issued_session_validates_back_to_its_user() {
        let db = Database::connect_memory().await.unwrap();
        db.migrate().await.unwrap();
        db.create_user("u1", "User One").await.unwrap();

        let token = issue_session(&db, "u1", 7).await.unwrap();
        assert_eq!(validate_session(&db, &token).await.unwrap().as_deref(), Some("u1"));
        assert_eq!(validate_session(&db, "bogus").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_session_is_rejected() {
        let db = Database::connect_memory().await.unwrap();
        db.migrate().await.unwrap();

        let past = chrono::Utc::now().timestamp() - 10;
        sqlx::query(
            "INSERT INTO sessions (session_token, user_id, created_at, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind("stale")
        .bind("u1")
        .bind(past - 100)
        .bind(past)
        .execute(&db.pool)
        .await
        .unwrap();

        assert_eq!(validate_session(&db, "stale").await.unwrap(), None);
    }
}
