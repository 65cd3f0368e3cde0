use log::{debug, info};
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};

use crate::server::models::Message;

#[derive(Debug, Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        // Extract the file path so the parent directory can be created first.
        let file_path = database_url
            .strip_prefix("sqlite://")
            .or_else(|| database_url.strip_prefix("sqlite:"))
            .unwrap_or(database_url);
        let file_path = file_path.split('?').next().unwrap_or(file_path);

        if file_path != ":memory:" {
            if let Some(parent) = std::path::Path::new(file_path).parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| sqlx::Error::Configuration(Box::new(e)))?;
                    debug!("created database directory {:?}", parent);
                }
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        info!("connected to database {}", database_url);
        Ok(Self { pool })
    }

    /// In-memory database on a single connection; used by the test suites.
    pub async fn connect_memory() -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        // Minimal user directory; rows are seeded by the platform.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Bearer credentials presented at gateway handshake.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_token TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // One room per unordered participant pair; the canonical (min, max)
        // ordering carries the uniqueness invariant.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rooms (
                id TEXT PRIMARY KEY,
                participant_min TEXT NOT NULL,
                participant_max TEXT NOT NULL,
                booking_id TEXT,
                hotel_id TEXT,
                last_message_preview TEXT,
                last_message_at INTEGER,
                active INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(participant_min, participant_max)
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Room owns its messages; deleting a room cascades.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                room_id TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
                sender_id TEXT NOT NULL,
                content TEXT NOT NULL,
                kind TEXT NOT NULL CHECK (kind IN ('text', 'file', 'image')),
                attachment_url TEXT,
                attachment_name TEXT,
                attachment_size INTEGER,
                delivery_state TEXT NOT NULL
                    CHECK (delivery_state IN ('sent', 'delivered', 'read')),
                edited INTEGER NOT NULL DEFAULT 0,
                edited_at INTEGER,
                metadata TEXT,
                created_at INTEGER NOT NULL
            );
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_messages_room_created
                ON messages(room_id, created_at);
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn create_user(&self, id: &str, display_name: &str) -> Result<(), sqlx::Error> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query("INSERT OR IGNORE INTO users (id, display_name, created_at) VALUES (?, ?, ?)")
            .bind(id)
            .bind(display_name)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn user_exists(&self, id: &str) -> Result<bool, sqlx::Error> {
        let row = sqlx::query("SELECT 1 FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Paginated history, newest first. The cursor is the (created_at, id)
    /// pair of the oldest message the client already holds.
    pub async fn message_history(
        &self,
        room_id: &str,
        limit: i64,
        before: Option<(i64, &str)>,
    ) -> Result<Vec<Message>, sqlx::Error> {
        let rows = match before {
            Some((ts, id)) => {
                sqlx::query(
                    r#"
                    SELECT * FROM messages
                    WHERE room_id = ?
                      AND (created_at < ? OR (created_at = ? AND id < ?))
                    ORDER BY created_at DESC, id DESC
                    LIMIT ?
                "#,
                )
                .bind(room_id)
                .bind(ts)
                .bind(ts)
                .bind(id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT * FROM messages
                    WHERE room_id = ?
                    ORDER BY created_at DESC, id DESC
                    LIMIT ?
                "#,
                )
                .bind(room_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.iter().map(Message::from_row).collect())
    }

    pub async fn message_by_id(&self, id: &str) -> Result<Option<Message>, sqlx::Error> {
        let row = sqlx::query("SELECT * FROM messages WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(Message::from_row))
    }

    pub async fn delivery_state_of(&self, message_id: &str) -> Result<Option<String>, sqlx::Error> {
        let row = sqlx::query("SELECT delivery_state FROM messages WHERE id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("delivery_state")))
    }
}
