use log::{debug, info};
use uuid::Uuid;

use crate::server::db::Database;
use crate::server::error::{ChatError, ChatResult};
use crate::server::models::Room;

/// Deterministic mapping from a participant pair (optionally anchored to a
/// booking) to exactly one room, created idempotently on first contact.
#[derive(Clone)]
pub struct RoomService {
    db: Database,
}

impl RoomService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Resolve the single room for an unordered participant pair, creating it
    /// when absent. Two racing calls collapse onto one row: the insert is
    /// guarded by the UNIQUE constraint and the loser reads back the winner's
    /// row instead of erroring.
    pub async fn get_or_create(
        &self,
        participant_a: &str,
        participant_b: &str,
        booking_id: Option<&str>,
        hotel_id: Option<&str>,
    ) -> ChatResult<Room> {
        if participant_a.trim().is_empty()
            || participant_b.trim().is_empty()
            || participant_a == participant_b
        {
            return Err(ChatError::InvalidParticipants);
        }
        for id in [participant_a, participant_b] {
            if !self.db.user_exists(id).await? {
                return Err(ChatError::ParticipantNotFound(id.to_string()));
            }
        }

        // Canonical ordering so call order never matters.
        let (min_id, max_id) = if participant_a < participant_b {
            (participant_a, participant_b)
        } else {
            (participant_b, participant_a)
        };

        let now = chrono::Utc::now().timestamp();
        let room_id = Uuid::new_v4().to_string();

        let mut tx = self.db.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO rooms
                (id, participant_min, participant_max, booking_id, hotel_id,
                 active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT(participant_min, participant_max) DO NOTHING
        "#,
        )
        .bind(&room_id)
        .bind(min_id)
        .bind(max_id)
        .bind(booking_id)
        .bind(hotel_id)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        let row = sqlx::query(
            "SELECT * FROM rooms WHERE participant_min = ? AND participant_max = ?",
        )
        .bind(min_id)
        .bind(max_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        let room = Room::from_row(&row);
        if inserted > 0 {
            info!("created room {} for pair ({}, {})", room.id, min_id, max_id);
        } else {
            debug!("resolved existing room {} for pair ({}, {})", room.id, min_id, max_id);
        }
        Ok(room)
    }

    pub async fn room_by_id(&self, room_id: &str) -> ChatResult<Room> {
        let row = sqlx::query("SELECT * FROM rooms WHERE id = ?")
            .bind(room_id)
            .fetch_optional(&self.db.pool)
            .await?;
        row.as_ref()
            .map(Room::from_row)
            .ok_or_else(|| ChatError::RoomNotFound(room_id.to_string()))
    }

    /// Active rooms for a user, most recent activity first.
    pub async fn rooms_for_user(&self, user_id: &str) -> ChatResult<Vec<Room>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM rooms
            WHERE (participant_min = ? OR participant_max = ?) AND active = 1
            ORDER BY COALESCE(last_message_at, updated_at) DESC
        "#,
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.db.pool)
        .await?;
        Ok(rows.iter().map(Room::from_row).collect())
    }

    /// Rooms are never hard-deleted, only deactivated.
    pub async fn deactivate(&self, room_id: &str) -> ChatResult<()> {
        let now = chrono::Utc::now().timestamp();
        let changed = sqlx::query("UPDATE rooms SET active = 0, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(room_id)
            .execute(&self.db.pool)
            .await?
            .rows_affected();
        if changed == 0 {
            return Err(ChatError::RoomNotFound(room_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service() -> RoomService {
        let db = Database::connect_memory().await.unwrap();
        db.migrate().await.unwrap();
        db.create_user("guest-1", "Guest One").await.unwrap();
        db.create_user("host-1", "Host One").await.unwrap();
        RoomService::new(db)
    }

    #[tokio::test]
    async fn pair_resolves_to_one_room_regardless_of_order() {
        let svc = service().await;
        let first = svc
            .get_or_create("guest-1", "host-1", Some("bk-9"), Some("ht-3"))
            .await
            .unwrap();
        let second = svc.get_or_create("host-1", "guest-1", None, None).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.booking_id.as_deref(), Some("bk-9"));
        assert_eq!(first.hotel_id.as_deref(), Some("ht-3"));
    }

    #[tokio::test]
    async fn repeated_resolution_yields_one_row() {
        let svc = service().await;
        let mut ids = Vec::new();
        for _ in 0..8 {
            let room = svc.get_or_create("guest-1", "host-1", None, None).await.unwrap();
            ids.push(room.id);
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rooms")
            .fetch_one(&svc.db.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn concurrent_resolution_collapses_to_one_row() {
        let svc = service().await;
        let mut handles = Vec::new();
        for i in 0..6 {
            let svc = svc.clone();
            // Alternate argument order to exercise canonicalization too.
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    svc.get_or_create("guest-1", "host-1", None, None).await
                } else {
                    svc.get_or_create("host-1", "guest-1", None, None).await
                }
            }));
        }

        let mut ids = std::collections::HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap().unwrap().id);
        }
        assert_eq!(ids.len(), 1);

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rooms")
            .fetch_one(&svc.db.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn self_chat_and_blank_ids_are_rejected() {
        let svc = service().await;
        assert!(matches!(
            svc.get_or_create("guest-1", "guest-1", None, None).await,
            Err(ChatError::InvalidParticipants)
        ));
        assert!(matches!(
            svc.get_or_create("", "host-1", None, None).await,
            Err(ChatError::InvalidParticipants)
        ));
    }

    #[tokio::test]
    async fn unknown_participant_is_surfaced() {
        let svc = service().await;
        match svc.get_or_create("guest-1", "nobody", None, None).await {
            Err(ChatError::ParticipantNotFound(id)) => assert_eq!(id, "nobody"),
            other => panic!("expected ParticipantNotFound, got {:?}", other.map(|r| r.id)),
        }
    }

    #[tokio::test]
    async fn deactivated_rooms_drop_out_of_listing() {
        let svc = service().await;
        let room = svc.get_or_create("guest-1", "host-1", None, None).await.unwrap();
        assert_eq!(svc.rooms_for_user("guest-1").await.unwrap().len(), 1);
        svc.deactivate(&room.id).await.unwrap();
        assert!(svc.rooms_for_user("guest-1").await.unwrap().is_empty());
        // The row itself survives.
        assert!(!svc.room_by_id(&room.id).await.unwrap().active);
    }
}
