use std::sync::Arc;

use log::{debug, info, warn};
use uuid::Uuid;

use crate::server::bus::EventBus;
use crate::server::db::Database;
use crate::server::error::{ChatError, ChatResult};
use crate::server::events::{ChatEvent, EVENTS_CHANNEL, NOTIFICATIONS_CHANNEL};
use crate::server::models::{Attachment, DeliveryState, Message, MessageKind};
use crate::server::presence::PresenceStore;
use crate::server::rooms::RoomService;

const PREVIEW_CHARS: usize = 80;

/// Validates, persists and distributes messages, and drives the
/// sent -> delivered -> read state machine.
pub struct MessageService {
    db: Database,
    rooms: RoomService,
    presence: Arc<dyn PresenceStore>,
    bus: Arc<dyn EventBus>,
    max_message_length: usize,
}

pub struct NewMessageInput {
    pub content: String,
    pub kind: MessageKind,
    pub attachment: Option<Attachment>,
    pub metadata: Option<serde_json::Value>,
}

impl NewMessageInput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            kind: MessageKind::Text,
            attachment: None,
            metadata: None,
        }
    }
}

impl MessageService {
    pub fn new(
        db: Database,
        rooms: RoomService,
        presence: Arc<dyn PresenceStore>,
        bus: Arc<dyn EventBus>,
        max_message_length: usize,
    ) -> Self {
        Self {
            db,
            rooms,
            presence,
            bus,
            max_message_length,
        }
    }

    /// Persist a message into an existing room and fan it out.
    ///
    /// The returned message is the persisted row, never an optimistic copy,
    /// so clients reconcile their local echo by id. The message is durable
    /// before any event referencing it is published; publish failures are
    /// logged and swallowed since real-time delivery is best-effort.
    pub async fn send(
        &self,
        room_id: &str,
        sender_id: &str,
        input: NewMessageInput,
    ) -> ChatResult<Message> {
        let room = self.rooms.room_by_id(room_id).await?;
        let recipient = room
            .other_participant(sender_id)
            .ok_or(ChatError::Forbidden)?
            .to_string();
        self.validate(&input)?;

        let now = chrono::Utc::now().timestamp();
        let id = Uuid::new_v4().to_string();
        let preview = preview_of(&input);
        let metadata_json = input
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut tx = self.db.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO messages
                (id, room_id, sender_id, content, kind,
                 attachment_url, attachment_name, attachment_size,
                 delivery_state, edited, metadata, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'sent', 0, ?, ?)
        "#,
        )
        .bind(&id)
        .bind(room_id)
        .bind(sender_id)
        .bind(&input.content)
        .bind(input.kind.as_str())
        .bind(input.attachment.as_ref().map(|a| a.url.as_str()))
        .bind(input.attachment.as_ref().map(|a| a.name.as_str()))
        .bind(input.attachment.as_ref().map(|a| a.size))
        .bind(metadata_json)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE rooms
            SET last_message_preview = ?, last_message_at = ?, updated_at = ?
            WHERE id = ?
        "#,
        )
        .bind(&preview)
        .bind(now)
        .bind(now)
        .bind(room_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut message = Message {
            id,
            room_id: room_id.to_string(),
            sender_id: sender_id.to_string(),
            content: input.content,
            kind: input.kind,
            attachment: input.attachment,
            delivery_state: DeliveryState::Sent,
            edited: false,
            edited_at: None,
            metadata: input.metadata,
            created_at: now,
        };

        // Best-effort delivered transition: only when the recipient is an
        // active member of the room right now. Offline recipients keep the
        // message at 'sent' until their next mark_read or history fetch.
        match self.presence.members_of(room_id).await {
            Ok(members) if members.contains(&recipient) => {
                if self.advance_to_delivered(&message.id).await? {
                    message.delivery_state = DeliveryState::Delivered;
                }
            }
            Ok(_) => {}
            Err(e) => warn!("presence check failed, leaving message 'sent': {}", e),
        }

        let event = ChatEvent::NewMessage {
            message: message.clone(),
            participants: vec![room.participant_min.clone(), room.participant_max.clone()],
        };
        if let Err(e) = self.bus.publish(EVENTS_CHANNEL, &event).await {
            warn!("publish of new_message failed (message persisted): {}", e);
        }

        let notify = ChatEvent::Notification {
            recipient_id: recipient,
            room_id: room_id.to_string(),
            preview,
        };
        if let Err(e) = self.bus.publish(NOTIFICATIONS_CHANNEL, &notify).await {
            warn!("publish of notification failed: {}", e);
        }

        info!("message {} sent into room {}", message.id, room_id);
        Ok(message)
    }

    /// First-contact path: resolve (or create) the pair's room, then send.
    pub async fn send_direct(
        &self,
        sender_id: &str,
        recipient_id: &str,
        booking_id: Option<&str>,
        hotel_id: Option<&str>,
        input: NewMessageInput,
    ) -> ChatResult<Message> {
        let room = self
            .rooms
            .get_or_create(sender_id, recipient_id, booking_id, hotel_id)
            .await?;
        self.send(&room.id, sender_id, input).await
    }

    /// Advance every message the reader did not author to 'read'.
    ///
    /// Idempotent: a second call matches no rows and publishes nothing, so
    /// no duplicate messages_read events go out. A sender can never mark
    /// their own messages read; the WHERE clause excludes them.
    pub async fn mark_read(&self, room_id: &str, reader_id: &str) -> ChatResult<()> {
        let room = self.rooms.room_by_id(room_id).await?;
        if !room.has_participant(reader_id) {
            return Err(ChatError::Forbidden);
        }

        let changed = sqlx::query(
            r#"
            UPDATE messages SET delivery_state = 'read'
            WHERE room_id = ? AND sender_id != ? AND delivery_state != 'read'
        "#,
        )
        .bind(room_id)
        .bind(reader_id)
        .execute(&self.db.pool)
        .await?
        .rows_affected();

        if changed == 0 {
            debug!("mark_read in room {} by {}: nothing to do", room_id, reader_id);
            return Ok(());
        }

        let event = ChatEvent::MessagesRead {
            room_id: room_id.to_string(),
            reader_id: reader_id.to_string(),
            participants: vec![room.participant_min.clone(), room.participant_max.clone()],
        };
        if let Err(e) = self.bus.publish(EVENTS_CHANNEL, &event).await {
            warn!("publish of messages_read failed (state persisted): {}", e);
        }
        info!("{} messages marked read in room {} by {}", changed, room_id, reader_id);
        Ok(())
    }

    /// Paginated history, newest first, membership-checked.
    pub async fn history(
        &self,
        room_id: &str,
        requester_id: &str,
        limit: i64,
        before: Option<(i64, &str)>,
    ) -> ChatResult<Vec<Message>> {
        let room = self.rooms.room_by_id(room_id).await?;
        if !room.has_participant(requester_id) {
            return Err(ChatError::Forbidden);
        }
        Ok(self.db.message_history(room_id, limit, before).await?)
    }

    /// Edit a text message in place. Only the original sender may edit, and
    /// an edit never moves the message between rooms or senders.
    pub async fn edit(
        &self,
        message_id: &str,
        editor_id: &str,
        new_content: &str,
    ) -> ChatResult<Message> {
        let message = self
            .db
            .message_by_id(message_id)
            .await?
            .ok_or_else(|| ChatError::InvalidMessage(format!("no such message {}", message_id)))?;
        if message.sender_id != editor_id {
            return Err(ChatError::Forbidden);
        }
        if message.kind != MessageKind::Text {
            return Err(ChatError::InvalidMessage("only text messages can be edited".into()));
        }
        let trimmed = new_content.trim();
        if trimmed.is_empty() {
            return Err(ChatError::InvalidMessage("edited content must not be empty".into()));
        }
        if trimmed.len() > self.max_message_length {
            return Err(ChatError::InvalidMessage(format!(
                "content exceeds {} bytes",
                self.max_message_length
            )));
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.db.pool.begin().await?;
        sqlx::query(
            "UPDATE messages SET content = ?, edited = 1, edited_at = ? WHERE id = ?",
        )
        .bind(trimmed)
        .bind(now)
        .bind(message_id)
        .execute(&mut *tx)
        .await?;

        // Keep the room preview honest when the newest message was edited.
        let newest: Option<String> = sqlx::query_scalar(
            "SELECT id FROM messages WHERE room_id = ? ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(&message.room_id)
        .fetch_optional(&mut *tx)
        .await?;
        if newest.as_deref() == Some(message_id) {
            let preview: String = trimmed.chars().take(PREVIEW_CHARS).collect();
            sqlx::query("UPDATE rooms SET last_message_preview = ?, updated_at = ? WHERE id = ?")
                .bind(preview)
                .bind(now)
                .bind(&message.room_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        self.db
            .message_by_id(message_id)
            .await?
            .ok_or_else(|| ChatError::InvalidMessage("message vanished during edit".into()))
    }

    /// Guarded transition; a message that already advanced past 'sent' is
    /// left alone, so delivery state can never regress through this path.
    async fn advance_to_delivered(&self, message_id: &str) -> ChatResult<bool> {
        let changed = sqlx::query(
            "UPDATE messages SET delivery_state = 'delivered' WHERE id = ? AND delivery_state = 'sent'",
        )
        .bind(message_id)
        .execute(&self.db.pool)
        .await?
        .rows_affected();
        Ok(changed > 0)
    }

    fn validate(&self, input: &NewMessageInput) -> ChatResult<()> {
        match input.kind {
            MessageKind::Text => {
                if input.content.trim().is_empty() {
                    return Err(ChatError::InvalidMessage("text content must not be empty".into()));
                }
            }
            MessageKind::File | MessageKind::Image => {
                let ok = input
                    .attachment
                    .as_ref()
                    .map(|a| !a.url.trim().is_empty())
                    .unwrap_or(false);
                if !ok {
                    return Err(ChatError::InvalidMessage(
                        "file and image messages require attachment fields".into(),
                    ));
                }
            }
        }
        if input.content.len() > self.max_message_length {
            return Err(ChatError::InvalidMessage(format!(
                "content exceeds {} bytes",
                self.max_message_length
            )));
        }
        Ok(())
    }
}

fn preview_of(input: &NewMessageInput) -> String {
    if !input.content.trim().is_empty() {
        input.content.chars().take(PREVIEW_CHARS).collect()
    } else if let Some(attachment) = &input.attachment {
        attachment.name.clone()
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::bus::LocalEventBus;
    use crate::server::presence::MemoryPresenceStore;
    use std::time::Duration;
    use tokio::sync::broadcast;

    struct Fixture {
        svc: MessageService,
        rooms: RoomService,
        db: Database,
        presence: Arc<MemoryPresenceStore>,
        bus: Arc<LocalEventBus>,
    }

    async fn fixture() -> Fixture {
        let db = Database::connect_memory().await.unwrap();
        db.migrate().await.unwrap();
        db.create_user("u1", "Guest").await.unwrap();
        db.create_user("u2", "Host").await.unwrap();
        db.create_user("u3", "Stranger").await.unwrap();

        let rooms = RoomService::new(db.clone());
        let presence = Arc::new(MemoryPresenceStore::new(Duration::from_secs(60)));
        let bus = Arc::new(LocalEventBus::new());
        let svc = MessageService::new(
            db.clone(),
            rooms.clone(),
            presence.clone(),
            bus.clone(),
            2048,
        );
        Fixture { svc, rooms, db, presence, bus }
    }

    fn next_event(rx: &mut broadcast::Receiver<ChatEvent>) -> ChatEvent {
        rx.try_recv().expect("expected a pending event")
    }

    #[tokio::test]
    async fn first_message_creates_room_transparently() {
        let f = fixture().await;
        let msg = f
            .svc
            .send_direct("u1", "u2", Some("bk-1"), Some("ht-1"), NewMessageInput::text("Hello"))
            .await
            .unwrap();

        assert!(!msg.id.is_empty());
        assert_eq!(msg.delivery_state, DeliveryState::Sent);

        let room = f.rooms.room_by_id(&msg.room_id).await.unwrap();
        assert!(room.has_participant("u1") && room.has_participant("u2"));
        assert_eq!(room.last_message_preview.as_deref(), Some("Hello"));
        assert!(room.last_message_at.is_some());
    }

    #[tokio::test]
    async fn message_is_durable_before_its_event_is_observable() {
        let f = fixture().await;
        let mut rx = f.bus.subscribe(EVENTS_CHANNEL);
        let sent = f
            .svc
            .send_direct("u1", "u2", None, None, NewMessageInput::text("hi"))
            .await
            .unwrap();

        match next_event(&mut rx) {
            ChatEvent::NewMessage { message, participants } => {
                assert_eq!(message.id, sent.id);
                assert_eq!(message.room_id, sent.room_id);
                assert!(participants.contains(&"u1".to_string()));
                // The row referenced by the event is already fetchable.
                assert!(f.db.message_by_id(&message.id).await.unwrap().is_some());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn recipient_in_room_advances_state_to_delivered() {
        let f = fixture().await;
        let room = f.rooms.get_or_create("u1", "u2", None, None).await.unwrap();
        f.presence.add_to_room(&room.id, "u2").await.unwrap();

        let mut rx = f.bus.subscribe(EVENTS_CHANNEL);
        let msg = f.svc.send(&room.id, "u1", NewMessageInput::text("hey")).await.unwrap();
        assert_eq!(msg.delivery_state, DeliveryState::Delivered);

        match next_event(&mut rx) {
            ChatEvent::NewMessage { message, .. } => {
                assert_eq!(message.id, msg.id);
                assert_eq!(message.delivery_state, DeliveryState::Delivered);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn mark_read_advances_only_the_other_sides_messages() {
        let f = fixture().await;
        let room = f.rooms.get_or_create("u1", "u2", None, None).await.unwrap();
        let from_u1 = f.svc.send(&room.id, "u1", NewMessageInput::text("one")).await.unwrap();
        let from_u2 = f.svc.send(&room.id, "u2", NewMessageInput::text("two")).await.unwrap();

        let mut rx = f.bus.subscribe(EVENTS_CHANNEL);
        f.svc.mark_read(&room.id, "u2").await.unwrap();

        assert_eq!(
            f.db.delivery_state_of(&from_u1.id).await.unwrap().as_deref(),
            Some("read")
        );
        // u2's own message is untouched by their read.
        assert_eq!(
            f.db.delivery_state_of(&from_u2.id).await.unwrap().as_deref(),
            Some("sent")
        );

        match next_event(&mut rx) {
            ChatEvent::MessagesRead { room_id, reader_id, .. } => {
                assert_eq!(room_id, room.id);
                assert_eq!(reader_id, "u2");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn mark_read_is_idempotent_and_emits_no_duplicate_event() {
        let f = fixture().await;
        let room = f.rooms.get_or_create("u1", "u2", None, None).await.unwrap();
        let msg = f.svc.send(&room.id, "u1", NewMessageInput::text("one")).await.unwrap();

        f.svc.mark_read(&room.id, "u2").await.unwrap();
        let mut rx = f.bus.subscribe(EVENTS_CHANNEL);
        f.svc.mark_read(&room.id, "u2").await.unwrap();

        assert_eq!(f.db.delivery_state_of(&msg.id).await.unwrap().as_deref(), Some("read"));
        assert!(rx.try_recv().is_err(), "second mark_read must not publish");
    }

    #[tokio::test]
    async fn sender_cannot_read_their_own_messages() {
        let f = fixture().await;
        let room = f.rooms.get_or_create("u1", "u2", None, None).await.unwrap();
        let msg = f.svc.send(&room.id, "u1", NewMessageInput::text("mine")).await.unwrap();

        f.svc.mark_read(&room.id, "u1").await.unwrap();
        assert_eq!(f.db.delivery_state_of(&msg.id).await.unwrap().as_deref(), Some("sent"));
    }

    #[tokio::test]
    async fn delivery_state_never_regresses() {
        let f = fixture().await;
        let room = f.rooms.get_or_create("u1", "u2", None, None).await.unwrap();
        let msg = f.svc.send(&room.id, "u1", NewMessageInput::text("one")).await.unwrap();
        f.svc.mark_read(&room.id, "u2").await.unwrap();

        // A late delivered transition finds no 'sent' row to advance.
        assert!(!f.svc.advance_to_delivered(&msg.id).await.unwrap());
        assert_eq!(f.db.delivery_state_of(&msg.id).await.unwrap().as_deref(), Some("read"));
    }

    #[tokio::test]
    async fn non_member_sender_is_forbidden() {
        let f = fixture().await;
        let room = f.rooms.get_or_create("u1", "u2", None, None).await.unwrap();
        assert!(matches!(
            f.svc.send(&room.id, "u3", NewMessageInput::text("hi")).await,
            Err(ChatError::Forbidden)
        ));
        assert!(matches!(
            f.svc.mark_read(&room.id, "u3").await,
            Err(ChatError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn validation_rejects_bad_payloads() {
        let f = fixture().await;
        let room = f.rooms.get_or_create("u1", "u2", None, None).await.unwrap();

        assert!(matches!(
            f.svc.send(&room.id, "u1", NewMessageInput::text("   ")).await,
            Err(ChatError::InvalidMessage(_))
        ));

        let file_without_attachment = NewMessageInput {
            content: String::new(),
            kind: MessageKind::File,
            attachment: None,
            metadata: None,
        };
        assert!(matches!(
            f.svc.send(&room.id, "u1", file_without_attachment).await,
            Err(ChatError::InvalidMessage(_))
        ));

        let oversize = NewMessageInput::text("x".repeat(3000));
        assert!(matches!(
            f.svc.send(&room.id, "u1", oversize).await,
            Err(ChatError::InvalidMessage(_))
        ));
    }

    #[tokio::test]
    async fn attachment_messages_persist_their_fields() {
        let f = fixture().await;
        let room = f.rooms.get_or_create("u1", "u2", None, None).await.unwrap();
        let input = NewMessageInput {
            content: String::new(),
            kind: MessageKind::Image,
            attachment: Some(Attachment {
                url: "https://cdn.example/img.png".into(),
                name: "img.png".into(),
                size: 1234,
            }),
            metadata: None,
        };
        let msg = f.svc.send(&room.id, "u1", input).await.unwrap();

        let stored = f.db.message_by_id(&msg.id).await.unwrap().unwrap();
        assert_eq!(stored.kind, MessageKind::Image);
        let attachment = stored.attachment.unwrap();
        assert_eq!(attachment.name, "img.png");
        assert_eq!(attachment.size, 1234);

        let room = f.rooms.room_by_id(&room.id).await.unwrap();
        assert_eq!(room.last_message_preview.as_deref(), Some("img.png"));
    }

    #[tokio::test]
    async fn history_pages_newest_first() {
        let f = fixture().await;
        let room = f.rooms.get_or_create("u1", "u2", None, None).await.unwrap();
        let m1 = f.svc.send(&room.id, "u1", NewMessageInput::text("first")).await.unwrap();
        let m2 = f.svc.send(&room.id, "u2", NewMessageInput::text("second")).await.unwrap();
        let m3 = f.svc.send(&room.id, "u1", NewMessageInput::text("third")).await.unwrap();

        // Pin distinct timestamps so ordering does not depend on sub-second
        // insert timing.
        for (msg, ts) in [(&m1, 1000i64), (&m2, 2000), (&m3, 3000)] {
            sqlx::query("UPDATE messages SET created_at = ? WHERE id = ?")
                .bind(ts)
                .bind(&msg.id)
                .execute(&f.db.pool)
                .await
                .unwrap();
        }

        let page = f.svc.history(&room.id, "u1", 2, None).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, m3.id);
        assert_eq!(page[1].id, m2.id);

        let oldest = page.last().unwrap();
        let rest = f
            .svc
            .history(&room.id, "u1", 2, Some((oldest.created_at, oldest.id.as_str())))
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, m1.id);

        assert!(matches!(
            f.svc.history(&room.id, "u3", 10, None).await,
            Err(ChatError::Forbidden)
        ));
    }

    #[tokio::test]
    async fn edit_is_sender_only_and_keeps_ownership() {
        let f = fixture().await;
        let room = f.rooms.get_or_create("u1", "u2", None, None).await.unwrap();
        let msg = f.svc.send(&room.id, "u1", NewMessageInput::text("tpyo")).await.unwrap();

        assert!(matches!(
            f.svc.edit(&msg.id, "u2", "fixed").await,
            Err(ChatError::Forbidden)
        ));

        let edited = f.svc.edit(&msg.id, "u1", "typo fixed").await.unwrap();
        assert!(edited.edited);
        assert!(edited.edited_at.is_some());
        assert_eq!(edited.content, "typo fixed");
        assert_eq!(edited.room_id, msg.room_id);
        assert_eq!(edited.sender_id, msg.sender_id);

        let room = f.rooms.room_by_id(&room.id).await.unwrap();
        assert_eq!(room.last_message_preview.as_deref(), Some("typo fixed"));
    }
}
