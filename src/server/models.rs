use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

/// A two-party conversation. The participant pair is stored in canonical
/// (lexicographic) order so the UNIQUE constraint holds regardless of which
/// side initiated contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub participant_min: String,
    pub participant_max: String,
    pub booking_id: Option<String>,
    pub hotel_id: Option<String>,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<i64>,
    pub active: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Room {
    pub fn participants(&self) -> [&str; 2] {
        [&self.participant_min, &self.participant_max]
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participant_min == user_id || self.participant_max == user_id
    }

    /// The counterpart of `user_id` in this room, if they are a member.
    pub fn other_participant(&self, user_id: &str) -> Option<&str> {
        if self.participant_min == user_id {
            Some(&self.participant_max)
        } else if self.participant_max == user_id {
            Some(&self.participant_min)
        } else {
            None
        }
    }

    pub fn from_row(row: &SqliteRow) -> Self {
        Self {
            id: row.get("id"),
            participant_min: row.get("participant_min"),
            participant_max: row.get("participant_max"),
            booking_id: row.get("booking_id"),
            hotel_id: row.get("hotel_id"),
            last_message_preview: row.get("last_message_preview"),
            last_message_at: row.get("last_message_at"),
            active: row.get::<i64, _>("active") != 0,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Sent,
    Delivered,
    Read,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Sent => "sent",
            DeliveryState::Delivered => "delivered",
            DeliveryState::Read => "read",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(DeliveryState::Sent),
            "delivered" => Some(DeliveryState::Delivered),
            "read" => Some(DeliveryState::Read),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    File,
    Image,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::File => "file",
            MessageKind::Image => "image",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "file" => Some(MessageKind::File),
            "image" => Some(MessageKind::Image),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub url: String,
    pub name: String,
    pub size: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub content: String,
    pub kind: MessageKind,
    pub attachment: Option<Attachment>,
    pub delivery_state: DeliveryState,
    pub edited: bool,
    pub edited_at: Option<i64>,
    /// Opaque bag for client-specific extensions; stored as JSON text.
    pub metadata: Option<serde_json::Value>,
    pub created_at: i64,
}

impl Message {
    pub fn from_row(row: &SqliteRow) -> Self {
        let attachment = match row.get::<Option<String>, _>("attachment_url") {
            Some(url) => Some(Attachment {
                url,
                name: row.get::<Option<String>, _>("attachment_name").unwrap_or_default(),
                size: row.get::<Option<i64>, _>("attachment_size").unwrap_or(0),
            }),
            None => None,
        };
        let metadata = row
            .get::<Option<String>, _>("metadata")
            .and_then(|raw| serde_json::from_str(&raw).ok());

        Self {
            id: row.get("id"),
            room_id: row.get("room_id"),
            sender_id: row.get("sender_id"),
            content: row.get("content"),
            kind: MessageKind::parse(&row.get::<String, _>("kind")).unwrap_or(MessageKind::Text),
            attachment,
            delivery_state: DeliveryState::parse(&row.get::<String, _>("delivery_state"))
                .unwrap_or(DeliveryState::Sent),
            edited: row.get::<i64, _>("edited") != 0,
            edited_at: row.get("edited_at"),
            metadata,
            created_at: row.get("created_at"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_state_is_ordered() {
        assert!(DeliveryState::Sent < DeliveryState::Delivered);
        assert!(DeliveryState::Delivered < DeliveryState::Read);
    }

    #[test]
    fn delivery_state_round_trips_through_str() {
        for state in [DeliveryState::Sent, DeliveryState::Delivered, DeliveryState::Read] {
            assert_eq!(DeliveryState::parse(state.as_str()), Some(state));
        }
        assert_eq!(DeliveryState::parse("unread"), None);
    }

    #[test]
    fn other_participant_only_resolves_members() {
        let room = Room {
            id: "r1".into(),
            participant_min: "alice".into(),
            participant_max: "bob".into(),
            booking_id: None,
            hotel_id: None,
            last_message_preview: None,
            last_message_at: None,
            active: true,
            created_at: 0,
            updated_at: 0,
        };
        assert_eq!(room.other_participant("alice"), Some("bob"));
        assert_eq!(room.other_participant("bob"), Some("alice"));
        assert_eq!(room.other_participant("mallory"), None);
    }
}
