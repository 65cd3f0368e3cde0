use serde::{Deserialize, Serialize};

use crate::server::models::Message;

/// All room/message lifecycle traffic flows through this well-known channel,
/// so monitoring and secondary consumers can observe everything in one place.
pub const EVENTS_CHANNEL: &str = "chat:events";
/// Fire-and-forget domain events for the notification collaborator.
pub const NOTIFICATIONS_CHANNEL: &str = "chat:notifications";

/// Events published on the bus after the durable write has committed.
///
/// `participants` rides along so gateway instances can route without a
/// database round trip per delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    NewMessage {
        message: Message,
        participants: Vec<String>,
    },
    MessagesRead {
        room_id: String,
        reader_id: String,
        participants: Vec<String>,
    },
    Notification {
        recipient_id: String,
        room_id: String,
        preview: String,
    },
}

impl ChatEvent {
    /// Users a gateway instance should consider delivering this event to.
    pub fn recipients(&self) -> &[String] {
        match self {
            ChatEvent::NewMessage { participants, .. } => participants,
            ChatEvent::MessagesRead { participants, .. } => participants,
            ChatEvent::Notification { recipient_id, .. } => std::slice::from_ref(recipient_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_carry_a_stable_wire_tag() {
        let event = ChatEvent::MessagesRead {
            room_id: "r1".into(),
            reader_id: "u2".into(),
            participants: vec!["u1".into(), "u2".into()],
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "messages_read");
        assert_eq!(json["reader_id"], "u2");

        let back: ChatEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.recipients(), ["u1".to_string(), "u2".to_string()]);
    }
}
