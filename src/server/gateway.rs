use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{tungstenite::Message as WsMessage, WebSocketStream};
use uuid::Uuid;

use crate::server::auth;
use crate::server::bus::EventBus;
use crate::server::config::ServerConfig;
use crate::server::db::Database;
use crate::server::error::{ChatError, ChatResult};
use crate::server::events::{ChatEvent, EVENTS_CHANNEL};
use crate::server::messages::{MessageService, NewMessageInput};
use crate::server::models::{Attachment, Message, MessageKind};
use crate::server::presence::PresenceStore;
use crate::server::rooms::RoomService;

pub type ClientId = String;
pub type UserId = String;

/// Operations a connected client may invoke. Authentication is carried once,
/// as the first frame after the socket opens.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth {
        token: String,
    },
    SendMessage {
        room_id: Option<String>,
        /// First-contact path: address the counterpart directly and let the
        /// server resolve (or create) the room.
        to_user: Option<String>,
        booking_id: Option<String>,
        hotel_id: Option<String>,
        #[serde(default)]
        content: String,
        kind: Option<MessageKind>,
        attachment: Option<Attachment>,
    },
    MarkRead {
        room_id: String,
    },
    JoinRoom {
        room_id: String,
    },
    LeaveRoom {
        room_id: String,
    },
}

/// Server-pushed frames and operation acknowledgements.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    AuthOk {
        user_id: String,
    },
    AuthError {
        error: String,
    },
    NewMessage {
        message: Message,
    },
    MessagesRead {
        room_id: String,
        reader_id: String,
    },
    History {
        room_id: String,
        messages: Vec<Message>,
    },
    Ack {
        op: String,
        message: Option<Message>,
    },
    Error {
        op: String,
        code: String,
        message: String,
        retryable: bool,
    },
}

impl ServerFrame {
    fn from_error(op: &str, err: &ChatError) -> Self {
        ServerFrame::Error {
            op: op.to_string(),
            code: err.code().to_string(),
            message: err.to_string(),
            retryable: err.retryable(),
        }
    }
}

struct ClientSession {
    client_id: ClientId,
    sender: mpsc::UnboundedSender<WsMessage>,
}

/// Per-process session table plus the glue between socket frames, the message
/// service and the event bus. One authenticated user per connection; events
/// from the bus are forwarded only to local sessions whose user is among the
/// event's participants.
pub struct ChatGateway {
    sessions: Arc<Mutex<HashMap<UserId, ClientSession>>>,
    db: Database,
    rooms: RoomService,
    messages: Arc<MessageService>,
    presence: Arc<dyn PresenceStore>,
    bus: Arc<dyn EventBus>,
    config: ServerConfig,
}

impl ChatGateway {
    pub fn new(
        db: Database,
        rooms: RoomService,
        messages: Arc<MessageService>,
        presence: Arc<dyn PresenceStore>,
        bus: Arc<dyn EventBus>,
        config: ServerConfig,
    ) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            db,
            rooms,
            messages,
            presence,
            bus,
            config,
        }
    }

    /// Bridge bus events into locally-held connections. Dropped or lagged
    /// events only delay real-time delivery; clients reconcile on the next
    /// history fetch.
    pub fn start_event_forwarder(self: Arc<Self>) {
        let gateway = self;
        let mut rx = gateway.bus.subscribe(EVENTS_CHANNEL);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => gateway.deliver_event(&event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("event forwarder lagged, skipped {} events", skipped);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        info!("event channel closed, stopping forwarder");
                        break;
                    }
                }
            }
        });
    }

    async fn deliver_event(&self, event: &ChatEvent) {
        let frame = match event {
            ChatEvent::NewMessage { message, .. } => ServerFrame::NewMessage {
                message: message.clone(),
            },
            ChatEvent::MessagesRead { room_id, reader_id, .. } => ServerFrame::MessagesRead {
                room_id: room_id.clone(),
                reader_id: reader_id.clone(),
            },
            // Notifications belong to the notification collaborator, not to
            // connected sockets.
            ChatEvent::Notification { .. } => return,
        };

        let payload = match serde_json::to_string(&frame) {
            Ok(p) => p,
            Err(e) => {
                error!("failed to encode server frame: {}", e);
                return;
            }
        };

        let sessions = self.sessions.lock().await;
        for user_id in event.recipients() {
            let Some(session) = sessions.get(user_id) else {
                continue;
            };
            // Cross-check presence so a socket that died without cleanup does
            // not accumulate sends forever; TTL expiry marks it offline.
            match self.presence.is_online(user_id).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!("skipping delivery to {}: presence says offline", user_id);
                    continue;
                }
                Err(e) => {
                    warn!("presence check failed during delivery: {}", e);
                }
            }
            if session.sender.send(WsMessage::Text(payload.clone())).is_err() {
                debug!("local session for {} is gone", user_id);
            }
        }
    }

    /// Drive one connection: authenticate the first frame, then serve
    /// operations until the socket closes.
    pub async fn handle_connection(
        self: Arc<Self>,
        ws_stream: WebSocketStream<tokio::net::TcpStream>,
    ) -> ChatResult<()> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let auth_wait = tokio::time::timeout(
            Duration::from_secs(self.config.auth_timeout_secs),
            ws_receiver.next(),
        )
        .await;

        let token = match auth_wait {
            Ok(Some(Ok(WsMessage::Text(text)))) => {
                match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(ClientFrame::Auth { token }) => token,
                    Ok(_) | Err(_) => {
                        let frame = ServerFrame::AuthError {
                            error: "expected an auth frame".to_string(),
                        };
                        let _ = ws_sender
                            .send(WsMessage::Text(serde_json::to_string(&frame)?))
                            .await;
                        return Err(ChatError::Unauthorized);
                    }
                }
            }
            Ok(Some(Ok(WsMessage::Close(_)))) | Ok(None) => {
                debug!("connection closed before authentication");
                return Ok(());
            }
            Ok(Some(Ok(_))) | Ok(Some(Err(_))) => {
                return Err(ChatError::Unauthorized);
            }
            Err(_) => {
                let frame = ServerFrame::AuthError {
                    error: "authentication timeout".to_string(),
                };
                let _ = ws_sender
                    .send(WsMessage::Text(serde_json::to_string(&frame)?))
                    .await;
                return Err(ChatError::Unauthorized);
            }
        };

        let Some(user_id) = auth::validate_session(&self.db, &token).await? else {
            let frame = ServerFrame::AuthError {
                error: "invalid or expired credential".to_string(),
            };
            let _ = ws_sender
                .send(WsMessage::Text(serde_json::to_string(&frame)?))
                .await;
            return Err(ChatError::Unauthorized);
        };

        let frame = ServerFrame::AuthOk {
            user_id: user_id.clone(),
        };
        ws_sender
            .send(WsMessage::Text(serde_json::to_string(&frame)?))
            .await
            .map_err(|_| ChatError::Unauthorized)?;
        info!("connection authenticated for user {}", user_id);

        let stream = ws_sender
            .reunite(ws_receiver)
            .map_err(|_| ChatError::Unauthorized)?;
        self.run_session(stream, user_id).await;
        Ok(())
    }

    async fn run_session(
        self: Arc<Self>,
        ws_stream: WebSocketStream<tokio::net::TcpStream>,
        user_id: UserId,
    ) {
        let client_id: ClientId = Uuid::new_v4().to_string();
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

        // One live connection per user; a newer one evicts the older.
        {
            let mut sessions = self.sessions.lock().await;
            if let Some(old) = sessions.insert(
                user_id.clone(),
                ClientSession {
                    client_id: client_id.clone(),
                    sender: tx,
                },
            ) {
                let _ = old.sender.send(WsMessage::Close(None));
                debug!("evicted older session {} for user {}", old.client_id, user_id);
            }
        }

        if let Err(e) = self.presence.set_online(&user_id).await {
            warn!("set_online failed for {}: {}", user_id, e);
        }

        let send_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if ws_sender.send(message).await.is_err() {
                    break;
                }
            }
        });

        // Heartbeat keeps the online TTL fresh; when it stops, expiry takes
        // over and the user decays to offline on its own.
        let heartbeat_gateway = self.clone();
        let heartbeat_user = user_id.clone();
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(
                heartbeat_gateway.config.heartbeat_interval_secs,
            ));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = heartbeat_gateway.presence.set_online(&heartbeat_user).await {
                    warn!("heartbeat refresh failed for {}: {}", heartbeat_user, e);
                }
            }
        });

        let gateway = self.clone();
        let recv_user = user_id.clone();
        let receive_task = tokio::spawn(async move {
            let mut joined_rooms: HashSet<String> = HashSet::new();

            while let Some(message) = ws_receiver.next().await {
                match message {
                    Ok(WsMessage::Text(text)) => {
                        let frame = match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                debug!("unparseable frame from {}: {}", recv_user, e);
                                gateway
                                    .push_to(
                                        &recv_user,
                                        &ServerFrame::Error {
                                            op: "parse".to_string(),
                                            code: "invalid_message".to_string(),
                                            message: format!("invalid frame: {}", e),
                                            retryable: false,
                                        },
                                    )
                                    .await;
                                continue;
                            }
                        };
                        gateway
                            .handle_frame(&recv_user, frame, &mut joined_rooms)
                            .await;
                    }
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection-lifecycle cleanup: leave every joined room. Presence
            // TTL is the backstop when this never runs.
            for room_id in joined_rooms.drain() {
                if let Err(e) = gateway.presence.remove_from_room(&room_id, &recv_user).await {
                    warn!("leave on disconnect failed for room {}: {}", room_id, e);
                }
            }
        });

        tokio::select! {
            _ = send_task => {}
            _ = receive_task => {}
        }
        heartbeat_task.abort();

        // Remove our session only if a newer connection has not replaced it.
        {
            let mut sessions = self.sessions.lock().await;
            let ours = sessions
                .get(&user_id)
                .map(|s| s.client_id == client_id)
                .unwrap_or(false);
            if ours {
                sessions.remove(&user_id);
                if let Err(e) = self.presence.set_offline(&user_id).await {
                    warn!("set_offline failed for {}: {}", user_id, e);
                }
            }
        }
        info!("session {} for user {} closed", client_id, user_id);
    }

    async fn handle_frame(
        &self,
        user_id: &str,
        frame: ClientFrame,
        joined_rooms: &mut HashSet<String>,
    ) {
        match frame {
            // A second auth frame on a bound connection is ignored.
            ClientFrame::Auth { .. } => {}

            ClientFrame::SendMessage {
                room_id,
                to_user,
                booking_id,
                hotel_id,
                content,
                kind,
                attachment,
            } => {
                let input = NewMessageInput {
                    content,
                    kind: kind.unwrap_or(MessageKind::Text),
                    attachment,
                    metadata: None,
                };
                let result = match (room_id, to_user) {
                    (Some(room_id), _) => self.messages.send(&room_id, user_id, input).await,
                    (None, Some(to_user)) => {
                        self.messages
                            .send_direct(
                                user_id,
                                &to_user,
                                booking_id.as_deref(),
                                hotel_id.as_deref(),
                                input,
                            )
                            .await
                    }
                    (None, None) => Err(ChatError::InvalidMessage(
                        "send_message requires room_id or to_user".into(),
                    )),
                };
                let frame = match result {
                    Ok(message) => ServerFrame::Ack {
                        op: "send_message".to_string(),
                        message: Some(message),
                    },
                    Err(e) => ServerFrame::from_error("send_message", &e),
                };
                self.push_to(user_id, &frame).await;
            }

            ClientFrame::MarkRead { room_id } => {
                let frame = match self.messages.mark_read(&room_id, user_id).await {
                    Ok(()) => ServerFrame::Ack {
                        op: "mark_read".to_string(),
                        message: None,
                    },
                    Err(e) => ServerFrame::from_error("mark_read", &e),
                };
                self.push_to(user_id, &frame).await;
            }

            ClientFrame::JoinRoom { room_id } => {
                let frame = match self.join_room(user_id, &room_id).await {
                    Ok(messages) => {
                        joined_rooms.insert(room_id.clone());
                        ServerFrame::History { room_id, messages }
                    }
                    Err(e) => ServerFrame::from_error("join_room", &e),
                };
                self.push_to(user_id, &frame).await;
            }

            ClientFrame::LeaveRoom { room_id } => {
                joined_rooms.remove(&room_id);
                let frame = match self.presence.remove_from_room(&room_id, user_id).await {
                    Ok(()) => ServerFrame::Ack {
                        op: "leave_room".to_string(),
                        message: None,
                    },
                    Err(e) => ServerFrame::from_error("leave_room", &e),
                };
                self.push_to(user_id, &frame).await;
            }
        }
    }

    /// Membership-check, register in the room's presence set, and return the
    /// first history page for the view to render.
    async fn join_room(&self, user_id: &str, room_id: &str) -> ChatResult<Vec<Message>> {
        let room = self.rooms.room_by_id(room_id).await?;
        if !room.has_participant(user_id) {
            return Err(ChatError::Forbidden);
        }
        self.presence.add_to_room(room_id, user_id).await?;
        self.messages
            .history(room_id, user_id, self.config.history_page_limit, None)
            .await
    }

    async fn push_to(&self, user_id: &str, frame: &ServerFrame) {
        let payload = match serde_json::to_string(frame) {
            Ok(p) => p,
            Err(e) => {
                error!("failed to encode server frame: {}", e);
                return;
            }
        };
        let sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(user_id) {
            let _ = session.sender.send(WsMessage::Text(payload));
        }
    }

    #[cfg(test)]
    async fn insert_test_session(
        &self,
        user_id: &str,
    ) -> mpsc::UnboundedReceiver<WsMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.lock().await.insert(
            user_id.to_string(),
            ClientSession {
                client_id: Uuid::new_v4().to_string(),
                sender: tx,
            },
        );
        rx
    }
}
