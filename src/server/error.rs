use thiserror::Error;

pub type ChatResult<T> = Result<T, ChatError>;

/// Error taxonomy for the chat core.
///
/// Validation and authorization failures are returned synchronously to the
/// caller; infrastructure failures on the durable path abort the operation,
/// while failures on the best-effort real-time path are logged and swallowed
/// by the callers themselves.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("participants must be two distinct, non-empty user ids")]
    InvalidParticipants,

    #[error("participant not found: {0}")]
    ParticipantNotFound(String),

    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("sender is not a member of this room")]
    Forbidden,

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("invalid or expired credential")]
    Unauthorized,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ChatError {
    /// Stable wire code for transport-level error frames.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::InvalidParticipants => "invalid_participants",
            ChatError::ParticipantNotFound(_) => "participant_not_found",
            ChatError::RoomNotFound(_) => "room_not_found",
            ChatError::Forbidden => "forbidden",
            ChatError::InvalidMessage(_) => "invalid_message",
            ChatError::Unauthorized => "unauthorized",
            ChatError::Database(_) | ChatError::Redis(_) | ChatError::Serialization(_) => {
                "internal"
            }
        }
    }

    /// Whether the client may retry the same operation unchanged.
    pub fn retryable(&self) -> bool {
        matches!(self, ChatError::Database(_) | ChatError::Redis(_))
    }
}
