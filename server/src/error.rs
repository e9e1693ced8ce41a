//! Error types for the broker.
//!
//! Every handler returns `Result<_, BrokerError>`. The router converts the
//! error into a wire `error` message at a single place, using [`BrokerError::code`]
//! for the stable code and its category.

use shared::{ClientRole, ErrorCode, ServerMessage, SessionState};
use thiserror::Error;

use crate::connection::ConnectionId;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BrokerError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    #[error("Message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("Client must identify before sending {0}")]
    NotIdentified(String),

    #[error("Role {role} may not send {message_type}")]
    Unauthorized {
        role: ClientRole,
        message_type: String,
    },

    #[error("Only the room host may {0}")]
    NotRoomHost(&'static str),

    #[error("Connection {0} not found")]
    ConnectionNotFound(ConnectionId),

    #[error("Connection {0} is not open")]
    ConnectionClosed(ConnectionId),

    #[error("Session {0} not found")]
    SessionNotFound(String),

    #[error("Room {0} not found")]
    RoomNotFound(String),

    #[error("Player for session {0} not found")]
    PlayerNotFound(String),

    #[error("Server is at its connection limit")]
    ServerFull,

    #[error("Session limit reached")]
    SessionLimit,

    #[error("Room limit reached")]
    RoomLimit,

    #[error("Session is full ({0} sensors)")]
    SessionFull(usize),

    #[error("Room is full ({0} players)")]
    RoomFull(usize),

    #[error("No session code available after {0} attempts")]
    CodeSpaceExhausted(u32),

    #[error("Sensor slot {0} is already taken")]
    SlotTaken(String),

    #[error("Role is already set to {0}")]
    RoleAlreadySet(ClientRole),

    #[error("Connection already belongs to session {0}")]
    AlreadyInSession(String),

    #[error("Session already belongs to room {0}")]
    AlreadyInRoom(String),

    #[error("Cannot {action} while session is {state}")]
    InvalidSessionState {
        action: &'static str,
        state: SessionState,
    },

    #[error("{0}")]
    InvalidState(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BrokerError::InvalidMessage(_) => ErrorCode::InvalidMessage,
            BrokerError::UnknownMessageType(_) => ErrorCode::UnknownMessageType,
            BrokerError::MessageTooLarge { .. } => ErrorCode::MessageTooLarge,
            BrokerError::NotIdentified(_) => ErrorCode::NotIdentified,
            BrokerError::Unauthorized { .. } => ErrorCode::Unauthorized,
            BrokerError::NotRoomHost(_) => ErrorCode::NotRoomHost,
            BrokerError::ConnectionNotFound(_) => ErrorCode::ConnectionNotFound,
            BrokerError::ConnectionClosed(_) => ErrorCode::ConnectionClosed,
            BrokerError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            BrokerError::RoomNotFound(_) => ErrorCode::RoomNotFound,
            BrokerError::PlayerNotFound(_) => ErrorCode::PlayerNotFound,
            BrokerError::ServerFull => ErrorCode::ServerFull,
            BrokerError::SessionLimit => ErrorCode::SessionLimit,
            BrokerError::RoomLimit => ErrorCode::RoomLimit,
            BrokerError::SessionFull(_) => ErrorCode::SessionFull,
            BrokerError::RoomFull(_) => ErrorCode::RoomFull,
            BrokerError::CodeSpaceExhausted(_) => ErrorCode::CodeSpaceExhausted,
            BrokerError::SlotTaken(_) => ErrorCode::SlotTaken,
            BrokerError::RoleAlreadySet(_) => ErrorCode::RoleAlreadySet,
            BrokerError::AlreadyInSession(_) => ErrorCode::AlreadyInSession,
            BrokerError::AlreadyInRoom(_) => ErrorCode::AlreadyInRoom,
            BrokerError::InvalidSessionState { .. } | BrokerError::InvalidState(_) => {
                ErrorCode::InvalidState
            }
            BrokerError::RateLimited => ErrorCode::RateLimited,
            BrokerError::Internal(_) => ErrorCode::InternalError,
        }
    }

    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::error(self.code(), self.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::InvalidMessage(e.to_string())
    }
}
