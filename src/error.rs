//! Error types for the session server.

use thiserror::Error;

use crate::error_codes::ErrorCode;
use crate::presence::InvalidTransition;
use crate::protocol::RoomId;
use crate::store::StoreError;

/// Errors that can occur while serving sessions.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The room already holds as many members as it has seats.
    #[error("room {room} is full ({capacity} seats)")]
    RoomFull {
        /// Room that rejected the join.
        room: RoomId,
        /// Configured seat count.
        capacity: usize,
    },

    /// The room is unknown or has expired, or holds no session for the caller.
    #[error("Room not found")]
    RoomNotFound {
        /// Room the client asked for.
        room: RoomId,
    },

    /// The connection has no seat in the room it addressed.
    #[error("not in room {room}")]
    NotInRoom {
        /// Room the client addressed.
        room: RoomId,
    },

    /// A presence transition was requested from a state that has no such edge.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// The snapshot backend failed. Callers degrade this to a cache miss.
    #[error("snapshot store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// An inbound frame violated the protocol rules.
    #[error("protocol error: {message}")]
    Protocol {
        /// Code sent back to the client.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
    },

    /// Failed to serialize or deserialize a protocol message.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failed to send a message through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a message from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed.
    #[error("transport connection closed")]
    TransportClosed,

    /// The event loop has shut down.
    #[error("session server stopped")]
    ServerStopped,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Wire code reported to the client for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::RoomFull { .. } => ErrorCode::RoomFull,
            Self::RoomNotFound { .. } => ErrorCode::RoomNotFound,
            Self::NotInRoom { .. } => ErrorCode::NotInRoom,
            Self::StoreUnavailable(_) => ErrorCode::StorageError,
            Self::Protocol { code, .. } => *code,
            Self::Serialization(_) => ErrorCode::InvalidInput,
            Self::ServerStopped => ErrorCode::ServiceUnavailable,
            Self::InvalidTransition(_) => ErrorCode::InternalError,
            Self::TransportSend(_)
            | Self::TransportReceive(_)
            | Self::TransportClosed
            | Self::Io(_) => ErrorCode::InternalError,
        }
    }
}

/// A specialized [`Result`] type for session server operations.
pub type Result<T> = std::result::Result<T, SessionError>;
