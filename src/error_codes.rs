//! Error codes for structured error handling on the wire.
//!
//! Codes serialize using `SCREAMING_SNAKE_CASE` (e.g. `"ROOM_NOT_FOUND"`) so
//! clients can branch on them without parsing the human-readable message.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured error codes sent to clients alongside failure acknowledgments.
///
/// Use [`description()`](ErrorCode::description) for a human-readable explanation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors
    InvalidInput,
    InvalidRoom,
    InvalidIdentity,
    MessageTooLarge,

    // Room errors
    RoomNotFound,
    RoomFull,
    NotInRoom,

    // Session errors
    SessionSuperseded,

    // Server errors
    InternalError,
    StorageError,
    ServiceUnavailable,
}

impl ErrorCode {
    /// Returns a human-readable description of this error code.
    pub fn description(&self) -> &'static str {
        match self {
            // Validation errors
            Self::InvalidInput => {
                "The message is invalid or malformed. Check the event name and payload fields."
            }
            Self::InvalidRoom => {
                "The room identifier is empty or too long."
            }
            Self::InvalidIdentity => {
                "The identity hint is empty or too long."
            }
            Self::MessageTooLarge => {
                "The message size exceeds the maximum allowed limit. Please send a smaller message."
            }

            // Room errors
            Self::RoomNotFound => {
                "The requested room could not be found. It may have expired; join it again as a new player."
            }
            Self::RoomFull => {
                "The room has reached its maximum player capacity. Try joining a different room."
            }
            Self::NotInRoom => {
                "You are not currently in this room. Join the room before performing this action."
            }

            // Session errors
            Self::SessionSuperseded => {
                "This identity connected from another session, which now owns the seat."
            }

            // Server errors
            Self::InternalError => {
                "An internal server error occurred. Please try again or contact support if the issue persists."
            }
            Self::StorageError => {
                "A storage error occurred while processing your request. Please try again later."
            }
            Self::ServiceUnavailable => {
                "The service is temporarily unavailable. Please try again in a few moments."
            }
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn codes_use_screaming_snake_case() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::RoomNotFound).unwrap(),
            "\"ROOM_NOT_FOUND\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorCode::SessionSuperseded).unwrap(),
            "\"SESSION_SUPERSEDED\""
        );
        let code: ErrorCode = serde_json::from_str("\"ROOM_FULL\"").unwrap();
        assert_eq!(code, ErrorCode::RoomFull);
    }

    #[test]
    fn display_uses_description() {
        assert_eq!(
            ErrorCode::RoomFull.to_string(),
            ErrorCode::RoomFull.description()
        );
    }
}
