//! Wire protocol for the session server.
//!
//! Every frame is a JSON text message, adjacently tagged as
//! `{"type": "<event>", "data": {...}}` with camelCase event and field names.
//! Inbound frames go through [`ClientMessage::from_json`], which rejects
//! oversized frames, unknown events, and empty or oversized identifiers before
//! any state is touched.
//!
//! Game state and secret mappings are opaque [`serde_json::Value`] blobs: the
//! server stores and forwards them verbatim and never inspects their contents.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SessionError};
use crate::error_codes::ErrorCode;

/// Maximum accepted size of a single inbound text frame, in bytes.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

/// Maximum length of a room key or identity string.
pub const MAX_ID_LEN: usize = 128;

// ── Identifiers ─────────────────────────────────────────────────────

/// Stable player identity that survives reconnects.
///
/// Derived from a wallet address when the client has one, otherwise a
/// server-assigned UUID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Assign a fresh identity to a client that did not bring one.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of a room (one game or lobby instance).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transient identifier of one transport connection. A new one is minted for
/// every connection, so a reconnecting player always arrives with a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Secondary numeric game identifier some clients know instead of the room key.
pub type GameId = u64;

// ── Shared structs ──────────────────────────────────────────────────

/// How a client identifies itself when joining or rejoining.
///
/// Matching precedence is fixed: `identity` when present, otherwise
/// `address`. The two are never combined.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityHint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    /// Correlating address, consulted only when `identity` is absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Display name shown to the other members.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl IdentityHint {
    pub fn identity(identity: impl Into<String>) -> Self {
        Self {
            identity: Some(Identity::new(identity)),
            ..Self::default()
        }
    }

    pub fn address(address: impl Into<String>) -> Self {
        Self {
            address: Some(address.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// One entry of a room's member list, in seat order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberInfo {
    pub identity: Identity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub joined_at: DateTime<Utc>,
}

/// Why a player's transport went away. Only this fixed reason string reaches
/// the room; the underlying error stays in the server log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    #[serde(rename = "transport close")]
    TransportClose,
    #[serde(rename = "transport error")]
    TransportError,
    #[serde(rename = "ping timeout")]
    PingTimeout,
    #[serde(rename = "server shutting down")]
    ServerShutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransportClose => "transport close",
            Self::TransportError => "transport error",
            Self::PingTimeout => "ping timeout",
            Self::ServerShutdown => "server shutting down",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Payload structs ─────────────────────────────────────────────────

/// Acknowledgment of a `join` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinAck {
    pub room: RoomId,
    /// The identity the server bound to this connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<Identity>,
    /// `true` when an existing session was reattached instead of created.
    #[serde(default)]
    pub reused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

/// Acknowledgment of a `rejoinRoom` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejoinAck {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_id: Option<GameId>,
    #[serde(default)]
    pub members: Vec<MemberInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
}

/// Restored game state pushed to a (re)connecting client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStateSyncPayload {
    pub room: RoomId,
    pub state: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_mapping: Option<serde_json::Value>,
    #[serde(default)]
    pub members: Vec<MemberInfo>,
    pub restored: bool,
}

// ── Messages ────────────────────────────────────────────────────────

/// Message types sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Enter a room, reclaiming a disconnected seat when the hint matches one.
    Join {
        room: RoomId,
        #[serde(default)]
        identity_hint: IdentityHint,
    },
    /// Rejoin a room after the transport dropped.
    RejoinRoom {
        room: RoomId,
        #[serde(default)]
        game_id_hint: Option<GameId>,
        #[serde(default)]
        identity_hint: IdentityHint,
    },
    /// Ask for the latest stored snapshot of a room.
    RequestGameStateSync {
        room: RoomId,
        #[serde(default)]
        game_id_hint: Option<GameId>,
    },
    /// First authoritative state of a new game.
    InitGameState {
        room: RoomId,
        #[serde(default)]
        game_id: Option<GameId>,
        state: serde_json::Value,
        #[serde(default)]
        secret_mapping: Option<serde_json::Value>,
    },
    /// Replacement authoritative state after a move.
    UpdateGameState {
        room: RoomId,
        state: serde_json::Value,
        #[serde(default)]
        secret_mapping: Option<serde_json::Value>,
    },
    /// Leave the current room immediately, without a grace period.
    LeaveRoom,
    /// Tear the room down: drop its snapshot and release every seat.
    CloseRoom { room: RoomId },
    /// Application-level keepalive.
    Ping,
}

impl ClientMessage {
    /// Parse and validate one inbound text frame.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Protocol`] for oversized frames or invalid
    /// identifiers and [`SessionError::Serialization`] for malformed JSON or
    /// unknown events.
    pub fn from_json(text: &str) -> Result<Self> {
        if text.len() > MAX_FRAME_BYTES {
            return Err(SessionError::Protocol {
                code: ErrorCode::MessageTooLarge,
                message: format!("frame of {} bytes exceeds {MAX_FRAME_BYTES}", text.len()),
            });
        }
        let msg: Self = serde_json::from_str(text)?;
        msg.validate()?;
        Ok(msg)
    }

    /// Check identifier fields against the boundary rules.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Protocol`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Join {
                room,
                identity_hint,
            }
            | Self::RejoinRoom {
                room,
                identity_hint,
                ..
            } => {
                validate_room(room)?;
                validate_hint(identity_hint)
            }
            Self::RequestGameStateSync { room, .. }
            | Self::InitGameState { room, .. }
            | Self::UpdateGameState { room, .. }
            | Self::CloseRoom { room } => validate_room(room),
            Self::LeaveRoom | Self::Ping => Ok(()),
        }
    }

    /// Event name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::RejoinRoom { .. } => "rejoinRoom",
            Self::RequestGameStateSync { .. } => "requestGameStateSync",
            Self::InitGameState { .. } => "initGameState",
            Self::UpdateGameState { .. } => "updateGameState",
            Self::LeaveRoom => "leaveRoom",
            Self::CloseRoom { .. } => "closeRoom",
            Self::Ping => "ping",
        }
    }
}

fn validate_room(room: &RoomId) -> Result<()> {
    let value = room.as_str().trim();
    if value.is_empty() || room.as_str().len() > MAX_ID_LEN {
        return Err(SessionError::Protocol {
            code: ErrorCode::InvalidRoom,
            message: format!("room must be 1..={MAX_ID_LEN} non-blank characters"),
        });
    }
    Ok(())
}

fn validate_hint(hint: &IdentityHint) -> Result<()> {
    let bad = |value: &str| value.trim().is_empty() || value.len() > MAX_ID_LEN;
    if hint.identity.as_ref().is_some_and(|id| bad(id.as_str()))
        || hint.address.as_deref().is_some_and(bad)
    {
        return Err(SessionError::Protocol {
            code: ErrorCode::InvalidIdentity,
            message: format!("identity and address must be 1..={MAX_ID_LEN} non-blank characters"),
        });
    }
    Ok(())
}

/// Message types sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    /// Result of a `join` request.
    JoinAck(JoinAck),
    /// Result of a `rejoinRoom` request.
    RejoinAck(Box<RejoinAck>),
    /// Stored snapshot of a room (boxed to reduce enum size).
    GameStateSync(Box<GameStateSyncPayload>),
    /// No snapshot exists for the room, so it expired or never started.
    GameStateSyncFailed {
        room: RoomId,
        error: String,
        error_code: ErrorCode,
    },
    /// Verbatim rebroadcast of `initGameState`.
    GameStateInitialized {
        room: RoomId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        game_id: Option<GameId>,
        from: Identity,
        state: serde_json::Value,
    },
    /// Verbatim rebroadcast of `updateGameState`.
    GameStateUpdated {
        room: RoomId,
        from: Identity,
        state: serde_json::Value,
    },
    /// A member's transport dropped; their seat is held for the grace period.
    PlayerDisconnected {
        identity: Identity,
        temporary: bool,
        reason: DisconnectReason,
    },
    /// A disconnected member came back within the grace period.
    PlayerReconnected {
        identity: Identity,
        timestamp: DateTime<Utc>,
    },
    /// A member is gone for good.
    PlayerLeft { identity: Identity, permanent: bool },
    /// Full member list of a room, in seat order.
    RoomData {
        room: RoomId,
        members: Vec<MemberInfo>,
    },
    /// This connection no longer holds a seat in `room`.
    LeftRoom { room: RoomId },
    /// The room was torn down.
    RoomClosed { room: RoomId },
    /// Request-level error.
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_code: Option<ErrorCode>,
    },
    /// Reply to `ping`.
    Pong,
}

impl ServerMessage {
    /// Build an `error` frame from a [`SessionError`].
    pub fn from_error(err: &SessionError) -> Self {
        Self::Error {
            message: err.to_string(),
            error_code: Some(err.error_code()),
        }
    }
}
