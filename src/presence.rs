//! Presence state machine.
//!
//! Decides when a player is announced as gone. A dropped transport only moves
//! the player to `Disconnected`; the seat is released when the grace period
//! runs out or the player leaves explicitly.
//!
//! ```text
//!            TransportLost              GraceExpired
//! ┌────────┐ ─────────────▶ ┌──────────────┐ ────────────▶ ┌─────────┐
//! │ Active │                │ Disconnected │               │ Removed │
//! └────────┘ ◀───────────── └──────────────┘               └─────────┘
//!     │        Reconnect                                        ▲
//!     └──────────────────────────── Leave ──────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::protocol::{ConnectionId, DisconnectReason, Identity, ServerMessage};

/// Coarse status of a session, as exposed to callers and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Active,
    Disconnected,
    Removed,
}

/// Full presence state. The connection id only exists while `Active`, so a
/// disconnected session can never be addressed through a stale connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceState {
    /// Bound to a live transport.
    Active { connection: ConnectionId },

    /// Transport lost; waiting out the grace period.
    Disconnected {
        since: DateTime<Utc>,
        reason: DisconnectReason,
    },

    /// Terminal. The session is purged right after entering this state.
    Removed,
}

impl PresenceState {
    pub fn status(&self) -> PresenceStatus {
        match self {
            Self::Active { .. } => PresenceStatus::Active,
            Self::Disconnected { .. } => PresenceStatus::Disconnected,
            Self::Removed => PresenceStatus::Removed,
        }
    }

    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            Self::Active { connection } => Some(*connection),
            _ => None,
        }
    }

    pub fn disconnected_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Disconnected { since, .. } => Some(*since),
            _ => None,
        }
    }

    /// Compute the next state for `event` without mutating `self`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] when `event` has no edge from the current
    /// state (e.g. a grace expiry for a player who is already back).
    pub fn apply(&self, event: &PresenceEvent) -> Result<Transition, InvalidTransition> {
        use PresenceEvent as E;

        let invalid = |reason: &'static str| InvalidTransition {
            from: self.status(),
            event: event.name(),
            reason,
        };

        match (self, event) {
            (Self::Active { .. }, E::TransportLost { reason, at }) => Ok(Transition {
                next: Self::Disconnected {
                    since: *at,
                    reason: *reason,
                },
                notice: Some(PresenceNotice::TemporarilyDisconnected { reason: *reason }),
            }),
            (Self::Disconnected { .. }, E::TransportLost { .. }) => {
                Err(invalid("already disconnected"))
            }

            (Self::Disconnected { .. }, E::Reconnect { connection, at }) => Ok(Transition {
                next: Self::Active {
                    connection: *connection,
                },
                notice: Some(PresenceNotice::Reconnected { at: *at }),
            }),
            // Same identity opened a second transport; it takes the seat over.
            (Self::Active { .. }, E::Reconnect { connection, .. }) => Ok(Transition {
                next: Self::Active {
                    connection: *connection,
                },
                notice: None,
            }),

            (Self::Disconnected { .. }, E::GraceExpired) => Ok(Transition {
                next: Self::Removed,
                notice: Some(PresenceNotice::LeftPermanently),
            }),
            (Self::Active { .. }, E::GraceExpired) => Err(invalid("player is connected")),

            (Self::Active { .. } | Self::Disconnected { .. }, E::Leave) => Ok(Transition {
                next: Self::Removed,
                notice: Some(PresenceNotice::LeftPermanently),
            }),

            (Self::Removed, _) => Err(invalid("session already removed")),
        }
    }
}

/// Inputs to the presence state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    TransportLost {
        reason: DisconnectReason,
        at: DateTime<Utc>,
    },
    Reconnect {
        connection: ConnectionId,
        at: DateTime<Utc>,
    },
    GraceExpired,
    Leave,
}

impl PresenceEvent {
    fn name(&self) -> &'static str {
        match self {
            Self::TransportLost { .. } => "transport_lost",
            Self::Reconnect { .. } => "reconnect",
            Self::GraceExpired => "grace_expired",
            Self::Leave => "leave",
        }
    }
}

/// Result of a valid transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: PresenceState,
    /// What the rest of the room should be told, if anything.
    pub notice: Option<PresenceNotice>,
}

/// Room notification produced by a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceNotice {
    TemporarilyDisconnected { reason: DisconnectReason },
    Reconnected { at: DateTime<Utc> },
    LeftPermanently,
}

impl PresenceNotice {
    /// Render the notice as the frame broadcast to the room.
    pub fn to_message(self, identity: &Identity) -> ServerMessage {
        match self {
            Self::TemporarilyDisconnected { reason } => ServerMessage::PlayerDisconnected {
                identity: identity.clone(),
                temporary: true,
                reason,
            },
            Self::Reconnected { at } => ServerMessage::PlayerReconnected {
                identity: identity.clone(),
                timestamp: at,
            },
            Self::LeftPermanently => ServerMessage::PlayerLeft {
                identity: identity.clone(),
                permanent: true,
            },
        }
    }
}

/// Error when a presence transition is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid presence transition from {from:?} via {event}: {reason}")]
pub struct InvalidTransition {
    pub from: PresenceStatus,
    pub event: &'static str,
    pub reason: &'static str,
}
