//! Connection registry.
//!
//! Maps transient connection ids to durable player sessions and keeps each
//! room's seat order. Seats are assigned in join order and survive a
//! disconnect/reconnect cycle: a reattached session returns to its original
//! position rather than being appended.
//!
//! The registry never talks to clients. Every mutating call returns what
//! changed, and the caller is expected to rebroadcast the room's member list.
//!
//! # Matching a returning player
//!
//! A join or rejoin is matched to an existing session by the hint's stable
//! `identity` when one is given. Only when the hint carries no identity is the
//! correlating `address` consulted, and then only against disconnected
//! sessions of the same room, in seat order.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{Result, SessionError};
use crate::presence::{PresenceEvent, PresenceNotice, PresenceState, PresenceStatus};
use crate::protocol::{
    ConnectionId, DisconnectReason, GameId, Identity, IdentityHint, MemberInfo, RoomId,
};

/// Default number of seats per room.
pub const DEFAULT_ROOM_CAPACITY: usize = 6;

/// A player's session. One per identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerSession {
    /// Stable identity; survives reconnects.
    pub identity: Identity,
    /// Display name, if the client supplied one.
    pub name: Option<String>,
    /// Correlating address used to match identity-less reconnects.
    pub address: Option<String>,
    /// Room this session holds a seat in.
    pub room: RoomId,
    /// Presence state, including the current connection while active.
    pub state: PresenceState,
    /// When the seat was first taken.
    pub joined_at: DateTime<Utc>,
}

impl PlayerSession {
    /// Current transport connection; `None` unless active.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.state.connection()
    }

    pub fn status(&self) -> PresenceStatus {
        self.state.status()
    }

    /// When the transport was lost; `None` unless disconnected.
    pub fn disconnected_at(&self) -> Option<DateTime<Utc>> {
        self.state.disconnected_at()
    }

    pub fn is_active(&self) -> bool {
        self.status() == PresenceStatus::Active
    }

    pub fn member_info(&self) -> MemberInfo {
        MemberInfo {
            identity: self.identity.clone(),
            name: self.name.clone(),
            joined_at: self.joined_at,
        }
    }
}

/// Result of a successful join or rejoin.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// The session now bound to the joining connection.
    pub session: PlayerSession,
    /// `true` when an existing session was reattached.
    pub reused: bool,
    /// Room notification for the transition (set when a disconnected player came back).
    pub notice: Option<PresenceNotice>,
    /// Connection that owned the seat before an identity takeover.
    pub superseded: Option<ConnectionId>,
    /// Sessions released to make this join possible (the connection's previous
    /// seat, or the identity's seat in another room).
    pub vacated: Vec<Departure>,
}

/// A session that left the active set.
#[derive(Debug, Clone)]
pub struct Departure {
    /// The session after its transition.
    pub session: PlayerSession,
    /// Connection the session was bound to before the transition.
    pub connection: Option<ConnectionId>,
    /// Room notification for the transition.
    pub notice: Option<PresenceNotice>,
}

/// Registry of player sessions, indexed by identity, connection and room.
#[derive(Debug)]
pub struct ConnectionRegistry {
    capacity: usize,
    sessions: HashMap<Identity, PlayerSession>,
    connections: HashMap<ConnectionId, Identity>,
    /// Seat order per room. Disconnected sessions keep their seat.
    seats: HashMap<RoomId, Vec<Identity>>,
    games: HashMap<GameId, RoomId>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_ROOM_CAPACITY)
    }
}

impl ConnectionRegistry {
    /// Create an empty registry with `capacity` seats per room (at least 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            sessions: HashMap::new(),
            connections: HashMap::new(),
            seats: HashMap::new(),
            games: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take a seat in `room`, reclaiming a matching session when there is one.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::RoomFull`] when a new seat is needed and the
    /// room has none left. A failed join releases nothing.
    pub fn join(
        &mut self,
        connection: ConnectionId,
        room: &RoomId,
        hint: &IdentityHint,
        now: DateTime<Utc>,
    ) -> Result<JoinOutcome> {
        if let Some(session) = self.get_by_connection(connection) {
            let same_identity = hint
                .identity
                .as_ref()
                .is_none_or(|id| *id == session.identity);
            if session.room == *room && same_identity {
                return Ok(JoinOutcome {
                    session: session.clone(),
                    reused: true,
                    notice: None,
                    superseded: None,
                    vacated: Vec::new(),
                });
            }
        }

        let matched = self.find_match(room, hint);
        let reclaim = matched
            .as_ref()
            .filter(|id| self.room_of(id) == Some(room))
            .cloned();

        let mut releasing = Vec::new();
        if let Some(current) = self.connections.get(&connection) {
            if reclaim.as_ref() != Some(current) {
                releasing.push(current.clone());
            }
        }
        if let (Some(other), None) = (&matched, &reclaim) {
            if !releasing.contains(other) {
                releasing.push(other.clone());
            }
        }

        if reclaim.is_none() {
            let occupied = self.seats.get(room).map_or(0, |seats| {
                seats.iter().filter(|id| !releasing.contains(id)).count()
            });
            if occupied >= self.capacity {
                debug!(room = %room, capacity = self.capacity, "join rejected: room full");
                return Err(SessionError::RoomFull {
                    room: room.clone(),
                    capacity: self.capacity,
                });
            }
        }

        let vacated = self.release_all(&releasing);

        let mut outcome = match reclaim {
            Some(identity) => self.rebind(&identity, room, connection, hint, now)?,
            None => self.seat_new(connection, room, hint, now),
        };
        outcome.vacated = vacated;
        Ok(outcome)
    }

    /// Reattach a returning player to their existing seat in `room`.
    ///
    /// Unlike [`join`](Self::join) this never creates a session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::RoomNotFound`] when `room` holds no session
    /// matching `hint`; the client should fall back to a fresh join.
    pub fn reattach(
        &mut self,
        connection: ConnectionId,
        room: &RoomId,
        hint: &IdentityHint,
        now: DateTime<Utc>,
    ) -> Result<JoinOutcome> {
        let identity = self
            .find_match(room, hint)
            .filter(|id| self.room_of(id) == Some(room))
            .ok_or_else(|| SessionError::RoomNotFound { room: room.clone() })?;

        let releasing: Vec<Identity> = self
            .connections
            .get(&connection)
            .filter(|current| **current != identity)
            .cloned()
            .into_iter()
            .collect();
        let vacated = self.release_all(&releasing);

        let mut outcome = self.rebind(&identity, room, connection, hint, now)?;
        outcome.vacated = vacated;
        Ok(outcome)
    }

    /// Mark the session on `connection` as disconnected. Its seat is kept.
    pub fn disconnect(
        &mut self,
        connection: ConnectionId,
        reason: DisconnectReason,
        now: DateTime<Utc>,
    ) -> Option<Departure> {
        let identity = self.connections.get(&connection)?.clone();
        let session = self.sessions.get_mut(&identity)?;
        let transition = match session
            .state
            .apply(&PresenceEvent::TransportLost { reason, at: now })
        {
            Ok(transition) => transition,
            Err(err) => {
                debug!(identity = %identity, %err, "ignoring transport loss");
                return None;
            }
        };
        session.state = transition.next;
        let session = session.clone();
        self.connections.remove(&connection);
        debug!(identity = %identity, room = %session.room, %reason, "session disconnected");
        Some(Departure {
            session,
            connection: Some(connection),
            notice: transition.notice,
        })
    }

    /// Remove the session on `connection` immediately, bypassing the grace period.
    pub fn leave(&mut self, connection: ConnectionId) -> Option<Departure> {
        let identity = self.connections.get(&connection)?.clone();
        self.purge(&identity, &PresenceEvent::Leave)
    }

    /// Remove a session whose grace period ran out. No-op unless the session
    /// is still disconnected.
    pub fn expire(&mut self, identity: &Identity) -> Option<Departure> {
        self.purge(identity, &PresenceEvent::GraceExpired)
    }

    /// Tear a room down, releasing every seat in it.
    pub fn close_room(&mut self, room: &RoomId) -> Vec<Departure> {
        let seated = self.seats.get(room).cloned().unwrap_or_default();
        self.unbind_room(room);
        self.release_all(&seated)
    }

    pub fn get_by_connection(&self, connection: ConnectionId) -> Option<&PlayerSession> {
        self.connections
            .get(&connection)
            .and_then(|identity| self.sessions.get(identity))
    }

    pub fn get_by_identity(&self, identity: &Identity) -> Option<&PlayerSession> {
        self.sessions.get(identity)
    }

    /// Active sessions of `room`, in seat order.
    pub fn list_active_in_room(&self, room: &RoomId) -> Vec<&PlayerSession> {
        self.members(room)
            .into_iter()
            .filter(|session| session.is_active())
            .collect()
    }

    /// Every seated session of `room` (active or within grace), in seat order.
    pub fn members(&self, room: &RoomId) -> Vec<&PlayerSession> {
        self.seats
            .get(room)
            .map(|seats| {
                seats
                    .iter()
                    .filter_map(|identity| self.sessions.get(identity))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Member list broadcast to clients.
    pub fn member_infos(&self, room: &RoomId) -> Vec<MemberInfo> {
        self.list_active_in_room(room)
            .into_iter()
            .map(PlayerSession::member_info)
            .collect()
    }

    /// Connections of the active members of `room`, in seat order.
    pub fn active_connections(&self, room: &RoomId) -> Vec<ConnectionId> {
        self.members(room)
            .into_iter()
            .filter_map(PlayerSession::connection_id)
            .collect()
    }

    /// `true` while at least one seat in `room` is taken.
    pub fn contains_room(&self, room: &RoomId) -> bool {
        self.seats.contains_key(room)
    }

    /// Number of rooms with at least one seated session.
    pub fn room_count(&self) -> usize {
        self.seats.len()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Associate a numeric game id with `room` so clients that only know the
    /// game id can still find it.
    pub fn bind_game(&mut self, game_id: GameId, room: &RoomId) {
        self.games.insert(game_id, room.clone());
    }

    /// Forget every game id bound to `room`.
    pub fn unbind_room(&mut self, room: &RoomId) {
        self.games.retain(|_, bound| bound != room);
    }

    /// Rooms that still have a game id bound but no seat taken.
    pub fn unseated_bound_rooms(&self) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = self
            .games
            .values()
            .filter(|room| !self.contains_room(room))
            .cloned()
            .collect();
        rooms.sort();
        rooms.dedup();
        rooms
    }

    pub fn game_for_room(&self, room: &RoomId) -> Option<GameId> {
        self.games
            .iter()
            .find(|(_, bound)| *bound == room)
            .map(|(game_id, _)| *game_id)
    }

    /// Room bound to `game_id`, if any.
    pub fn room_for_game(&self, game_id: GameId) -> Option<&RoomId> {
        self.games.get(&game_id)
    }

    /// Resolve a rejoin target: the room itself when it has seats, otherwise
    /// the seated room bound to `game_hint`.
    pub fn resolve_room(&self, room: &RoomId, game_hint: Option<GameId>) -> Option<RoomId> {
        if self.contains_room(room) {
            return Some(room.clone());
        }
        game_hint
            .and_then(|game_id| self.room_for_game(game_id))
            .filter(|bound| self.contains_room(bound))
            .cloned()
    }

    // ── Internal helpers ────────────────────────────────────────────

    fn room_of(&self, identity: &Identity) -> Option<&RoomId> {
        self.sessions.get(identity).map(|session| &session.room)
    }

    fn find_match(&self, room: &RoomId, hint: &IdentityHint) -> Option<Identity> {
        if let Some(identity) = &hint.identity {
            return self.sessions.contains_key(identity).then(|| identity.clone());
        }
        let address = hint.address.as_deref()?;
        self.members(room)
            .into_iter()
            .find(|session| {
                session.status() == PresenceStatus::Disconnected
                    && session.address.as_deref() == Some(address)
            })
            .map(|session| session.identity.clone())
    }

    fn rebind(
        &mut self,
        identity: &Identity,
        room: &RoomId,
        connection: ConnectionId,
        hint: &IdentityHint,
        now: DateTime<Utc>,
    ) -> Result<JoinOutcome> {
        let session = self
            .sessions
            .get_mut(identity)
            .ok_or_else(|| SessionError::RoomNotFound { room: room.clone() })?;
        let previous = session.state.connection();
        let transition = session
            .state
            .apply(&PresenceEvent::Reconnect { connection, at: now })?;
        session.state = transition.next;
        if hint.name.is_some() {
            session.name.clone_from(&hint.name);
        }
        if hint.address.is_some() {
            session.address.clone_from(&hint.address);
        }
        let session = session.clone();

        if let Some(previous) = previous {
            self.connections.remove(&previous);
        }
        self.connections.insert(connection, identity.clone());
        debug!(identity = %identity, room = %session.room, "session reattached");

        Ok(JoinOutcome {
            session,
            reused: true,
            notice: transition.notice,
            superseded: previous.filter(|previous| *previous != connection),
            vacated: Vec::new(),
        })
    }

    fn seat_new(
        &mut self,
        connection: ConnectionId,
        room: &RoomId,
        hint: &IdentityHint,
        now: DateTime<Utc>,
    ) -> JoinOutcome {
        let identity = hint.identity.clone().unwrap_or_else(Identity::generate);
        let session = PlayerSession {
            identity: identity.clone(),
            name: hint.name.clone(),
            address: hint.address.clone(),
            room: room.clone(),
            state: PresenceState::Active { connection },
            joined_at: now,
        };
        self.sessions.insert(identity.clone(), session.clone());
        self.connections.insert(connection, identity.clone());
        self.seats.entry(room.clone()).or_default().push(identity.clone());
        debug!(identity = %identity, room = %room, "session created");

        JoinOutcome {
            session,
            reused: false,
            notice: None,
            superseded: None,
            vacated: Vec::new(),
        }
    }

    fn release_all(&mut self, identities: &[Identity]) -> Vec<Departure> {
        identities
            .iter()
            .filter_map(|identity| self.purge(identity, &PresenceEvent::Leave))
            .collect()
    }

    /// Apply a terminal transition and drop the session from every index.
    fn purge(&mut self, identity: &Identity, event: &PresenceEvent) -> Option<Departure> {
        let transition = match self.sessions.get(identity)?.state.apply(event) {
            Ok(transition) => transition,
            Err(err) => {
                debug!(identity = %identity, %err, "session not purged");
                return None;
            }
        };
        let mut session = self.sessions.remove(identity)?;
        let connection = session.state.connection();
        if let Some(connection) = connection {
            self.connections.remove(&connection);
        }
        if let Some(seats) = self.seats.get_mut(&session.room) {
            seats.retain(|seated| seated != identity);
            if seats.is_empty() {
                self.seats.remove(&session.room);
            }
        }
        session.state = transition.next;
        debug!(identity = %identity, room = %session.room, "session removed");
        Some(Departure {
            session,
            connection,
            notice: transition.notice,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn conn(n: u128) -> ConnectionId {
        ConnectionId::from_u128(n)
    }

    fn room(name: &str) -> RoomId {
        RoomId::new(name)
    }

    fn who(name: &str) -> IdentityHint {
        IdentityHint::identity(name)
    }

    fn active_names(registry: &ConnectionRegistry, room: &RoomId) -> Vec<String> {
        registry
            .list_active_in_room(room)
            .into_iter()
            .map(|s| s.identity.to_string())
            .collect()
    }

    #[test]
    fn join_creates_active_session() {
        let mut registry = ConnectionRegistry::default();
        let outcome = registry.join(conn(1), &room("r1"), &who("alice"), Utc::now()).unwrap();
        assert!(!outcome.reused);
        assert_eq!(outcome.session.connection_id(), Some(conn(1)));
        assert_eq!(outcome.session.status(), PresenceStatus::Active);
        assert_eq!(
            registry.get_by_connection(conn(1)).unwrap().identity,
            Identity::new("alice")
        );
        assert!(registry.get_by_identity(&Identity::new("alice")).is_some());
    }

    #[test]
    fn join_without_identity_assigns_one() {
        let mut registry = ConnectionRegistry::default();
        let outcome = registry
            .join(conn(1), &room("r1"), &IdentityHint::default(), Utc::now())
            .unwrap();
        assert!(!outcome.session.identity.as_str().is_empty());
    }

    #[test]
    fn join_is_idempotent_on_same_connection() {
        let mut registry = ConnectionRegistry::default();
        registry.join(conn(1), &room("r1"), &who("alice"), Utc::now()).unwrap();
        let again = registry.join(conn(1), &room("r1"), &who("alice"), Utc::now()).unwrap();
        assert!(again.reused);
        assert_eq!(registry.session_count(), 1);
        assert_eq!(registry.list_active_in_room(&room("r1")).len(), 1);
    }

    #[test]
    fn seventh_join_is_rejected_and_not_added() {
        let mut registry = ConnectionRegistry::new(6);
        for n in 0..6 {
            registry
                .join(conn(n), &room("r1"), &who(&format!("p{n}")), Utc::now())
                .unwrap();
        }
        let err = registry
            .join(conn(99), &room("r1"), &who("late"), Utc::now())
            .unwrap_err();
        assert!(matches!(err, SessionError::RoomFull { capacity: 6, .. }));
        assert_eq!(registry.list_active_in_room(&room("r1")).len(), 6);
        assert!(registry.get_by_identity(&Identity::new("late")).is_none());
    }

    #[test]
    fn disconnected_member_keeps_seat_for_capacity() {
        let mut registry = ConnectionRegistry::new(2);
        registry.join(conn(1), &room("r1"), &who("a"), Utc::now()).unwrap();
        registry.join(conn(2), &room("r1"), &who("b"), Utc::now()).unwrap();
        registry.disconnect(conn(2), DisconnectReason::TransportClose, Utc::now());
        assert!(registry.join(conn(3), &room("r1"), &who("c"), Utc::now()).is_err());
    }

    #[test]
    fn reconnect_within_grace_reuses_session_and_room() {
        let mut registry = ConnectionRegistry::default();
        registry.join(conn(1), &room("r1"), &who("alice"), Utc::now()).unwrap();
        let departure = registry
            .disconnect(conn(1), DisconnectReason::TransportClose, Utc::now())
            .unwrap();
        assert_eq!(departure.session.status(), PresenceStatus::Disconnected);
        assert!(departure.session.disconnected_at().is_some());
        assert!(registry.get_by_connection(conn(1)).is_none());

        let outcome = registry.join(conn(2), &room("r1"), &who("alice"), Utc::now()).unwrap();
        assert!(outcome.reused);
        assert_eq!(outcome.session.room, room("r1"));
        assert_eq!(outcome.session.connection_id(), Some(conn(2)));
        assert!(outcome.session.disconnected_at().is_none());
        assert!(matches!(outcome.notice, Some(PresenceNotice::Reconnected { .. })));
    }

    #[test]
    fn seat_order_survives_disconnect_and_reconnect() {
        let mut registry = ConnectionRegistry::default();
        let r1 = room("r1");
        registry.join(conn(1), &r1, &who("A"), Utc::now()).unwrap();
        registry.join(conn(2), &r1, &who("B"), Utc::now()).unwrap();
        registry.join(conn(3), &r1, &who("C"), Utc::now()).unwrap();

        registry.disconnect(conn(2), DisconnectReason::TransportError, Utc::now());
        assert_eq!(active_names(&registry, &r1), ["A", "C"]);

        let outcome = registry.reattach(conn(4), &r1, &who("B"), Utc::now()).unwrap();
        assert!(outcome.reused);
        assert_eq!(active_names(&registry, &r1), ["A", "B", "C"]);
    }

    #[test]
    fn address_matches_only_when_identity_absent() {
        let mut registry = ConnectionRegistry::default();
        let r1 = room("r1");
        let hint = IdentityHint {
            identity: Some(Identity::new("alice")),
            address: Some("10.0.0.7".into()),
            name: None,
        };
        registry.join(conn(1), &r1, &hint, Utc::now()).unwrap();
        registry.disconnect(conn(1), DisconnectReason::TransportClose, Utc::now());

        // Address alone finds the disconnected seat.
        let outcome = registry
            .join(conn(2), &r1, &IdentityHint::address("10.0.0.7"), Utc::now())
            .unwrap();
        assert!(outcome.reused);
        assert_eq!(outcome.session.identity, Identity::new("alice"));

        // A different identity from the same address gets its own seat.
        registry.disconnect(conn(2), DisconnectReason::TransportClose, Utc::now());
        let other = IdentityHint {
            identity: Some(Identity::new("bob")),
            address: Some("10.0.0.7".into()),
            name: None,
        };
        let outcome = registry.join(conn(3), &r1, &other, Utc::now()).unwrap();
        assert!(!outcome.reused);
        assert_eq!(registry.members(&r1).len(), 2);
    }

    #[test]
    fn active_identity_on_new_connection_supersedes_old_one() {
        let mut registry = ConnectionRegistry::default();
        registry.join(conn(1), &room("r1"), &who("alice"), Utc::now()).unwrap();
        let outcome = registry.join(conn(2), &room("r1"), &who("alice"), Utc::now()).unwrap();
        assert!(outcome.reused);
        assert_eq!(outcome.superseded, Some(conn(1)));
        assert!(outcome.notice.is_none());
        assert!(registry.get_by_connection(conn(1)).is_none());
        assert_eq!(registry.session_count(), 1);
    }

    #[test]
    fn joining_another_room_vacates_the_old_seat() {
        let mut registry = ConnectionRegistry::default();
        registry.join(conn(1), &room("r1"), &who("alice"), Utc::now()).unwrap();
        let outcome = registry.join(conn(1), &room("r2"), &who("alice"), Utc::now()).unwrap();
        assert!(!outcome.reused);
        assert_eq!(outcome.vacated.len(), 1);
        assert_eq!(outcome.vacated[0].session.room, room("r1"));
        assert!(!registry.contains_room(&room("r1")));
        assert_eq!(registry.get_by_identity(&Identity::new("alice")).unwrap().room, room("r2"));
    }

    #[test]
    fn full_target_room_keeps_old_seat() {
        let mut registry = ConnectionRegistry::new(1);
        registry.join(conn(1), &room("r1"), &who("alice"), Utc::now()).unwrap();
        registry.join(conn(2), &room("r2"), &who("bob"), Utc::now()).unwrap();
        assert!(registry.join(conn(1), &room("r2"), &who("alice"), Utc::now()).is_err());
        assert_eq!(registry.get_by_identity(&Identity::new("alice")).unwrap().room, room("r1"));
    }

    #[test]
    fn reattach_unknown_identity_is_room_not_found() {
        let mut registry = ConnectionRegistry::default();
        registry.join(conn(1), &room("r1"), &who("alice"), Utc::now()).unwrap();
        let err = registry
            .reattach(conn(2), &room("r1"), &who("mallory"), Utc::now())
            .unwrap_err();
        assert!(matches!(err, SessionError::RoomNotFound { .. }));
        let err = registry
            .reattach(conn(2), &room("r9"), &who("alice"), Utc::now())
            .unwrap_err();
        assert!(matches!(err, SessionError::RoomNotFound { .. }));
    }

    #[test]
    fn leave_removes_immediately() {
        let mut registry = ConnectionRegistry::default();
        registry.join(conn(1), &room("r1"), &who("alice"), Utc::now()).unwrap();
        let departure = registry.leave(conn(1)).unwrap();
        assert_eq!(departure.session.status(), PresenceStatus::Removed);
        assert_eq!(departure.notice, Some(PresenceNotice::LeftPermanently));
        assert!(registry.get_by_identity(&Identity::new("alice")).is_none());
        assert!(!registry.contains_room(&room("r1")));
        assert!(registry.leave(conn(1)).is_none());
    }

    #[test]
    fn expire_only_removes_disconnected_sessions() {
        let mut registry = ConnectionRegistry::default();
        let alice = Identity::new("alice");
        registry.join(conn(1), &room("r1"), &who("alice"), Utc::now()).unwrap();
        assert!(registry.expire(&alice).is_none());

        registry.disconnect(conn(1), DisconnectReason::TransportClose, Utc::now());
        let departure = registry.expire(&alice).unwrap();
        assert_eq!(departure.session.status(), PresenceStatus::Removed);
        assert!(registry.list_active_in_room(&room("r1")).is_empty());
        assert!(registry.expire(&alice).is_none());
    }

    #[test]
    fn game_id_resolves_to_seated_room() {
        let mut registry = ConnectionRegistry::default();
        let r1 = room("r1");
        registry.join(conn(1), &r1, &who("alice"), Utc::now()).unwrap();
        registry.bind_game(42, &r1);
        assert_eq!(registry.resolve_room(&room("unknown"), Some(42)), Some(r1.clone()));
        assert_eq!(registry.resolve_room(&r1, None), Some(r1.clone()));
        assert_eq!(registry.resolve_room(&room("unknown"), Some(7)), None);
        assert_eq!(registry.game_for_room(&r1), Some(42));
    }

    #[test]
    fn emptied_room_is_reported_with_its_game_ids() {
        let mut registry = ConnectionRegistry::default();
        let r1 = room("r1");
        registry.join(conn(1), &r1, &who("alice"), Utc::now()).unwrap();
        registry.bind_game(7, &r1);
        registry.bind_game(8, &r1);
        assert!(registry.unseated_bound_rooms().is_empty());

        registry.leave(conn(1)).unwrap();
        assert_eq!(registry.unseated_bound_rooms(), vec![r1.clone()]);
        registry.unbind_room(&r1);
        assert!(registry.unseated_bound_rooms().is_empty());
        assert!(registry.room_for_game(7).is_none());
    }

    #[test]
    fn close_room_releases_every_seat() {
        let mut registry = ConnectionRegistry::default();
        let r1 = room("r1");
        registry.join(conn(1), &r1, &who("a"), Utc::now()).unwrap();
        registry.join(conn(2), &r1, &who("b"), Utc::now()).unwrap();
        registry.disconnect(conn(2), DisconnectReason::TransportClose, Utc::now());
        registry.bind_game(5, &r1);

        let departed = registry.close_room(&r1);
        assert_eq!(departed.len(), 2);
        assert_eq!(registry.session_count(), 0);
        assert_eq!(registry.room_count(), 0);
        assert!(registry.room_for_game(5).is_none());
    }

    #[test]
    fn one_session_per_identity_across_operations() {
        let mut registry = ConnectionRegistry::default();
        registry.join(conn(1), &room("r1"), &who("alice"), Utc::now()).unwrap();
        registry.join(conn(2), &room("r1"), &who("alice"), Utc::now()).unwrap();
        registry.disconnect(conn(2), DisconnectReason::TransportClose, Utc::now());
        registry.join(conn(3), &room("r2"), &who("alice"), Utc::now()).unwrap();
        let active: Vec<_> = [room("r1"), room("r2")]
            .iter()
            .flat_map(|r| registry.list_active_in_room(r))
            .filter(|s| s.identity == Identity::new("alice"))
            .map(|s| s.room.clone())
            .collect();
        assert_eq!(active, vec![room("r2")]);
    }
}
