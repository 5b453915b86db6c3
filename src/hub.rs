//! Reconnection protocol handler.
//!
//! [`SessionHub`] owns the registry, the grace scheduler and the outbound
//! channel of every open connection, and turns inbound frames, transport
//! losses and timer expiries into registry transitions plus the frames the
//! affected clients must see. It is driven by exactly one task (see
//! [`server`](crate::server)), so none of its state is locked.
//!
//! Store writes are awaited in place, which keeps one connection's writes in
//! order. Snapshot reads for a sync are spawned: the reply arrives on the
//! connection's outbound channel whenever the read completes, and registry
//! work never waits on the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::SessionError;
use crate::error_codes::ErrorCode;
use crate::protocol::{
    ClientMessage, ConnectionId, DisconnectReason, GameId, GameStateSyncPayload, IdentityHint,
    JoinAck, MemberInfo, RejoinAck, RoomId, ServerMessage,
};
use crate::registry::{ConnectionRegistry, Departure};
use crate::scheduler::{Expiry, GraceScheduler};
use crate::store::{SnapshotStore, StoreBackend};

/// Sender half of a connection's outbound frame queue.
pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

/// Body of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    /// Always `"ok"` while the event loop answers.
    pub status: &'static str,
    pub uptime_secs: u64,
    /// Rooms with a stored snapshot. `None` when the store did not answer.
    pub snapshots: Option<usize>,
    /// Rooms with at least one seated member.
    pub active_rooms: usize,
    /// Open transport connections.
    pub connections: usize,
    pub store_backend: StoreBackend,
}

/// Session state of one server process.
pub struct SessionHub {
    registry: ConnectionRegistry,
    scheduler: GraceScheduler,
    store: Arc<dyn SnapshotStore>,
    outbound: HashMap<ConnectionId, Outbound>,
    snapshot_max_age: Duration,
    started_at: Instant,
}

impl SessionHub {
    /// Build a hub from `config` and return the receiver on which grace
    /// expiries must be fed back through [`handle_expiry`](Self::handle_expiry).
    pub fn new(
        config: &ServerConfig,
        store: Arc<dyn SnapshotStore>,
    ) -> (Self, mpsc::UnboundedReceiver<Expiry>) {
        let (scheduler, expiry_rx) = GraceScheduler::channel(config.grace_period);
        let hub = Self {
            registry: ConnectionRegistry::new(config.room_capacity),
            scheduler,
            store,
            outbound: HashMap::new(),
            snapshot_max_age: config.snapshot_max_age,
            started_at: Instant::now(),
        };
        (hub, expiry_rx)
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &GraceScheduler {
        &self.scheduler
    }

    pub fn connection_count(&self) -> usize {
        self.outbound.len()
    }

    // ── Connection lifecycle ────────────────────────────────────────

    /// Register a new transport connection.
    pub fn connect(&mut self, connection: ConnectionId, outbound: Outbound) {
        debug!(%connection, "connection opened");
        self.outbound.insert(connection, outbound);
    }

    /// Handle one raw inbound frame. Frames that fail validation are answered
    /// with an `error` frame and touch no state.
    pub async fn handle_text(&mut self, connection: ConnectionId, text: &str) {
        match ClientMessage::from_json(text) {
            Ok(msg) => self.handle_message(connection, msg).await,
            Err(err) => {
                debug!(%connection, "rejected inbound frame: {err}");
                self.send(connection, ServerMessage::from_error(&err));
            }
        }
    }

    /// Dispatch one validated message.
    pub async fn handle_message(&mut self, connection: ConnectionId, msg: ClientMessage) {
        debug!(%connection, kind = msg.kind(), "handling client message");
        match msg {
            ClientMessage::Join {
                room,
                identity_hint,
            } => self.join(connection, room, identity_hint),
            ClientMessage::RejoinRoom {
                room,
                game_id_hint,
                identity_hint,
            } => self.rejoin(connection, room, game_id_hint, identity_hint),
            ClientMessage::RequestGameStateSync { room, game_id_hint } => {
                self.request_sync(connection, room, game_id_hint);
            }
            ClientMessage::InitGameState {
                room,
                game_id,
                state,
                secret_mapping,
            } => {
                self.write_state(connection, room, game_id, state, secret_mapping, true)
                    .await;
            }
            ClientMessage::UpdateGameState {
                room,
                state,
                secret_mapping,
            } => {
                self.write_state(connection, room, None, state, secret_mapping, false)
                    .await;
            }
            ClientMessage::LeaveRoom => self.leave(connection),
            ClientMessage::CloseRoom { room } => self.close_room(connection, room).await,
            ClientMessage::Ping => self.send(connection, ServerMessage::Pong),
        }
    }

    /// The transport of `connection` is gone. Its session, if any, enters the
    /// grace period and the room is told the absence is temporary.
    pub fn handle_closed(&mut self, connection: ConnectionId, reason: DisconnectReason) {
        self.outbound.remove(&connection);
        let Some(departure) = self.registry.disconnect(connection, reason, Utc::now()) else {
            debug!(%connection, %reason, "connection closed without a session");
            return;
        };
        let identity = departure.session.identity.clone();
        let room = departure.session.room.clone();
        self.scheduler.arm(&identity);
        info!(
            identity = %identity,
            room = %room,
            %reason,
            "player disconnected; grace period started"
        );

        if let Some(notice) = departure.notice {
            self.broadcast(&room, &notice.to_message(&identity), None);
        }
        self.broadcast_room_data(&room);
    }

    /// A grace timer fired. Stale expiries (cancelled or re-armed since) are
    /// ignored.
    pub fn handle_expiry(&mut self, expiry: &Expiry) {
        if !self.scheduler.claim(expiry) {
            return;
        }
        let Some(departure) = self.registry.expire(&expiry.identity) else {
            return;
        };
        let room = departure.session.room.clone();
        info!(identity = %expiry.identity, room = %room, "grace period expired; player removed");
        self.announce_departure(&departure);
    }

    /// Drop expired snapshots, then forget the game ids of rooms that have
    /// neither a seated player nor a snapshot left.
    /// Failures are logged and retried on the next sweep.
    pub async fn sweep(&mut self) {
        match self.store.sweep_expired(self.snapshot_max_age).await {
            Ok(swept) => {
                if !swept.is_empty() {
                    info!(count = swept.len(), "swept expired snapshots");
                }
            }
            Err(err) => warn!("snapshot sweep failed: {err}"),
        }

        // A game id outlives its room's seats only while the snapshot does.
        for room in self.registry.unseated_bound_rooms() {
            match self.store.get_state(&room).await {
                Ok(None) => {
                    debug!(room = %room, "dropping game id of finished room");
                    self.registry.unbind_room(&room);
                }
                Ok(Some(_)) => {}
                Err(err) => warn!(room = %room, "snapshot lookup failed during sweep: {err}"),
            }
        }
    }

    /// Current health counters.
    pub async fn health(&self) -> HealthReport {
        let snapshots = match self.store.snapshot_count().await {
            Ok(count) => Some(count),
            Err(err) => {
                warn!("snapshot count unavailable: {err}");
                None
            }
        };
        HealthReport {
            status: "ok",
            uptime_secs: self.started_at.elapsed().as_secs(),
            snapshots,
            active_rooms: self.registry.room_count(),
            connections: self.outbound.len(),
            store_backend: self.store.backend(),
        }
    }

    /// Close every outbound queue so connection pumps shut their transports.
    pub fn shutdown(&mut self) {
        info!(connections = self.outbound.len(), "closing all connections");
        self.outbound.clear();
    }

    // ── Handlers ────────────────────────────────────────────────────

    fn join(&mut self, connection: ConnectionId, room: RoomId, hint: IdentityHint) {
        let outcome = match self.registry.join(connection, &room, &hint, Utc::now()) {
            Ok(outcome) => outcome,
            Err(err) => {
                debug!(%connection, room = %room, "join rejected: {err}");
                self.send(
                    connection,
                    ServerMessage::JoinAck(JoinAck {
                        room,
                        identity: None,
                        reused: false,
                        error: Some(err.to_string()),
                        error_code: Some(err.error_code()),
                    }),
                );
                return;
            }
        };

        for departure in &outcome.vacated {
            self.announce_departure(departure);
        }

        let identity = outcome.session.identity.clone();
        self.scheduler.cancel(&identity);
        if let Some(previous) = outcome.superseded {
            self.supersede(previous);
        }

        info!(identity = %identity, room = %room, reused = outcome.reused, "player joined");
        self.send(
            connection,
            ServerMessage::JoinAck(JoinAck {
                room: room.clone(),
                identity: Some(identity.clone()),
                reused: outcome.reused,
                error: None,
                error_code: None,
            }),
        );
        if let Some(notice) = outcome.notice {
            self.broadcast(&room, &notice.to_message(&identity), Some(connection));
        }
        self.broadcast_room_data(&room);
        if outcome.reused {
            self.push_sync(connection, room);
        }
    }

    fn rejoin(
        &mut self,
        connection: ConnectionId,
        room: RoomId,
        game_id_hint: Option<GameId>,
        hint: IdentityHint,
    ) {
        let resolved = self
            .registry
            .resolve_room(&room, game_id_hint)
            .ok_or_else(|| SessionError::RoomNotFound { room: room.clone() })
            .and_then(|target| {
                self.registry
                    .reattach(connection, &target, &hint, Utc::now())
                    .map(|outcome| (target, outcome))
            });
        let (target, outcome) = match resolved {
            Ok(found) => found,
            Err(err) => {
                debug!(%connection, room = %room, "rejoin rejected: {err}");
                self.send(
                    connection,
                    ServerMessage::RejoinAck(Box::new(RejoinAck {
                        success: false,
                        room: None,
                        game_id: None,
                        members: Vec::new(),
                        error: Some(err.to_string()),
                        error_code: Some(err.error_code()),
                    })),
                );
                return;
            }
        };

        for departure in &outcome.vacated {
            self.announce_departure(departure);
        }
        let identity = outcome.session.identity.clone();
        self.scheduler.cancel(&identity);
        if let Some(previous) = outcome.superseded {
            self.supersede(previous);
        }

        info!(identity = %identity, room = %target, "player rejoined");
        let members = self.registry.member_infos(&target);
        self.send(
            connection,
            ServerMessage::RejoinAck(Box::new(RejoinAck {
                success: true,
                room: Some(target.clone()),
                game_id: self.registry.game_for_room(&target),
                members,
                error: None,
                error_code: None,
            })),
        );
        if let Some(notice) = outcome.notice {
            self.broadcast(&target, &notice.to_message(&identity), Some(connection));
        }
        self.broadcast_room_data(&target);
        self.push_sync(connection, target);
    }

    fn request_sync(
        &mut self,
        connection: ConnectionId,
        room: RoomId,
        game_id_hint: Option<GameId>,
    ) {
        let target = self
            .registry
            .resolve_room(&room, game_id_hint)
            .or_else(|| game_id_hint.and_then(|id| self.registry.room_for_game(id).cloned()))
            .unwrap_or(room);
        self.push_sync(connection, target);
    }

    async fn write_state(
        &mut self,
        connection: ConnectionId,
        room: RoomId,
        game_id: Option<GameId>,
        state: serde_json::Value,
        secret_mapping: Option<serde_json::Value>,
        initial: bool,
    ) {
        let Some(author) = self
            .registry
            .get_by_connection(connection)
            .filter(|session| session.room == room)
            .map(|session| session.identity.clone())
        else {
            let err = SessionError::NotInRoom { room };
            self.send(connection, ServerMessage::from_error(&err));
            return;
        };

        if initial {
            // A new game starts clean: no mapping or game id of the last one.
            if let Err(err) = self.store.delete_room(&room).await {
                warn!(room = %room, "snapshot reset failed: {err}");
            }
            self.registry.unbind_room(&room);
        }
        if let Err(err) = self.store.save_state(&room, state.clone()).await {
            warn!(room = %room, "snapshot write failed: {err}");
        }
        if let Some(mapping) = secret_mapping {
            if let Err(err) = self.store.save_secret_mapping(&room, mapping).await {
                warn!(room = %room, "secret mapping write failed: {err}");
            }
        }
        if let Some(game_id) = game_id {
            self.registry.bind_game(game_id, &room);
        }

        let msg = if initial {
            ServerMessage::GameStateInitialized {
                room: room.clone(),
                game_id,
                from: author,
                state,
            }
        } else {
            ServerMessage::GameStateUpdated {
                room: room.clone(),
                from: author,
                state,
            }
        };
        self.broadcast(&room, &msg, None);
    }

    fn leave(&mut self, connection: ConnectionId) {
        let Some(departure) = self.registry.leave(connection) else {
            self.send(
                connection,
                ServerMessage::Error {
                    message: "not in a room".into(),
                    error_code: Some(ErrorCode::NotInRoom),
                },
            );
            return;
        };
        self.scheduler.cancel(&departure.session.identity);
        info!(
            identity = %departure.session.identity,
            room = %departure.session.room,
            "player left"
        );
        self.announce_departure(&departure);
    }

    async fn close_room(&mut self, connection: ConnectionId, room: RoomId) {
        let is_member = self
            .registry
            .get_by_connection(connection)
            .is_some_and(|session| session.room == room);
        if !is_member {
            let err = SessionError::NotInRoom { room };
            self.send(connection, ServerMessage::from_error(&err));
            return;
        }

        if let Err(err) = self.store.delete_room(&room).await {
            warn!(room = %room, "snapshot delete failed: {err}");
        }
        self.broadcast(&room, &ServerMessage::RoomClosed { room: room.clone() }, None);
        for departure in self.registry.close_room(&room) {
            self.scheduler.cancel(&departure.session.identity);
        }
        info!(room = %room, "room closed");
    }

    // ── Internal helpers ────────────────────────────────────────────

    /// Tell a room that a member is gone for good, and tell the member's
    /// connection, if it still has one, that it no longer holds the seat.
    fn announce_departure(&mut self, departure: &Departure) {
        let room = &departure.session.room;
        let identity = &departure.session.identity;
        self.scheduler.cancel(identity);
        if let Some(notice) = departure.notice {
            self.broadcast(room, &notice.to_message(identity), None);
        }
        self.broadcast_room_data(room);
        if let Some(connection) = departure.connection {
            self.send(connection, ServerMessage::LeftRoom { room: room.clone() });
        }
    }

    /// The identity of `previous` reconnected elsewhere; notify the old
    /// connection and stop delivering room traffic to it.
    fn supersede(&mut self, previous: ConnectionId) {
        debug!(connection = %previous, "connection superseded");
        self.send(
            previous,
            ServerMessage::Error {
                message: ErrorCode::SessionSuperseded.description().into(),
                error_code: Some(ErrorCode::SessionSuperseded),
            },
        );
        self.outbound.remove(&previous);
    }

    /// Read the room's snapshot off-loop and deliver it to `connection`.
    fn push_sync(&self, connection: ConnectionId, room: RoomId) {
        let Some(tx) = self.outbound.get(&connection).cloned() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let members = self.registry.member_infos(&room);
        tokio::spawn(async move {
            let msg = load_sync(store.as_ref(), room, members).await;
            // Connection may be gone by the time the read completes.
            let _ = tx.send(msg);
        });
    }

    fn broadcast_room_data(&self, room: &RoomId) {
        let msg = ServerMessage::RoomData {
            room: room.clone(),
            members: self.registry.member_infos(room),
        };
        self.broadcast(room, &msg, None);
    }

    /// Send `msg` to every active member of `room` except `skip`.
    fn broadcast(&self, room: &RoomId, msg: &ServerMessage, skip: Option<ConnectionId>) {
        for connection in self.registry.active_connections(room) {
            if Some(connection) != skip {
                self.send(connection, msg.clone());
            }
        }
    }

    fn send(&self, connection: ConnectionId, msg: ServerMessage) {
        match self.outbound.get(&connection) {
            Some(tx) => {
                if tx.send(msg).is_err() {
                    debug!(%connection, "outbound queue closed; frame dropped");
                }
            }
            None => debug!(%connection, "no outbound queue; frame dropped"),
        }
    }
}

impl std::fmt::Debug for SessionHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHub")
            .field("sessions", &self.registry.session_count())
            .field("rooms", &self.registry.room_count())
            .field("connections", &self.outbound.len())
            .field("room_capacity", &self.registry.capacity())
            .field("grace_period", &self.scheduler.grace_period())
            .field("armed_timers", &self.scheduler.armed_count())
            .field("store_backend", &self.store.backend())
            .finish()
    }
}

/// Build the reply to a sync request. A store failure is reported to the
/// client exactly like a missing snapshot.
async fn load_sync(
    store: &dyn SnapshotStore,
    room: RoomId,
    members: Vec<MemberInfo>,
) -> ServerMessage {
    let snapshot = match store.load_snapshot(&room).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!(room = %room, "snapshot read failed, treating as miss: {err}");
            None
        }
    };
    match snapshot {
        Some(snapshot) => ServerMessage::GameStateSync(Box::new(GameStateSyncPayload {
            room,
            state: snapshot.state,
            secret_mapping: snapshot.secret_mapping,
            members,
            restored: true,
        })),
        None => {
            let err = SessionError::RoomNotFound { room: room.clone() };
            ServerMessage::GameStateSyncFailed {
                room,
                error: err.to_string(),
                error_code: err.error_code(),
            }
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::protocol::Identity;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    type Inbox = mpsc::UnboundedReceiver<ServerMessage>;

    fn hub() -> (SessionHub, mpsc::UnboundedReceiver<Expiry>) {
        SessionHub::new(&ServerConfig::new(), Arc::new(MemoryStore::new()))
    }

    fn open(hub: &mut SessionHub) -> (ConnectionId, Inbox) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = ConnectionId::new();
        hub.connect(connection, tx);
        (connection, rx)
    }

    fn drain(rx: &mut Inbox) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn join(room: &str, identity: &str) -> ClientMessage {
        ClientMessage::Join {
            room: RoomId::new(room),
            identity_hint: IdentityHint::identity(identity),
        }
    }

    fn rejoin(room: &str, identity: &str) -> ClientMessage {
        ClientMessage::RejoinRoom {
            room: RoomId::new(room),
            game_id_hint: None,
            identity_hint: IdentityHint::identity(identity),
        }
    }

    #[tokio::test]
    async fn join_acks_and_broadcasts_room_data() {
        let (mut hub, _expiries) = hub();
        let (alice, mut alice_rx) = open(&mut hub);
        hub.handle_message(alice, join("r1", "alice")).await;

        let frames = drain(&mut alice_rx);
        assert!(matches!(
            &frames[0],
            ServerMessage::JoinAck(JoinAck { reused: false, error: None, .. })
        ));
        match &frames[1] {
            ServerMessage::RoomData { members, .. } => {
                assert_eq!(members.len(), 1);
                assert_eq!(members[0].identity, Identity::new("alice"));
            }
            other => panic!("expected roomData, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_then_rejoin_restores_seat_and_state() {
        let (mut hub, _expiries) = hub();
        let (alice, _alice_rx) = open(&mut hub);
        let (bob, mut bob_rx) = open(&mut hub);
        hub.handle_message(alice, join("r1", "alice")).await;
        hub.handle_message(bob, join("r1", "bob")).await;
        hub.handle_message(
            alice,
            ClientMessage::InitGameState {
                room: RoomId::new("r1"),
                game_id: Some(9),
                state: json!({ "turn": 1 }),
                secret_mapping: Some(json!({ "alice": [4] })),
            },
        )
        .await;
        drain(&mut bob_rx);

        hub.handle_closed(alice, DisconnectReason::TransportClose);
        assert!(hub.scheduler().is_armed(&Identity::new("alice")));
        let frames = drain(&mut bob_rx);
        assert_eq!(
            frames[0],
            ServerMessage::PlayerDisconnected {
                identity: Identity::new("alice"),
                temporary: true,
                reason: DisconnectReason::TransportClose,
            }
        );

        let (alice2, mut alice2_rx) = open(&mut hub);
        hub.handle_message(alice2, rejoin("r1", "alice")).await;
        settle().await;
        assert!(!hub.scheduler().is_armed(&Identity::new("alice")));

        let frames = drain(&mut alice2_rx);
        let ack = frames
            .iter()
            .find_map(|f| match f {
                ServerMessage::RejoinAck(ack) => Some(ack.clone()),
                _ => None,
            })
            .unwrap();
        assert!(ack.success);
        assert_eq!(ack.game_id, Some(9));
        assert_eq!(ack.members.len(), 2);
        let sync = frames
            .iter()
            .find_map(|f| match f {
                ServerMessage::GameStateSync(sync) => Some(sync.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(sync.state, json!({ "turn": 1 }));
        assert_eq!(sync.secret_mapping, Some(json!({ "alice": [4] })));
        assert!(sync.restored);

        let frames = drain(&mut bob_rx);
        assert!(matches!(
            &frames[0],
            ServerMessage::PlayerReconnected { identity, .. } if identity.as_str() == "alice"
        ));
        assert!(!frames
            .iter()
            .any(|f| matches!(f, ServerMessage::PlayerLeft { .. })));
    }

    #[tokio::test]
    async fn rejoin_unknown_room_is_room_not_found() {
        let (mut hub, _expiries) = hub();
        let (conn, mut rx) = open(&mut hub);
        hub.handle_message(conn, rejoin("ghost", "alice")).await;
        match &drain(&mut rx)[0] {
            ServerMessage::RejoinAck(ack) => {
                assert!(!ack.success);
                assert_eq!(ack.error.as_deref(), Some("Room not found"));
                assert_eq!(ack.error_code, Some(ErrorCode::RoomNotFound));
            }
            other => panic!("expected rejoinAck, got {other:?}"),
        }
        assert_eq!(hub.registry().session_count(), 0);
    }

    #[tokio::test]
    async fn rejoin_by_game_id_finds_room() {
        let (mut hub, _expiries) = hub();
        let (alice, _alice_rx) = open(&mut hub);
        hub.handle_message(alice, join("r1", "alice")).await;
        hub.handle_message(
            alice,
            ClientMessage::InitGameState {
                room: RoomId::new("r1"),
                game_id: Some(77),
                state: json!({}),
                secret_mapping: None,
            },
        )
        .await;
        hub.handle_closed(alice, DisconnectReason::PingTimeout);

        let (again, mut rx) = open(&mut hub);
        hub.handle_message(
            again,
            ClientMessage::RejoinRoom {
                room: RoomId::new("stale-key"),
                game_id_hint: Some(77),
                identity_hint: IdentityHint::identity("alice"),
            },
        )
        .await;
        match &drain(&mut rx)[0] {
            ServerMessage::RejoinAck(ack) => {
                assert!(ack.success);
                assert_eq!(ack.room, Some(RoomId::new("r1")));
            }
            other => panic!("expected rejoinAck, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sync_for_unknown_room_fails_explicitly() {
        let (mut hub, _expiries) = hub();
        let (conn, mut rx) = open(&mut hub);
        hub.handle_message(
            conn,
            ClientMessage::RequestGameStateSync {
                room: RoomId::new("nope"),
                game_id_hint: None,
            },
        )
        .await;
        settle().await;
        assert_eq!(
            drain(&mut rx),
            vec![ServerMessage::GameStateSyncFailed {
                room: RoomId::new("nope"),
                error: "Room not found".into(),
                error_code: ErrorCode::RoomNotFound,
            }]
        );
    }

    #[tokio::test]
    async fn update_from_non_member_is_rejected() {
        let (mut hub, _expiries) = hub();
        let (conn, mut rx) = open(&mut hub);
        hub.handle_message(
            conn,
            ClientMessage::UpdateGameState {
                room: RoomId::new("r1"),
                state: json!({ "turn": 2 }),
                secret_mapping: None,
            },
        )
        .await;
        match &drain(&mut rx)[0] {
            ServerMessage::Error { error_code, .. } => {
                assert_eq!(*error_code, Some(ErrorCode::NotInRoom));
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(hub.health().await.snapshots, Some(0));
    }

    #[tokio::test]
    async fn update_rebroadcasts_without_secret_mapping() {
        let (mut hub, _expiries) = hub();
        let (alice, _alice_rx) = open(&mut hub);
        let (bob, mut bob_rx) = open(&mut hub);
        hub.handle_message(alice, join("r1", "alice")).await;
        hub.handle_message(bob, join("r1", "bob")).await;
        drain(&mut bob_rx);

        hub.handle_message(
            alice,
            ClientMessage::UpdateGameState {
                room: RoomId::new("r1"),
                state: json!({ "turn": 5 }),
                secret_mapping: Some(json!({ "hidden": true })),
            },
        )
        .await;
        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerMessage::GameStateUpdated {
                room: RoomId::new("r1"),
                from: Identity::new("alice"),
                state: json!({ "turn": 5 }),
            }]
        );
    }

    fn init(room: &str, game_id: Option<GameId>, state: serde_json::Value) -> ClientMessage {
        ClientMessage::InitGameState {
            room: RoomId::new(room),
            game_id,
            state,
            secret_mapping: None,
        }
    }

    #[tokio::test]
    async fn new_game_does_not_inherit_previous_mapping() {
        let (mut hub, _expiries) = hub();
        let (alice, _alice_rx) = open(&mut hub);
        hub.handle_message(alice, join("r1", "alice")).await;
        hub.handle_message(
            alice,
            ClientMessage::InitGameState {
                room: RoomId::new("r1"),
                game_id: Some(1),
                state: json!({ "game": 1 }),
                secret_mapping: Some(json!({ "alice": "OLD-HAND" })),
            },
        )
        .await;
        hub.handle_message(alice, init("r1", Some(2), json!({ "game": 2 })))
            .await;
        assert!(hub.registry().room_for_game(1).is_none());
        assert_eq!(hub.registry().room_for_game(2), Some(&RoomId::new("r1")));

        let (observer, mut rx) = open(&mut hub);
        hub.handle_message(
            observer,
            ClientMessage::RequestGameStateSync {
                room: RoomId::new("r1"),
                game_id_hint: None,
            },
        )
        .await;
        settle().await;
        match &drain(&mut rx)[0] {
            ServerMessage::GameStateSync(payload) => {
                assert_eq!(payload.state, json!({ "game": 2 }));
                assert_eq!(payload.secret_mapping, None);
            }
            other => panic!("expected gameStateSync, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_keeps_mapping_of_current_game() {
        let (mut hub, _expiries) = hub();
        let (alice, _alice_rx) = open(&mut hub);
        hub.handle_message(alice, join("r1", "alice")).await;
        hub.handle_message(
            alice,
            ClientMessage::InitGameState {
                room: RoomId::new("r1"),
                game_id: None,
                state: json!({ "turn": 0 }),
                secret_mapping: Some(json!({ "alice": ["r1"] })),
            },
        )
        .await;
        hub.handle_message(
            alice,
            ClientMessage::UpdateGameState {
                room: RoomId::new("r1"),
                state: json!({ "turn": 1 }),
                secret_mapping: None,
            },
        )
        .await;
        let snapshot = hub
            .store
            .load_snapshot(&RoomId::new("r1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.state, json!({ "turn": 1 }));
        assert_eq!(snapshot.secret_mapping, Some(json!({ "alice": ["r1"] })));
    }

    #[tokio::test(start_paused = true)]
    async fn game_id_is_dropped_once_room_and_snapshot_are_gone() {
        let config = ServerConfig::new().with_snapshot_max_age(Duration::from_secs(10));
        let (mut hub, _expiries) = SessionHub::new(&config, Arc::new(MemoryStore::new()));
        let (alice, _alice_rx) = open(&mut hub);
        hub.handle_message(alice, join("r1", "alice")).await;
        hub.handle_message(alice, init("r1", Some(7), json!({}))).await;

        // Snapshot expires while the seat is still taken.
        tokio::time::advance(Duration::from_secs(11)).await;
        hub.sweep().await;
        assert_eq!(hub.registry().room_for_game(7), Some(&RoomId::new("r1")));

        hub.handle_message(alice, ClientMessage::LeaveRoom).await;
        hub.sweep().await;
        assert!(hub.registry().room_for_game(7).is_none());
    }

    #[tokio::test]
    async fn game_id_survives_sweep_while_snapshot_lives() {
        let (mut hub, _expiries) = hub();
        let (alice, _alice_rx) = open(&mut hub);
        hub.handle_message(alice, join("r1", "alice")).await;
        hub.handle_message(alice, init("r1", Some(9), json!({}))).await;
        hub.handle_message(alice, ClientMessage::LeaveRoom).await;

        hub.sweep().await;
        assert_eq!(hub.registry().room_for_game(9), Some(&RoomId::new("r1")));
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_removes_player() {
        let (mut hub, mut expiries) = hub();
        let (alice, _alice_rx) = open(&mut hub);
        let (bob, mut bob_rx) = open(&mut hub);
        hub.handle_message(alice, join("r1", "alice")).await;
        hub.handle_message(bob, join("r1", "bob")).await;
        hub.handle_closed(alice, DisconnectReason::TransportError);
        drain(&mut bob_rx);

        tokio::time::advance(Duration::from_secs(61)).await;
        let expiry = expiries.recv().await.unwrap();
        hub.handle_expiry(&expiry);

        let frames = drain(&mut bob_rx);
        assert_eq!(
            frames[0],
            ServerMessage::PlayerLeft {
                identity: Identity::new("alice"),
                permanent: true,
            }
        );
        let room = RoomId::new("r1");
        assert!(hub
            .registry()
            .list_active_in_room(&room)
            .iter()
            .all(|s| s.identity != Identity::new("alice")));
        assert!(hub.registry().get_by_identity(&Identity::new("alice")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_that_lost_the_race_to_a_reconnect_is_ignored() {
        let (mut hub, mut expiries) = hub();
        let (alice, _alice_rx) = open(&mut hub);
        hub.handle_message(alice, join("r1", "alice")).await;
        hub.handle_closed(alice, DisconnectReason::TransportClose);

        // The timer fires, but the reconnect is processed before the expiry.
        tokio::time::advance(Duration::from_secs(61)).await;
        let expiry = expiries.recv().await.unwrap();
        let (again, _rx) = open(&mut hub);
        hub.handle_message(again, join("r1", "alice")).await;
        hub.handle_expiry(&expiry);

        let session = hub
            .registry()
            .get_by_identity(&Identity::new("alice"))
            .unwrap();
        assert!(session.is_active());
        assert_eq!(session.connection_id(), Some(again));
    }

    #[tokio::test]
    async fn leave_notifies_room_and_leaver() {
        let (mut hub, _expiries) = hub();
        let (alice, mut alice_rx) = open(&mut hub);
        let (bob, mut bob_rx) = open(&mut hub);
        hub.handle_message(alice, join("r1", "alice")).await;
        hub.handle_message(bob, join("r1", "bob")).await;
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        hub.handle_message(alice, ClientMessage::LeaveRoom).await;
        assert_eq!(
            drain(&mut alice_rx),
            vec![ServerMessage::LeftRoom {
                room: RoomId::new("r1")
            }]
        );
        let frames = drain(&mut bob_rx);
        assert!(matches!(&frames[0], ServerMessage::PlayerLeft { permanent: true, .. }));
        assert!(!hub.scheduler().is_armed(&Identity::new("alice")));
    }

    #[tokio::test]
    async fn close_room_drops_snapshot_and_members() {
        let (mut hub, _expiries) = hub();
        let (alice, mut alice_rx) = open(&mut hub);
        hub.handle_message(alice, join("r1", "alice")).await;
        hub.handle_message(
            alice,
            ClientMessage::InitGameState {
                room: RoomId::new("r1"),
                game_id: None,
                state: json!({}),
                secret_mapping: None,
            },
        )
        .await;
        drain(&mut alice_rx);

        hub.handle_message(
            alice,
            ClientMessage::CloseRoom {
                room: RoomId::new("r1"),
            },
        )
        .await;
        assert_eq!(
            drain(&mut alice_rx)[0],
            ServerMessage::RoomClosed {
                room: RoomId::new("r1")
            }
        );
        let health = hub.health().await;
        assert_eq!(health.snapshots, Some(0));
        assert_eq!(health.active_rooms, 0);
    }

    #[tokio::test]
    async fn second_connection_supersedes_first() {
        let (mut hub, _expiries) = hub();
        let (first, mut first_rx) = open(&mut hub);
        hub.handle_message(first, join("r1", "alice")).await;
        drain(&mut first_rx);

        let (second, _second_rx) = open(&mut hub);
        hub.handle_message(second, join("r1", "alice")).await;
        assert!(matches!(
            &drain(&mut first_rx)[0],
            ServerMessage::Error {
                error_code: Some(ErrorCode::SessionSuperseded),
                ..
            }
        ));
        // The superseded queue is closed.
        assert!(first_rx.recv().await.is_none());
        assert_eq!(hub.connection_count(), 1);
    }

    #[tokio::test]
    async fn malformed_frame_gets_error_reply() {
        let (mut hub, _expiries) = hub();
        let (conn, mut rx) = open(&mut hub);
        hub.handle_text(conn, "{not json").await;
        hub.handle_text(conn, r#"{"type":"ping"}"#).await;
        let frames = drain(&mut rx);
        assert!(matches!(
            &frames[0],
            ServerMessage::Error {
                error_code: Some(ErrorCode::InvalidInput),
                ..
            }
        ));
        assert_eq!(frames[1], ServerMessage::Pong);
    }

    #[tokio::test]
    async fn health_reports_counters() {
        let (mut hub, _expiries) = hub();
        let (alice, _rx) = open(&mut hub);
        hub.handle_message(alice, join("r1", "alice")).await;
        let health = hub.health().await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.active_rooms, 1);
        assert_eq!(health.connections, 1);
        assert_eq!(health.store_backend, StoreBackend::Memory);
        let value = serde_json::to_value(&health).unwrap();
        assert_eq!(value["storeBackend"], "memory");
        assert!(value.get("uptimeSecs").is_some());
    }
}
