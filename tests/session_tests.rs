#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! End-to-end session scenarios driven through [`SessionServer`] and
//! [`MockPeer`] connections on a paused Tokio clock.

mod common;

use std::time::Duration;

use common::{join, join_room, rejoin, settle, start_server, MockPeer};
use pretty_assertions::assert_eq;
use serde_json::json;
use tokio_test::assert_ok;
use uno_session_server::protocol::{Identity, ServerMessage};
use uno_session_server::{ErrorCode, ServerConfig};

fn config() -> ServerConfig {
    ServerConfig::new().with_grace_period(Duration::from_secs(60))
}

fn is_left(msg: &ServerMessage) -> bool {
    matches!(msg, ServerMessage::PlayerLeft { .. })
}

fn member_ids(msg: &ServerMessage) -> Vec<String> {
    match msg {
        ServerMessage::RoomData { members, .. } => members
            .iter()
            .map(|m| m.identity.as_str().to_string())
            .collect(),
        other => panic!("expected roomData, got {other:?}"),
    }
}

// ── Reconnect within the grace period ───────────────────────────────

#[tokio::test(start_paused = true)]
async fn quick_reconnect_is_never_announced_as_leaving() {
    let mut server = start_server(&config());
    let handle = server.handle();

    let mut alice = join_room(&handle, "r1", "alice").await;
    let mut bob = join_room(&handle, "r1", "bob").await;
    settle().await;
    alice.drain();
    bob.drain();

    bob.close();
    let first = alice
        .next_matching(|m| !matches!(m, ServerMessage::RoomData { .. }))
        .await;
    match &first {
        ServerMessage::PlayerDisconnected {
            identity,
            temporary,
            ..
        } => {
            assert_eq!(identity, &Identity::new("bob"));
            assert!(temporary);
        }
        other => panic!("expected playerDisconnected, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_secs(10)).await;

    let mut bob_again = MockPeer::connect(&handle);
    bob_again.send(&join("r1", "bob"));
    match bob_again.next().await {
        ServerMessage::JoinAck(ack) => {
            assert!(ack.reused);
            assert_eq!(ack.identity, Some(Identity::new("bob")));
        }
        other => panic!("expected joinAck, got {other:?}"),
    }

    let reconnected = alice
        .next_matching(|m| !matches!(m, ServerMessage::RoomData { .. }))
        .await;
    assert!(matches!(
        reconnected,
        ServerMessage::PlayerReconnected { ref identity, .. } if identity.as_str() == "bob"
    ));

    // Well past the original grace window.
    tokio::time::sleep(Duration::from_secs(120)).await;
    settle().await;
    assert!(!alice.drain().iter().any(is_left));

    let health = assert_ok!(handle.health().await);
    assert_eq!(health.active_rooms, 1);
    assert_eq!(health.connections, 2);
    server.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rejoin_room_reclaims_seat_in_order() {
    let mut server = start_server(&config());
    let handle = server.handle();

    let mut alice = join_room(&handle, "r1", "alice").await;
    let mut bob = join_room(&handle, "r1", "bob").await;
    let _carol = join_room(&handle, "r1", "carol").await;
    settle().await;
    alice.drain();

    bob.close();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let mut bob_again = MockPeer::connect(&handle);
    bob_again.send(&rejoin("r1", "bob"));
    match bob_again.next().await {
        ServerMessage::RejoinAck(ack) => {
            assert!(ack.success);
            let seats: Vec<_> = ack.members.iter().map(|m| m.identity.as_str()).collect();
            assert_eq!(seats, vec!["alice", "bob", "carol"]);
        }
        other => panic!("expected rejoinAck, got {other:?}"),
    }
    server.shutdown().await;
}

// ── Grace period expiry ─────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn silent_player_leaves_after_grace_period() {
    let mut server = start_server(&config());
    let handle = server.handle();

    let mut alice = join_room(&handle, "r1", "alice").await;
    let mut bob = join_room(&handle, "r1", "bob").await;
    settle().await;
    alice.drain();

    bob.close();
    alice
        .next_matching(|m| matches!(m, ServerMessage::PlayerDisconnected { .. }))
        .await;

    tokio::time::sleep(Duration::from_secs(65)).await;

    match alice.next_matching(is_left).await {
        ServerMessage::PlayerLeft {
            identity,
            permanent,
        } => {
            assert_eq!(identity, Identity::new("bob"));
            assert!(permanent);
        }
        other => panic!("expected playerLeft, got {other:?}"),
    }
    let roster = alice
        .next_matching(|m| matches!(m, ServerMessage::RoomData { .. }))
        .await;
    assert_eq!(member_ids(&roster), vec!["alice".to_string()]);
    server.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rejoin_after_last_seat_expired_reports_room_not_found() {
    let mut server = start_server(&config());
    let handle = server.handle();

    let mut solo = join_room(&handle, "r9", "solo").await;
    solo.close();
    tokio::time::sleep(Duration::from_secs(65)).await;
    settle().await;

    let health = assert_ok!(handle.health().await);
    assert_eq!(health.active_rooms, 0);

    let mut back = MockPeer::connect(&handle);
    back.send(&rejoin("r9", "solo"));
    match back.next().await {
        ServerMessage::RejoinAck(ack) => {
            assert!(!ack.success);
            assert_eq!(ack.error.as_deref(), Some("Room not found"));
            assert_eq!(ack.error_code, Some(ErrorCode::RoomNotFound));
        }
        other => panic!("expected rejoinAck, got {other:?}"),
    }
    server.shutdown().await;
}

// ── Capacity ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn seventh_player_is_turned_away() {
    let mut server = start_server(&config());
    let handle = server.handle();

    let mut seated = Vec::new();
    for n in 0..6 {
        seated.push(join_room(&handle, "r3", &format!("p{n}")).await);
    }

    let mut late = MockPeer::connect(&handle);
    late.send(&join("r3", "p6"));
    match late.next().await {
        ServerMessage::JoinAck(ack) => {
            assert_eq!(ack.error_code, Some(ErrorCode::RoomFull));
            assert!(ack.identity.is_none());
        }
        other => panic!("expected joinAck, got {other:?}"),
    }
    server.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn disconnected_player_still_holds_a_seat() {
    let mut server = start_server(&config().with_room_capacity(2));
    let handle = server.handle();

    let _alice = join_room(&handle, "r4", "alice").await;
    let mut bob = join_room(&handle, "r4", "bob").await;
    bob.close();
    settle().await;

    let mut carol = MockPeer::connect(&handle);
    carol.send(&join("r4", "carol"));
    assert!(matches!(
        carol.next().await,
        ServerMessage::JoinAck(ref ack) if ack.error_code == Some(ErrorCode::RoomFull)
    ));
    server.shutdown().await;
}

// ── Snapshot recovery ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn sync_request_restores_latest_state() {
    let mut server = start_server(&config());
    let handle = server.handle();

    let alice = join_room(&handle, "r2", "alice").await;
    alice.send_raw(
        json!({
            "type": "initGameState",
            "data": {
                "room": "r2",
                "state": { "turn": 3 },
                "secretMapping": { "alice": ["r5", "g7"] }
            }
        })
        .to_string(),
    );
    settle().await;

    let mut observer = MockPeer::connect(&handle);
    observer.send_raw(r#"{"type":"requestGameStateSync","data":{"room":"r2"}}"#);
    match observer.next().await {
        ServerMessage::GameStateSync(payload) => {
            assert!(payload.restored);
            assert_eq!(payload.state, json!({ "turn": 3 }));
            assert_eq!(payload.secret_mapping, Some(json!({ "alice": ["r5", "g7"] })));
        }
        other => panic!("expected gameStateSync, got {other:?}"),
    }
    server.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn sync_for_unknown_room_fails_cleanly() {
    let mut server = start_server(&config());
    let handle = server.handle();

    let mut peer = MockPeer::connect(&handle);
    peer.send_raw(r#"{"type":"requestGameStateSync","data":{"room":"ghost"}}"#);
    match peer.next().await {
        ServerMessage::GameStateSyncFailed { error_code, .. } => {
            assert_eq!(error_code, ErrorCode::RoomNotFound);
        }
        other => panic!("expected gameStateSyncFailed, got {other:?}"),
    }
    server.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn reconnecting_player_receives_state_automatically() {
    let mut server = start_server(&config());
    let handle = server.handle();

    let _alice = join_room(&handle, "r5", "alice").await;
    let mut bob = join_room(&handle, "r5", "bob").await;
    bob.send_raw(
        json!({
            "type": "updateGameState",
            "data": { "room": "r5", "state": { "turn": 8, "color": "red" } }
        })
        .to_string(),
    );
    settle().await;
    bob.close();
    settle().await;

    let mut bob_again = MockPeer::connect(&handle);
    bob_again.send(&join("r5", "bob"));
    let sync = bob_again
        .next_matching(|m| matches!(m, ServerMessage::GameStateSync(_)))
        .await;
    match sync {
        ServerMessage::GameStateSync(payload) => {
            assert_eq!(payload.state["turn"], 8);
            assert_eq!(payload.members.len(), 2);
        }
        other => panic!("expected gameStateSync, got {other:?}"),
    }
    server.shutdown().await;
}

// ── Misc ────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn malformed_frame_gets_error_and_connection_survives() {
    let mut server = start_server(&config());
    let handle = server.handle();

    let mut peer = MockPeer::connect(&handle);
    peer.send_raw("{not json");
    assert!(matches!(
        peer.next().await,
        ServerMessage::Error {
            error_code: Some(ErrorCode::InvalidInput),
            ..
        }
    ));
    peer.send_raw(r#"{"type":"ping"}"#);
    assert_eq!(peer.next().await, ServerMessage::Pong);
    server.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn second_connection_supersedes_the_first() {
    let mut server = start_server(&config());
    let handle = server.handle();

    let mut first = join_room(&handle, "r6", "alice").await;
    settle().await;
    first.drain();

    let _second = join_room(&handle, "r6", "alice").await;
    match first
        .next_matching(|m| matches!(m, ServerMessage::Error { .. }))
        .await
    {
        ServerMessage::Error { error_code, .. } => {
            assert_eq!(error_code, Some(ErrorCode::SessionSuperseded));
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert!(first.is_disconnected().await);
    server.shutdown().await;
}

// ── Snapshot sweep ──────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn periodic_sweep_expires_abandoned_snapshot() {
    let config = config()
        .with_snapshot_max_age(Duration::from_secs(10))
        .with_sweep_interval(Duration::from_secs(5));
    let mut server = start_server(&config);
    let handle = server.handle();

    let alice = join_room(&handle, "r7", "alice").await;
    alice.send_raw(
        json!({
            "type": "initGameState",
            "data": { "room": "r7", "gameId": 70, "state": { "turn": 1 } }
        })
        .to_string(),
    );
    alice.send_raw(r#"{"type":"leaveRoom"}"#);
    settle().await;
    let health = assert_ok!(handle.health().await);
    assert_eq!(health.snapshots, Some(1));
    assert_eq!(health.active_rooms, 0);

    // Past max age plus one sweep interval.
    tokio::time::sleep(Duration::from_secs(16)).await;
    settle().await;

    let health = assert_ok!(handle.health().await);
    assert_eq!(health.snapshots, Some(0));

    let mut peer = MockPeer::connect(&handle);
    peer.send_raw(r#"{"type":"requestGameStateSync","data":{"room":"gone","gameIdHint":70}}"#);
    match peer.next().await {
        ServerMessage::GameStateSyncFailed { room, error_code, .. } => {
            // The game id no longer resolves, so the request room is echoed.
            assert_eq!(room.as_str(), "gone");
            assert_eq!(error_code, ErrorCode::RoomNotFound);
        }
        other => panic!("expected gameStateSyncFailed, got {other:?}"),
    }
    server.shutdown().await;
}
