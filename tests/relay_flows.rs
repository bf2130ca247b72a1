//! End-to-end tests for the relay over the in-process transport.
//!
//! These tests drive the public handle the way a host would: games and the
//! upstream agent are plain transport peers exchanging JSON frames, and the
//! assertions observe only wire traffic and the handle's snapshots.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

use relaymux::{InProcessTransport, PeerId, Relay, RelayConfig, Transport};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);
const QUIET_PERIOD: Duration = Duration::from_millis(200);

struct TestRig {
    relay: Relay,
    transport: Arc<InProcessTransport>,
    upstream: PeerId,
    upstream_rx: mpsc::Receiver<String>,
}

async fn start_relay() -> TestRig {
    start_relay_with(RelayConfig {
        relay_name: "Test Relay".to_string(),
        shutdown_grace: Duration::from_millis(300),
    })
    .await
}

async fn start_relay_with(config: RelayConfig) -> TestRig {
    let (events_tx, events_rx) = mpsc::channel(256);
    let transport = InProcessTransport::new(events_tx);
    let (upstream, upstream_rx) = transport.open_peer().await;

    let shared: Arc<dyn Transport> = transport.clone();
    let relay = Relay::spawn(config, shared, upstream, events_rx);

    TestRig {
        relay,
        transport,
        upstream,
        upstream_rx,
    }
}

struct TestGame {
    peer: PeerId,
    rx: mpsc::Receiver<String>,
}

/// Connect a peer and send its startup announcement.
async fn connect_game(rig: &TestRig, name: &str) -> TestGame {
    let (peer, rx) = rig.transport.open_peer().await;
    rig.transport
        .frame_from(peer, json!({ "command": "startup", "game": name }).to_string())
        .await;
    TestGame { peer, rx }
}

/// Complete the version handshake, unlocking multiplexing for the session.
async fn handshake(rig: &TestRig, game: &mut TestGame) {
    rig.transport
        .frame_from(
            game.peer,
            json!({
                "command": "nrc-endpoints/startup",
                "data": { "nr-version": "1.0.0" },
            })
            .to_string(),
        )
        .await;
    let ack = frame_with_command(&mut game.rx, "nrc-endpoints/startup-ack").await;
    assert_eq!(ack["data"]["features"]["multiplexing"], true);
}

async fn register_action(rig: &TestRig, game: &TestGame, name: &str) {
    rig.transport
        .frame_from(
            game.peer,
            json!({
                "command": "actions/register",
                "data": { "actions": [{ "name": name, "description": "test action" }] },
            })
            .to_string(),
        )
        .await;
}

async fn next_frame(rx: &mut mpsc::Receiver<String>) -> Value {
    let raw = timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("peer channel closed");
    serde_json::from_str(&raw).expect("frame is valid JSON")
}

/// Skip frames until one with the given command arrives.
async fn frame_with_command(rx: &mut mpsc::Receiver<String>, command: &str) -> Value {
    frame_where(rx, |frame| frame["command"] == command).await
}

async fn frame_where(
    rx: &mut mpsc::Receiver<String>,
    pred: impl Fn(&Value) -> bool,
) -> Value {
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        assert!(!remaining.is_zero(), "timed out waiting for matching frame");
        let raw = timeout(remaining, rx.recv())
            .await
            .expect("timed out waiting for matching frame")
            .expect("peer channel closed");
        let frame: Value = serde_json::from_str(&raw).expect("frame is valid JSON");
        if pred(&frame) {
            return frame;
        }
    }
}

/// Fail if a result for `id` shows up within the quiet period.
async fn assert_no_result_for(rx: &mut mpsc::Receiver<String>, id: &str) {
    let deadline = tokio::time::Instant::now() + QUIET_PERIOD;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return;
        }
        match timeout(remaining, rx.recv()).await {
            Err(_) | Ok(None) => return,
            Ok(Some(raw)) => {
                let frame: Value = serde_json::from_str(&raw).expect("frame is valid JSON");
                assert!(
                    !(frame["command"] == "action/result" && frame["data"]["id"] == id),
                    "duplicate result for {id}: {frame}"
                );
            }
        }
    }
}

// ============================================================================
// Admission
// ============================================================================

#[tokio::test]
async fn startup_announces_and_derives_game_id() {
    let mut rig = start_relay().await;

    let startup = frame_with_command(&mut rig.upstream_rx, "startup").await;
    assert_eq!(startup["game"], "Test Relay");

    let _game = connect_game(&rig, "Buckshot Roulette: Extended Edition!!!").await;
    let context = frame_with_command(&mut rig.upstream_rx, "context").await;
    assert_eq!(
        context["data"]["message"],
        "Game 'Buckshot Roulette: Extended Edition!!!' connected to relay"
    );
    assert_eq!(context["data"]["silent"], true);

    let sessions = rig.relay.sessions().await;
    assert_eq!(
        sessions,
        vec![(
            "buckshot-roulette-extended-edition".to_string(),
            "Buckshot Roulette: Extended Edition!!!".to_string(),
        )]
    );
}

#[tokio::test]
async fn empty_derived_id_is_rejected() {
    let rig = start_relay().await;

    let mut game = connect_game(&rig, "-- --").await;
    let error = frame_with_command(&mut game.rx, "nrc-endpoints/error").await;
    assert!(error["data"]["error"].as_str().unwrap().contains("empty"));

    assert!(rig.relay.sessions().await.is_empty());
}

#[tokio::test]
async fn id_collision_rejects_second_session() {
    let rig = start_relay().await;

    let mut first = connect_game(&rig, "Game A").await;
    handshake(&rig, &mut first).await;

    let mut second = connect_game(&rig, "game a").await;
    let error = frame_with_command(&mut second.rx, "nrc-endpoints/error").await;
    assert!(error["data"]["error"].as_str().unwrap().contains("game-a"));

    assert_eq!(rig.relay.sessions().await.len(), 1);
}

#[tokio::test]
async fn lock_admits_one_legacy_game_at_a_time() {
    let rig = start_relay().await;

    // A game that never negotiates multiplexing takes the lock.
    let legacy = connect_game(&rig, "Legacy Game").await;
    assert!(rig.relay.is_locked().await);

    let mut second = connect_game(&rig, "Modern Game").await;
    let refusal = frame_with_command(&mut second.rx, "nrelay/locked").await;
    assert!(refusal["data"]["error"].is_string());
    assert_eq!(rig.relay.sessions().await.len(), 1);

    // Holder disconnects; the lock clears and the retry is admitted.
    rig.transport.disconnect(legacy.peer).await;
    let mut retry = second;
    rig.transport
        .frame_from(
            retry.peer,
            json!({ "command": "startup", "game": "Modern Game" }).to_string(),
        )
        .await;
    handshake(&rig, &mut retry).await;

    assert!(!rig.relay.is_locked().await);
    assert_eq!(
        rig.relay.sessions().await,
        vec![("modern-game".to_string(), "Modern Game".to_string())]
    );
}

#[tokio::test]
async fn handshake_releases_lock() {
    let rig = start_relay().await;

    let mut game = connect_game(&rig, "Game A").await;
    assert!(rig.relay.is_locked().await);

    handshake(&rig, &mut game).await;
    assert!(!rig.relay.is_locked().await);
}

#[tokio::test]
async fn unsupported_version_gets_mismatch_with_alternatives() {
    let rig = start_relay().await;

    let mut game = connect_game(&rig, "Game A").await;
    rig.transport
        .frame_from(
            game.peer,
            json!({
                "command": "nrc-endpoints/startup",
                "data": { "nr-version": "2.0.0" },
            })
            .to_string(),
        )
        .await;

    let mismatch = frame_with_command(&mut game.rx, "nrc-endpoints/version-mismatch").await;
    assert_eq!(mismatch["data"]["requested"], "2.0.0");
    assert_eq!(mismatch["data"]["available"], json!(["1.0.0"]));
    assert_eq!(mismatch["data"]["suggestion"], "1.0.0");

    // The session survives in its pre-handshake state.
    assert!(rig.relay.is_locked().await);
}

// ============================================================================
// Action namespace and routing
// ============================================================================

#[tokio::test]
async fn multiplexed_action_round_trip() {
    let mut rig = start_relay().await;

    let mut game = connect_game(&rig, "Game A").await;
    handshake(&rig, &mut game).await;
    register_action(&rig, &game, "buy_books").await;

    // The combined register carries the exposed (prefixed) name upstream.
    let register = frame_where(&mut rig.upstream_rx, |f| {
        f["command"] == "actions/register"
            && f["data"]["actions"][0]["name"] == "game-a--buy_books"
    })
    .await;
    assert_eq!(register["game"], "Test Relay");

    // Upstream executes the exposed action; the game sees the raw name and
    // the payload verbatim.
    rig.transport
        .frame_from(
            rig.upstream,
            json!({
                "command": "action",
                "data": { "id": "r1", "name": "game-a--buy_books", "data": "{\"n\":2}" },
            })
            .to_string(),
        )
        .await;

    let action = frame_with_command(&mut game.rx, "action").await;
    assert_eq!(action["data"]["id"], "r1");
    assert_eq!(action["data"]["name"], "buy_books");
    assert_eq!(action["data"]["data"], "{\"n\":2}");

    // The result travels back with the same id, exactly once.
    rig.transport
        .frame_from(
            game.peer,
            json!({
                "command": "action/result",
                "data": { "id": "r1", "success": true },
            })
            .to_string(),
        )
        .await;

    let result = frame_with_command(&mut rig.upstream_rx, "action/result").await;
    assert_eq!(result["data"]["id"], "r1");
    assert_eq!(result["data"]["success"], true);

    // A late duplicate from the game is dropped.
    rig.transport
        .frame_from(
            game.peer,
            json!({
                "command": "action/result",
                "data": { "id": "r1", "success": false },
            })
            .to_string(),
        )
        .await;
    assert_no_result_for(&mut rig.upstream_rx, "r1").await;
}

#[tokio::test]
async fn unknown_action_fails_upstream() {
    let mut rig = start_relay().await;

    rig.transport
        .frame_from(
            rig.upstream,
            json!({
                "command": "action",
                "data": { "id": "r9", "name": "nobody--jump", "data": "" },
            })
            .to_string(),
        )
        .await;

    let result = frame_with_command(&mut rig.upstream_rx, "action/result").await;
    assert_eq!(result["data"]["id"], "r9");
    assert_eq!(result["data"]["success"], false);
    assert_eq!(result["data"]["message"], "unknown action");
}

#[tokio::test]
async fn unregister_removes_upstream_routing() {
    let mut rig = start_relay().await;

    let mut game = connect_game(&rig, "Game A").await;
    handshake(&rig, &mut game).await;
    register_action(&rig, &game, "buy_books").await;
    frame_where(&mut rig.upstream_rx, |f| {
        f["command"] == "actions/register"
            && f["data"]["actions"][0]["name"] == "game-a--buy_books"
    })
    .await;

    rig.transport
        .frame_from(
            game.peer,
            json!({
                "command": "actions/unregister",
                "data": { "action_names": ["buy_books"] },
            })
            .to_string(),
        )
        .await;

    let unregister = frame_with_command(&mut rig.upstream_rx, "actions/unregister").await;
    assert_eq!(unregister["data"]["action_names"], json!(["game-a--buy_books"]));

    // The mapping is gone: execution now misses.
    rig.transport
        .frame_from(
            rig.upstream,
            json!({
                "command": "action",
                "data": { "id": "r2", "name": "game-a--buy_books", "data": "" },
            })
            .to_string(),
        )
        .await;
    let result = frame_with_command(&mut rig.upstream_rx, "action/result").await;
    assert_eq!(result["data"]["success"], false);
    assert_eq!(result["data"]["message"], "unknown action");
}

#[tokio::test]
async fn duplicate_request_id_does_not_disturb_live_request() {
    let mut rig = start_relay().await;

    let mut game_a = connect_game(&rig, "Game A").await;
    handshake(&rig, &mut game_a).await;
    register_action(&rig, &game_a, "buy_books").await;
    let mut game_b = connect_game(&rig, "Game B").await;
    handshake(&rig, &mut game_b).await;
    register_action(&rig, &game_b, "jump").await;

    rig.transport
        .frame_from(
            rig.upstream,
            json!({
                "command": "action",
                "data": { "id": "r2", "name": "game-a--buy_books", "data": "" },
            })
            .to_string(),
        )
        .await;
    frame_with_command(&mut game_a.rx, "action").await;

    // Same id, different target: refused without touching the first.
    rig.transport
        .frame_from(
            rig.upstream,
            json!({
                "command": "action",
                "data": { "id": "r2", "name": "game-b--jump", "data": "" },
            })
            .to_string(),
        )
        .await;
    let refusal = frame_with_command(&mut rig.upstream_rx, "action/result").await;
    assert_eq!(refusal["data"]["id"], "r2");
    assert_eq!(refusal["data"]["success"], false);
    assert_eq!(refusal["data"]["message"], "duplicate request");

    // The original request still completes normally.
    rig.transport
        .frame_from(
            game_a.peer,
            json!({
                "command": "action/result",
                "data": { "id": "r2", "success": true },
            })
            .to_string(),
        )
        .await;
    let result = frame_with_command(&mut rig.upstream_rx, "action/result").await;
    assert_eq!(result["data"]["id"], "r2");
    assert_eq!(result["data"]["success"], true);
}

#[tokio::test]
async fn disconnect_mid_request_synthesizes_exactly_one_failure() {
    let mut rig = start_relay().await;

    let mut game = connect_game(&rig, "Game A").await;
    handshake(&rig, &mut game).await;
    register_action(&rig, &game, "buy_books").await;

    rig.transport
        .frame_from(
            rig.upstream,
            json!({
                "command": "action",
                "data": { "id": "r1", "name": "game-a--buy_books", "data": "" },
            })
            .to_string(),
        )
        .await;
    frame_with_command(&mut game.rx, "action").await;

    // The game vanishes with r1 in flight.
    rig.transport.disconnect(game.peer).await;

    let result = frame_with_command(&mut rig.upstream_rx, "action/result").await;
    assert_eq!(result["data"]["id"], "r1");
    assert_eq!(result["data"]["success"], false);
    assert_eq!(result["data"]["message"], "session terminated");

    // A straggler result from the dead peer is dropped.
    rig.transport
        .frame_from(
            game.peer,
            json!({
                "command": "action/result",
                "data": { "id": "r1", "success": true },
            })
            .to_string(),
        )
        .await;
    assert_no_result_for(&mut rig.upstream_rx, "r1").await;
}

// ============================================================================
// Context and forced actions
// ============================================================================

#[tokio::test]
async fn context_and_force_carry_game_attribution() {
    let mut rig = start_relay().await;

    let mut game = connect_game(&rig, "Game A").await;
    handshake(&rig, &mut game).await;

    rig.transport
        .frame_from(
            game.peer,
            json!({
                "command": "context",
                "data": { "message": "entered the shop", "silent": false },
            })
            .to_string(),
        )
        .await;
    let context = frame_where(&mut rig.upstream_rx, |f| {
        f["command"] == "context" && f["data"]["message"] == "[game-a] entered the shop"
    })
    .await;
    assert_eq!(context["data"]["silent"], false);

    rig.transport
        .frame_from(
            game.peer,
            json!({
                "command": "actions/force",
                "data": {
                    "query": "pick something to buy",
                    "action_names": ["buy_books"],
                    "ephemeral_context": true,
                },
            })
            .to_string(),
        )
        .await;
    let force = frame_with_command(&mut rig.upstream_rx, "actions/force").await;
    assert_eq!(force["data"]["query"], "[game-a] pick something to buy");
    assert_eq!(force["data"]["action_names"], json!(["game-a--buy_books"]));
    assert_eq!(force["data"]["ephemeral_context"], true);
    assert_eq!(force["data"]["priority"], "low");
    assert!(force["data"].get("state").is_none());
}

// ============================================================================
// Synthetic shutdown_game action
// ============================================================================

#[tokio::test]
async fn shutdown_game_enum_tracks_open_sessions() {
    let mut rig = start_relay().await;

    let mut game_a = connect_game(&rig, "Game A").await;
    handshake(&rig, &mut game_a).await;
    let mut game_b = connect_game(&rig, "Game B").await;
    handshake(&rig, &mut game_b).await;

    frame_where(&mut rig.upstream_rx, |f| {
        f["command"] == "actions/register"
            && f["data"]["actions"][0]["name"] == "shutdown_game"
            && f["data"]["actions"][0]["schema"]["properties"]["game_id"]["enum"]
                == json!(["game-a", "game-b"])
    })
    .await;

    // Graceful shutdown of A: the game is told, upstream is acknowledged.
    rig.transport
        .frame_from(
            rig.upstream,
            json!({
                "command": "action",
                "data": { "id": "s1", "name": "shutdown_game", "data": "{\"game_id\":\"game-a\"}" },
            })
            .to_string(),
        )
        .await;

    let graceful = frame_with_command(&mut game_a.rx, "shutdown/graceful").await;
    assert_eq!(graceful["data"]["wants_shutdown"], true);

    let result = frame_with_command(&mut rig.upstream_rx, "action/result").await;
    assert_eq!(result["data"]["id"], "s1");
    assert_eq!(result["data"]["success"], true);
    assert_eq!(result["data"]["message"], "shutdown requested");

    // The game acknowledges and hangs up; the enum shrinks to B alone.
    rig.transport
        .frame_from(game_a.peer, json!({ "command": "shutdown/ready" }).to_string())
        .await;
    rig.transport.disconnect(game_a.peer).await;

    frame_where(&mut rig.upstream_rx, |f| {
        f["command"] == "actions/register"
            && f["data"]["actions"][0]["name"] == "shutdown_game"
            && f["data"]["actions"][0]["schema"]["properties"]["game_id"]["enum"]
                == json!(["game-b"])
    })
    .await;
}

#[tokio::test]
async fn shutdown_game_times_out_into_forced_disconnect() {
    let mut rig = start_relay().await;

    let mut game = connect_game(&rig, "Game A").await;
    handshake(&rig, &mut game).await;

    rig.transport
        .frame_from(
            rig.upstream,
            json!({
                "command": "action",
                "data": { "id": "s1", "name": "shutdown_game", "data": "{\"game_id\":\"game-a\"}" },
            })
            .to_string(),
        )
        .await;
    frame_with_command(&mut game.rx, "shutdown/graceful").await;

    // No acknowledgment: the relay force-closes the peer at the deadline.
    let closed = timeout(TEST_TIMEOUT, async {
        loop {
            if game.rx.recv().await.is_none() {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "peer was not force-closed after the grace period");

    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    loop {
        if rig.relay.sessions().await.is_empty() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "session survived the forced disconnect"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn shutdown_game_rejects_unknown_and_missing_targets() {
    let mut rig = start_relay().await;

    let mut game = connect_game(&rig, "Game A").await;
    handshake(&rig, &mut game).await;

    rig.transport
        .frame_from(
            rig.upstream,
            json!({
                "command": "action",
                "data": { "id": "s1", "name": "shutdown_game", "data": "{\"game_id\":\"game-x\"}" },
            })
            .to_string(),
        )
        .await;
    let unknown = frame_with_command(&mut rig.upstream_rx, "action/result").await;
    assert_eq!(unknown["data"]["id"], "s1");
    assert_eq!(unknown["data"]["success"], false);
    assert_eq!(unknown["data"]["message"], "no such game");

    rig.transport
        .frame_from(
            rig.upstream,
            json!({
                "command": "action",
                "data": { "id": "s2", "name": "shutdown_game", "data": "" },
            })
            .to_string(),
        )
        .await;
    let missing = frame_with_command(&mut rig.upstream_rx, "action/result").await;
    assert_eq!(missing["data"]["id"], "s2");
    assert_eq!(missing["data"]["success"], false);
    assert_eq!(missing["data"]["message"], "missing game_id parameter");
}

// ============================================================================
// Health endpoint
// ============================================================================

#[tokio::test]
async fn health_reports_live_relay_state() {
    let rig = start_relay().await;

    let mut game = connect_game(&rig, "Game A").await;
    handshake(&rig, &mut game).await;

    rig.transport
        .frame_from(game.peer, json!({ "command": "nrc-endpoints/health" }).to_string())
        .await;

    let health = frame_with_command(&mut game.rx, "nrc-endpoints/health-response").await;
    assert_eq!(health["data"]["status"], "healthy");
    assert_eq!(health["data"]["nr-version"], "1.0.0");
    assert_eq!(health["data"]["game-nr-version"], "1.0.0");
    assert_eq!(health["data"]["total-games"], 1);
    assert_eq!(health["data"]["connected-games"][0]["id"], "game-a");
    assert_eq!(health["data"]["neuro-backend-connected"], true);
    assert!(health["data"]["uptime-seconds"].is_u64());
    // Unselected fields stay out of the response.
    assert!(health["data"].get("backend-locked").is_none());

    rig.transport
        .frame_from(
            game.peer,
            json!({
                "command": "nrc-endpoints/health",
                "data": { "include": ["lock-status"] },
            })
            .to_string(),
        )
        .await;
    let filtered = frame_with_command(&mut game.rx, "nrc-endpoints/health-response").await;
    assert_eq!(filtered["data"]["backend-locked"], false);
    assert!(filtered["data"].get("status").is_none());
}

#[tokio::test]
async fn health_requires_negotiated_feature() {
    let rig = start_relay().await;

    // Pre-handshake sessions have no health feature.
    let mut game = connect_game(&rig, "Game A").await;
    rig.transport
        .frame_from(game.peer, json!({ "command": "nrc-endpoints/health" }).to_string())
        .await;

    let error = frame_with_command(&mut game.rx, "nrc-endpoints/error").await;
    assert!(error["data"]["error"]
        .as_str()
        .unwrap()
        .contains("not supported"));
}

// ============================================================================
// Upstream lifecycle
// ============================================================================

#[tokio::test]
async fn upstream_reconnect_replays_registrations() {
    let mut rig = start_relay().await;

    let mut game = connect_game(&rig, "Game A").await;
    handshake(&rig, &mut game).await;
    register_action(&rig, &game, "buy_books").await;
    frame_where(&mut rig.upstream_rx, |f| {
        f["command"] == "actions/register"
            && f["data"]["actions"][0]["name"] == "game-a--buy_books"
    })
    .await;

    // Upstream drops; sessions survive.
    rig.transport.disconnect(rig.upstream).await;
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while rig.relay.upstream_connected().await {
        assert!(tokio::time::Instant::now() < deadline, "upstream still marked connected");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(rig.relay.sessions().await.len(), 1);

    // A new upstream peer gets the announcement and the full catalog.
    let (new_upstream, mut new_rx) = rig.transport.open_peer().await;
    rig.relay.attach_upstream(new_upstream).await;

    frame_with_command(&mut new_rx, "startup").await;
    frame_where(&mut new_rx, |f| {
        f["command"] == "actions/register"
            && f["data"]["actions"][0]["name"] == "game-a--buy_books"
    })
    .await;
    frame_where(&mut new_rx, |f| {
        f["command"] == "actions/register"
            && f["data"]["actions"][0]["name"] == "shutdown_game"
    })
    .await;
}

#[tokio::test]
async fn reregister_all_request_is_honored() {
    let mut rig = start_relay().await;

    let mut game = connect_game(&rig, "Game A").await;
    handshake(&rig, &mut game).await;
    register_action(&rig, &game, "buy_books").await;
    frame_where(&mut rig.upstream_rx, |f| {
        f["command"] == "actions/register"
            && f["data"]["actions"][0]["name"] == "game-a--buy_books"
    })
    .await;

    rig.transport
        .frame_from(rig.upstream, json!({ "command": "actions/reregister_all" }).to_string())
        .await;

    frame_where(&mut rig.upstream_rx, |f| {
        f["command"] == "actions/register"
            && f["data"]["actions"][0]["name"] == "game-a--buy_books"
    })
    .await;
}

#[tokio::test]
async fn graceful_shutdown_from_upstream_terminates_relay() {
    let mut rig = start_relay().await;

    rig.transport
        .frame_from(
            rig.upstream,
            json!({
                "command": "shutdown/graceful",
                "data": { "wants_shutdown": true },
            })
            .to_string(),
        )
        .await;

    let ready = frame_with_command(&mut rig.upstream_rx, "shutdown/ready").await;
    assert_eq!(ready["game"], "Test Relay");

    timeout(TEST_TIMEOUT, rig.relay.terminated())
        .await
        .expect("relay did not terminate");
}

#[tokio::test]
async fn quit_drains_in_flight_requests() {
    let mut rig = start_relay().await;

    let mut game = connect_game(&rig, "Game A").await;
    handshake(&rig, &mut game).await;
    register_action(&rig, &game, "buy_books").await;

    rig.transport
        .frame_from(
            rig.upstream,
            json!({
                "command": "action",
                "data": { "id": "r1", "name": "game-a--buy_books", "data": "" },
            })
            .to_string(),
        )
        .await;
    frame_with_command(&mut game.rx, "action").await;

    rig.relay.quit().await;

    let result = frame_with_command(&mut rig.upstream_rx, "action/result").await;
    assert_eq!(result["data"]["id"], "r1");
    assert_eq!(result["data"]["success"], false);
    assert_eq!(result["data"]["message"], "session terminated");

    timeout(TEST_TIMEOUT, rig.relay.terminated())
        .await
        .expect("relay did not terminate");
}
