//! Relay controller: the coordinator that impersonates a single integration
//! upstream while fanning out to many downstream games.
//!
//! # Architecture
//!
//! - [`Relay`]: the public handle (cheap to clone, sends commands to the actor)
//! - `RelayActor`: owns the session registry, the namespace router and the
//!   upstream peer; processes transport events and commands sequentially
//! - `RelayCommand`: commands sent from handles and timer tasks to the actor
//!
//! The actor's queue is the linearization point for all shared state and
//! also serializes every upstream write, which the upstream transport
//! requires. Registry and router operations are synchronous and never block
//! on I/O.
//!
//! Protocol state machines implemented here:
//!
//! - downstream-facing: session admission, version handshake, health,
//!   action registration, context/force forwarding, result correlation,
//!   graceful-shutdown acknowledgment;
//! - upstream-facing: action routing with exactly-once result delivery,
//!   full re-registration, relay-wide graceful shutdown;
//! - the synthetic `shutdown_game` action with its timeout fallback.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::protocol::{self, ActionSpec, Envelope};
use crate::registry::{OpenError, SessionRegistry};
use crate::router::NamespaceRouter;
use crate::transport::{PeerId, Transport, TransportEvent};
use crate::version;

/// The one action the relay itself exposes upstream.
pub const SHUTDOWN_GAME_ACTION: &str = "shutdown_game";

const COMMAND_BUFFER: usize = 256;

#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Display name the relay announces upstream.
    pub relay_name: String,
    /// How long a game gets to answer `shutdown/graceful` before its
    /// connection is forced closed.
    pub shutdown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            relay_name: "Game Relay".to_string(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// Commands sent from handles and timer tasks to the actor
// ============================================================================

enum RelayCommand {
    AttachUpstream(PeerId),
    Sessions {
        reply: oneshot::Sender<Vec<(String, String)>>,
    },
    IsLocked {
        reply: oneshot::Sender<bool>,
    },
    UpstreamConnected {
        reply: oneshot::Sender<bool>,
    },
    ShutdownTimerFired {
        game_id: String,
        token: u64,
    },
    Quit,
}

// ============================================================================
// Relay handle (public API - cheap to clone)
// ============================================================================

/// Handle to the relay actor. Cheap to clone.
#[derive(Clone)]
pub struct Relay {
    cmd_tx: mpsc::Sender<RelayCommand>,
    terminated_rx: watch::Receiver<bool>,
}

impl Relay {
    /// Spawn the relay actor.
    ///
    /// `events` carries the merged event streams of both transport
    /// endpoints; `upstream` names the peer representing the agent
    /// connection. Everything else on the stream is a downstream game.
    pub fn spawn(
        config: RelayConfig,
        transport: Arc<dyn Transport>,
        upstream: PeerId,
        events: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (terminated_tx, terminated_rx) = watch::channel(false);

        let actor = RelayActor {
            config,
            transport,
            registry: SessionRegistry::new(),
            router: NamespaceRouter::new(),
            upstream: Some(upstream),
            upstream_connected: false,
            shutdown_action_registered: false,
            started_at: Instant::now(),
            shutdown_timers: HashMap::new(),
            next_timer_token: 0,
            cmd_tx: cmd_tx.clone(),
            terminated_tx,
        };
        tokio::spawn(actor.run(cmd_rx, events));

        Self {
            cmd_tx,
            terminated_rx,
        }
    }

    /// Point the relay at a new upstream peer after a reconnect. The relay
    /// replays its startup announcement and re-registers every exposed
    /// action.
    pub async fn attach_upstream(&self, peer: PeerId) {
        let _ = self.cmd_tx.send(RelayCommand::AttachUpstream(peer)).await;
    }

    /// Snapshot of connected games as `(id, display name)` pairs.
    pub async fn sessions(&self) -> Vec<(String, String)> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(RelayCommand::Sessions { reply: tx }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Whether a non-multiplexing integration currently holds the relay.
    pub async fn is_locked(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(RelayCommand::IsLocked { reply: tx }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Whether the upstream agent connection is currently live.
    pub async fn upstream_connected(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(RelayCommand::UpstreamConnected { reply: tx })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Stop the actor. In-flight requests are drained with synthetic
    /// failure results before the terminated event fires.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(RelayCommand::Quit).await;
    }

    /// Resolves once the relay has terminated (quit, event stream ended, or
    /// upstream-initiated graceful shutdown acknowledged).
    pub async fn terminated(&self) {
        let mut rx = self.terminated_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

// ============================================================================
// Actor
// ============================================================================

struct RelayActor {
    config: RelayConfig,
    transport: Arc<dyn Transport>,
    registry: SessionRegistry,
    router: NamespaceRouter,
    upstream: Option<PeerId>,
    upstream_connected: bool,
    /// Whether `shutdown_game` is currently registered upstream.
    shutdown_action_registered: bool,
    started_at: Instant,
    /// Live shutdown timers keyed by game id; the token invalidates stale
    /// timer tasks after an acknowledgment or disconnect.
    shutdown_timers: HashMap<String, u64>,
    next_timer_token: u64,
    cmd_tx: mpsc::Sender<RelayCommand>,
    terminated_tx: watch::Sender<bool>,
}

impl RelayActor {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<RelayCommand>,
        mut events: mpsc::Receiver<TransportEvent>,
    ) {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(RelayCommand::AttachUpstream(peer)) => {
                            self.upstream = Some(peer);
                            self.upstream_connected = false;
                            self.shutdown_action_registered = false;
                            self.upstream_open().await;
                        }
                        Some(RelayCommand::Sessions { reply }) => {
                            let _ = reply.send(self.registry.all());
                        }
                        Some(RelayCommand::IsLocked { reply }) => {
                            let _ = reply.send(self.registry.is_locked());
                        }
                        Some(RelayCommand::UpstreamConnected { reply }) => {
                            let _ = reply.send(self.upstream_connected);
                        }
                        Some(RelayCommand::ShutdownTimerFired { game_id, token }) => {
                            self.shutdown_timer_fired(&game_id, token).await;
                        }
                        Some(RelayCommand::Quit) | None => {
                            debug!("relay actor shutting down");
                            break;
                        }
                    }
                }

                event = events.recv() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            debug!("transport event stream ended");
                            break;
                        }
                    }
                }
            }
        }

        self.finish().await;
    }

    /// Drain every live correlation with a synthetic failure and announce
    /// termination to the host.
    async fn finish(&mut self) {
        for (request_id, game_id) in self.router.drain_requests() {
            debug!(game = %game_id, request = %request_id, "draining in-flight request");
            self.send_upstream_result(&request_id, false, Some("session terminated"))
                .await;
        }
        let _ = self.terminated_tx.send(true);
        info!("relay terminated");
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened(peer) => {
                if self.upstream == Some(peer) {
                    if !self.upstream_connected {
                        self.upstream_open().await;
                    }
                } else {
                    // Downstream peers carry no state until startup.
                    debug!(%peer, "downstream peer connected");
                }
            }
            TransportEvent::Closed(peer) => {
                if self.upstream == Some(peer) {
                    self.upstream_closed();
                } else {
                    self.downstream_closed(peer).await;
                }
            }
            TransportEvent::Frame(peer, raw) => {
                let envelope = match Envelope::parse(&raw) {
                    Ok(envelope) => envelope,
                    Err(error) => {
                        warn!(%peer, %error, "dropping malformed frame");
                        return;
                    }
                };
                if self.upstream == Some(peer) {
                    self.handle_upstream_frame(envelope).await;
                } else {
                    self.handle_downstream_frame(peer, envelope).await;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Upstream lifecycle
    // ------------------------------------------------------------------

    async fn upstream_open(&mut self) {
        self.upstream_connected = true;
        info!(relay = %self.config.relay_name, "upstream connected, announcing relay");
        self.send_upstream(protocol::startup_frame(&self.config.relay_name))
            .await;
        self.reregister_all().await;
    }

    fn upstream_closed(&mut self) {
        warn!("upstream disconnected");
        self.upstream_connected = false;
        self.shutdown_action_registered = false;
        // Nothing can be delivered upstream any more; in-flight requests
        // are released so late game results are dropped as stale. Sessions
        // are preserved until the upstream returns.
        for (request_id, game_id) in self.router.drain_requests() {
            debug!(game = %game_id, request = %request_id, "released request on upstream loss");
        }
    }

    // ------------------------------------------------------------------
    // Downstream session lifecycle
    // ------------------------------------------------------------------

    async fn downstream_closed(&mut self, peer: PeerId) {
        let Some(session) = self.registry.close(peer) else {
            debug!(%peer, "unknown downstream peer closed");
            return;
        };

        self.shutdown_timers.remove(&session.id);
        let purged = self.router.purge_session(&session.id);
        for request_id in purged.orphaned_requests {
            self.send_upstream_result(&request_id, false, Some("session terminated"))
                .await;
        }
        if !purged.exposed_names.is_empty() {
            self.send_upstream(protocol::unregister_frame(
                &self.config.relay_name,
                &purged.exposed_names,
            ))
            .await;
        }
        self.refresh_shutdown_action().await;
    }

    async fn handle_downstream_frame(&mut self, peer: PeerId, envelope: Envelope) {
        if let Some(endpoint) = envelope.command.strip_prefix(protocol::NRC_PREFIX) {
            match endpoint {
                "startup" => self.handle_version_handshake(peer, &envelope).await,
                "health" => self.handle_health(peer, &envelope).await,
                _ => {
                    warn!(%peer, endpoint, "unknown relay endpoint");
                    self.send_to_peer(
                        peer,
                        protocol::error_frame(
                            protocol::CMD_NRC_ERROR,
                            &format!("Unknown endpoint: {endpoint}"),
                        ),
                    )
                    .await;
                }
            }
            return;
        }

        match envelope.command.as_str() {
            protocol::CMD_STARTUP => self.handle_startup(peer, &envelope).await,
            protocol::CMD_CONTEXT => self.handle_context(peer, &envelope).await,
            protocol::CMD_ACTIONS_REGISTER => self.handle_register(peer, &envelope).await,
            protocol::CMD_ACTIONS_UNREGISTER => self.handle_unregister(peer, &envelope).await,
            protocol::CMD_ACTIONS_FORCE => self.handle_force(peer, &envelope).await,
            protocol::CMD_ACTION_RESULT => self.handle_game_result(peer, &envelope).await,
            protocol::CMD_SHUTDOWN_READY => self.handle_shutdown_ready(peer).await,
            other => {
                warn!(%peer, command = other, "unknown downstream command");
            }
        }
    }

    async fn handle_startup(&mut self, peer: PeerId, envelope: &Envelope) {
        if self.registry.get(peer).is_some() {
            warn!(%peer, "duplicate startup ignored");
            return;
        }

        let display_name = envelope.game.clone().unwrap_or_default();
        let (game_id, game_name) = match self.registry.open(peer, &display_name) {
            Ok(session) => (session.id.clone(), session.display_name.clone()),
            Err(error) => {
                info!(%peer, game = %display_name, %error, "startup rejected");
                let frame = match error {
                    OpenError::Locked => {
                        protocol::error_frame(protocol::CMD_RELAY_LOCKED, &error.to_string())
                    }
                    OpenError::EmptyId | OpenError::IdCollision(_) => {
                        protocol::error_frame(protocol::CMD_NRC_ERROR, &error.to_string())
                    }
                };
                self.send_to_peer(peer, frame).await;
                return;
            }
        };

        info!(game = %game_id, name = %game_name, "game connected");
        self.send_upstream(protocol::context_frame(
            &self.config.relay_name,
            &format!("Game '{game_name}' connected to relay"),
            true,
        ))
        .await;
        self.refresh_shutdown_action().await;
    }

    async fn handle_version_handshake(&mut self, peer: PeerId, envelope: &Envelope) {
        if self.registry.get(peer).is_none() {
            self.send_to_peer(
                peer,
                protocol::error_frame(
                    protocol::CMD_NRC_ERROR,
                    "Session not found. Send 'startup' command first.",
                ),
            )
            .await;
            return;
        }

        let requested = envelope
            .payload::<protocol::HandshakePayload>()
            .and_then(|p| p.version)
            .unwrap_or_default();
        if requested.is_empty() {
            self.send_to_peer(
                peer,
                protocol::error_frame(
                    protocol::CMD_NRC_ERROR,
                    "Missing required field: nr-version",
                ),
            )
            .await;
            return;
        }

        let Some(features) = version::features_for(&requested) else {
            debug!(%peer, version = %requested, "unsupported protocol version");
            self.send_to_peer(
                peer,
                protocol::version_mismatch_frame(
                    &requested,
                    &version::supported_versions(),
                    version::CURRENT_VERSION,
                ),
            )
            .await;
            return;
        };

        if let Some(session) = self.registry.upgrade_features(peer, features, &requested) {
            info!(game = %session.id, version = %requested, "version handshake complete");
        }
        self.send_to_peer(
            peer,
            protocol::startup_ack_frame(version::CURRENT_VERSION, features),
        )
        .await;
    }

    async fn handle_health(&mut self, peer: PeerId, envelope: &Envelope) {
        let Some(session) = self.registry.get(peer) else {
            warn!(%peer, "health check from unknown session");
            return;
        };
        if !session.features.health_endpoint {
            self.send_to_peer(
                peer,
                protocol::error_frame(
                    protocol::CMD_NRC_ERROR,
                    "Health endpoint not supported in your version",
                ),
            )
            .await;
            return;
        }

        let include = envelope
            .payload::<protocol::HealthPayload>()
            .and_then(|p| p.include)
            .unwrap_or_else(default_health_fields);

        let features = session.features;
        let game_version = session.negotiated_version.clone().unwrap_or_default();
        let mut fields = Map::new();
        for field in &include {
            match field.as_str() {
                "status" => {
                    fields.insert("status".into(), json!("healthy"));
                }
                "version" => {
                    fields.insert("nr-version".into(), json!(version::CURRENT_VERSION));
                    fields.insert("game-nr-version".into(), json!(game_version));
                }
                "connected-games" => {
                    let games = self.registry.all();
                    fields.insert("total-games".into(), json!(games.len()));
                    let list: Vec<Value> = games
                        .into_iter()
                        .map(|(id, name)| json!({ "id": id, "name": name }))
                        .collect();
                    fields.insert("connected-games".into(), Value::Array(list));
                }
                "neuro-backend" => {
                    fields.insert(
                        "neuro-backend-connected".into(),
                        json!(self.upstream_connected),
                    );
                }
                "uptime" => {
                    fields.insert(
                        "uptime-seconds".into(),
                        json!(self.started_at.elapsed().as_secs()),
                    );
                }
                "features" => {
                    fields.insert(
                        "features".into(),
                        json!({
                            "health-endpoint": features.health_endpoint,
                            "multiplexing": features.multiplexing,
                            "custom-routing": features.custom_routing,
                        }),
                    );
                }
                "lock-status" => {
                    fields.insert("backend-locked".into(), json!(self.registry.is_locked()));
                }
                other => {
                    debug!(%peer, field = other, "unknown health field requested");
                }
            }
        }

        self.send_to_peer(peer, protocol::health_response_frame(fields)).await;
    }

    async fn handle_context(&mut self, peer: PeerId, envelope: &Envelope) {
        let Some(session) = self.registry.get(peer) else {
            warn!(%peer, "context from unknown session");
            return;
        };
        let Some(payload) = envelope.payload::<protocol::ContextPayload>() else {
            warn!(game = %session.id, "malformed context payload");
            return;
        };

        let message = format!("[{}] {}", session.id, payload.message);
        debug!(game = %session.id, silent = payload.silent, "forwarding context");
        self.send_upstream(protocol::context_frame(
            &self.config.relay_name,
            &message,
            payload.silent,
        ))
        .await;
    }

    async fn handle_register(&mut self, peer: PeerId, envelope: &Envelope) {
        let Some(session) = self.registry.get(peer) else {
            warn!(%peer, "register from unknown session");
            return;
        };
        let Some(payload) = envelope.payload::<protocol::RegisterPayload>() else {
            warn!(game = %session.id, "malformed register payload");
            return;
        };
        let game_id = session.id.clone();
        let multiplexing = session.features.multiplexing;

        let mut exposed_batch = Vec::with_capacity(payload.actions.len());
        for action in payload.actions {
            match self.router.register(&game_id, &action.name, multiplexing) {
                Ok(exposed) => {
                    debug!(game = %game_id, action = %action.name, %exposed, "action registered");
                    if let Some(session) = self.registry.get_mut(peer) {
                        session.actions.insert(action.name.clone(), action.clone());
                    }
                    exposed_batch.push(ActionSpec {
                        name: exposed,
                        description: action.description,
                        schema: action.schema,
                    });
                }
                Err(error) => {
                    warn!(game = %game_id, action = %action.name, %error, "action rejected");
                    self.send_to_peer(
                        peer,
                        protocol::error_frame(protocol::CMD_NRC_ERROR, &error.to_string()),
                    )
                    .await;
                }
            }
        }

        if !exposed_batch.is_empty() {
            self.send_upstream(protocol::register_frame(
                &self.config.relay_name,
                &exposed_batch,
            ))
            .await;
        }
    }

    async fn handle_unregister(&mut self, peer: PeerId, envelope: &Envelope) {
        let Some(session) = self.registry.get(peer) else {
            warn!(%peer, "unregister from unknown session");
            return;
        };
        let Some(payload) = envelope.payload::<protocol::UnregisterPayload>() else {
            warn!(game = %session.id, "malformed unregister payload");
            return;
        };
        let game_id = session.id.clone();
        let multiplexing = session.features.multiplexing;

        let mut removed = Vec::with_capacity(payload.action_names.len());
        for name in payload.action_names {
            if let Some(session) = self.registry.get_mut(peer) {
                session.actions.remove(&name);
            }
            if let Some(exposed) = self.router.unregister(&game_id, &name, multiplexing) {
                debug!(game = %game_id, action = %name, %exposed, "action unregistered");
                removed.push(exposed);
            }
        }

        if !removed.is_empty() {
            self.send_upstream(protocol::unregister_frame(&self.config.relay_name, &removed))
                .await;
        }
    }

    async fn handle_force(&mut self, peer: PeerId, envelope: &Envelope) {
        let Some(session) = self.registry.get(peer) else {
            warn!(%peer, "force from unknown session");
            return;
        };
        let Some(payload) = envelope.payload::<protocol::ForcePayload>() else {
            warn!(game = %session.id, "malformed force payload");
            return;
        };
        let game_id = session.id.clone();
        let multiplexing = session.features.multiplexing;

        let exposed_names: Vec<String> = payload
            .action_names
            .iter()
            .map(|name| self.router.exposed_for(&game_id, name, multiplexing))
            .collect();
        let priority = payload
            .priority
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or("low");
        let query = format!("[{game_id}] {}", payload.query);

        debug!(game = %game_id, actions = ?exposed_names, "forwarding force");
        self.send_upstream(protocol::force_frame(
            &self.config.relay_name,
            &query,
            &exposed_names,
            payload.ephemeral_context,
            priority,
            payload.state.as_deref(),
        ))
        .await;
    }

    async fn handle_game_result(&mut self, peer: PeerId, envelope: &Envelope) {
        let Some(session) = self.registry.get(peer) else {
            warn!(%peer, "action result from unknown session");
            return;
        };
        let Some(payload) = envelope.payload::<protocol::ActionResultPayload>() else {
            warn!(game = %session.id, "malformed action result payload");
            return;
        };
        let game_id = session.id.clone();

        match self.router.release(&payload.id) {
            Some(owner) if owner == game_id => {
                debug!(
                    game = %game_id,
                    request = %payload.id,
                    success = payload.success,
                    "forwarding action result"
                );
                self.send_upstream_result(&payload.id, payload.success, payload.message.as_deref())
                    .await;
            }
            Some(owner) => {
                // The request belongs to another session; keep its
                // correlation live and drop the impostor result.
                warn!(game = %game_id, request = %payload.id, %owner, "result for foreign request dropped");
                let _ = self.router.bind(&payload.id, &owner);
            }
            None => {
                debug!(game = %game_id, request = %payload.id, "late or unknown result dropped");
            }
        }
    }

    async fn handle_shutdown_ready(&mut self, peer: PeerId) {
        let Some(session) = self.registry.get(peer) else {
            warn!(%peer, "shutdown ready from unknown session");
            return;
        };
        let game_id = session.id.clone();

        if self.shutdown_timers.remove(&game_id).is_some() {
            info!(game = %game_id, "game acknowledged shutdown in time");
        }
        self.send_upstream(protocol::context_frame(
            &self.config.relay_name,
            &format!("Game '{game_id}' has shut down gracefully"),
            true,
        ))
        .await;
    }

    // ------------------------------------------------------------------
    // Upstream-facing state machine
    // ------------------------------------------------------------------

    async fn handle_upstream_frame(&mut self, envelope: Envelope) {
        match envelope.command.as_str() {
            protocol::CMD_ACTION => self.handle_upstream_action(&envelope).await,
            protocol::CMD_REREGISTER_ALL => {
                info!("upstream requested full re-registration");
                self.reregister_all().await;
            }
            protocol::CMD_SHUTDOWN_GRACEFUL => self.handle_relay_shutdown(&envelope).await,
            other => {
                warn!(command = other, "unknown upstream command");
            }
        }
    }

    async fn handle_upstream_action(&mut self, envelope: &Envelope) {
        let Some(payload) = envelope.payload::<protocol::ActionPayload>() else {
            warn!("malformed action payload from upstream");
            return;
        };

        if payload.name == SHUTDOWN_GAME_ACTION {
            self.handle_shutdown_game(&payload.id, payload.data.as_ref())
                .await;
            return;
        }

        let Some(game_id) = self.router.resolve(&payload.name).map(str::to_string) else {
            debug!(action = %payload.name, request = %payload.id, "unknown action");
            self.send_upstream_result(&payload.id, false, Some("unknown action"))
                .await;
            return;
        };

        if self.router.bind(&payload.id, &game_id).is_err() {
            warn!(request = %payload.id, "duplicate request id from upstream");
            self.send_upstream_result(&payload.id, false, Some("duplicate request"))
                .await;
            return;
        }

        let Some(session) = self.registry.get_by_id(&game_id) else {
            // Resolve and session lifetime are kept in sync by purge; a
            // miss here means the maps disagree.
            warn!(game = %game_id, request = %payload.id, "action resolved to dead session");
            self.router.release(&payload.id);
            self.send_upstream_result(&payload.id, false, Some("game disconnected"))
                .await;
            return;
        };

        let peer = session.peer;
        let raw = if session.features.multiplexing {
            crate::naming::raw_name(&game_id, &payload.name)
                .unwrap_or(&payload.name)
                .to_string()
        } else {
            payload.name.clone()
        };

        debug!(game = %game_id, request = %payload.id, action = %raw, "routing action");
        let frame = protocol::action_frame(&payload.id, &raw, payload.data.as_ref());
        if let Err(error) = self.send_to_game(peer, frame).await {
            warn!(game = %game_id, request = %payload.id, %error, "forward failed");
            self.router.release(&payload.id);
            self.send_upstream_result(&payload.id, false, Some("game disconnected"))
                .await;
        }
    }

    async fn handle_shutdown_game(&mut self, request_id: &str, data: Option<&Value>) {
        let params = match parse_shutdown_params(data) {
            Some(params) => params,
            None => {
                self.send_upstream_result(request_id, false, Some("invalid parameters"))
                    .await;
                return;
            }
        };
        let Some(game_id) = params.game_id.filter(|id| !id.is_empty()) else {
            self.send_upstream_result(request_id, false, Some("missing game_id parameter"))
                .await;
            return;
        };

        let Some(session) = self.registry.get_by_id(&game_id) else {
            self.send_upstream_result(request_id, false, Some("no such game"))
                .await;
            return;
        };
        let peer = session.peer;

        info!(game = %game_id, request = %request_id, "graceful shutdown requested");
        if let Err(error) = self
            .send_to_game(peer, protocol::graceful_shutdown_frame(true))
            .await
        {
            warn!(game = %game_id, %error, "shutdown delivery failed");
            self.send_upstream_result(request_id, false, Some("game disconnected"))
                .await;
            return;
        }

        self.arm_shutdown_timer(&game_id);
        self.send_upstream_result(request_id, true, Some("shutdown requested"))
            .await;
    }

    async fn handle_relay_shutdown(&mut self, envelope: &Envelope) {
        let Some(payload) = envelope.payload::<protocol::GracefulShutdownPayload>() else {
            warn!("malformed graceful shutdown payload from upstream");
            return;
        };

        if !payload.wants_shutdown {
            info!("relay shutdown cancelled by upstream");
            return;
        }

        info!("relay shutdown requested by upstream");
        for (request_id, game_id) in self.router.drain_requests() {
            debug!(game = %game_id, request = %request_id, "draining in-flight request");
            self.send_upstream_result(&request_id, false, Some("session terminated"))
                .await;
        }
        self.send_upstream(protocol::shutdown_ready_frame(&self.config.relay_name))
            .await;
        let _ = self.terminated_tx.send(true);
    }

    // ------------------------------------------------------------------
    // Synthetic shutdown_game action
    // ------------------------------------------------------------------

    fn arm_shutdown_timer(&mut self, game_id: &str) {
        let token = self.next_timer_token;
        self.next_timer_token += 1;
        self.shutdown_timers.insert(game_id.to_string(), token);

        let cmd_tx = self.cmd_tx.clone();
        let grace = self.config.shutdown_grace;
        let game_id = game_id.to_string();
        tokio::spawn(async move {
            sleep(grace).await;
            let _ = cmd_tx
                .send(RelayCommand::ShutdownTimerFired { game_id, token })
                .await;
        });
    }

    async fn shutdown_timer_fired(&mut self, game_id: &str, token: u64) {
        if self.shutdown_timers.get(game_id) != Some(&token) {
            // Acknowledged or superseded; stale timer.
            return;
        }
        self.shutdown_timers.remove(game_id);

        if let Some(session) = self.registry.get_by_id(game_id) {
            let peer = session.peer;
            warn!(game = %game_id, "graceful shutdown timed out, forcing disconnect");
            self.transport.close(peer).await;
        }
    }

    /// Keep the upstream's `shutdown_game` action in sync with the set of
    /// open games: refreshed on every open and close, unregistered when no
    /// games remain.
    async fn refresh_shutdown_action(&mut self) {
        let game_ids: Vec<String> = self.registry.all().into_iter().map(|(id, _)| id).collect();

        if game_ids.is_empty() {
            if self.shutdown_action_registered {
                self.send_upstream(protocol::unregister_frame(
                    &self.config.relay_name,
                    &[SHUTDOWN_GAME_ACTION.to_string()],
                ))
                .await;
                self.shutdown_action_registered = false;
            }
            return;
        }

        debug!(games = ?game_ids, "refreshing shutdown_game action");
        self.send_upstream(protocol::register_frame(
            &self.config.relay_name,
            &[shutdown_game_spec(&game_ids)],
        ))
        .await;
        self.shutdown_action_registered = true;
    }

    /// Re-announce every exposed action upstream, then refresh the
    /// synthetic one. Used on upstream (re)connect and on request.
    async fn reregister_all(&mut self) {
        let mut batch = Vec::new();
        for (game_id, _) in self.registry.all() {
            let Some(session) = self.registry.get_by_id(&game_id) else {
                continue;
            };
            let multiplexing = session.features.multiplexing;
            let mut raw_names: Vec<&String> = session.actions.keys().collect();
            raw_names.sort();
            for raw in raw_names {
                let spec = &session.actions[raw];
                batch.push(ActionSpec {
                    name: self.router.exposed_for(&game_id, raw, multiplexing),
                    description: spec.description.clone(),
                    schema: spec.schema.clone(),
                });
            }
        }

        if !batch.is_empty() {
            info!(count = batch.len(), "re-registering actions upstream");
            self.send_upstream(protocol::register_frame(&self.config.relay_name, &batch))
                .await;
        }
        self.refresh_shutdown_action().await;
    }

    // ------------------------------------------------------------------
    // Send helpers
    // ------------------------------------------------------------------

    async fn send_upstream(&self, frame: Envelope) {
        let Some(peer) = self.upstream else {
            return;
        };
        if !self.upstream_connected {
            debug!(command = %frame.command, "upstream down, frame dropped");
            return;
        }
        if let Err(error) = self.transport.send(peer, frame.encode()).await {
            warn!(%error, "upstream send failed");
        }
    }

    async fn send_upstream_result(&self, id: &str, success: bool, message: Option<&str>) {
        self.send_upstream(protocol::action_result_frame(
            &self.config.relay_name,
            id,
            success,
            message,
        ))
        .await;
    }

    /// Reply to a downstream peer; delivery failures are logged only, the
    /// peer's close event does the cleanup.
    async fn send_to_peer(&self, peer: PeerId, frame: Envelope) {
        if let Err(error) = self.transport.send(peer, frame.encode()).await {
            debug!(%peer, %error, "downstream send failed");
        }
    }

    /// Forward to a game where the caller must observe the failure.
    async fn send_to_game(&self, peer: PeerId, frame: Envelope) -> anyhow::Result<()> {
        self.transport.send(peer, frame.encode()).await
    }
}

#[derive(Debug, Default, Deserialize)]
struct ShutdownGameParams {
    game_id: Option<String>,
}

/// The `shutdown_game` argument payload arrives as a JSON string. Absent or
/// empty payloads are legal (they fail later as a missing game id); anything
/// else must parse as an object.
fn parse_shutdown_params(data: Option<&Value>) -> Option<ShutdownGameParams> {
    match data {
        None | Some(Value::Null) => Some(ShutdownGameParams::default()),
        Some(Value::String(raw)) if raw.is_empty() => Some(ShutdownGameParams::default()),
        Some(Value::String(raw)) => serde_json::from_str(raw).ok(),
        Some(_) => None,
    }
}

fn shutdown_game_spec(game_ids: &[String]) -> ActionSpec {
    ActionSpec {
        name: SHUTDOWN_GAME_ACTION.to_string(),
        description:
            "Request a game to shut down gracefully. The game will save progress and quit."
                .to_string(),
        schema: Some(json!({
            "type": "object",
            "properties": {
                "game_id": {
                    "type": "string",
                    "description": "ID of the game to shut down",
                    "enum": game_ids,
                },
            },
            "required": ["game_id"],
        })),
    }
}

fn default_health_fields() -> Vec<String> {
    ["status", "version", "connected-games", "neuro-backend", "uptime"]
        .into_iter()
        .map(String::from)
        .collect()
}
