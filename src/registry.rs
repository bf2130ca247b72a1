//! Session registry: the authoritative table of downstream games.
//!
//! Owned and mutated exclusively by the relay actor, so the type itself is
//! synchronous; the actor's command queue is the linearization point. The
//! registry also arbitrates the compatibility lock: a session that has not
//! negotiated multiplexing holds exclusive use of the upstream channel, and
//! no further session may open until it disconnects or upgrades.

use std::collections::HashMap;
use std::fmt;

use tracing::{error, info};

use crate::naming::normalize_game_name;
use crate::protocol::ActionSpec;
use crate::transport::PeerId;
use crate::version::VersionFeatures;

/// Per-downstream-peer state.
#[derive(Clone, Debug)]
pub struct GameSession {
    pub id: String,
    pub display_name: String,
    pub peer: PeerId,
    pub features: VersionFeatures,
    pub negotiated_version: Option<String>,
    /// Action catalog keyed by raw (unprefixed) name, as the game sent it.
    pub actions: HashMap<String, ActionSpec>,
    /// Admission order, for deterministic snapshots and lock arbitration.
    seq: u64,
}

/// Why a startup was refused. No session is created in any of these cases.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpenError {
    /// The display name normalizes to the reserved empty id.
    EmptyId,
    /// A non-multiplexing session holds the relay.
    Locked,
    /// Another live session already owns the derived id.
    IdCollision(String),
}

impl fmt::Display for OpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenError::EmptyId => write!(f, "game name normalizes to an empty id"),
            OpenError::Locked => {
                write!(f, "relay is locked to a non-multiplexing integration")
            }
            OpenError::IdCollision(id) => {
                write!(f, "a game with id '{id}' is already connected")
            }
        }
    }
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: HashMap<PeerId, GameSession>,
    lock_holder: Option<PeerId>,
    next_seq: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a session for `peer`. New sessions start with every feature
    /// disabled and therefore take the lock; the version handshake upgrades
    /// them afterwards.
    pub fn open(&mut self, peer: PeerId, display_name: &str) -> Result<&GameSession, OpenError> {
        let id = normalize_game_name(display_name);
        if id.is_empty() {
            return Err(OpenError::EmptyId);
        }
        if self.lock_holder.is_some() {
            return Err(OpenError::Locked);
        }
        if self.sessions.values().any(|s| s.id == id) {
            return Err(OpenError::IdCollision(id));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.sessions.insert(
            peer,
            GameSession {
                id,
                display_name: display_name.to_string(),
                peer,
                features: VersionFeatures::default(),
                negotiated_version: None,
                actions: HashMap::new(),
                seq,
            },
        );
        self.recompute_lock();

        let session = &self.sessions[&peer];
        info!(game = %session.id, %peer, "session opened");
        Ok(session)
    }

    /// Remove the session bound to `peer`, releasing the lock if it held
    /// it. Idempotent: unknown peers return `None`.
    pub fn close(&mut self, peer: PeerId) -> Option<GameSession> {
        let session = self.sessions.remove(&peer)?;
        self.recompute_lock();
        info!(game = %session.id, %peer, "session closed");
        Some(session)
    }

    pub fn get(&self, peer: PeerId) -> Option<&GameSession> {
        self.sessions.get(&peer)
    }

    pub fn get_mut(&mut self, peer: PeerId) -> Option<&mut GameSession> {
        self.sessions.get_mut(&peer)
    }

    pub fn get_by_id(&self, id: &str) -> Option<&GameSession> {
        self.sessions.values().find(|s| s.id == id)
    }

    /// Snapshot of `(id, display name)` pairs in admission order.
    pub fn all(&self) -> Vec<(String, String)> {
        let mut sessions: Vec<&GameSession> = self.sessions.values().collect();
        sessions.sort_by_key(|s| s.seq);
        sessions
            .iter()
            .map(|s| (s.id.clone(), s.display_name.clone()))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn is_locked(&self) -> bool {
        self.lock_holder.is_some()
    }

    /// Which peer holds the lock. Test-only.
    #[cfg(test)]
    pub fn lock_holder(&self) -> Option<PeerId> {
        self.lock_holder
    }

    /// Record a completed version handshake for `peer`. Returns the updated
    /// session, or `None` for an unknown peer. If the negotiated features
    /// include multiplexing and the peer held the lock, the lock is
    /// released.
    pub fn upgrade_features(
        &mut self,
        peer: PeerId,
        features: VersionFeatures,
        version: &str,
    ) -> Option<&GameSession> {
        let session = self.sessions.get_mut(&peer)?;
        session.features = features;
        session.negotiated_version = Some(version.to_string());
        self.recompute_lock();
        Some(&self.sessions[&peer])
    }

    /// The lock is always bound to the earliest-admitted session without
    /// multiplexing. Admission control keeps that set at size <= 1, so
    /// finding more than one is an invariant breach.
    fn recompute_lock(&mut self) {
        let mut holders: Vec<&GameSession> = self
            .sessions
            .values()
            .filter(|s| !s.features.multiplexing)
            .collect();
        holders.sort_by_key(|s| s.seq);

        if holders.len() > 1 {
            debug_assert!(false, "multiple non-multiplexing sessions admitted");
            error!(
                count = holders.len(),
                "multiple non-multiplexing sessions in registry"
            );
        }

        let previous = self.lock_holder;
        self.lock_holder = holders.first().map(|s| s.peer);
        if previous != self.lock_holder {
            match self.lock_holder {
                Some(peer) => info!(%peer, "relay locked"),
                None => info!("relay unlocked"),
            }
        }
    }
}
