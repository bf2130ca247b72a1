//! Transport abstraction consumed by the relay core.
//!
//! The core requires only a message-oriented bidirectional channel per peer
//! with ordered in-channel delivery and an observable close event: frames
//! and lifecycle changes arrive as [`TransportEvent`]s on a single stream,
//! outbound traffic goes through the [`Transport`] trait. Failed sends are
//! surfaced as errors so the core can synthesize failure results instead of
//! relying on transport-level panics or teardown.
//!
//! [`InProcessTransport`] is the channel-backed realization used by tests
//! and by hosts that embed both sides in one process; `ws` provides the
//! WebSocket realization.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

/// Opaque handle for a connected peer, unique for the process lifetime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(u64);

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

impl PeerId {
    /// Allocate a fresh id. Transport implementations call this once per
    /// accepted or dialed connection.
    pub fn fresh() -> Self {
        Self(NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Lifecycle and traffic events emitted by a transport endpoint.
///
/// Per peer, events are ordered: `Opened` first, then `Frame`s in receive
/// order, then exactly one `Closed`. No ordering holds across peers.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    Opened(PeerId),
    Closed(PeerId),
    Frame(PeerId, String),
}

/// Outbound side of the transport abstraction.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue a frame for delivery to a peer. Frames submitted to the same
    /// peer are delivered in submission order. Errors when the peer is gone;
    /// callers turn that into a synthetic failure, never a panic.
    async fn send(&self, peer: PeerId, frame: String) -> Result<()>;

    /// Close a peer's channel. The transport emits `Closed` for the peer;
    /// idempotent for already-closed peers.
    async fn close(&self, peer: PeerId);
}

/// In-process transport: every peer is a bounded channel pair.
pub struct InProcessTransport {
    events: mpsc::Sender<TransportEvent>,
    peers: Mutex<HashMap<PeerId, mpsc::Sender<String>>>,
}

const PEER_BUFFER: usize = 64;

impl InProcessTransport {
    pub fn new(events: mpsc::Sender<TransportEvent>) -> Arc<Self> {
        Arc::new(Self {
            events,
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Attach a new peer. Returns its id and the receiving end of the
    /// frames the core sends to it. Emits `Opened` on the event stream.
    pub async fn open_peer(&self) -> (PeerId, mpsc::Receiver<String>) {
        let peer = PeerId::fresh();
        let (tx, rx) = mpsc::channel(PEER_BUFFER);
        self.peers.lock().await.insert(peer, tx);
        let _ = self.events.send(TransportEvent::Opened(peer)).await;
        (peer, rx)
    }

    /// Inject an inbound frame from a peer, as the remote side would.
    pub async fn frame_from(&self, peer: PeerId, raw: impl Into<String>) {
        let _ = self
            .events
            .send(TransportEvent::Frame(peer, raw.into()))
            .await;
    }

    /// Peer-initiated disconnect: drops the outbound channel and emits
    /// `Closed`, exactly like a remote hangup.
    pub async fn disconnect(&self, peer: PeerId) {
        if self.peers.lock().await.remove(&peer).is_some() {
            let _ = self.events.send(TransportEvent::Closed(peer)).await;
        }
    }
}

#[async_trait]
impl Transport for InProcessTransport {
    async fn send(&self, peer: PeerId, frame: String) -> Result<()> {
        let tx = {
            let peers = self.peers.lock().await;
            peers.get(&peer).cloned()
        };
        match tx {
            Some(tx) => tx.send(frame).await.map_err(|_| anyhow!("{peer} hung up")),
            None => Err(anyhow!("{peer} is not connected")),
        }
    }

    async fn close(&self, peer: PeerId) {
        if self.peers.lock().await.remove(&peer).is_some() {
            debug!(%peer, "transport close");
            let _ = self.events.send(TransportEvent::Closed(peer)).await;
        }
    }
}
