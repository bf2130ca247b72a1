//! WebSocket realization of the transport abstraction.
//!
//! Downstream games connect to a listening acceptor; the upstream agent is
//! dialed. Every connection gets one read pump feeding the shared event
//! stream and one write pump draining a bounded per-peer queue, so frames
//! to a peer go out in submission order. A peer whose queue overflows is
//! evicted rather than allowed to stall the relay.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::transport::{PeerId, Transport, TransportEvent};

const OUTBOUND_BUFFER: usize = 256;

/// WebSocket transport endpoint serving downstream games and dialing the
/// upstream agent. Both directions feed the same event stream.
pub struct WsTransport {
    events: mpsc::Sender<TransportEvent>,
    peers: Mutex<HashMap<PeerId, mpsc::Sender<Message>>>,
}

impl WsTransport {
    pub fn new(events: mpsc::Sender<TransportEvent>) -> Arc<Self> {
        Arc::new(Self {
            events,
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Bind the downstream listener and spawn the accept loop. Returns the
    /// bound address (useful with port 0).
    pub async fn serve(self: &Arc<Self>, addr: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "websocket listener started");

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, remote)) => {
                        let transport = Arc::clone(&transport);
                        tokio::spawn(async move {
                            if let Err(error) = transport.accept(stream, remote).await {
                                warn!(%remote, %error, "websocket handshake failed");
                            }
                        });
                    }
                    Err(error) => {
                        warn!(%error, "accept failed");
                    }
                }
            }
        });

        Ok(local_addr)
    }

    async fn accept(self: Arc<Self>, stream: TcpStream, remote: SocketAddr) -> Result<()> {
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .context("websocket upgrade failed")?;
        let peer = self.attach(ws).await;
        debug!(%peer, %remote, "downstream connection accepted");
        Ok(())
    }

    /// Dial the upstream agent and attach the connection as a peer.
    pub async fn connect(self: &Arc<Self>, url: &str) -> Result<PeerId> {
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .with_context(|| format!("failed to connect to {url}"))?;
        let peer = self.attach(ws).await;
        info!(%peer, %url, "upstream connection established");
        Ok(peer)
    }

    /// Register the connection, start its pumps, emit `Opened`.
    async fn attach<S>(self: &Arc<Self>, ws: WebSocketStream<S>) -> PeerId
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let peer = PeerId::fresh();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
        self.peers.lock().await.insert(peer, outbound_tx);
        let _ = self.events.send(TransportEvent::Opened(peer)).await;

        let (mut sink, mut stream) = ws.split();

        // Write pump: drains the peer queue; ends when the queue sender is
        // dropped (detach) or the socket dies.
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Read pump: text frames become events, everything else is
        // transport housekeeping.
        let transport = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        let _ = transport
                            .events
                            .send(TransportEvent::Frame(peer, text.to_string()))
                            .await;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        debug!(%peer, %error, "websocket read ended");
                        break;
                    }
                }
            }
            transport.detach(peer).await;
        });

        peer
    }

    /// Drop the peer's queue and emit `Closed` exactly once.
    async fn detach(&self, peer: PeerId) {
        if self.peers.lock().await.remove(&peer).is_some() {
            debug!(%peer, "peer detached");
            let _ = self.events.send(TransportEvent::Closed(peer)).await;
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&self, peer: PeerId, frame: String) -> Result<()> {
        let tx = {
            let peers = self.peers.lock().await;
            peers.get(&peer).cloned()
        };
        let Some(tx) = tx else {
            bail!("{peer} is not connected");
        };

        match tx.try_send(Message::Text(frame.into())) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(%peer, "outbound queue full, evicting slow peer");
                self.detach(peer).await;
                bail!("{peer} is too slow");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.detach(peer).await;
                bail!("{peer} hung up");
            }
        }
    }

    async fn close(&self, peer: PeerId) {
        self.detach(peer).await;
    }
}
