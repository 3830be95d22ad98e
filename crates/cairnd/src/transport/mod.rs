//! TCP transport: one connection per peer, control frames and raw streams
//! multiplexed over it.
//!
//! Every accepted or dialed connection gets its own task:
//!
//!   handshake → on_peer hook → read loop → on_disconnect hook
//!
//! The read loop pushes decoded MESSAGE frames onto a bounded channel with a
//! single consumer. A full channel blocks the read loop, nothing is dropped.
//! On a STREAM tag the loop parks on the peer's stream gate until the
//! application has drained the stream.

pub mod handshake;
pub mod peer;
pub mod state;

pub use handshake::{AllowList, Handshake, HandshakeError, NoHandshake};
pub use peer::{Peer, StreamReader};
pub use state::{StreamGate, StreamState};

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use bytes::Bytes;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

use cairn_core::wire::{Frame, WireError};

/// A frame delivered to the consumer.
#[derive(Debug, Clone)]
pub struct Rpc {
    /// Remote address of the sending peer.
    pub from: String,
    /// Serialized `Message` for control frames, empty for stream markers.
    pub payload: Bytes,
    /// True if this announces a stream rather than carrying a message.
    pub stream: bool,
}

/// Called after a successful handshake. An error closes the connection.
pub type PeerHook = Arc<dyn Fn(Arc<Peer>) -> anyhow::Result<()> + Send + Sync>;

/// Called once a peer's read loop has ended.
pub type DisconnectHook = Arc<dyn Fn(&Peer) + Send + Sync>;

pub struct TcpTransportOpts {
    pub listen_addr: String,
    pub handshake: Arc<dyn Handshake>,
    /// Capacity of the control channel.
    pub rpc_buffer: usize,
}

impl TcpTransportOpts {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            handshake: Arc::new(NoHandshake),
            rpc_buffer: 1024,
        }
    }
}

pub struct TcpTransport {
    opts: TcpTransportOpts,
    rpc_tx: mpsc::Sender<Rpc>,
    rpc_rx: Mutex<Option<mpsc::Receiver<Rpc>>>,
    on_peer: RwLock<Option<PeerHook>>,
    on_disconnect: RwLock<Option<DisconnectHook>>,
    local_addr: OnceLock<SocketAddr>,
    shutdown: broadcast::Sender<()>,
}

impl TcpTransport {
    pub fn new(opts: TcpTransportOpts) -> Arc<Self> {
        let (rpc_tx, rpc_rx) = mpsc::channel(opts.rpc_buffer.max(1));
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(Self {
            opts,
            rpc_tx,
            rpc_rx: Mutex::new(Some(rpc_rx)),
            on_peer: RwLock::new(None),
            on_disconnect: RwLock::new(None),
            local_addr: OnceLock::new(),
            shutdown,
        })
    }

    /// Configured listen address.
    pub fn addr(&self) -> &str {
        &self.opts.listen_addr
    }

    /// Bound address, once `listen_and_accept` has succeeded.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn set_on_peer(&self, hook: PeerHook) {
        if let Ok(mut slot) = self.on_peer.write() {
            *slot = Some(hook);
        }
    }

    pub fn set_on_disconnect(&self, hook: DisconnectHook) {
        if let Ok(mut slot) = self.on_disconnect.write() {
            *slot = Some(hook);
        }
    }

    /// Take the control channel. There is exactly one consumer.
    pub fn consume(&self) -> Result<mpsc::Receiver<Rpc>, TransportError> {
        self.rpc_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .ok_or(TransportError::AlreadyConsumed)
    }

    /// Bind and start accepting in the background. Returns the bound address.
    pub async fn listen_and_accept(self: &Arc<Self>) -> Result<SocketAddr, TransportError> {
        let listener = TcpListener::bind(&self.opts.listen_addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: self.opts.listen_addr.clone(),
                source,
            })?;
        let local = listener.local_addr().map_err(|source| TransportError::Bind {
            addr: self.opts.listen_addr.clone(),
            source,
        })?;
        let _ = self.local_addr.set(local);

        let shutdown = self.shutdown.subscribe();
        tokio::spawn(self.clone().accept_loop(listener, shutdown));

        tracing::info!(addr = %local, "tcp transport listening");
        Ok(local)
    }

    /// Connect to `addr` and run the connection like an accepted one,
    /// marked outbound.
    pub async fn dial(self: &Arc<Self>, addr: &str) -> Result<(), TransportError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| TransportError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        tokio::spawn(self.clone().handle_conn(stream, true));
        Ok(())
    }

    /// Stop accepting and drop the listener. Running read loops are left
    /// to end when their connections do.
    pub fn close(&self) {
        let _ = self.shutdown.send(());
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!(addr = %self.opts.listen_addr, "tcp transport closed");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        tracing::debug!(peer = %remote, "new incoming connection");
                        tokio::spawn(self.clone().handle_conn(stream, false));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "tcp accept error");
                    }
                },
            }
        }
    }

    async fn handle_conn(self: Arc<Self>, stream: TcpStream, outbound: bool) {
        let peer = match Peer::new(stream, outbound) {
            Ok(p) => Arc::new(p),
            Err(e) => {
                tracing::warn!(error = %e, "failed to set up peer connection");
                return;
            }
        };

        if let Err(e) = self.opts.handshake.handshake(&peer) {
            tracing::warn!(peer = %peer.addr(), error = %e, "tcp handshake error");
            peer.shutdown().await;
            return;
        }

        let on_peer = self.on_peer.read().ok().and_then(|h| h.clone());
        if let Some(hook) = on_peer {
            if let Err(e) = hook(peer.clone()) {
                tracing::warn!(peer = %peer.addr(), error = %e, "peer rejected by on_peer hook");
                peer.shutdown().await;
                return;
            }
        }

        let err = self.read_loop(&peer).await;
        match err {
            WireError::Closed => tracing::debug!(peer = %peer.addr(), "peer closed connection"),
            e => tracing::warn!(peer = %peer.addr(), error = %e, "dropping peer connection"),
        }

        let on_disconnect = self.on_disconnect.read().ok().and_then(|h| h.clone());
        if let Some(hook) = on_disconnect {
            hook(peer.as_ref());
        }
        peer.shutdown().await;
    }

    /// Runs until the connection fails. Always returns the reason.
    async fn read_loop(&self, peer: &Peer) -> WireError {
        let from = peer.id();
        loop {
            match peer.read_frame().await {
                Ok(Frame::Message(payload)) => {
                    let rpc = Rpc {
                        from: from.clone(),
                        payload,
                        stream: false,
                    };
                    if self.rpc_tx.send(rpc).await.is_err() {
                        return WireError::Closed;
                    }
                }
                Ok(Frame::Stream) => {
                    peer.gate().open();
                    tracing::debug!(peer = %from, "incoming stream, waiting");

                    let marker = Rpc {
                        from: from.clone(),
                        payload: Bytes::new(),
                        stream: true,
                    };
                    if self.rpc_tx.send(marker).await.is_err() {
                        return WireError::Closed;
                    }

                    peer.gate().released().await;
                    tracing::debug!(peer = %from, "stream closed, resuming read loop");
                }
                Err(e) => return e,
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport channel already has a consumer")]
    AlreadyConsumed,
}
