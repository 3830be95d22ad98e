//! Replication server.
//!
//! A `FileServer` owns one local `Store` namespace (its node id) and one
//! transport. `store` writes locally and pushes the bytes to every connected
//! peer; `get` serves local hits and otherwise asks the network.
//!
//! Per-peer protocol, on top of the transport's frames:
//!
//! ```text
//! store:  MESSAGE StoreFile{key,size}  then  STREAM <size bytes>
//! get:    MESSAGE GetFile{key}
//!   reply MESSAGE StoreFile{key,size,reply}  then  STREAM <size bytes>
//! ```
//!
//! Replies name their key, so a late answer to an abandoned `get` can never
//! satisfy a different one. The first complete reply for a pending key is
//! committed; the rest are drained and dropped.

pub mod dispatch;
pub mod fetch;
pub mod registry;

pub use dispatch::{Decoder, JsonDecoder};
pub use fetch::{FetchWaiter, PendingFetches};
pub use registry::PeerRegistry;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;

use cairn_core::config::CairnConfig;
use cairn_core::crypto::{self, CipherError, EncryptionKey};
use cairn_core::wire::{Message, WireError};
use cairn_store::{cas_path_transform, PathTransform, Store, StoreError, StoreOpts};

use crate::transport::{
    AllowList, HandshakeError, NoHandshake, Peer, TcpTransport, TcpTransportOpts, TransportError,
};

pub struct FileServerOpts {
    /// Node id, also the local store namespace. Generated when empty.
    pub id: String,
    pub storage_root: PathBuf,
    pub path_transform: PathTransform,
    pub transport: TcpTransportOpts,
    pub bootstrap: Vec<String>,
    /// Encrypt payloads sent to peers. The local copy stays plaintext.
    pub encrypt: bool,
    /// How long `get` waits for any peer to deliver the file.
    pub fetch_timeout: Duration,
    pub decoder: Arc<dyn Decoder>,
}

impl FileServerOpts {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            storage_root: PathBuf::from(cairn_store::DEFAULT_ROOT),
            path_transform: cas_path_transform,
            transport: TcpTransportOpts::new(listen_addr),
            bootstrap: Vec::new(),
            encrypt: false,
            fetch_timeout: Duration::from_millis(2000),
            decoder: Arc::new(JsonDecoder),
        }
    }

    pub fn from_config(config: &CairnConfig) -> Result<Self, HandshakeError> {
        let mut opts = Self::new(config.node.listen_addr.clone());
        opts.id = config.node.id.clone();
        opts.storage_root = config.storage.root.clone();
        opts.bootstrap = config.node.bootstrap.clone();
        opts.encrypt = config.replication.encrypt;
        opts.fetch_timeout = config.replication.fetch_timeout();
        opts.transport.rpc_buffer = config.transport.rpc_buffer;
        if !config.transport.allowed_peers.is_empty() {
            opts.transport.handshake = Arc::new(AllowList::parse(&config.transport.allowed_peers)?);
        } else {
            opts.transport.handshake = Arc::new(NoHandshake);
        }
        Ok(opts)
    }
}

pub struct FileServer {
    id: String,
    store: Store,
    transport: Arc<TcpTransport>,
    peers: PeerRegistry,
    pending: PendingFetches,
    bootstrap: Vec<String>,
    enc_key: EncryptionKey,
    encrypt: bool,
    fetch_timeout: Duration,
    decoder: Arc<dyn Decoder>,
    shutdown: watch::Sender<bool>,
}

impl FileServer {
    pub fn new(opts: FileServerOpts) -> Arc<Self> {
        let id = if opts.id.is_empty() {
            crypto::generate_id()
        } else {
            opts.id
        };
        let store = Store::new(StoreOpts {
            root: opts.storage_root,
            path_transform: opts.path_transform,
        });
        let transport = TcpTransport::new(opts.transport);
        let (shutdown, _) = watch::channel(false);

        Arc::new_cyclic(|this: &Weak<FileServer>| {
            let on_peer = this.clone();
            transport.set_on_peer(Arc::new(move |peer: Arc<Peer>| -> anyhow::Result<()> {
                let server = on_peer
                    .upgrade()
                    .ok_or_else(|| anyhow::anyhow!("file server dropped"))?;
                server.on_peer(peer);
                Ok(())
            }));

            let on_disconnect = this.clone();
            transport.set_on_disconnect(Arc::new(move |peer: &Peer| {
                if let Some(server) = on_disconnect.upgrade() {
                    server.on_disconnect(peer);
                }
            }));

            Self {
                id,
                store,
                transport,
                peers: PeerRegistry::new(),
                pending: PendingFetches::new(),
                bootstrap: opts.bootstrap,
                enc_key: EncryptionKey::generate(),
                encrypt: opts.encrypt,
                fetch_timeout: opts.fetch_timeout,
                decoder: opts.decoder,
                shutdown,
            }
        })
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// `listen` then `serve`. Returns once the server has been stopped.
    pub async fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        self.listen().await?;
        self.serve().await
    }

    /// Bind the transport and dial the bootstrap nodes in the background.
    pub async fn listen(&self) -> Result<SocketAddr, ServerError> {
        let addr = self.transport.listen_and_accept().await?;
        tracing::info!(id = %self.id, addr = %addr, "file server listening");
        self.bootstrap_network();
        Ok(addr)
    }

    /// Run the dispatch loop until `stop()`, then close the transport.
    pub async fn serve(self: &Arc<Self>) -> Result<(), ServerError> {
        let rpcs = self.transport.consume()?;
        self.dispatch_loop(rpcs).await;
        self.transport.close();
        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    fn bootstrap_network(&self) {
        for addr in self.bootstrap.iter().filter(|a| !a.is_empty()) {
            let transport = self.transport.clone();
            let addr = addr.clone();
            tokio::spawn(async move {
                tracing::info!(addr = %addr, "attempting to connect with remote");
                if let Err(e) = transport.dial(&addr).await {
                    tracing::warn!(addr = %addr, error = %e, "dial error");
                }
            });
        }
    }

    // ── Peers ─────────────────────────────────────────────────────────────────

    pub fn on_peer(&self, peer: Arc<Peer>) {
        tracing::info!(id = %self.id, peer = %peer.addr(), outbound = peer.is_outbound(), "connected with remote");
        self.peers.insert(peer);
    }

    pub fn on_disconnect(&self, peer: &Peer) {
        if self.peers.remove(peer) {
            tracing::info!(id = %self.id, peer = %peer.addr(), "peer disconnected");
        }
    }

    // ── Replication ───────────────────────────────────────────────────────────

    /// Store `reader`'s content locally under `key` and replicate it to every
    /// connected peer. Returns the number of bytes stored locally.
    ///
    /// Fails on the first peer that cannot be written to; peers before it
    /// keep their copy.
    pub async fn store<R>(&self, key: &str, reader: &mut R) -> Result<u64, ServerError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        let size = self.store.write(&self.id, key, &mut data.as_slice()).await?;

        let payload = if self.encrypt {
            crypto::encrypt_bytes(&self.enc_key, &data).await?
        } else {
            data
        };

        let body = Message::StoreFile {
            key: key.to_string(),
            size: payload.len() as u64,
            reply: false,
        }
        .encode()?;

        let peers = self.peers.snapshot();
        for peer in &peers {
            peer.send_file(&body, &payload).await?;
            tracing::debug!(peer = %peer.addr(), key, bytes = payload.len(), "streamed file to peer");
        }

        tracing::info!(id = %self.id, key, bytes = size, peers = peers.len(), "stored file");
        Ok(size)
    }

    /// Open `key`, fetching it from the network first if it is not held
    /// locally.
    ///
    /// Asks every connected peer and waits up to `fetch_timeout` for the
    /// first complete reply to be committed by the dispatch loop.
    pub async fn get(&self, key: &str) -> Result<(u64, File), ServerError> {
        if self.store.has(&self.id, key).await {
            tracing::info!(id = %self.id, key, "serving file from local disk");
            return Ok(self.store.read(&self.id, key).await?);
        }

        let peers = self.peers.snapshot();
        if peers.is_empty() {
            tracing::info!(id = %self.id, key, "file not held locally and no peers to ask");
            return Err(ServerError::Fetch(key.to_string()));
        }

        tracing::info!(id = %self.id, key, peers = peers.len(), "don't have file locally, fetching from network");

        let mut waiter = self.pending.register(key);
        let body = Message::GetFile { key: key.to_string() }.encode()?;
        let mut asked = 0;
        for peer in &peers {
            match peer.send(&body).await {
                Ok(()) => asked += 1,
                Err(e) => tracing::warn!(peer = %peer.addr(), key, error = %e, "get request failed"),
            }
        }

        let delivered = asked > 0
            && matches!(
                tokio::time::timeout(self.fetch_timeout, waiter.delivered()).await,
                Ok(true)
            );
        if !delivered {
            self.pending.abandon(key, waiter);
            tracing::info!(id = %self.id, key, asked, "no peer delivered file");
            return Err(ServerError::Fetch(key.to_string()));
        }

        Ok(self.store.read(&self.id, key).await?)
    }

    /// Send `msg` as a control frame to every connected peer.
    pub async fn broadcast(&self, msg: &Message) -> Result<(), ServerError> {
        broadcast_to(&self.peers.snapshot(), msg).await
    }

    // ── Introspection ─────────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peers(&self) -> Vec<String> {
        self.peers.ids()
    }

    pub fn store_handle(&self) -> &Store {
        &self.store
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.local_addr()
    }
}

async fn broadcast_to(peers: &[Arc<Peer>], msg: &Message) -> Result<(), ServerError> {
    let body = msg.encode()?;
    for peer in peers {
        peer.send(&body).await?;
    }
    Ok(())
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("peer {0} could not be found in the peer map")]
    PeerNotFound(String),

    #[error("storage: {0}")]
    Storage(#[from] StoreError),

    #[error("no peer delivered {0:?}")]
    Fetch(String),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("wire: {0}")]
    Wire(#[from] WireError),

    #[error("cipher: {0}")]
    Cipher(#[from] CipherError),

    #[error("stream from {peer} ended after {got} of {expected} bytes")]
    ShortStream { peer: String, expected: u64, got: u64 },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
