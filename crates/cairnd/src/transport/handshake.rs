//! Handshake strategies, run on every new connection before any frame is
//! read. A rejected connection is closed and never registered.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

use super::peer::Peer;

/// Decides whether a freshly connected peer may proceed.
pub trait Handshake: Send + Sync {
    fn handshake(&self, peer: &Peer) -> Result<(), HandshakeError>;
}

/// Accepts every connection.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHandshake;

impl Handshake for NoHandshake {
    fn handshake(&self, _peer: &Peer) -> Result<(), HandshakeError> {
        Ok(())
    }
}

/// Accepts only peers whose remote IP is on the list.
#[derive(Debug, Clone)]
pub struct AllowList {
    allowed: HashSet<IpAddr>,
}

impl AllowList {
    pub fn new(allowed: impl IntoIterator<Item = IpAddr>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
        }
    }

    /// Parse textual IPs, e.g. from config.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self, HandshakeError> {
        let allowed = entries
            .iter()
            .map(|e| {
                e.as_ref()
                    .trim()
                    .parse::<IpAddr>()
                    .map_err(|_| HandshakeError::InvalidEntry(e.as_ref().to_string()))
            })
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(Self { allowed })
    }

    pub fn allows(&self, addr: &SocketAddr) -> bool {
        self.allowed.contains(&addr.ip())
    }
}

impl Handshake for AllowList {
    fn handshake(&self, peer: &Peer) -> Result<(), HandshakeError> {
        if self.allows(&peer.addr()) {
            Ok(())
        } else {
            Err(HandshakeError::NotAllowed(peer.addr()))
        }
    }
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("invalid handshake: peer {0} is not on the allow list")]
    NotAllowed(SocketAddr),

    #[error("invalid allow-list entry: {0:?}")]
    InvalidEntry(String),
}
