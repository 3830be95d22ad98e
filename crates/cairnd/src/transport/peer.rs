//! A live TCP connection to a remote node.
//!
//! The connection is split: the read half is shared between the read loop
//! (control frames) and whoever claims a raw stream; the write half is
//! shared between every task that sends to this peer. Each half sits behind
//! its own async mutex so a frame or stream is always written contiguously.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, MutexGuard};

use cairn_core::wire::{self, Frame, WireError, TAG_STREAM};

use super::state::{StreamGate, StreamState};

pub struct Peer {
    addr: SocketAddr,
    outbound: bool,
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    gate: StreamGate,
}

impl Peer {
    pub(crate) fn new(stream: TcpStream, outbound: bool) -> io::Result<Self> {
        let addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            addr,
            outbound,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            gate: StreamGate::new(),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Registry key: the remote address as a string.
    pub fn id(&self) -> String {
        self.addr.to_string()
    }

    /// True if we dialed this peer, false if it connected to us.
    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    /// Send one control frame. `body` is a serialized `Message`.
    pub async fn send(&self, body: &[u8]) -> Result<(), WireError> {
        let mut writer = self.writer.lock().await;
        wire::write_message(&mut *writer, body).await
    }

    /// Send a control frame, a STREAM tag and `payload` under one writer
    /// lock, so nothing else sent to this peer can land between them.
    pub async fn send_file(&self, body: &[u8], payload: &[u8]) -> Result<(), WireError> {
        let frame = wire::message_frame(body)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.write_u8(TAG_STREAM).await?;
        writer.write_all(payload).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Exclusive access to the raw write half, for replies that are copied
    /// straight from disk. Hold it for the whole control frame and stream.
    pub async fn writer(&self) -> MutexGuard<'_, OwnedWriteHalf> {
        self.writer.lock().await
    }

    /// Wait for an announced stream and take the raw read half.
    ///
    /// The caller reads exactly the bytes the protocol promised and drops
    /// the returned reader, which closes the stream.
    pub async fn claim_stream(&self) -> StreamReader<'_> {
        loop {
            self.gate.opened().await;
            let reader = self.reader.lock().await;
            // Someone else may have drained and closed it while we waited.
            if self.gate.state() == StreamState::Draining {
                return StreamReader { peer: self, reader };
            }
        }
    }

    /// Release the stream gate.
    pub fn close_stream(&self) {
        if !self.gate.close() {
            tracing::trace!(peer = %self.addr, "close_stream with no stream open");
        }
    }

    pub fn stream_state(&self) -> StreamState {
        self.gate.state()
    }

    pub(crate) fn gate(&self) -> &StreamGate {
        &self.gate
    }

    pub(crate) async fn read_frame(&self) -> Result<Frame, WireError> {
        let mut reader = self.reader.lock().await;
        wire::read_frame(&mut *reader).await
    }

    /// Half-close our side so the remote read loop sees EOF.
    pub(crate) async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::trace!(peer = %self.addr, error = %e, "shutdown failed");
        }
    }
}

/// Raw read access to a claimed stream.
///
/// Dropping it calls `close_stream` while the read half is still locked, so
/// no other claimant can mistake the drained stream for a new one.
pub struct StreamReader<'a> {
    peer: &'a Peer,
    reader: MutexGuard<'a, OwnedReadHalf>,
}

impl AsyncRead for StreamReader<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().reader).poll_read(cx, buf)
    }
}

impl Drop for StreamReader<'_> {
    fn drop(&mut self) {
        self.peer.close_stream();
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("addr", &self.addr)
            .field("outbound", &self.outbound)
            .field("stream", &self.gate.state())
            .finish()
    }
}
