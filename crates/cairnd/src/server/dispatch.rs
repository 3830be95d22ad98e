//! The dispatch loop: one task consuming control frames from every peer.
//!
//! Each decoded message is handled in its own task, so a peer that stalls
//! mid-stream only holds up its own connection. Per-peer ordering still
//! holds: the read loop delivers nothing more from a peer until the stream
//! announced by its StoreFile has been consumed and committed.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use cairn_core::wire::{self, Message, WireError, TAG_STREAM};

use super::{FileServer, ServerError};
use crate::transport::Rpc;

// ── Decoder strategy ──────────────────────────────────────────────────────────

/// Turns a control frame body into a `Message`.
pub trait Decoder: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<Message, WireError>;
}

/// The wire default: tagged JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDecoder;

impl Decoder for JsonDecoder {
    fn decode(&self, payload: &[u8]) -> Result<Message, WireError> {
        Message::decode(payload)
    }
}

// ── Loop ──────────────────────────────────────────────────────────────────────

impl FileServer {
    /// Runs until `stop()` or until every sender is gone.
    pub(super) async fn dispatch_loop(self: &Arc<Self>, mut rpcs: mpsc::Receiver<Rpc>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let stopped = *shutdown.borrow_and_update();
            if stopped {
                break;
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                rpc = rpcs.recv() => match rpc {
                    Some(rpc) => self.handle_rpc(rpc),
                    None => break,
                },
            }
        }
        tracing::info!(id = %self.id, "file server stopped");
    }

    fn handle_rpc(self: &Arc<Self>, rpc: Rpc) {
        if rpc.stream {
            // Owned by the StoreFile that announced it.
            tracing::trace!(peer = %rpc.from, "stream announced");
            return;
        }

        let msg = match self.decoder.decode(&rpc.payload) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::warn!(peer = %rpc.from, error = %e, "decoding error");
                return;
            }
        };

        tracing::debug!(peer = %rpc.from, key = msg.key(), "received message");
        let server = self.clone();
        tokio::spawn(async move {
            if let Err(e) = server.handle_message(&rpc.from, msg).await {
                tracing::warn!(peer = %rpc.from, error = %e, "handle message error");
            }
        });
    }

    pub(super) async fn handle_message(&self, from: &str, msg: Message) -> Result<(), ServerError> {
        match msg {
            Message::StoreFile { key, size, reply } => {
                self.handle_store_file(from, &key, size, reply).await
            }
            Message::GetFile { key } => self.handle_get_file(from, &key).await,
        }
    }

    /// Consume the announced stream and store it under `key`.
    ///
    /// Replies to our own `GetFile` are decrypted when encryption is on and
    /// only the first complete one for a pending key is kept. Everything is
    /// staged and committed before the stream is released.
    async fn handle_store_file(&self, from: &str, key: &str, size: u64, reply: bool) -> Result<(), ServerError> {
        let peer = self
            .peers
            .get(from)
            .ok_or_else(|| ServerError::PeerNotFound(from.to_string()))?;

        let mut stream = peer.claim_stream().await;
        let mut limited = (&mut stream).take(size);

        if reply && !self.pending.is_pending(key) {
            let n = tokio::io::copy(&mut limited, &mut tokio::io::sink()).await?;
            tracing::debug!(peer = %from, key, bytes = n, "discarded unrequested reply");
            return Ok(());
        }

        let staged = if reply && self.encrypt {
            self.store
                .stage_decrypt(&self.enc_key, &self.id, key, &mut limited)
                .await?
        } else {
            self.store.stage(&self.id, key, &mut limited).await?
        };

        let missing = limited.limit();
        if missing > 0 {
            staged.discard().await;
            return Err(ServerError::ShortStream {
                peer: from.to_string(),
                expected: size,
                got: size - missing,
            });
        }

        if !reply {
            let n = staged.commit().await?;
            tracing::info!(peer = %from, key, bytes = n, "stored replicated file");
            return Ok(());
        }

        let Some(done) = self.pending.take(key) else {
            staged.discard().await;
            tracing::debug!(peer = %from, key, "fetch already satisfied, discarding reply");
            return Ok(());
        };
        let n = staged.commit().await?;
        done.send_replace(true);
        tracing::info!(peer = %from, key, bytes = n, "received file over the network");
        Ok(())
    }

    /// Answer with `StoreFile{key,size,reply}`, STREAM and exactly `size`
    /// bytes of the file, all under one writer lock.
    async fn handle_get_file(&self, from: &str, key: &str) -> Result<(), ServerError> {
        if !self.store.has(&self.id, key).await {
            tracing::info!(peer = %from, key, "need to serve file but it does not exist on disk");
            return Ok(());
        }

        let peer = self
            .peers
            .get(from)
            .ok_or_else(|| ServerError::PeerNotFound(from.to_string()))?;
        let (size, file) = self.store.read(&self.id, key).await?;
        let body = Message::StoreFile {
            key: key.to_string(),
            size,
            reply: true,
        }
        .encode()?;
        let frame = wire::message_frame(&body)?;

        let mut writer = peer.writer().await;
        writer.write_all(&frame).await?;
        writer.write_u8(TAG_STREAM).await?;
        let n = tokio::io::copy(&mut file.take(size), &mut *writer).await?;
        if n < size {
            // The announced size can no longer be honoured; end the
            // connection rather than leave the peer out of frame sync.
            let _ = writer.shutdown().await;
            return Err(ServerError::ShortStream {
                peer: from.to_string(),
                expected: size,
                got: n,
            });
        }
        writer.flush().await?;

        tracing::info!(peer = %from, key, bytes = n, "served file over the network");
        Ok(())
    }
}
