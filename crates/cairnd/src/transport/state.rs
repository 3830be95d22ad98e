//! Per-connection stream gate.
//!
//! A connection is either carrying control frames, read by its read loop,
//! or carrying a raw stream, read by whoever claimed it. The gate makes that
//! explicit so the read loop never parses payload bytes as frames:
//!
//! ```text
//!  AwaitingControl --(STREAM tag read)--> Draining
//!  Draining --------(close_stream)------> AwaitingControl
//! ```
//!
//! Only one stream is ever in flight per connection: the read loop does not
//! read another frame until the gate is back to `AwaitingControl`.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// The read loop owns the connection and is parsing frames.
    AwaitingControl,
    /// A STREAM tag was consumed; the bytes after it belong to the
    /// application until it closes the stream.
    Draining,
}

pub struct StreamGate {
    state: watch::Sender<StreamState>,
}

impl StreamGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(StreamState::AwaitingControl);
        Self { state }
    }

    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Called by the read loop right after it consumed a STREAM tag.
    pub(crate) fn open(&self) {
        self.state.send_replace(StreamState::Draining);
    }

    /// Hand the connection back to the read loop. Returns true if a stream
    /// was actually open.
    pub fn close(&self) -> bool {
        self.state.send_replace(StreamState::AwaitingControl) == StreamState::Draining
    }

    /// Wait until a stream is open.
    pub async fn opened(&self) {
        self.wait_for(StreamState::Draining).await;
    }

    /// Wait until the current stream, if any, has been closed.
    pub async fn released(&self) {
        self.wait_for(StreamState::AwaitingControl).await;
    }

    async fn wait_for(&self, target: StreamState) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so this only returns once `target` is seen.
        let _ = rx.wait_for(|s| *s == target).await;
    }
}

impl Default for StreamGate {
    fn default() -> Self {
        Self::new()
    }
}
