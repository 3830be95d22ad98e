//! Outstanding network fetches, keyed on the file key.
//!
//! `get` registers a key before asking its peers. The dispatch loop stores
//! the first complete reply for a registered key, takes the entry and wakes
//! every waiter. Replies for keys that are not (or no longer) registered are
//! drained and dropped.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::watch;

#[derive(Clone, Default)]
pub struct PendingFetches {
    waiting: Arc<DashMap<String, watch::Sender<bool>>>,
}

impl PendingFetches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for `key`. Concurrent fetches of one key share an
    /// entry.
    pub fn register(&self, key: &str) -> FetchWaiter {
        let rx = self
            .waiting
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe();
        FetchWaiter { rx }
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.waiting.contains_key(key)
    }

    /// Claim the right to answer `key`. Only the first caller gets the
    /// sender; it reports the outcome with `send_replace(true)` or by
    /// dropping it.
    pub fn take(&self, key: &str) -> Option<watch::Sender<bool>> {
        self.waiting.remove(key).map(|(_, tx)| tx)
    }

    /// Give up on `key`, unless another fetch of it is still waiting.
    pub fn abandon(&self, key: &str, waiter: FetchWaiter) {
        drop(waiter);
        self.waiting.remove_if(key, |_, tx| tx.receiver_count() == 0);
    }

    pub fn len(&self) -> usize {
        self.waiting.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiting.is_empty()
    }
}

pub struct FetchWaiter {
    rx: watch::Receiver<bool>,
}

impl FetchWaiter {
    /// True once a reply has been committed, false if the entry was taken
    /// and the commit failed.
    pub async fn delivered(&mut self) -> bool {
        loop {
            let ready = *self.rx.borrow_and_update();
            if ready {
                return true;
            }
            if self.rx.changed().await.is_err() {
                let done = *self.rx.borrow();
                return done;
            }
        }
    }
}
