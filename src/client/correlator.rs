//! Request correlator
//!
//! Maps a request identifier to the single-use channel its caller waits on.
//! Capacity is bounded: registering past capacity evicts the least recently
//! used entry, whose waiter then sees nothing and runs into its own deadline.

use std::num::NonZeroUsize;

use lru::LruCache;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::protocol::Response;

/// What a waiter receives: a response, or `None` when the request was
/// given up on without an answer.
pub type Delivery = Option<Response>;

pub struct Correlator {
    callbacks: LruCache<Uuid, oneshot::Sender<Delivery>>,
}

impl Correlator {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            callbacks: LruCache::new(capacity),
        }
    }

    /// Register a waiter for `id`, replacing any previous one.
    pub fn register(&mut self, id: Uuid) -> oneshot::Receiver<Delivery> {
        let (tx, rx) = oneshot::channel();
        if let Some((evicted, _)) = self.callbacks.push(id, tx) {
            if evicted != id {
                log::warn!("correlator full, evicted request {}", evicted);
            }
        }
        rx
    }

    /// Hand `response` to its waiter and remove the entry. Returns whether a
    /// waiter was found.
    pub fn deliver(&mut self, response: Response) -> bool {
        let id = response.request_id;
        match self.callbacks.pop(&id) {
            Some(tx) => {
                log::info!("found callback for request {}", id);
                if tx.send(Some(response)).is_err() {
                    log::debug!("waiter for request {} already gone", id);
                }
                true
            }
            None => {
                log::info!("callback not found for request {}", id);
                false
            }
        }
    }

    /// Give up on `id`: wake its waiter with `None` and remove the entry.
    pub fn abandon(&mut self, id: &Uuid) -> bool {
        match self.callbacks.pop(id) {
            Some(tx) => {
                let _ = tx.send(None);
                log::warn!("evicting request {}", id);
                true
            }
            None => false,
        }
    }

    pub fn is_pending(&self, id: &Uuid) -> bool {
        self.callbacks.contains(id)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.callbacks.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}
