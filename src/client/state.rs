//! Shared client state behind a single lock
//!
//! The active pairing secret, outgoing queue, correlator and cached profile
//! only change through the operations here, each of which runs entirely
//! under the caller's lock guard. The guard is never held across I/O;
//! callers take a copy of the secret and release the lock before talking
//! to a transport.

use tokio::sync::oneshot;
use uuid::Uuid;

use super::correlator::{Correlator, Delivery};
use super::queue::OutgoingQueue;
use crate::pairing::{PairingSecret, PairingStatus};
use crate::protocol::{Profile, Response};

/// Outcome of offering a message to the outgoing queue.
#[derive(Debug)]
pub enum Enqueued {
    Queued,
    /// Queue full; the message was dropped.
    Dropped,
    /// The key arrived since the caller's copy was taken; encrypt with this
    /// secret instead.
    KeyReady(PairingSecret),
    Unpaired,
}

pub struct ClientState {
    secret: Option<PairingSecret>,
    outgoing: OutgoingQueue,
    correlator: Correlator,
    cached_profile: Option<Profile>,
}

impl ClientState {
    pub fn new(correlator_capacity: usize, queue_capacity: usize) -> Self {
        Self {
            secret: None,
            outgoing: OutgoingQueue::new(queue_capacity),
            correlator: Correlator::new(correlator_capacity),
            cached_profile: None,
        }
    }

    pub fn secret(&self) -> Option<PairingSecret> {
        self.secret.clone()
    }

    pub fn status(&self) -> PairingStatus {
        self.secret
            .as_ref()
            .map_or(PairingStatus::Unpaired, PairingSecret::status)
    }

    /// Install a new secret (or none), discarding everything tied to the
    /// old one. Returns the previous secret.
    pub fn replace_secret(&mut self, secret: Option<PairingSecret>) -> Option<PairingSecret> {
        self.outgoing.clear();
        self.cached_profile = None;
        std::mem::replace(&mut self.secret, secret)
    }

    /// Adopt a copy of the active secret that has just received its key and
    /// take the buffered messages. Returns `None` if the pairing changed
    /// meanwhile or the key was already installed.
    pub fn establish_key(&mut self, updated: &PairingSecret) -> Option<Vec<Vec<u8>>> {
        let current = self.secret.as_ref()?;
        if current.pairing_id() != updated.pairing_id() || current.is_paired() {
            return None;
        }
        let endpoint = current.endpoint_id().map(str::to_string);
        let mut adopted = updated.clone();
        if let Some(endpoint) = endpoint {
            adopted.set_endpoint_id(endpoint);
        }
        self.secret = Some(adopted);
        Some(self.outgoing.take())
    }

    /// Buffer a message that could not be encrypted for `pairing_id`.
    pub fn enqueue(&mut self, pairing_id: Uuid, message: Vec<u8>) -> Enqueued {
        match &self.secret {
            None => Enqueued::Unpaired,
            Some(current) if current.pairing_id() != pairing_id => Enqueued::Unpaired,
            Some(current) if current.is_paired() => Enqueued::KeyReady(current.clone()),
            Some(_) => {
                if self.outgoing.push(message) {
                    Enqueued::Queued
                } else {
                    Enqueued::Dropped
                }
            }
        }
    }

    pub fn queued_len(&self) -> usize {
        self.outgoing.len()
    }

    /// Record a relay endpoint on the active secret. Returns a copy to
    /// persist when it changed.
    pub fn set_endpoint(&mut self, endpoint_id: &str) -> Option<PairingSecret> {
        let secret = self.secret.as_mut()?;
        if secret.endpoint_id() == Some(endpoint_id) {
            return None;
        }
        secret.set_endpoint_id(endpoint_id.to_string());
        Some(secret.clone())
    }

    pub fn register(&mut self, id: Uuid) -> oneshot::Receiver<Delivery> {
        self.correlator.register(id)
    }

    pub fn deliver(&mut self, response: Response) -> bool {
        self.correlator.deliver(response)
    }

    pub fn abandon(&mut self, id: &Uuid) -> bool {
        self.correlator.abandon(id)
    }

    pub fn is_pending(&self, id: &Uuid) -> bool {
        self.correlator.is_pending(id)
    }

    pub fn cache_profile(&mut self, profile: Profile) {
        self.cached_profile = Some(profile);
    }

    pub fn cached_profile(&self) -> Option<Profile> {
        self.cached_profile.clone()
    }
}
