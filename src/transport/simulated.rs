//! In-process transport simulator
//!
//! `SimRelay` and `SimRadio` stand in for the cloud relay and the radio
//! driver; `SimEnclave` plays the phone, answering requests it finds on the
//! relay. Used for integration testing and the demo binary without cloud
//! credentials or radio hardware.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{RadioTransport, RelayTransport, TransportError};
use crate::pairing::{PairingMaterial, PeerSession, RelayAddress, SecretError};
use crate::protocol::{
    ListResponse, Profile, ProfileResponse, Request, RequestBody, Response, ResponseBody,
    SignResponse,
};

#[derive(Default)]
struct RelayQueues {
    to_enclave: VecDeque<Vec<u8>>,
    to_workstation: VecDeque<Vec<u8>>,
    sent_total: usize,
}

/// Simulated relay: a pair of mailboxes per pairing.
#[derive(Default)]
pub struct SimRelay {
    queues: Mutex<HashMap<Uuid, RelayQueues>>,
    fail_sends: AtomicBool,
    fail_reads: AtomicBool,
    notified: Mutex<Vec<String>>,
}

impl SimRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Whether `create_queues` was called for this pairing.
    pub async fn has_queues(&self, queue: &Uuid) -> bool {
        self.queues.lock().await.contains_key(queue)
    }

    /// Enclave side: take everything the workstation has sent.
    pub async fn take_for_enclave(&self, queue: &Uuid) -> Vec<Vec<u8>> {
        let mut queues = self.queues.lock().await;
        match queues.get_mut(queue) {
            Some(q) => q.to_enclave.drain(..).collect(),
            None => Vec::new(),
        }
    }

    /// Enclave side: post a ciphertext for the workstation.
    pub async fn post_to_workstation(&self, queue: &Uuid, ciphertext: Vec<u8>) {
        let mut queues = self.queues.lock().await;
        queues
            .entry(*queue)
            .or_default()
            .to_workstation
            .push_back(ciphertext);
    }

    /// Total number of ciphertexts the workstation has sent on this queue.
    pub async fn sent_total(&self, queue: &Uuid) -> usize {
        let queues = self.queues.lock().await;
        queues.get(queue).map(|q| q.sent_total).unwrap_or(0)
    }

    /// Push endpoints that were notified on send, in order.
    pub async fn notified_endpoints(&self) -> Vec<String> {
        self.notified.lock().await.clone()
    }
}

#[async_trait]
impl RelayTransport for SimRelay {
    async fn create_queues(&self, queue: &Uuid) -> Result<(), TransportError> {
        self.queues.lock().await.entry(*queue).or_default();
        Ok(())
    }

    async fn send(&self, address: &RelayAddress, ciphertext: &[u8]) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("relay unreachable".to_string()));
        }
        {
            let mut queues = self.queues.lock().await;
            let q = queues.entry(address.queue).or_default();
            q.to_enclave.push_back(ciphertext.to_vec());
            q.sent_total += 1;
        }
        if let Some(endpoint) = &address.endpoint {
            self.notified.lock().await.push(endpoint.clone());
        }
        Ok(())
    }

    async fn read_pending(&self, address: &RelayAddress) -> Result<Vec<Vec<u8>>, TransportError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(TransportError::ReceiveFailed("relay unreachable".to_string()));
        }
        let mut queues = self.queues.lock().await;
        match queues.get_mut(&address.queue) {
            Some(q) => Ok(q.to_workstation.drain(..).collect()),
            None => Ok(Vec::new()),
        }
    }
}

/// A service registration change seen by the simulated radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceEvent {
    Added(Uuid),
    Removed(Uuid),
}

/// Simulated radio driver.
#[derive(Default)]
pub struct SimRadio {
    fail_power_on: AtomicBool,
    fail_writes: AtomicBool,
    services: Mutex<HashSet<Uuid>>,
    events: Mutex<Vec<ServiceEvent>>,
    written: Mutex<Vec<Vec<u8>>>,
    inbound: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl SimRadio {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A radio whose `power_on` fails, as on a machine without the hardware.
    pub fn unavailable() -> Arc<Self> {
        let radio = Self::default();
        radio.fail_power_on.store(true, Ordering::SeqCst);
        Arc::new(radio)
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn active_services(&self) -> HashSet<Uuid> {
        self.services.lock().await.clone()
    }

    pub async fn service_events(&self) -> Vec<ServiceEvent> {
        self.events.lock().await.clone()
    }

    /// Ciphertexts successfully written by the workstation.
    pub async fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().await.clone()
    }

    /// Enclave side: deliver a ciphertext into the workstation's read stream.
    pub async fn inject(&self, ciphertext: Vec<u8>) -> Result<(), TransportError> {
        let sender = self.inbound.lock().await.clone();
        match sender {
            Some(tx) => tx.send(ciphertext).await.map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    /// End the current read stream.
    pub async fn close_stream(&self) {
        self.inbound.lock().await.take();
    }
}

#[async_trait]
impl RadioTransport for SimRadio {
    async fn power_on(&self) -> Result<(), TransportError> {
        if self.fail_power_on.load(Ordering::SeqCst) {
            return Err(TransportError::Unavailable(
                "no radio adapter present".to_string(),
            ));
        }
        Ok(())
    }

    async fn add_service(&self, service: Uuid) -> Result<(), TransportError> {
        self.services.lock().await.insert(service);
        self.events.lock().await.push(ServiceEvent::Added(service));
        Ok(())
    }

    async fn remove_service(&self, service: Uuid) -> Result<(), TransportError> {
        if !self.services.lock().await.remove(&service) {
            return Err(TransportError::ServiceError(format!(
                "service {} not registered",
                service
            )));
        }
        self.events.lock().await.push(ServiceEvent::Removed(service));
        Ok(())
    }

    async fn write(&self, ciphertext: &[u8]) -> Result<(), TransportError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("peer not connected".to_string()));
        }
        self.written.lock().await.push(ciphertext.to_vec());
        Ok(())
    }

    async fn read_stream(&self) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        let (tx, rx) = mpsc::channel(64);
        *self.inbound.lock().await = Some(tx);
        Ok(rx)
    }
}

/// Simulated phone holding the signing key.
pub struct SimEnclave {
    relay: Arc<SimRelay>,
    radio: Option<Arc<SimRadio>>,
    session: PeerSession,
    signing_key: SigningKey,
    email: String,
    endpoint_id: Option<String>,
    answered: AtomicUsize,
}

impl SimEnclave {
    /// Accept pairing material, as if the phone had scanned the QR code.
    pub fn accept(material: &PairingMaterial, relay: Arc<SimRelay>) -> Result<Self, SecretError> {
        Ok(Self {
            relay,
            radio: None,
            session: PeerSession::accept(material)?,
            signing_key: SigningKey::generate(&mut OsRng),
            email: "enclave@example.com".to_string(),
            endpoint_id: None,
            answered: AtomicUsize::new(0),
        })
    }

    /// Answer over the radio instead of the relay.
    pub fn with_radio(mut self, radio: Arc<SimRadio>) -> Self {
        self.radio = Some(radio);
        self
    }

    /// Attach this endpoint identifier to every response.
    pub fn with_endpoint(mut self, endpoint_id: &str) -> Self {
        self.endpoint_id = Some(endpoint_id.to_string());
        self
    }

    pub fn session(&self) -> &PeerSession {
        &self.session
    }

    pub fn profile(&self) -> Profile {
        Profile {
            public_key: self.signing_key.verifying_key().to_bytes().to_vec(),
            email: self.email.clone(),
        }
    }

    pub fn answered(&self) -> usize {
        self.answered.load(Ordering::SeqCst)
    }

    /// Complete the key exchange by posting the key-wrap frame.
    pub async fn send_key(&self) -> Result<(), SecretError> {
        let frame = self.session.key_wrap_frame(None)?;
        self.relay
            .post_to_workstation(&self.session.pairing_id(), frame)
            .await;
        Ok(())
    }

    /// Decrypt every request waiting on the relay, in send order.
    pub async fn pending_requests(&self) -> Vec<Request> {
        let frames = self
            .relay
            .take_for_enclave(&self.session.pairing_id())
            .await;
        frames
            .iter()
            .filter_map(|frame| match self.session.decrypt(frame) {
                Ok(plaintext) => serde_json::from_slice::<Request>(&plaintext).ok(),
                Err(e) => {
                    log::warn!("enclave could not decrypt request: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Answer every request waiting on the relay. Returns how many were answered.
    pub async fn respond_pending(&self) -> usize {
        let requests = self.pending_requests().await;
        let mut count = 0;
        for request in &requests {
            if self.reply(&self.respond_to(request)).await {
                count += 1;
            }
        }
        self.answered.fetch_add(count, Ordering::SeqCst);
        count
    }

    /// Encrypt and deliver a response on the configured path.
    pub async fn reply(&self, response: &Response) -> bool {
        let frame = match serde_json::to_vec(response)
            .map_err(|e| SecretError::Malformed(e.to_string()))
            .and_then(|json| self.session.encrypt(&json))
        {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("enclave could not encrypt response: {}", e);
                return false;
            }
        };
        match &self.radio {
            Some(radio) => radio.inject(frame).await.is_ok(),
            None => {
                self.relay
                    .post_to_workstation(&self.session.pairing_id(), frame)
                    .await;
                true
            }
        }
    }

    /// Build the response the enclave would give to `request`.
    pub fn respond_to(&self, request: &Request) -> Response {
        let profile = self.profile();
        let body = match &request.body {
            RequestBody::Profile(_) => ResponseBody::Profile(ProfileResponse { profile }),
            RequestBody::Sign(sign) => {
                if sign.public_key_fingerprint == profile.fingerprint().to_vec() {
                    ResponseBody::Sign(SignResponse {
                        signature: Some(self.signing_key.sign(&sign.data).to_bytes().to_vec()),
                        error: None,
                    })
                } else {
                    ResponseBody::Sign(SignResponse {
                        signature: None,
                        error: Some("unknown key".to_string()),
                    })
                }
            }
            RequestBody::List(list) => {
                let matches = list
                    .email
                    .as_ref()
                    .map_or(true, |email| *email == profile.email);
                ResponseBody::List(ListResponse {
                    profiles: if matches { vec![profile] } else { Vec::new() },
                })
            }
        };
        Response {
            request_id: request.request_id,
            endpoint_id: self.endpoint_id.clone(),
            body,
        }
    }

    /// Keep answering until the task is aborted.
    pub fn serve(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                self.respond_pending().await;
                tokio::time::sleep(interval).await;
            }
        })
    }
}
