//! EnclaveClient: pairing lifecycle and the request/response loop
//!
//! Each request spawns a send-and-drain worker that sends the encrypted
//! request and then polls the relay until its own response has been routed
//! or its deadline passes. Draining routes every ciphertext it finds, so
//! workers also settle each other's requests. When the radio is up a single
//! ingestion worker feeds radio ciphertexts through the same path.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use uuid::Uuid;

use super::state::{ClientState, Enqueued};
use super::{EnclaveApi, EnclaveError};
use crate::config::ClientConfig;
use crate::pairing::{
    FilePairingStore, PairingMaterial, PairingSecret, PairingStatus, PairingStore, RelayAddress,
    SecretError,
};
use crate::protocol::{
    ListRequest, ListResponse, Profile, ProfileRequest, Request, RequestBody, Response,
    ResponseBody, SignRequest, SignResponse,
};
use crate::transport::{DeliveryPolicy, RadioTransport, RelayTransport};

/// Why a send-and-drain worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainExit {
    /// The request's entry left the correlator (delivered or evicted).
    Settled,
    /// Deadline passed and the last poll was empty.
    Deadline,
    ReceiveError,
}

/// Client for one workstation's pairing with one enclave.
#[derive(Clone)]
pub struct EnclaveClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    state: Mutex<ClientState>,
    store: Arc<dyn PairingStore>,
    relay: Arc<dyn RelayTransport>,
    radio: Option<Arc<dyn RadioTransport>>,
    radio_ready: AtomicBool,
    shutdown: broadcast::Sender<()>,
    workers: AtomicUsize,
    /// Serializes pair/unpair.
    pairing_gate: tokio::sync::Mutex<()>,
}

/// Counts a live send-and-drain worker for as long as it exists.
struct InFlight(Arc<Inner>);

impl InFlight {
    fn enter(inner: &Arc<Inner>) -> Self {
        inner.workers.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(inner))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.workers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl EnclaveClient {
    /// Create an unpaired client. Nothing is loaded or started until
    /// `start` is called.
    pub fn new(
        config: ClientConfig,
        store: Arc<dyn PairingStore>,
        relay: Arc<dyn RelayTransport>,
        radio: Option<Arc<dyn RadioTransport>>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let state = ClientState::new(config.correlator_capacity, config.outgoing_queue_capacity);
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(state),
                store,
                relay,
                radio,
                radio_ready: AtomicBool::new(false),
                shutdown,
                workers: AtomicUsize::new(0),
                pairing_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Client persisting its pairing under `config.data_dir`.
    pub fn with_file_store(
        config: ClientConfig,
        relay: Arc<dyn RelayTransport>,
        radio: Option<Arc<dyn RadioTransport>>,
    ) -> Self {
        let store = Arc::new(FilePairingStore::new(config.pairing_path()));
        Self::new(config, store, relay, radio)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn pairing_status(&self) -> PairingStatus {
        self.inner.state().status()
    }

    /// Material of the current pairing, for showing it again.
    pub fn pairing_material(&self) -> Option<PairingMaterial> {
        let secret = self.inner.state().secret();
        secret.map(|s| s.material())
    }

    /// Forget the current pairing, in memory and on disk.
    pub async fn unpair(&self) -> Result<(), EnclaveError> {
        let _gate = self.inner.pairing_gate.lock().await;
        let previous = self.inner.state().replace_secret(None);
        if let Some(previous) = previous {
            self.inner.deactivate(&previous).await;
            log::info!("unpaired from {}", previous.pairing_id());
        }
        self.inner
            .store
            .delete()
            .map_err(|e| EnclaveError::Storage(e.to_string()))
    }

    /// Number of send-and-drain workers still running, including those
    /// whose callers already timed out.
    pub fn in_flight_requests(&self) -> usize {
        self.inner.workers.load(Ordering::SeqCst)
    }

    async fn try_request(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, EnclaveError> {
        let inner = &self.inner;
        let secret = inner.state().secret().ok_or(EnclaveError::Unpaired)?;
        let message =
            serde_json::to_vec(&request).map_err(|e| EnclaveError::Protocol(e.to_string()))?;
        let id = request.request_id;
        let deadline = Instant::now() + timeout;
        log::debug!("sending {:?} request {}", request.kind(), id);

        let delivery = inner.state().register(id);
        let (sent_tx, mut sent_rx) = oneshot::channel();
        let worker = tokio::spawn(Arc::clone(inner).send_and_drain(
            id,
            message,
            secret.relay_address(),
            deadline,
            sent_tx,
            InFlight::enter(inner),
        ));

        // An evicted entry drops its sender; keep waiting for the deadline.
        let waited = timeout_at(deadline, async {
            match delivery.await {
                Ok(delivered) => delivered,
                Err(_) => std::future::pending().await,
            }
        })
        .await;

        let fallback = match waited {
            Ok(Some(response)) => return Ok(response),
            Ok(None) if Instant::now() < deadline => EnclaveError::NoAnswer,
            _ => EnclaveError::Timeout,
        };
        reap(id, worker);

        // Prefer the send failure, if there was one, over the generic outcome.
        match sent_rx.try_recv() {
            Ok(Err(send_error)) => Err(send_error),
            _ => Err(fallback),
        }
    }
}

#[async_trait]
impl EnclaveApi for EnclaveClient {
    async fn pair(&self) -> Result<PairingMaterial, EnclaveError> {
        let inner = &self.inner;
        let _gate = inner.pairing_gate.lock().await;

        let secret = PairingSecret::generate(&inner.config.workstation_name);
        inner
            .relay
            .create_queues(&secret.pairing_id())
            .await
            .map_err(|e| EnclaveError::Send(e.to_string()))?;

        let previous = inner.state().replace_secret(Some(secret.clone()));
        if let Some(previous) = previous {
            inner.deactivate(&previous).await;
        }
        inner.persist(&secret);
        inner.activate(&secret).await;

        log::info!("generated pairing {}", secret.pairing_id());
        Ok(secret.material())
    }

    fn is_paired(&self) -> bool {
        self.pairing_status() == PairingStatus::Paired
    }

    async fn start(&self) -> Result<(), EnclaveError> {
        let inner = &self.inner;

        let current = inner.state().secret();
        let secret = match current {
            Some(secret) => Some(secret),
            None => match inner.store.load() {
                Ok(Some(loaded)) => {
                    log::info!("loaded pairing {}", loaded.pairing_id());
                    inner.state().replace_secret(Some(loaded.clone()));
                    Some(loaded)
                }
                Ok(None) => {
                    log::info!("no pairing stored, starting unpaired");
                    None
                }
                Err(e) => {
                    log::warn!("pairing not loaded: {}", e);
                    None
                }
            },
        };

        let radio_was_ready = inner.radio_ready.load(Ordering::SeqCst);
        if let Some(radio) = &inner.radio {
            if !radio_was_ready {
                match radio.power_on().await {
                    Ok(()) => {
                        inner.radio_ready.store(true, Ordering::SeqCst);
                        match radio.read_stream().await {
                            Ok(stream) => Inner::spawn_radio_worker(inner, stream),
                            Err(e) => log::error!("error retrieving radio read stream: {}", e),
                        }
                    }
                    Err(e) => {
                        log::warn!("error starting radio, continuing over relay only: {}", e)
                    }
                }
            }
        }

        if let Some(secret) = secret {
            // Already advertised if the radio was up before this call.
            if !radio_was_ready {
                inner.activate(&secret).await;
            }
            let client = self.clone();
            tokio::spawn(async move {
                if let Err(e) = client.request_profile().await {
                    log::warn!("initial profile fetch failed: {}", e);
                }
            });
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), EnclaveError> {
        let inner = &self.inner;
        let secret = inner.state().secret();
        if let Some(secret) = secret {
            inner.deactivate(&secret).await;
        }
        inner.radio_ready.store(false, Ordering::SeqCst);
        let _ = inner.shutdown.send(());
        Ok(())
    }

    async fn request_profile(&self) -> Result<Profile, EnclaveError> {
        let request = Request::new(RequestBody::Profile(ProfileRequest::default()));
        let response = self
            .try_request(request, self.inner.config.profile_timeout)
            .await?;
        match response.body {
            ResponseBody::Profile(me) => {
                self.inner.state().cache_profile(me.profile.clone());
                Ok(me.profile)
            }
            other => Err(unexpected("profile", &other)),
        }
    }

    fn cached_profile(&self) -> Option<Profile> {
        self.inner.state().cached_profile()
    }

    async fn request_signature(&self, request: SignRequest) -> Result<SignResponse, EnclaveError> {
        let started = Instant::now();
        let request = Request::new(RequestBody::Sign(request));
        let response = self
            .try_request(request, self.inner.config.signature_timeout)
            .await?;
        match response.body {
            ResponseBody::Sign(sign) => {
                log::info!("signature took {} ms", started.elapsed().as_millis());
                Ok(sign)
            }
            other => Err(unexpected("sign", &other)),
        }
    }

    async fn request_list(&self, request: ListRequest) -> Result<ListResponse, EnclaveError> {
        let request = Request::new(RequestBody::List(request));
        let response = self
            .try_request(request, self.inner.config.list_timeout)
            .await?;
        match response.body {
            ResponseBody::List(list) => Ok(list),
            other => Err(unexpected("list", &other)),
        }
    }
}

fn unexpected(expected: &str, body: &ResponseBody) -> EnclaveError {
    EnclaveError::Protocol(format!("expected {} response, got {:?}", expected, body))
}

/// Join a worker whose caller stopped waiting and log how it ended.
fn reap(id: Uuid, worker: JoinHandle<DrainExit>) {
    tokio::spawn(async move {
        match worker.await {
            Ok(exit) => log::debug!("worker for request {} finished: {:?}", id, exit),
            Err(e) => log::error!("worker for request {} failed: {}", id, e),
        }
    });
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, secret: &PairingSecret) {
        if let Err(e) = self.store.save(secret) {
            log::error!("error saving pairing: {}", e);
        }
    }

    fn radio(&self) -> Option<&Arc<dyn RadioTransport>> {
        if self.radio_ready.load(Ordering::SeqCst) {
            self.radio.as_ref()
        } else {
            None
        }
    }

    async fn activate(&self, secret: &PairingSecret) {
        let Some(radio) = self.radio() else {
            return;
        };
        match secret.derive_transport_id() {
            Ok(service) => match radio.add_service(service).await {
                Ok(()) => log::info!("advertising radio service {}", service),
                Err(e) => log::error!("error adding radio service: {}", e),
            },
            Err(e) => log::error!("could not derive radio service id: {}", e),
        }
    }

    async fn deactivate(&self, secret: &PairingSecret) {
        let Some(radio) = self.radio() else {
            return;
        };
        match secret.derive_transport_id() {
            Ok(service) => {
                if let Err(e) = radio.remove_service(service).await {
                    log::error!("error removing radio service: {}", e);
                }
            }
            Err(e) => log::error!("could not derive radio service id: {}", e),
        }
    }

    /// Feed every radio ciphertext through ingestion until the stream closes
    /// or the client stops.
    fn spawn_radio_worker(self: &Arc<Self>, mut stream: mpsc::Receiver<Vec<u8>>) {
        let inner = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = stream.recv() => match received {
                        Some(ciphertext) => {
                            if let Err(e) = inner.handle_ciphertext(&ciphertext).await {
                                log::warn!("dropping radio ciphertext: {}", e);
                            }
                        }
                        None => {
                            log::info!("radio read stream closed");
                            break;
                        }
                    },
                    _ = shutdown.recv() => break,
                }
            }
        });
    }

    async fn send_and_drain(
        self: Arc<Self>,
        id: Uuid,
        message: Vec<u8>,
        address: RelayAddress,
        deadline: Instant,
        sent: oneshot::Sender<Result<(), EnclaveError>>,
        _in_flight: InFlight,
    ) -> DrainExit {
        let outcome = match self.send_message(&message).await {
            Err(EnclaveError::Queued) => {
                log::info!("request {} queued until key exchange completes", id);
                Ok(())
            }
            Err(e) => {
                log::error!("request {} send failed: {}", id, e);
                Err(e)
            }
            Ok(()) => Ok(()),
        };
        let _ = sent.send(outcome);

        let exit = loop {
            let received = match self.drain_relay(&address).await {
                Ok(received) => received,
                Err(e) => {
                    log::error!("queue err: {}", e);
                    break DrainExit::ReceiveError;
                }
            };
            let pending = self.state().is_pending(&id);
            if !pending {
                break DrainExit::Settled;
            }
            if received == 0 {
                let now = Instant::now();
                if now >= deadline {
                    break DrainExit::Deadline;
                }
                tokio::time::sleep_until(deadline.min(now + self.config.drain_interval)).await;
            }
        };

        self.state().abandon(&id);
        exit
    }

    /// Route everything waiting on the relay. Returns how many ciphertexts
    /// were read.
    async fn drain_relay(&self, address: &RelayAddress) -> Result<usize, EnclaveError> {
        let ciphertexts = self
            .relay
            .read_pending(address)
            .await
            .map_err(|e| EnclaveError::Receive(e.to_string()))?;
        for ciphertext in &ciphertexts {
            if let Err(e) = self.handle_ciphertext(ciphertext).await {
                log::warn!("dropping relay ciphertext: {}", e);
            }
        }
        Ok(ciphertexts.len())
    }

    /// Encrypt and send one message, buffering it while the key exchange is
    /// pending.
    async fn send_message(&self, message: &[u8]) -> Result<(), EnclaveError> {
        let secret = self.state().secret().ok_or(EnclaveError::Unpaired)?;
        let (address, ciphertext) = match secret.encrypt(message) {
            Ok(ciphertext) => (secret.relay_address(), ciphertext),
            Err(SecretError::WaitingForKey) => {
                let enqueued = self.state().enqueue(secret.pairing_id(), message.to_vec());
                match enqueued {
                    Enqueued::Queued => return Err(EnclaveError::Queued),
                    Enqueued::Dropped => {
                        log::debug!("outgoing queue full, dropping message");
                        return Err(EnclaveError::Queued);
                    }
                    Enqueued::Unpaired => return Err(EnclaveError::Unpaired),
                    Enqueued::KeyReady(fresh) => {
                        let ciphertext = fresh
                            .encrypt(message)
                            .map_err(|e| EnclaveError::Send(e.to_string()))?;
                        (fresh.relay_address(), ciphertext)
                    }
                }
            }
            Err(e) => return Err(EnclaveError::Send(e.to_string())),
        };
        self.dispatch(&address, ciphertext).await
    }

    /// Write a ciphertext to both transports according to their policies.
    async fn dispatch(&self, address: &RelayAddress, ciphertext: Vec<u8>) -> Result<(), EnclaveError> {
        if let Some(radio) = self.radio() {
            match self.config.radio_policy {
                DeliveryPolicy::Authoritative => radio
                    .write(&ciphertext)
                    .await
                    .map_err(|e| EnclaveError::Send(e.to_string()))?,
                DeliveryPolicy::BestEffort => {
                    let radio = Arc::clone(radio);
                    let ciphertext = ciphertext.clone();
                    tokio::spawn(async move {
                        if let Err(e) = radio.write(&ciphertext).await {
                            log::warn!("error writing to radio: {}", e);
                        }
                    });
                }
            }
        }

        match self.config.relay_policy {
            DeliveryPolicy::Authoritative => self
                .relay
                .send(address, &ciphertext)
                .await
                .map_err(|e| EnclaveError::Send(e.to_string())),
            DeliveryPolicy::BestEffort => {
                let relay = Arc::clone(&self.relay);
                let address = address.clone();
                tokio::spawn(async move {
                    if let Err(e) = relay.send(&address, &ciphertext).await {
                        log::warn!("error sending to relay: {}", e);
                    }
                });
                Ok(())
            }
        }
    }

    /// Ingest one ciphertext from either transport.
    async fn handle_ciphertext(&self, ciphertext: &[u8]) -> Result<(), EnclaveError> {
        let mut secret = self.state().secret().ok_or(EnclaveError::Unpaired)?;
        let (remainder, unwrapped_key) = secret
            .unwrap_key_if_present(ciphertext)
            .map_err(|e| EnclaveError::Protocol(e.to_string()))?;
        if unwrapped_key {
            self.install_key(&secret).await;
        }

        let Some(frame) = remainder else {
            return Ok(());
        };
        match self.open_frame(&secret, &frame) {
            Ok(Some(message)) => self.handle_message(&message),
            Ok(None) => {
                log::debug!("message arrived before key exchange, skipping");
                Ok(())
            }
            Err(e) => Err(EnclaveError::Protocol(format!("decrypt error: {}", e))),
        }
    }

    /// Decrypt with `snapshot`, falling back to the live secret when the key
    /// was installed by another worker after the snapshot was taken.
    fn open_frame(
        &self,
        snapshot: &PairingSecret,
        frame: &[u8],
    ) -> Result<Option<Vec<u8>>, SecretError> {
        match snapshot.decrypt(frame)? {
            Some(message) => Ok(Some(message)),
            None => {
                let current = self.state().secret();
                match current {
                    Some(current)
                        if current.is_paired() && current.pairing_id() == snapshot.pairing_id() =>
                    {
                        current.decrypt(frame)
                    }
                    _ => Ok(None),
                }
            }
        }
    }

    /// Adopt a freshly unwrapped key, persist it and flush the outgoing
    /// queue in order.
    async fn install_key(&self, updated: &PairingSecret) {
        let queued = self.state().establish_key(updated);
        let Some(queued) = queued else {
            return;
        };
        log::info!("key exchange complete for pairing {}", updated.pairing_id());

        let current = self.state().secret();
        if let Some(current) = current {
            self.persist(&current);
        }

        for message in queued {
            if let Err(e) = self.send_message(&message).await {
                log::error!("error sending queued message: {}", e);
            }
        }
    }

    fn handle_message(&self, message: &[u8]) -> Result<(), EnclaveError> {
        let response: Response =
            serde_json::from_slice(message).map_err(|e| EnclaveError::Protocol(e.to_string()))?;
        if let Some(endpoint_id) = &response.endpoint_id {
            self.apply_endpoint_update(endpoint_id);
        }
        self.state().deliver(response);
        Ok(())
    }

    /// Record the enclave's relay endpoint, whichever response carried it.
    fn apply_endpoint_update(&self, endpoint_id: &str) {
        let changed = self.state().set_endpoint(endpoint_id);
        if let Some(secret) = changed {
            log::info!("enclave endpoint updated to {}", endpoint_id);
            self.persist(&secret);
        }
    }
}
