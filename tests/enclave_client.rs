//! End-to-end tests of EnclaveClient against the simulated relay, radio and
//! enclave.
//!
//! Run with:
//!   cargo test --test enclave_client

use std::sync::Arc;
use std::time::Duration;

use enclave_link::pairing::{MemoryPairingStore, PairingStatus, PairingStore};
use enclave_link::protocol::{ListRequest, RequestKind, Response, ResponseBody, SignRequest};
use enclave_link::transport::simulated::{ServiceEvent, SimEnclave, SimRadio, SimRelay};
use enclave_link::{ClientConfig, EnclaveApi, EnclaveClient, EnclaveError};

use tokio::time::{sleep, Instant};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Harness {
    client: EnclaveClient,
    relay: Arc<SimRelay>,
    radio: Arc<SimRadio>,
    store: Arc<MemoryPairingStore>,
}

fn harness(radio: Arc<SimRadio>) -> Harness {
    let relay = SimRelay::new();
    let store = Arc::new(MemoryPairingStore::new());
    let client = client_for(&relay, &radio, &store);
    Harness {
        client,
        relay,
        radio,
        store,
    }
}

fn client_for(
    relay: &Arc<SimRelay>,
    radio: &Arc<SimRadio>,
    store: &Arc<MemoryPairingStore>,
) -> EnclaveClient {
    let config = ClientConfig {
        workstation_name: "test-workstation".to_string(),
        ..ClientConfig::default()
    };
    EnclaveClient::new(config, store.clone(), relay.clone(), Some(radio.clone()))
}

impl Harness {
    /// Pair and hand the key over the radio. Requires a started client.
    async fn establish(&self, setup: impl FnOnce(SimEnclave) -> SimEnclave) -> Arc<SimEnclave> {
        let material = self.client.pair().await.unwrap();
        let enclave = setup(SimEnclave::accept(&material, self.relay.clone()).unwrap());
        let frame = enclave.session().key_wrap_frame(None).unwrap();
        self.radio.inject(frame).await.unwrap();
        sleep(Duration::from_millis(10)).await;
        assert!(self.client.is_paired());
        Arc::new(enclave)
    }

    fn queue(&self) -> Uuid {
        self.client.pairing_material().unwrap().pairing_id
    }
}

fn serve(enclave: &Arc<SimEnclave>) -> tokio::task::JoinHandle<()> {
    Arc::clone(enclave).serve(Duration::from_millis(50))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unpaired_request_fails_fast() {
    let h = harness(SimRadio::new());
    h.client.start().await.unwrap();

    let started = Instant::now();
    assert_eq!(h.client.request_profile().await, Err(EnclaveError::Unpaired));
    assert!(started.elapsed() < Duration::from_millis(100));
    assert!(!h.client.is_paired());
    assert_eq!(h.client.pairing_status(), PairingStatus::Unpaired);
    assert_eq!(h.client.in_flight_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_request_without_responder_times_out() {
    let h = harness(SimRadio::new());
    h.client.pair().await.unwrap();
    assert_eq!(h.client.pairing_status(), PairingStatus::KeyPending);

    let started = Instant::now();
    assert_eq!(h.client.request_profile().await, Err(EnclaveError::Timeout));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(20));
    assert!(elapsed < Duration::from_secs(21));

    // The worker cleans up after its caller gave up.
    sleep(Duration::from_secs(1)).await;
    assert_eq!(h.client.in_flight_requests(), 0);
    assert!(h.client.cached_profile().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_profile_round_trip_updates_cache() {
    let h = harness(SimRadio::new());
    h.client.start().await.unwrap();
    let enclave = h.establish(|e| e).await;
    let server = serve(&enclave);

    assert!(h.client.cached_profile().is_none());
    let profile = h.client.request_profile().await.unwrap();
    assert_eq!(profile, enclave.profile());
    assert_eq!(h.client.cached_profile(), Some(profile));

    server.abort();
}

#[tokio::test(start_paused = true)]
async fn test_queued_request_sent_exactly_once_after_key() {
    let h = harness(SimRadio::new());
    let material = h.client.pair().await.unwrap();
    let enclave = SimEnclave::accept(&material, h.relay.clone()).unwrap();
    let queue = material.pairing_id;

    let client = h.client.clone();
    let pending = tokio::spawn(async move { client.request_list(ListRequest::default()).await });

    sleep(Duration::from_secs(1)).await;
    assert_eq!(h.relay.sent_total(&queue).await, 0);

    enclave.send_key().await.unwrap();
    sleep(Duration::from_secs(1)).await;
    assert!(h.client.is_paired());
    assert_eq!(h.relay.sent_total(&queue).await, 1);

    assert_eq!(enclave.respond_pending().await, 1);
    let list = pending.await.unwrap().unwrap();
    assert_eq!(list.profiles, vec![enclave.profile()]);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(h.relay.sent_total(&queue).await, 1);
    assert!(h.store.current().unwrap().is_paired());
}

#[tokio::test]
async fn test_repeated_pairing_leaves_one_radio_service() {
    let h = harness(SimRadio::new());
    h.client.start().await.unwrap();

    let mut services = Vec::new();
    let mut last = None;
    for _ in 0..3 {
        let material = h.client.pair().await.unwrap();
        let service = h.store.current().unwrap().derive_transport_id().unwrap();
        assert!(h.relay.has_queues(&material.pairing_id).await);
        services.push(service);
        last = Some(material);
    }

    let active = h.radio.active_services().await;
    assert_eq!(active.len(), 1);
    assert!(active.contains(&services[2]));
    assert_eq!(
        h.radio.service_events().await,
        vec![
            ServiceEvent::Added(services[0]),
            ServiceEvent::Removed(services[0]),
            ServiceEvent::Added(services[1]),
            ServiceEvent::Removed(services[1]),
            ServiceEvent::Added(services[2]),
        ]
    );
    assert_eq!(h.client.pairing_material(), last);
    assert_eq!(h.client.pairing_status(), PairingStatus::KeyPending);
}

#[tokio::test(start_paused = true)]
async fn test_endpoint_update_from_uncorrelated_response() {
    let h = harness(SimRadio::new());
    h.client.start().await.unwrap();
    let radio = h.radio.clone();
    let enclave = h
        .establish(|e| e.with_radio(radio).with_endpoint("endpoint-42"))
        .await;

    let stray = Response {
        request_id: Uuid::new_v4(),
        endpoint_id: Some("endpoint-42".to_string()),
        body: ResponseBody::List(Default::default()),
    };
    assert!(enclave.reply(&stray).await);
    sleep(Duration::from_millis(10)).await;

    assert_eq!(
        h.store.current().unwrap().endpoint_id(),
        Some("endpoint-42")
    );

    // Later relay sends wake the enclave through its endpoint.
    let server = serve(&enclave);
    h.client.request_list(ListRequest::default()).await.unwrap();
    assert_eq!(
        h.relay.notified_endpoints().await,
        vec!["endpoint-42".to_string()]
    );
    server.abort();
}

#[tokio::test(start_paused = true)]
async fn test_radio_unavailable_falls_back_to_relay() {
    let h = harness(SimRadio::unavailable());
    h.client.start().await.unwrap();

    let material = h.client.pair().await.unwrap();
    let enclave = Arc::new(SimEnclave::accept(&material, h.relay.clone()).unwrap());
    enclave.send_key().await.unwrap();
    let server = serve(&enclave);

    let profile = h.client.request_profile().await.unwrap();
    assert_eq!(profile, enclave.profile());
    assert!(h.radio.written().await.is_empty());
    assert!(h.radio.active_services().await.is_empty());
    server.abort();
}

#[tokio::test(start_paused = true)]
async fn test_responses_delivered_over_radio() {
    let h = harness(SimRadio::new());
    h.client.start().await.unwrap();
    let radio = h.radio.clone();
    let enclave = h.establish(|e| e.with_radio(radio)).await;
    let server = serve(&enclave);

    let fingerprint = enclave.profile().fingerprint().to_vec();
    let signed = h
        .client
        .request_signature(SignRequest {
            public_key_fingerprint: fingerprint,
            data: b"challenge".to_vec(),
            command: Some("git commit".to_string()),
        })
        .await
        .unwrap();
    assert!(signed.signature.is_some());
    assert!(signed.error.is_none());

    // The request also went out over the radio.
    assert_eq!(h.radio.written().await.len(), 1);
    server.abort();
}

#[tokio::test(start_paused = true)]
async fn test_corrupt_ciphertexts_do_not_stop_processing() {
    let h = harness(SimRadio::new());
    h.client.start().await.unwrap();
    let enclave = h.establish(|e| e).await;
    let queue = h.queue();

    h.relay.post_to_workstation(&queue, vec![0x00, 1, 2, 3]).await;
    h.relay.post_to_workstation(&queue, Vec::new()).await;
    h.radio.inject(vec![0x05; 40]).await.unwrap();
    h.radio
        .inject(enclave.session().encrypt(b"not a response").unwrap())
        .await
        .unwrap();

    let server = serve(&enclave);
    let profile = h.client.request_profile().await.unwrap();
    assert_eq!(profile, enclave.profile());
    server.abort();
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_are_correlated() {
    let h = harness(SimRadio::new());
    h.client.start().await.unwrap();
    let enclave = h.establish(|e| e).await;
    let server = serve(&enclave);

    let fingerprint = enclave.profile().fingerprint().to_vec();
    let (profile, list, signed, refused) = tokio::join!(
        h.client.request_profile(),
        h.client.request_list(ListRequest {
            email: Some("someone-else@example.com".to_string()),
        }),
        h.client.request_signature(SignRequest {
            public_key_fingerprint: fingerprint,
            data: b"first".to_vec(),
            command: None,
        }),
        h.client.request_signature(SignRequest {
            public_key_fingerprint: vec![0u8; 32],
            data: b"second".to_vec(),
            command: None,
        }),
    );

    assert_eq!(profile.unwrap(), enclave.profile());
    assert!(list.unwrap().profiles.is_empty());
    assert!(signed.unwrap().signature.is_some());
    assert_eq!(refused.unwrap().error.as_deref(), Some("unknown key"));

    sleep(Duration::from_secs(1)).await;
    assert_eq!(h.client.in_flight_requests(), 0);
    server.abort();
}

#[tokio::test(start_paused = true)]
async fn test_send_failure_is_surfaced() {
    let h = harness(SimRadio::new());
    h.client.start().await.unwrap();
    h.establish(|e| e).await;

    h.relay.set_fail_sends(true);
    let started = Instant::now();
    let result = h.client.request_list(ListRequest::default()).await;
    assert!(matches!(result, Err(EnclaveError::Send(_))));
    assert!(started.elapsed() >= Duration::from_secs(5));
}

#[tokio::test(start_paused = true)]
async fn test_receive_failure_gives_no_answer() {
    let h = harness(SimRadio::new());
    h.client.start().await.unwrap();
    h.establish(|e| e).await;

    h.relay.set_fail_reads(true);
    let started = Instant::now();
    assert_eq!(
        h.client.request_list(ListRequest::default()).await,
        Err(EnclaveError::NoAnswer)
    );
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn test_restart_keeps_pairing_and_warms_cache() {
    let h = harness(SimRadio::new());
    h.client.start().await.unwrap();
    let enclave = h.establish(|e| e).await;
    let service = h.store.current().unwrap().derive_transport_id().unwrap();

    h.client.stop().await.unwrap();
    assert!(h.radio.active_services().await.is_empty());
    assert!(h.store.current().is_some());

    let server = serve(&enclave);
    h.client.start().await.unwrap();
    assert!(h.radio.active_services().await.contains(&service));

    sleep(Duration::from_secs(2)).await;
    assert_eq!(h.client.cached_profile(), Some(enclave.profile()));
    server.abort();
}

#[tokio::test(start_paused = true)]
async fn test_repeated_start_registers_service_once() {
    let h = harness(SimRadio::new());
    h.client.start().await.unwrap();
    h.client.pair().await.unwrap();
    let service = h.store.current().unwrap().derive_transport_id().unwrap();

    h.client.start().await.unwrap();
    h.client.start().await.unwrap();
    assert_eq!(
        h.radio.service_events().await,
        vec![ServiceEvent::Added(service)]
    );
    assert!(h.radio.active_services().await.contains(&service));
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_request_times_out_alone() {
    let h = harness(SimRadio::new());
    h.client.start().await.unwrap();
    let enclave = h.establish(|e| e).await;

    // Answers list requests only.
    let responder = {
        let enclave = Arc::clone(&enclave);
        tokio::spawn(async move {
            loop {
                for request in enclave.pending_requests().await {
                    if request.kind() == RequestKind::List {
                        enclave.reply(&enclave.respond_to(&request)).await;
                    }
                }
                sleep(Duration::from_millis(50)).await;
            }
        })
    };

    let started = Instant::now();
    let ((profile, profile_elapsed), (list, list_elapsed)) = tokio::join!(
        async { (h.client.request_profile().await, started.elapsed()) },
        async {
            (
                h.client.request_list(ListRequest::default()).await,
                started.elapsed(),
            )
        },
    );

    assert_eq!(list.unwrap().profiles, vec![enclave.profile()]);
    assert!(list_elapsed < Duration::from_secs(2));
    assert_eq!(profile, Err(EnclaveError::Timeout));
    assert!(profile_elapsed >= Duration::from_secs(20));
    assert!(profile_elapsed < Duration::from_secs(21));
    assert!(h.client.cached_profile().is_none());
    responder.abort();
}

#[tokio::test(start_paused = true)]
async fn test_late_response_does_not_reach_next_request() {
    let h = harness(SimRadio::new());
    h.client.start().await.unwrap();
    let enclave = h.establish(|e| e).await;

    let started = Instant::now();
    assert_eq!(
        h.client.request_list(ListRequest::default()).await,
        Err(EnclaveError::Timeout)
    );
    assert!(started.elapsed() >= Duration::from_secs(5));

    // Answer the abandoned request after its caller gave up.
    let abandoned = enclave.pending_requests().await;
    assert_eq!(abandoned.len(), 1);
    assert!(enclave.reply(&enclave.respond_to(&abandoned[0])).await);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(h.client.in_flight_requests(), 0);

    // The stale answer lists the profile; this one must not.
    let server = serve(&enclave);
    let list = h
        .client
        .request_list(ListRequest {
            email: Some("someone-else@example.com".to_string()),
        })
        .await
        .unwrap();
    assert!(list.profiles.is_empty());

    sleep(Duration::from_secs(1)).await;
    assert_eq!(h.client.in_flight_requests(), 0);
    server.abort();
}

#[tokio::test(start_paused = true)]
async fn test_start_loads_persisted_pairing() {
    let h = harness(SimRadio::new());
    h.client.start().await.unwrap();
    let enclave = h.establish(|e| e).await;
    h.client.stop().await.unwrap();

    let radio = SimRadio::new();
    let restarted = client_for(&h.relay, &radio, &h.store);
    assert_eq!(restarted.pairing_status(), PairingStatus::Unpaired);

    let server = serve(&enclave);
    restarted.start().await.unwrap();
    assert!(restarted.is_paired());
    assert_eq!(radio.active_services().await.len(), 1);

    sleep(Duration::from_secs(2)).await;
    assert_eq!(restarted.cached_profile(), Some(enclave.profile()));
    server.abort();
}

#[tokio::test]
async fn test_unpair_clears_everything() {
    let h = harness(SimRadio::new());
    h.client.start().await.unwrap();
    h.establish(|e| e).await;

    h.client.unpair().await.unwrap();
    assert_eq!(h.client.pairing_status(), PairingStatus::Unpaired);
    assert!(h.client.pairing_material().is_none());
    assert!(h.store.load().unwrap().is_none());
    assert!(h.radio.active_services().await.is_empty());
    assert_eq!(h.client.request_profile().await, Err(EnclaveError::Unpaired));
}
