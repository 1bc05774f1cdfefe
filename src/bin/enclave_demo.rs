//! Enclave round trip against the in-process simulator
//!
//! Run with: RUST_LOG=info cargo run --bin enclave_demo

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use enclave_link::pairing::MemoryPairingStore;
use enclave_link::protocol::{ListRequest, SignRequest};
use enclave_link::transport::simulated::{SimEnclave, SimRadio, SimRelay};
use enclave_link::{ClientConfig, EnclaveApi, EnclaveClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    println!("\n🔐 Enclave Link demo");
    println!("====================");

    let relay = SimRelay::new();
    let radio = SimRadio::new();
    let store = Arc::new(MemoryPairingStore::new());
    let client = EnclaveClient::new(
        ClientConfig::from_env(),
        store,
        relay.clone(),
        Some(radio.clone()),
    );
    client.start().await?;

    let material = client.pair().await?;
    println!("📱 Pairing {} ({})", material.pairing_id, material.workstation_name);
    println!("   Workstation key: {}", hex::encode(material.workstation_public_key));

    let enclave = Arc::new(
        SimEnclave::accept(&material, relay.clone())
            .context("enclave rejected pairing material")?
            .with_endpoint("sim-endpoint-1"),
    );
    enclave.send_key().await?;
    let server = Arc::clone(&enclave).serve(Duration::from_millis(50));

    let profile = client.request_profile().await?;
    println!("✅ Profile: {} ({})", profile.email, hex::encode(profile.fingerprint()));
    println!("   Paired: {}", client.is_paired());

    let list = client.request_list(ListRequest::default()).await?;
    println!("📋 Enclave holds {} profile(s)", list.profiles.len());

    let signature = client
        .request_signature(SignRequest {
            public_key_fingerprint: profile.fingerprint().to_vec(),
            data: b"demo challenge".to_vec(),
            command: Some("enclave_demo".to_string()),
        })
        .await?;
    match (signature.signature, signature.error) {
        (Some(sig), _) => println!("✍️  Signature: {}", hex::encode(sig)),
        (None, Some(error)) => println!("❌ Enclave refused: {}", error),
        (None, None) => println!("❌ Enclave returned an empty sign response"),
    }

    println!("📡 Radio frames written: {}", radio.written().await.len());
    println!("🔔 Endpoint wakeups: {:?}", relay.notified_endpoints().await);

    server.abort();
    client.stop().await?;
    println!("\n👋 Done");
    Ok(())
}
