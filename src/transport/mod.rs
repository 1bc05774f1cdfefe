//! Transports between the workstation and the enclave
//!
//! Two independent paths carry the same ciphertext frames: a cloud relay
//! queue (always available, addressed by pairing) and a short-range radio
//! link (lower latency, only in proximity). Each path is given a
//! `DeliveryPolicy` that decides whether its write failures reach callers.

pub mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::pairing::RelayAddress;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Radio unavailable: {0}")]
    Unavailable(String),

    #[error("Service registration error: {0}")]
    ServiceError(String),

    #[error("Stream closed")]
    Closed,
}

/// How a transport's write failures are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPolicy {
    /// Awaited; failures are surfaced to the sender.
    Authoritative,
    /// Spawned fire-and-forget; failures are only logged.
    BestEffort,
}

/// Cloud-relayed message queue.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Create the queues for a new pairing.
    async fn create_queues(&self, queue: &Uuid) -> Result<(), TransportError>;

    /// Send a ciphertext toward the enclave.
    async fn send(&self, address: &RelayAddress, ciphertext: &[u8]) -> Result<(), TransportError>;

    /// Drain ciphertexts waiting for the workstation.
    async fn read_pending(&self, address: &RelayAddress) -> Result<Vec<Vec<u8>>, TransportError>;
}

/// Short-range radio link.
#[async_trait]
pub trait RadioTransport: Send + Sync {
    /// Bring the radio up. Failure leaves the client in relay-only mode.
    async fn power_on(&self) -> Result<(), TransportError>;

    /// Advertise the service the enclave looks for.
    async fn add_service(&self, service: Uuid) -> Result<(), TransportError>;

    async fn remove_service(&self, service: Uuid) -> Result<(), TransportError>;

    async fn write(&self, ciphertext: &[u8]) -> Result<(), TransportError>;

    /// Continuous stream of incoming ciphertexts. Ends when the link closes.
    async fn read_stream(&self) -> Result<mpsc::Receiver<Vec<u8>>, TransportError>;
}
