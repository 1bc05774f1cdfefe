//! Enclave client
//!
//! Public entry point for talking to a paired enclave. Requests are
//! encrypted under the pairing secret, sent over the relay and the radio,
//! and matched to their responses by request identifier.

pub mod correlator;
pub mod enclave;
pub mod queue;
pub mod state;

pub use correlator::Correlator;
pub use enclave::EnclaveClient;
pub use queue::OutgoingQueue;

use async_trait::async_trait;
use thiserror::Error;

use crate::pairing::PairingMaterial;
use crate::protocol::{ListRequest, ListResponse, Profile, SignRequest, SignResponse};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnclaveError {
    /// Key exchange still pending; the message is buffered and will be sent
    /// once the key arrives.
    #[error("Message queued until key exchange completes")]
    Queued,

    #[error("Send error: {0}")]
    Send(String),

    #[error("Receive error: {0}")]
    Receive(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Enclave gave no answer")]
    NoAnswer,

    #[error("Not paired with an enclave")]
    Unpaired,

    #[error("Storage error: {0}")]
    Storage(String),
}

/// Operations offered to the daemon and CLI.
#[async_trait]
pub trait EnclaveApi: Send + Sync {
    /// Replace any existing pairing with a fresh one and return the material
    /// to show the enclave.
    async fn pair(&self) -> Result<PairingMaterial, EnclaveError>;

    /// Whether a pairing exists and its key exchange has completed.
    fn is_paired(&self) -> bool;

    async fn start(&self) -> Result<(), EnclaveError>;

    async fn stop(&self) -> Result<(), EnclaveError>;

    async fn request_profile(&self) -> Result<Profile, EnclaveError>;

    /// Last profile fetched under the current pairing.
    fn cached_profile(&self) -> Option<Profile>;

    async fn request_signature(&self, request: SignRequest) -> Result<SignResponse, EnclaveError>;

    async fn request_list(&self, request: ListRequest) -> Result<ListResponse, EnclaveError>;
}
