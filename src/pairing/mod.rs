//! Pairing secret and its persistence
//!
//! - `PairingSecret`: the workstation's half of the pairing (X25519 key,
//!   symmetric key once exchanged, relay and radio identifiers)
//! - `PeerSession`: the enclave's half of the key exchange
//! - `PairingStore`: durable storage for the active secret

mod crypto;
pub mod secret;
pub mod store;

pub use secret::{PairingMaterial, PairingSecret, PairingStatus, PeerSession, RelayAddress};
pub use store::{FilePairingStore, MemoryPairingStore, PairingStore};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecretError {
    /// The symmetric key has not been received from the enclave yet.
    #[error("Waiting for key exchange")]
    WaitingForKey,

    #[error("Malformed ciphertext: {0}")]
    Malformed(String),

    #[error("Cryptographic error: {0}")]
    CryptoError(String),

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}
