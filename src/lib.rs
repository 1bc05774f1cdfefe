// Enclave Link - workstation client for a paired key enclave

pub mod client;
pub mod config;
pub mod pairing;
pub mod protocol;
pub mod transport;

pub use client::{EnclaveApi, EnclaveClient, EnclaveError};
pub use config::ClientConfig;
pub use pairing::{PairingMaterial, PairingSecret, PairingStatus};
