//! Pairing secret: the negotiated trust relationship with one enclave
//!
//! The workstation generates an X25519 keypair and publishes the public half
//! (with the relay queue identifier) as pairing material. The enclave answers
//! with a key-wrap frame: its own X25519 public key plus a fresh symmetric key
//! sealed under the ECDH-derived wrap key. Until that frame arrives the secret
//! is key-pending and cannot encrypt.
//!
//! Frame layout on both transports:
//! - `0x00 || nonce(12) || AES-256-GCM(message)`
//! - `0x01 || enclave_public(32) || nonce(12) || AES-256-GCM(key) || [message frame]`

use std::fmt;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519Secret};
use zeroize::Zeroize;

use super::crypto::{derive_key, open, seal, NONCE_LEN, TAG_LEN};
use super::SecretError;

pub const FRAME_MESSAGE: u8 = 0x00;
pub const FRAME_KEY_WRAP: u8 = 0x01;

const KEY_WRAP_INFO: &[u8] = b"enclave-link-key-wrap-v1";
const MESSAGE_INFO: &[u8] = b"enclave-link-message-v1";
const RADIO_SERVICE_TAG: &[u8] = b"enclave-link.radio-service";

/// enclave public key + sealed 32-byte symmetric key
const WRAP_LEN: usize = 32 + NONCE_LEN + 32 + TAG_LEN;

/// Where in the pairing lifecycle a client is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairingStatus {
    Unpaired,
    KeyPending,
    Paired,
}

/// Public half of a pairing, handed to the enclave out of band (QR code).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingMaterial {
    pub pairing_id: Uuid,
    pub workstation_public_key: [u8; 32],
    pub workstation_name: String,
}

/// Relay addressing derived from a pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayAddress {
    pub queue: Uuid,
    /// Push endpoint of the enclave, once the relay has assigned one.
    pub endpoint: Option<String>,
}

/// Workstation side of a pairing. Secret bytes are zeroized on drop.
#[derive(Clone, Serialize, Deserialize)]
pub struct PairingSecret {
    pairing_id: Uuid,
    workstation_name: String,
    dh_secret_bytes: [u8; 32],
    symmetric_key: Option<[u8; 32]>,
    endpoint_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl PairingSecret {
    /// Generate a new key-pending secret.
    pub fn generate(workstation_name: &str) -> Self {
        let dh_secret = X25519Secret::random_from_rng(OsRng);
        Self {
            pairing_id: Uuid::new_v4(),
            workstation_name: workstation_name.to_string(),
            dh_secret_bytes: dh_secret.to_bytes(),
            symmetric_key: None,
            endpoint_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn pairing_id(&self) -> Uuid {
        self.pairing_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn endpoint_id(&self) -> Option<&str> {
        self.endpoint_id.as_deref()
    }

    pub fn set_endpoint_id(&mut self, endpoint_id: String) {
        self.endpoint_id = Some(endpoint_id);
    }

    /// Whether the symmetric key has been exchanged.
    pub fn is_paired(&self) -> bool {
        self.symmetric_key.is_some()
    }

    pub fn status(&self) -> PairingStatus {
        if self.is_paired() {
            PairingStatus::Paired
        } else {
            PairingStatus::KeyPending
        }
    }

    pub fn public_key(&self) -> [u8; 32] {
        X25519PublicKey::from(&self.dh_secret()).to_bytes()
    }

    pub fn material(&self) -> PairingMaterial {
        PairingMaterial {
            pairing_id: self.pairing_id,
            workstation_public_key: self.public_key(),
            workstation_name: self.workstation_name.clone(),
        }
    }

    pub fn relay_address(&self) -> RelayAddress {
        RelayAddress {
            queue: self.pairing_id,
            endpoint: self.endpoint_id.clone(),
        }
    }

    /// Derive the radio service identifier advertised for this pairing.
    ///
    /// SHA-256 over a domain tag and the workstation public key, formatted
    /// with UUID v4 version/variant bits.
    pub fn derive_transport_id(&self) -> Result<Uuid, SecretError> {
        let public_key = self.public_key();
        if public_key == [0u8; 32] {
            return Err(SecretError::InvalidKeyMaterial(
                "workstation public key is all zeros".to_string(),
            ));
        }
        let mut hasher = Sha256::new();
        hasher.update(RADIO_SERVICE_TAG);
        hasher.update(public_key);
        let hash = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hash[..16]);
        bytes[6] = (bytes[6] & 0x0F) | 0x40;
        bytes[8] = (bytes[8] & 0x3F) | 0x80;
        Ok(Uuid::from_bytes(bytes))
    }

    /// Encrypt a message frame. Fails with `WaitingForKey` while key-pending.
    pub fn encrypt(&self, message: &[u8]) -> Result<Vec<u8>, SecretError> {
        let key = self.message_key()?.ok_or(SecretError::WaitingForKey)?;
        let sealed = seal(&key, message)?;
        let mut frame = Vec::with_capacity(1 + sealed.len());
        frame.push(FRAME_MESSAGE);
        frame.extend_from_slice(&sealed);
        Ok(frame)
    }

    /// Decrypt a message frame. Returns `Ok(None)` while key-pending.
    pub fn decrypt(&self, frame: &[u8]) -> Result<Option<Vec<u8>>, SecretError> {
        let Some(key) = self.message_key()? else {
            return Ok(None);
        };
        match frame.split_first() {
            Some((&FRAME_MESSAGE, sealed)) => open(&key, sealed).map(Some),
            Some((tag, _)) => Err(SecretError::Malformed(format!(
                "expected message frame, got tag {:#04x}",
                tag
            ))),
            None => Err(SecretError::Malformed("empty frame".to_string())),
        }
    }

    /// Install the symmetric key if `ciphertext` is a key-wrap frame.
    ///
    /// Returns the message frame that still needs decrypting (if any) and
    /// whether this call established the key. A wrap frame arriving after
    /// the key is already known is skipped.
    pub fn unwrap_key_if_present(
        &mut self,
        ciphertext: &[u8],
    ) -> Result<(Option<Vec<u8>>, bool), SecretError> {
        let (tag, body) = ciphertext
            .split_first()
            .ok_or_else(|| SecretError::Malformed("empty ciphertext".to_string()))?;

        match *tag {
            FRAME_MESSAGE => Ok((Some(ciphertext.to_vec()), false)),
            FRAME_KEY_WRAP => {
                if body.len() < WRAP_LEN {
                    return Err(SecretError::Malformed(format!(
                        "key wrap frame too short ({} < {})",
                        body.len(),
                        WRAP_LEN
                    )));
                }
                let (wrap, rest) = body.split_at(WRAP_LEN);
                let remainder = if rest.is_empty() {
                    None
                } else {
                    Some(rest.to_vec())
                };
                if self.symmetric_key.is_some() {
                    return Ok((remainder, false));
                }

                let mut enclave_public = [0u8; 32];
                enclave_public.copy_from_slice(&wrap[..32]);
                let shared = self
                    .dh_secret()
                    .diffie_hellman(&X25519PublicKey::from(enclave_public));
                let wrap_key = derive_key(shared.as_bytes(), KEY_WRAP_INFO)?;

                let mut key_bytes = open(&wrap_key, &wrap[32..])?;
                let key: Result<[u8; 32], _> = key_bytes.as_slice().try_into();
                key_bytes.zeroize();
                let key = key.map_err(|_| {
                    SecretError::InvalidKeyMaterial("wrapped key is not 32 bytes".to_string())
                })?;

                self.symmetric_key = Some(key);
                Ok((remainder, true))
            }
            other => Err(SecretError::Malformed(format!(
                "unknown frame tag {:#04x}",
                other
            ))),
        }
    }

    fn dh_secret(&self) -> X25519Secret {
        X25519Secret::from(self.dh_secret_bytes)
    }

    fn message_key(&self) -> Result<Option<[u8; 32]>, SecretError> {
        self.symmetric_key
            .as_ref()
            .map(|key| derive_key(key, MESSAGE_INFO))
            .transpose()
    }
}

impl Drop for PairingSecret {
    fn drop(&mut self) {
        self.dh_secret_bytes.zeroize();
        if let Some(key) = self.symmetric_key.as_mut() {
            key.zeroize();
        }
    }
}

impl fmt::Debug for PairingSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PairingSecret")
            .field("pairing_id", &self.pairing_id)
            .field("workstation_name", &self.workstation_name)
            .field("public_key", &hex::encode(self.public_key()))
            .field("status", &self.status())
            .field("endpoint_id", &self.endpoint_id)
            .finish()
    }
}

/// Enclave side of a pairing: accepts pairing material, chooses the
/// symmetric key and produces the key-wrap frame.
pub struct PeerSession {
    pairing_id: Uuid,
    symmetric_key: [u8; 32],
    enclave_public: [u8; 32],
    sealed_key: Vec<u8>,
}

impl PeerSession {
    pub fn accept(material: &PairingMaterial) -> Result<Self, SecretError> {
        let mut symmetric_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut symmetric_key);

        let enclave_secret = X25519Secret::random_from_rng(OsRng);
        let enclave_public = X25519PublicKey::from(&enclave_secret).to_bytes();
        let shared =
            enclave_secret.diffie_hellman(&X25519PublicKey::from(material.workstation_public_key));
        let wrap_key = derive_key(shared.as_bytes(), KEY_WRAP_INFO)?;
        let sealed_key = seal(&wrap_key, &symmetric_key)?;

        Ok(Self {
            pairing_id: material.pairing_id,
            symmetric_key,
            enclave_public,
            sealed_key,
        })
    }

    pub fn pairing_id(&self) -> Uuid {
        self.pairing_id
    }

    /// Key-wrap frame, optionally carrying an encrypted message behind it.
    pub fn key_wrap_frame(&self, message: Option<&[u8]>) -> Result<Vec<u8>, SecretError> {
        let mut frame = Vec::with_capacity(1 + WRAP_LEN);
        frame.push(FRAME_KEY_WRAP);
        frame.extend_from_slice(&self.enclave_public);
        frame.extend_from_slice(&self.sealed_key);
        if let Some(message) = message {
            frame.extend_from_slice(&self.encrypt(message)?);
        }
        Ok(frame)
    }

    pub fn encrypt(&self, message: &[u8]) -> Result<Vec<u8>, SecretError> {
        let key = derive_key(&self.symmetric_key, MESSAGE_INFO)?;
        let sealed = seal(&key, message)?;
        let mut frame = Vec::with_capacity(1 + sealed.len());
        frame.push(FRAME_MESSAGE);
        frame.extend_from_slice(&sealed);
        Ok(frame)
    }

    pub fn decrypt(&self, frame: &[u8]) -> Result<Vec<u8>, SecretError> {
        let key = derive_key(&self.symmetric_key, MESSAGE_INFO)?;
        match frame.split_first() {
            Some((&FRAME_MESSAGE, sealed)) => open(&key, sealed),
            _ => Err(SecretError::Malformed("expected message frame".to_string())),
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.symmetric_key.zeroize();
    }
}
