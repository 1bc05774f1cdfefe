//! AES-256-GCM sealing with HKDF-derived keys.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use super::SecretError;

pub(crate) const NONCE_LEN: usize = 12;
pub(crate) const TAG_LEN: usize = 16;

/// Derive a 32-byte subkey for `info` from `ikm`.
pub(crate) fn derive_key(ikm: &[u8; 32], info: &[u8]) -> Result<[u8; 32], SecretError> {
    let hk = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; 32];
    hk.expand(info, &mut okm)
        .map_err(|e| SecretError::CryptoError(e.to_string()))?;
    Ok(okm)
}

/// Encrypt with a random nonce. Returns nonce || ciphertext.
pub(crate) fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, SecretError> {
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| SecretError::CryptoError(e.to_string()))?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| SecretError::CryptoError(e.to_string()))?;

    let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Decrypt nonce || ciphertext.
pub(crate) fn open(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>, SecretError> {
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(SecretError::Malformed(
            "ciphertext too short (missing nonce or tag)".to_string(),
        ));
    }

    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| SecretError::CryptoError(e.to_string()))?;
    let nonce = Nonce::from_slice(&data[..NONCE_LEN]);
    cipher
        .decrypt(nonce, &data[NONCE_LEN..])
        .map_err(|e| SecretError::CryptoError(e.to_string()))
}
