//! Identity sealing using AES-256-GCM.
//!
//! Identity credential data is sealed before it reaches the store and
//! unsealed on load, with additional authenticated data binding the
//! ciphertext to its owning project, connector, and identity kind. The rest
//! of the service only ever handles the opaque sealed bytes.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Key, Nonce,
};
use thiserror::Error;
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop};

const VERSION_SEALED: u8 = 0x01;
const VERSION_FIELD_LEN: usize = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_SEALED_LEN: usize = VERSION_FIELD_LEN + NONCE_LEN + TAG_LEN;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("sealing failed: {0}")]
    SealFailed(String),
    #[error("unsealing failed: {0}")]
    UnsealFailed(String),
    #[error("invalid sealed payload format")]
    InvalidFormat,
    #[error("empty sealed payload")]
    EmptyPayload,
    #[error("invalid key length: expected 32 bytes")]
    InvalidKeyLength,
}

/// Secure wrapper for the sealing key with zeroization on drop.
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct IdentityKey(Vec<u8>);

impl IdentityKey {
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength);
        }
        Ok(IdentityKey(bytes))
    }

    /// Parses a hex-encoded 32-byte key, the form carried by configuration.
    pub fn from_hex(value: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(value).map_err(|_| CryptoError::InvalidKeyLength)?;
        Self::new(bytes)
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Seals raw bytes under the given additional authenticated data.
pub fn seal_bytes(key: &IdentityKey, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| CryptoError::SealFailed(e.to_string()))?;

    let mut result = Vec::with_capacity(VERSION_FIELD_LEN + NONCE_LEN + ciphertext.len());
    result.push(VERSION_SEALED);
    result.extend_from_slice(&nonce);
    result.append(&mut ciphertext);

    Ok(result)
}

/// Unseals bytes previously produced by [`seal_bytes`] with the same AAD.
pub fn unseal_bytes(key: &IdentityKey, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.is_empty() {
        return Err(CryptoError::EmptyPayload);
    }

    if sealed[0] != VERSION_SEALED || sealed.len() < MIN_SEALED_LEN {
        return Err(CryptoError::InvalidFormat);
    }

    let nonce = Nonce::from_slice(&sealed[VERSION_FIELD_LEN..VERSION_FIELD_LEN + NONCE_LEN]);
    let ciphertext = &sealed[VERSION_FIELD_LEN + NONCE_LEN..];

    let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
    let cipher = Aes256Gcm::new(cipher_key);

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|e| CryptoError::UnsealFailed(e.to_string()))
}

/// AAD binding an identity's sealed data to its context.
pub fn identity_aad(project_id: Uuid, connector: &str, kind: &str) -> Vec<u8> {
    format!("{project_id}|{connector}|{kind}").into_bytes()
}

/// Seals an identity's JSON data for storage.
pub fn seal_identity_data(
    key: &IdentityKey,
    project_id: Uuid,
    connector: &str,
    kind: &str,
    data: &serde_json::Value,
) -> Result<Vec<u8>, CryptoError> {
    let plaintext =
        serde_json::to_vec(data).map_err(|e| CryptoError::SealFailed(e.to_string()))?;
    seal_bytes(key, &identity_aad(project_id, connector, kind), &plaintext)
}

/// Unseals an identity's stored data back into JSON.
pub fn unseal_identity_data(
    key: &IdentityKey,
    project_id: Uuid,
    connector: &str,
    kind: &str,
    sealed: &[u8],
) -> Result<serde_json::Value, CryptoError> {
    let plaintext = unseal_bytes(key, &identity_aad(project_id, connector, kind), sealed)?;
    serde_json::from_slice(&plaintext).map_err(|e| CryptoError::UnsealFailed(e.to_string()))
}
