//! AES-256-GCM envelopes for secrets at rest.
//!
//! Envelope format: `v1:` followed by base64 (standard, padded) of
//! `nonce(12) || ciphertext+tag`. Two independent boxes exist at runtime: one
//! for TOTP secrets and one for tenant secrets and private signing keys.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

const ENVELOPE_VERSION: &str = "v1:";
const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("master key must be 32 bytes encoded as hex or base64")]
    InvalidMasterKey,
    #[error("unsupported envelope version")]
    UnsupportedVersion,
    #[error("malformed envelope")]
    Malformed,
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}

/// Decodes a 32-byte key from 64 hex chars or base64.
pub fn parse_master_key(encoded: &str) -> Result<[u8; 32], CryptoError> {
    let encoded = encoded.trim();
    let bytes = if encoded.len() == 64 && encoded.bytes().all(|b| b.is_ascii_hexdigit()) {
        hex::decode(encoded).map_err(|_| CryptoError::InvalidMasterKey)?
    } else {
        STANDARD
            .decode(encoded)
            .map_err(|_| CryptoError::InvalidMasterKey)?
    };
    bytes.try_into().map_err(|_| CryptoError::InvalidMasterKey)
}

#[derive(Clone)]
pub struct SecretBox {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretBox(..)")
    }
}

impl SecretBox {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    pub fn from_secret(secret: &SecretString) -> Result<Self, CryptoError> {
        Ok(Self::new(&parse_master_key(secret.expose_secret())?))
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<String, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Encrypt)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(format!("{}{}", ENVELOPE_VERSION, STANDARD.encode(blob)))
    }

    pub fn open(&self, envelope: &str) -> Result<Vec<u8>, CryptoError> {
        let body = envelope
            .strip_prefix(ENVELOPE_VERSION)
            .ok_or(CryptoError::UnsupportedVersion)?;
        let blob = STANDARD.decode(body).map_err(|_| CryptoError::Malformed)?;
        if blob.len() <= NONCE_LEN {
            return Err(CryptoError::Malformed);
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }

    pub fn seal_str(&self, plaintext: &str) -> Result<String, CryptoError> {
        self.seal(plaintext.as_bytes())
    }

    pub fn open_string(&self, envelope: &str) -> Result<String, CryptoError> {
        String::from_utf8(self.open(envelope)?).map_err(|_| CryptoError::Malformed)
    }
}
