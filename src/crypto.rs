//! # Token Guard
//!
//! Credential encryption and signing for stored integration secrets, using
//! AES-256-GCM for confidentiality and HMAC-SHA256 for integrity. Inbound
//! webhook signatures are verified with the same primitives and constant-time
//! comparison to prevent timing attacks.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use std::sync::RwLock;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::AppConfig;

type HmacSha256 = Hmac<Sha256>;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const SECURE_TOKEN_LEN: usize = 32;

/// Crypto error types
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected {KEY_LEN} bytes, got {length}")]
    InvalidKeyLength { length: usize },
    #[error("no encryption key configured")]
    MissingKey,
    #[error("encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("signing failed")]
    SigningFailed,
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Secure wrapper for encryption keys with zeroization
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct ZeroizingKey(Vec<u8>);

/// Type alias for crypto keys
pub type CryptoKey = ZeroizingKey;

impl CryptoKey {
    /// Create a new crypto key from bytes
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                length: bytes.len(),
            });
        }
        Ok(ZeroizingKey(bytes))
    }

    /// Get the key as bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Encrypted credential blob as stored at rest.
///
/// All three fields are hex-encoded; `iv` is the 12-byte GCM nonce and
/// `auth_tag` the 16-byte authentication tag, kept separate from the
/// ciphertext so a tampered field fails closed on decrypt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub ciphertext: String,
    pub iv: String,
    pub auth_tag: String,
}

impl EncryptedBlob {
    /// Serialize the blob to its storage representation.
    pub fn to_json(&self) -> Result<String, CryptoError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a blob from its storage representation.
    pub fn from_json(raw: &str) -> Result<Self, CryptoError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Snapshot of the guard's operability, embedded in the health endpoint.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct GuardHealth {
    pub healthy: bool,
    pub key_fingerprint: String,
}

/// Guards credential material with an in-memory AES-256 key.
///
/// The key can be swapped at runtime via [`TokenGuard::rotate_key`]; blobs
/// written under a previous key are not re-encrypted and will fail closed
/// until their owning integration is re-credentialed.
pub struct TokenGuard {
    key: RwLock<CryptoKey>,
}

impl TokenGuard {
    /// Create a guard from validated key material.
    pub fn new(key: CryptoKey) -> Self {
        Self {
            key: RwLock::new(key),
        }
    }

    /// Create a guard from the application configuration.
    pub fn from_config(config: &AppConfig) -> Result<Self, CryptoError> {
        let bytes = config.crypto_key.clone().ok_or(CryptoError::MissingKey)?;
        Ok(Self::new(CryptoKey::new(bytes)?))
    }

    /// Encrypt a plaintext string into a hex-encoded blob.
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedBlob, CryptoError> {
        let key = self.key.read().unwrap();
        let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
        let cipher = Aes256Gcm::new(cipher_key);

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        // The aead API appends the tag to the ciphertext; split it back out
        // so the stored shape keeps tag and ciphertext distinct.
        let mut sealed = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        if sealed.len() < TAG_LEN {
            return Err(CryptoError::EncryptionFailed(
                "sealed output shorter than tag".to_string(),
            ));
        }
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        Ok(EncryptedBlob {
            ciphertext: hex::encode(sealed),
            iv: hex::encode(nonce),
            auth_tag: hex::encode(tag),
        })
    }

    /// Decrypt a blob back into its plaintext string. Fails closed on any
    /// tampering with ciphertext, nonce or tag.
    pub fn decrypt(&self, blob: &EncryptedBlob) -> Result<String, CryptoError> {
        let ciphertext = hex::decode(&blob.ciphertext).map_err(|_| CryptoError::InvalidFormat)?;
        let iv = hex::decode(&blob.iv).map_err(|_| CryptoError::InvalidFormat)?;
        let tag = hex::decode(&blob.auth_tag).map_err(|_| CryptoError::InvalidFormat)?;

        if iv.len() != NONCE_LEN || tag.len() != TAG_LEN {
            return Err(CryptoError::InvalidFormat);
        }

        let key = self.key.read().unwrap();
        let cipher_key = Key::<Aes256Gcm>::from_slice(key.as_bytes());
        let cipher = Aes256Gcm::new(cipher_key);
        let nonce = Nonce::from_slice(&iv);

        let mut sealed = Vec::with_capacity(ciphertext.len() + tag.len());
        sealed.extend_from_slice(&ciphertext);
        sealed.extend_from_slice(&tag);

        let plaintext = cipher
            .decrypt(nonce, sealed.as_ref())
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|e| CryptoError::DecryptionFailed(format!("Invalid UTF-8: {}", e)))
    }

    /// Encrypt any serializable value as its JSON representation.
    pub fn encrypt_json<T: Serialize>(&self, value: &T) -> Result<EncryptedBlob, CryptoError> {
        let json = serde_json::to_string(value)?;
        self.encrypt(&json)
    }

    /// Decrypt a blob and deserialize its JSON payload.
    pub fn decrypt_json<T: DeserializeOwned>(&self, blob: &EncryptedBlob) -> Result<T, CryptoError> {
        let json = self.decrypt(blob)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Compute a hex-encoded HMAC-SHA256 signature over a payload with the
    /// active key.
    pub fn sign(&self, payload: &str) -> Result<String, CryptoError> {
        let key = self.key.read().unwrap();
        let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
            .map_err(|_| CryptoError::SigningFailed)?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Verify a hex-encoded signature over a payload in constant time.
    /// Malformed signatures verify as false rather than erroring.
    pub fn verify(&self, payload: &str, signature_hex: &str) -> bool {
        let Ok(expected_hex) = self.sign(payload) else {
            return false;
        };
        let Ok(provided) = hex::decode(signature_hex) else {
            return false;
        };
        let Ok(expected) = hex::decode(expected_hex) else {
            return false;
        };
        subtle::ConstantTimeEq::ct_eq(&expected[..], &provided[..]).into()
    }

    /// Swap the active key. Existing blobs stay encrypted under the old key.
    pub fn rotate_key(&self, new_key: CryptoKey) {
        let mut key = self.key.write().unwrap();
        *key = new_key;
    }

    /// SHA-256 fingerprint of the active key, for rotation auditing.
    pub fn key_fingerprint(&self) -> String {
        let key = self.key.read().unwrap();
        hex::encode(Sha256::digest(key.as_bytes()))
    }

    /// Round-trip a timestamped synthetic payload to prove the guard works.
    pub fn health_check(&self) -> GuardHealth {
        let payload = format!("health-check-{}", chrono::Utc::now().timestamp_millis());
        let healthy = self
            .encrypt(&payload)
            .and_then(|blob| self.decrypt(&blob))
            .map(|roundtrip| roundtrip == payload)
            .unwrap_or(false);

        GuardHealth {
            healthy,
            key_fingerprint: self.key_fingerprint(),
        }
    }
}

/// Generate a URL-safe random token suitable for API keys and secrets.
pub fn generate_secure_token() -> String {
    let mut bytes = vec![0u8; SECURE_TOKEN_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64_url::encode(&bytes)
}

/// Errors that can occur during webhook signature verification
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("Missing required signature header: {header}")]
    MissingSignature { header: String },

    #[error("Invalid signature format: {header}")]
    InvalidSignatureFormat { header: String },

    #[error("Signature verification failed")]
    VerificationFailed,
}

/// Verifies an inbound webhook signature using HMAC-SHA256.
///
/// The header carries the hex HMAC of the raw request body, optionally
/// prefixed with `sha256=`. Comparison is constant-time.
pub fn verify_webhook_signature(
    secret: &str,
    body: &[u8],
    signature_header: &str,
) -> Result<(), SignatureError> {
    if signature_header.is_empty() {
        return Err(SignatureError::MissingSignature {
            header: "X-Signature".to_string(),
        });
    }

    let provided_hex = signature_header
        .strip_prefix("sha256=")
        .unwrap_or(signature_header);

    // Compute HMAC-SHA256 of the body
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::VerificationFailed)?;
    mac.update(body);
    let expected_bytes = mac.finalize().into_bytes();

    // Decode the provided signature
    let provided_bytes =
        hex::decode(provided_hex).map_err(|_| SignatureError::InvalidSignatureFormat {
            header: "X-Signature contains invalid hex".to_string(),
        })?;

    // Compare signatures using constant-time comparison to prevent timing attacks
    let expected_bytes_array: &[u8] = expected_bytes.as_ref();
    if subtle::ConstantTimeEq::ct_eq(expected_bytes_array, &provided_bytes[..]).into() {
        Ok(())
    } else {
        Err(SignatureError::VerificationFailed)
    }
}
