//! Hybrid RSA-OAEP / AES-256-GCM primitives.
//!
//! Text messages are encrypted directly with RSA-OAEP (SHA-256) under each
//! participant's public key. Binary payloads are sealed once with a fresh
//! AES-256-GCM session key, and that key is wrapped under each participant's
//! public key.
//!
//! All ciphertext crossing a module boundary is standard base64 with padding.
//! Binary blobs are laid out as `IV (12) ‖ ciphertext ‖ tag (16)`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::Zeroize;

pub const RSA_BITS: usize = 2048;
/// Largest plaintext RSA-OAEP/SHA-256 accepts for a 2048-bit modulus:
/// `256 - 2 * 32 - 2`.
pub const OAEP_CAPACITY: usize = RSA_BITS / 8 - 2 * 32 - 2;
pub const SESSION_KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("plaintext is {len} bytes; direct RSA-OAEP holds at most {max}")]
    Capacity { len: usize, max: usize },
    #[error("decryption failed: {0}")]
    Decryption(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("encryption failed: {0}")]
    Encryption(String),
}

/// Base64-encoded key pair as exchanged with the identity service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredKeypair {
    /// SPKI DER, base64.
    pub public_key: String,
    /// PKCS#8 DER, base64.
    pub private_key: String,
}

/// A parsed RSA public key together with its base64 SPKI form.
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey {
    key: RsaPublicKey,
    encoded: String,
}

impl PublicKey {
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let der = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("public key base64: {e}")))?;
        let key = RsaPublicKey::from_public_key_der(&der)
            .map_err(|e| CryptoError::InvalidKey(format!("public key SPKI: {e}")))?;
        Ok(Self {
            key,
            encoded: encoded.trim().to_string(),
        })
    }

    pub fn to_base64(&self) -> &str {
        &self.encoded
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix: String = self.encoded.chars().skip(32).take(12).collect();
        write!(f, "PublicKey({prefix}…)")
    }
}

/// Decryption-capable key material held by exactly one party.
#[derive(Clone)]
pub struct KeyMaterial {
    private_key: RsaPrivateKey,
    public_key: PublicKey,
}

impl KeyMaterial {
    pub fn from_stored(stored: &StoredKeypair) -> Result<Self, CryptoError> {
        let der = STANDARD
            .decode(stored.private_key.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("private key base64: {e}")))?;
        let private_key = RsaPrivateKey::from_pkcs8_der(&der)
            .map_err(|e| CryptoError::InvalidKey(format!("private key PKCS#8: {e}")))?;
        let public_key = PublicKey::from_base64(&stored.public_key)?;
        if RsaPublicKey::from(&private_key) != public_key.key {
            return Err(CryptoError::InvalidKey(
                "public key does not belong to private key".to_string(),
            ));
        }
        Ok(Self {
            private_key,
            public_key,
        })
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// Ephemeral AES-256 key. Only ever leaves the edge wrapped.
pub struct SessionKey([u8; SESSION_KEY_SIZE]);

impl SessionKey {
    pub fn from_bytes(bytes: [u8; SESSION_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }

    fn export(&self) -> String {
        STANDARD.encode(self.0)
    }

    fn import(exported: &str) -> Result<Self, CryptoError> {
        let mut raw = STANDARD
            .decode(exported.trim())
            .map_err(|e| CryptoError::Decryption(format!("session key encoding: {e}")))?;
        if raw.len() != SESSION_KEY_SIZE {
            let len = raw.len();
            raw.zeroize();
            return Err(CryptoError::Decryption(format!(
                "session key must be {SESSION_KEY_SIZE} bytes, got {len}"
            )));
        }
        let mut key = [0u8; SESSION_KEY_SIZE];
        key.copy_from_slice(&raw);
        raw.zeroize();
        Ok(Self(key))
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

pub fn generate_keypair() -> Result<StoredKeypair, CryptoError> {
    let private_key = RsaPrivateKey::new(&mut OsRng, RSA_BITS)
        .map_err(|e| CryptoError::InvalidKey(format!("key generation: {e}")))?;
    let public_key = RsaPublicKey::from(&private_key);

    let spki = public_key
        .to_public_key_der()
        .map_err(|e| CryptoError::InvalidKey(format!("SPKI export: {e}")))?;
    let pkcs8 = private_key
        .to_pkcs8_der()
        .map_err(|e| CryptoError::InvalidKey(format!("PKCS#8 export: {e}")))?;

    Ok(StoredKeypair {
        public_key: STANDARD.encode(spki.as_bytes()),
        private_key: STANDARD.encode(pkcs8.as_bytes()),
    })
}

pub fn encrypt_text(plaintext: &str, recipient: &PublicKey) -> Result<String, CryptoError> {
    let bytes = plaintext.as_bytes();
    if bytes.len() > OAEP_CAPACITY {
        return Err(CryptoError::Capacity {
            len: bytes.len(),
            max: OAEP_CAPACITY,
        });
    }
    let ciphertext = recipient
        .key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), bytes)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    Ok(STANDARD.encode(ciphertext))
}

pub fn decrypt_text(ciphertext: &str, keys: &KeyMaterial) -> Result<String, CryptoError> {
    let raw = STANDARD
        .decode(ciphertext.trim())
        .map_err(|e| CryptoError::Decryption(format!("ciphertext encoding: {e}")))?;
    let plaintext = keys
        .private_key
        .decrypt(Oaep::new::<Sha256>(), &raw)
        .map_err(|e| CryptoError::Decryption(e.to_string()))?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::Decryption("plaintext is not UTF-8".into()))
}

pub fn generate_session_key() -> SessionKey {
    let mut key = [0u8; SESSION_KEY_SIZE];
    OsRng.fill_bytes(&mut key);
    SessionKey(key)
}

pub fn encrypt_binary(plaintext: &[u8], key: &SessionKey) -> Result<String, CryptoError> {
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
    let sealed = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;

    let mut blob = Vec::with_capacity(IV_SIZE + sealed.len());
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&sealed);
    Ok(STANDARD.encode(blob))
}

pub fn decrypt_binary(blob: &str, key: &SessionKey) -> Result<Vec<u8>, CryptoError> {
    let raw = STANDARD
        .decode(blob.trim())
        .map_err(|e| CryptoError::Decryption(format!("blob encoding: {e}")))?;
    if raw.len() < IV_SIZE + TAG_SIZE {
        return Err(CryptoError::Decryption(format!(
            "blob is {} bytes, shorter than IV and tag",
            raw.len()
        )));
    }
    let (iv, sealed) = raw.split_at(IV_SIZE);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
    cipher
        .decrypt(Nonce::from_slice(iv), sealed)
        .map_err(|_| CryptoError::Decryption("authentication tag mismatch".to_string()))
}

/// Wraps the session key for one participant. The key travels as its base64
/// export, which is well inside [`OAEP_CAPACITY`].
pub fn wrap_key(key: &SessionKey, recipient: &PublicKey) -> Result<String, CryptoError> {
    let mut exported = key.export();
    let wrapped = encrypt_text(&exported, recipient);
    exported.zeroize();
    wrapped
}

pub fn unwrap_key(wrapped: &str, keys: &KeyMaterial) -> Result<SessionKey, CryptoError> {
    let mut exported = decrypt_text(wrapped, keys)?;
    let key = SessionKey::import(&exported);
    exported.zeroize();
    key
}
