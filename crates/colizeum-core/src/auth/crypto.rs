use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::password_hash::rand_core::{OsRng, RngCore};
use argon2::Argon2;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const ALGORITHM: &str = "AES-256-GCM";
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// Errors raised while encrypting or decrypting the token record.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key derivation failed: {0}")]
    KeyDerivation(String),
    #[error("cipher initialisation failed: {0}")]
    Cipher(String),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed (wrong key or corrupted payload)")]
    Decrypt,
    #[error("unsupported algorithm '{0}'")]
    UnsupportedAlgorithm(String),
    #[error("invalid nonce length {0}")]
    InvalidNonce(usize),
    #[error("invalid encrypted payload: {0}")]
    Payload(String),
}

/// Serializable container for one encrypted value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedData {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub salt: Option<String>,
    pub algorithm: String,
}

/// AES-256-GCM cipher with an Argon2-derived key for tokens at rest.
pub struct TokenCipher {
    cipher: Aes256Gcm,
    salt: String,
}

impl std::fmt::Debug for TokenCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCipher")
            .field("cipher", &"[REDACTED]")
            .field("salt", &"[REDACTED]")
            .finish()
    }
}

impl TokenCipher {
    /// Derive the symmetric key from a passphrase and salt.
    ///
    /// The same passphrase and salt always yield the same key, so a record
    /// written in one process can be decrypted in the next.
    pub fn derive(passphrase: &str, salt: &str) -> Result<Self, CryptoError> {
        let mut key = [0u8; KEY_LEN];
        Argon2::default()
            .hash_password_into(passphrase.as_bytes(), salt.as_bytes(), &mut key)
            .map_err(|err| CryptoError::KeyDerivation(err.to_string()))?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|err| CryptoError::Cipher(err.to_string()))?;
        Ok(Self {
            cipher,
            salt: salt.to_owned(),
        })
    }

    /// Encrypt bytes into an [`EncryptedData`] payload with a fresh nonce.
    pub fn encrypt(&self, data: &[u8]) -> Result<EncryptedData, CryptoError> {
        let nonce = generate_nonce();
        let ciphertext = self
            .cipher
            .encrypt(&Nonce::from(nonce), data)
            .map_err(|_| CryptoError::Encrypt)?;
        Ok(EncryptedData {
            nonce: nonce.to_vec(),
            ciphertext,
            salt: Some(self.salt.clone()),
            algorithm: ALGORITHM.to_string(),
        })
    }

    /// Decrypt an [`EncryptedData`] payload back into raw bytes.
    pub fn decrypt(&self, encrypted: &EncryptedData) -> Result<Vec<u8>, CryptoError> {
        if encrypted.algorithm != ALGORITHM {
            return Err(CryptoError::UnsupportedAlgorithm(
                encrypted.algorithm.clone(),
            ));
        }
        let nonce: [u8; NONCE_LEN] = encrypted
            .nonce
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidNonce(encrypted.nonce.len()))?;
        self.cipher
            .decrypt(&Nonce::from(nonce), encrypted.ciphertext.as_ref())
            .map_err(|_| CryptoError::Decrypt)
    }

    /// Encrypt bytes and encode the payload as a base64 string.
    pub fn encrypt_to_string(&self, data: &[u8]) -> Result<String, CryptoError> {
        let encrypted = self.encrypt(data)?;
        let serialized =
            serde_json::to_vec(&encrypted).map_err(|err| CryptoError::Payload(err.to_string()))?;
        Ok(BASE64.encode(serialized))
    }

    /// Decode a base64 string and decrypt the contained payload.
    pub fn decrypt_from_string(&self, payload: &str) -> Result<Vec<u8>, CryptoError> {
        let decoded = BASE64
            .decode(payload)
            .map_err(|err| CryptoError::Payload(err.to_string()))?;
        let encrypted: EncryptedData =
            serde_json::from_slice(&decoded).map_err(|err| CryptoError::Payload(err.to_string()))?;
        self.decrypt(&encrypted)
    }
}

fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}
