use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::{thread_rng, Rng, RngCore};
use sha2::{Digest, Sha256};

use super::AuthError;

/// PKCE code verifier and challenge pair.
///
/// The challenge is always derived from the verifier held here, so the
/// two can never drift apart within one authorization attempt.
#[derive(Debug, Clone)]
pub struct PkcePair {
    verifier: String,
    challenge: String,
}

impl PkcePair {
    /// Create a new random verifier/challenge pair following RFC 7636.
    pub fn generate() -> Result<Self, AuthError> {
        let verifier = generate_verifier()?;
        let challenge = generate_challenge(&verifier);
        Ok(Self {
            verifier,
            challenge,
        })
    }

    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    pub fn challenge(&self) -> &str {
        &self.challenge
    }
}

fn generate_verifier() -> Result<String, AuthError> {
    const BYTE_LEN: usize = 32;
    let mut bytes = [0u8; BYTE_LEN];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|err| AuthError::CryptoUnavailable(err.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

fn generate_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Random alphanumeric nonce for the `state` parameter.
pub fn random_state(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
