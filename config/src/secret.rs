//! Token-at-rest sealing.
//!
//! The bearer token lives in settings.toml sealed under AES-256-GCM with a
//! key derived from the machine identity (hostname plus username), so the
//! file is useless when copied to another host. This guards a settings file
//! at rest; it is not a defense against a local attacker.

use std::sync::OnceLock;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ConfigError;

const NONCE_LEN: usize = 12;
const KEY_SALT: &[u8] = b"mneme-token-sealing-v1";

/// A secret sealed to this machine, serialized as base64(nonce || ciphertext).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SealedSecret(String);

fn machine_key() -> &'static [u8; 32] {
    static KEY: OnceLock<[u8; 32]> = OnceLock::new();
    KEY.get_or_init(|| {
        let hostname = whoami::fallible::hostname().unwrap_or_else(|_| "unknown".to_string());
        Sha256::new()
            .chain_update(KEY_SALT)
            .chain_update(hostname.as_bytes())
            .chain_update(b":")
            .chain_update(whoami::username().as_bytes())
            .finalize()
            .into()
    })
}

fn cipher() -> Result<Aes256Gcm, ConfigError> {
    Aes256Gcm::new_from_slice(machine_key()).map_err(|e| ConfigError::Sealing(e.to_string()))
}

impl SealedSecret {
    /// Seal a plaintext secret with a fresh random nonce.
    pub fn seal(plaintext: &str) -> Result<Self, ConfigError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill(&mut nonce);

        let sealed = cipher()?
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| ConfigError::Sealing(e.to_string()))?;

        let mut payload = Vec::with_capacity(NONCE_LEN + sealed.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&sealed);
        Ok(SealedSecret(BASE64.encode(payload)))
    }

    /// Recover the plaintext. Fails on a different machine or a tampered
    /// payload; GCM authenticates the ciphertext.
    pub fn open(&self) -> Result<String, ConfigError> {
        let payload = BASE64
            .decode(&self.0)
            .map_err(|e| ConfigError::Sealing(e.to_string()))?;
        if payload.len() <= NONCE_LEN {
            return Err(ConfigError::Sealing("sealed payload too short".to_string()));
        }

        let (nonce, sealed) = payload.split_at(NONCE_LEN);
        let plain = cipher()?
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| ConfigError::Sealing("token does not open on this machine".to_string()))?;
        String::from_utf8(plain).map_err(|e| ConfigError::Sealing(e.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let sealed = SealedSecret::seal("eyJhbGciOiJIUzI1NiJ9.bearer").unwrap();
        assert_eq!(sealed.open().unwrap(), "eyJhbGciOiJIUzI1NiJ9.bearer");
    }

    #[test]
    fn test_fresh_nonce_per_seal() {
        let a = SealedSecret::seal("same-secret").unwrap();
        let b = SealedSecret::seal("same-secret").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_payload_does_not_open() {
        let sealed = SealedSecret::seal("bearer-xyz").unwrap();
        let mut payload = BASE64.decode(sealed.as_str()).unwrap();
        let last = payload.len() - 1;
        payload[last] ^= 0x01;
        let tampered = SealedSecret(BASE64.encode(payload));
        assert!(tampered.open().is_err());
    }

    #[test]
    fn test_garbage_does_not_open() {
        assert!(SealedSecret("not-base64!!!".to_string()).open().is_err());
        assert!(SealedSecret(BASE64.encode(b"short")).open().is_err());
    }
}
