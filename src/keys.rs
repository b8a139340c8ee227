//! Secret key material: time-bounded symmetric keys, their serializable
//! form for the cluster cache, and secure random generation.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tag identifying the MAC function a key is intended for.
pub const HMAC_SHA256: &str = "HmacSHA256";

/// Length of generated key material in bytes.
pub const KEY_LEN: usize = 32;

/// A symmetric MAC key bound to an expiry time and an owning server.
///
/// Keys are immutable once created. A key may be used to *verify* tokens
/// while `now < expires_at`; it may be used to *sign* new tokens only while
/// it occupies the active slot of its owner's key ring.
#[derive(Clone, PartialEq, Eq)]
pub struct ExpiringSecretKey {
    key: Vec<u8>,
    algorithm: String,
    expires_at: u64,
    server_id: String,
}

impl ExpiringSecretKey {
    pub fn new(key: Vec<u8>, algorithm: &str, expires_at: u64, server_id: &str) -> Self {
        Self {
            key,
            algorithm: algorithm.to_string(),
            expires_at,
            server_id: server_id.to_string(),
        }
    }

    /// Generate a fresh random key owned by `server_id`.
    pub fn generate(expires_at: u64, server_id: &str) -> Self {
        let mut key = vec![0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self::new(key, HMAC_SHA256, expires_at, server_id)
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now > self.expires_at
    }

    /// Serializable form for publication into the shared key cache.
    pub fn to_data(&self) -> SecretKeyData {
        SecretKeyData {
            expires_at: self.expires_at,
            algorithm: self.algorithm.clone(),
            key: URL_SAFE_NO_PAD.encode(&self.key),
            server_id: self.server_id.clone(),
        }
    }
}

// Key bytes stay out of logs.
impl fmt::Debug for ExpiringSecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpiringSecretKey")
            .field("algorithm", &self.algorithm)
            .field("expires_at", &self.expires_at)
            .field("server_id", &self.server_id)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Wire form of a secret key as stored in the cluster-replicated cache,
/// keyed by `"{server_id}:{slot}"`. Key bytes are base64url encoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretKeyData {
    pub expires_at: u64,
    pub algorithm: String,
    pub key: String,
    pub server_id: String,
}

impl SecretKeyData {
    /// Rebuild the usable key. Fails on undecodable key bytes.
    pub fn to_key(&self) -> anyhow::Result<ExpiringSecretKey> {
        let key = URL_SAFE_NO_PAD
            .decode(&self.key)
            .map_err(|e| anyhow::anyhow!("invalid cached key material: {e}"))?;
        Ok(ExpiringSecretKey::new(
            key,
            &self.algorithm,
            self.expires_at,
            &self.server_id,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_are_distinct() {
        let a = ExpiringSecretKey::generate(1000, "server-a");
        let b = ExpiringSecretKey::generate(1000, "server-a");
        assert_eq!(a.key().len(), KEY_LEN);
        assert_ne!(a.key(), b.key());
        assert_eq!(a.algorithm(), HMAC_SHA256);
    }

    #[test]
    fn cache_form_round_trips() {
        let key = ExpiringSecretKey::generate(5000, "server-a");
        let data = key.to_data();
        let back = data.to_key().unwrap();
        assert_eq!(back, key);

        // and survives JSON, which is what the redis backend stores
        let json = serde_json::to_string(&data).unwrap();
        let parsed: SecretKeyData = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.to_key().unwrap(), key);
    }

    #[test]
    fn debug_redacts_key_material() {
        let key = ExpiringSecretKey::generate(5000, "server-a");
        let rendered = format!("{key:?}");
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains(&URL_SAFE_NO_PAD.encode(key.key())));
    }

    #[test]
    fn expiry_is_strict() {
        let key = ExpiringSecretKey::new(vec![1; KEY_LEN], HMAC_SHA256, 100, "s");
        assert!(!key.is_expired(100));
        assert!(key.is_expired(101));
    }
}
