//! API key verification and minting.
//!
//! The scheduler only consumes the [`KeyVerifier`] capability; where keys
//! live is the store's business. [`MemoryKeyStore`] keeps HMAC-SHA256 digests
//! in process memory, keyed by a short non-secret prefix.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::RngCore;
use serde::Serialize;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::error::ServiceError;

type HmacSha256 = Hmac<Sha256>;

const KEY_SCHEME: &str = "sk_";
const PREFIX_LEN: usize = 12;
const MAX_KEY_LEN: usize = 256;

/// Resolve a presented secret to its owner, or reject it.
pub trait KeyVerifier: Send + Sync {
    fn verify(&self, secret: &str) -> Result<String, ServiceError>;
}

/// Issue a new secret for an owner.
pub trait KeyMinter: Send + Sync {
    fn mint(&self, owner: &str) -> Result<MintedKey, ServiceError>;
}

pub trait KeyStore: KeyVerifier + KeyMinter {}

impl<T: KeyVerifier + KeyMinter> KeyStore for T {}

#[derive(Debug, Clone, Serialize)]
pub struct MintedKey {
    pub api_key: String,
    pub owner: String,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
pub struct ApiKeyRecord {
    pub id: u64,
    pub prefix: String,
    pub digest: Vec<u8>,
    pub owner: String,
    pub created_at: DateTime<Utc>,
    pub revoked: bool,
}

pub struct MemoryKeyStore {
    pepper: Vec<u8>,
    records: RwLock<HashMap<String, Vec<ApiKeyRecord>>>,
    next_id: AtomicU64,
}

impl MemoryKeyStore {
    /// Without a configured pepper a random one is drawn; keys then only
    /// verify for the lifetime of this process.
    pub fn new(pepper: Option<&str>) -> Self {
        let pepper = match pepper {
            Some(p) => p.as_bytes().to_vec(),
            None => {
                let mut bytes = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut bytes);
                bytes
            }
        };
        Self {
            pepper,
            records: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register an externally provisioned secret.
    pub fn insert(&self, secret: &str, owner: &str) -> Result<ApiKeyRecord, ServiceError> {
        if secret.is_empty() || secret.len() > MAX_KEY_LEN {
            return Err(ServiceError::Validation(
                "API key must be 1..=256 characters".into(),
            ));
        }
        let record = ApiKeyRecord {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            prefix: lookup_prefix(secret),
            digest: self.digest(secret)?,
            owner: owner.to_string(),
            created_at: Utc::now(),
            revoked: false,
        };
        self.records
            .write()
            .entry(record.prefix.clone())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    /// Mark a secret revoked. Returns whether a live key matched.
    pub fn revoke(&self, secret: &str) -> bool {
        let prefix = lookup_prefix(secret);
        let mut records = self.records.write();
        let Some(candidates) = records.get_mut(&prefix) else {
            return false;
        };
        for record in candidates.iter_mut().filter(|r| !r.revoked) {
            if self.matches(secret, &record.digest) {
                record.revoked = true;
                return true;
            }
        }
        false
    }

    pub fn len(&self) -> usize {
        self.records.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mac(&self) -> Result<HmacSha256, ServiceError> {
        HmacSha256::new_from_slice(&self.pepper)
            .map_err(|e| ServiceError::Other(format!("invalid key pepper: {e}")))
    }

    fn digest(&self, secret: &str) -> Result<Vec<u8>, ServiceError> {
        let mut mac = self.mac()?;
        mac.update(secret.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }

    fn matches(&self, secret: &str, digest: &[u8]) -> bool {
        match self.mac() {
            Ok(mut mac) => {
                mac.update(secret.as_bytes());
                // Constant-time comparison.
                mac.verify_slice(digest).is_ok()
            }
            Err(_) => false,
        }
    }
}

impl KeyVerifier for MemoryKeyStore {
    fn verify(&self, secret: &str) -> Result<String, ServiceError> {
        if secret.is_empty() || secret.len() > MAX_KEY_LEN {
            warn!(len = secret.len(), "rejecting malformed API key");
            return Err(ServiceError::Unauthorized);
        }

        let records = self.records.read();
        let owner = records
            .get(&lookup_prefix(secret))
            .into_iter()
            .flatten()
            .filter(|record| !record.revoked)
            .find(|record| self.matches(secret, &record.digest))
            .map(|record| record.owner.clone());

        match owner {
            Some(owner) => Ok(owner),
            None => {
                warn!("invalid API key attempt");
                Err(ServiceError::Unauthorized)
            }
        }
    }
}

impl KeyMinter for MemoryKeyStore {
    fn mint(&self, owner: &str) -> Result<MintedKey, ServiceError> {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let mut secret = String::with_capacity(KEY_SCHEME.len() + raw.len() * 2);
        secret.push_str(KEY_SCHEME);
        for byte in raw {
            secret.push_str(&format!("{byte:02x}"));
        }

        let record = self.insert(&secret, owner)?;
        debug!(id = record.id, owner, "minted API key");
        Ok(MintedKey {
            api_key: secret,
            owner: record.owner,
            created_at: record.created_at.timestamp(),
        })
    }
}

fn lookup_prefix(secret: &str) -> String {
    secret.chars().take(PREFIX_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minted_key_verifies_to_owner() {
        let store = MemoryKeyStore::new(Some("pepper"));
        let minted = store.mint("alice").unwrap();

        assert!(minted.api_key.starts_with("sk_"));
        assert_eq!(minted.api_key.len(), 3 + 64);
        assert_eq!(store.verify(&minted.api_key).unwrap(), "alice");
    }

    #[test]
    fn test_unknown_and_oversized_keys_rejected() {
        let store = MemoryKeyStore::new(None);
        store.mint("bob").unwrap();

        assert!(matches!(store.verify("sk_nope"), Err(ServiceError::Unauthorized)));
        assert!(matches!(store.verify(""), Err(ServiceError::Unauthorized)));
        let huge = "x".repeat(MAX_KEY_LEN + 1);
        assert!(matches!(store.verify(&huge), Err(ServiceError::Unauthorized)));
    }

    #[test]
    fn test_shared_prefix_keys_are_distinguished() {
        let store = MemoryKeyStore::new(Some("p"));
        store.insert("sk_aaaaaaaaa-one", "one").unwrap();
        store.insert("sk_aaaaaaaaa-two", "two").unwrap();

        assert_eq!(store.verify("sk_aaaaaaaaa-two").unwrap(), "two");
        assert_eq!(store.verify("sk_aaaaaaaaa-one").unwrap(), "one");
        assert!(store.verify("sk_aaaaaaaaa-three").is_err());
    }

    #[test]
    fn test_revoked_key_rejected() {
        let store = MemoryKeyStore::new(Some("p"));
        let minted = store.mint("carol").unwrap();
        assert!(store.revoke(&minted.api_key));
        assert!(store.verify(&minted.api_key).is_err());
        assert!(!store.revoke(&minted.api_key));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_digest_depends_on_pepper() {
        let a = MemoryKeyStore::new(Some("one"));
        let b = MemoryKeyStore::new(Some("two"));
        assert_ne!(a.digest("sk_x").unwrap(), b.digest("sk_x").unwrap());
    }
}
