//! API key records

use crate::config::AuthConfig;
use crate::{Error, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use subtle::ConstantTimeEq;

pub type KeyDigest = [u8; 32];

pub fn hash_key(key: &str) -> KeyDigest {
    Sha256::digest(key.as_bytes()).into()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    pub customer_id: String,
    pub digest: KeyDigest,
    pub active: bool,
    pub plan: Option<String>,
}

/// Backing store for customer keys
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Record for `customer_id` whose digest equals `digest`
    async fn find(&self, customer_id: &str, digest: &KeyDigest) -> Result<Option<KeyRecord>>;

    /// Whether the customer holds at least one active key
    async fn customer_active(&self, customer_id: &str) -> Result<bool>;
}

/// Key records loaded from the config file
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    records: HashMap<String, Vec<KeyRecord>>,
}

impl MemoryCredentialStore {
    pub fn new(records: impl IntoIterator<Item = KeyRecord>) -> Self {
        let mut map: HashMap<String, Vec<KeyRecord>> = HashMap::new();
        for record in records {
            map.entry(record.customer_id.clone()).or_default().push(record);
        }
        MemoryCredentialStore { records: map }
    }

    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        let mut records = Vec::with_capacity(config.keys.len());
        for key in &config.keys {
            key.validate()?;
            let digest = match (&key.key_sha256, &key.key) {
                (Some(hex_digest), _) => {
                    let bytes = hex::decode(hex_digest)
                        .map_err(|e| Error::config(format!("bad key-sha256: {}", e)))?;
                    <KeyDigest>::try_from(bytes.as_slice())
                        .map_err(|_| Error::config("key-sha256 must be 32 bytes"))?
                }
                (None, Some(plain)) => hash_key(plain),
                (None, None) => {
                    return Err(Error::config(format!(
                        "auth key for {} needs key or key-sha256",
                        key.customer_id
                    )))
                }
            };
            records.push(KeyRecord {
                customer_id: key.customer_id.clone(),
                digest,
                active: key.active,
                plan: key.plan.clone(),
            });
        }
        Ok(Self::new(records))
    }

    pub fn len(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find(&self, customer_id: &str, digest: &KeyDigest) -> Result<Option<KeyRecord>> {
        let Some(records) = self.records.get(customer_id) else {
            return Ok(None);
        };
        // walk every record so timing does not reveal which one matched
        let mut found = None;
        for record in records {
            if bool::from(record.digest.ct_eq(digest)) && found.is_none() {
                found = Some(record.clone());
            }
        }
        Ok(found)
    }

    async fn customer_active(&self, customer_id: &str) -> Result<bool> {
        Ok(self
            .records
            .get(customer_id)
            .map(|records| records.iter().any(|r| r.active))
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiKeyConfig;

    fn key(customer: &str, plain: Option<&str>, digest: Option<&str>, active: bool) -> ApiKeyConfig {
        ApiKeyConfig {
            customer_id: customer.into(),
            key: plain.map(String::from),
            key_sha256: digest.map(String::from),
            active,
            plan: None,
        }
    }

    #[test]
    fn test_hash_key_is_sha256() {
        assert_eq!(
            hex::encode(hash_key("abc")),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_find_by_plain_and_digest() {
        let config = AuthConfig {
            keys: vec![
                key("acme", Some("k1"), None, true),
                key(
                    "acme",
                    None,
                    Some("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"),
                    true,
                ),
            ],
            ..Default::default()
        };
        let store = MemoryCredentialStore::from_config(&config).unwrap();
        assert_eq!(store.len(), 2);

        assert!(store.find("acme", &hash_key("k1")).await.unwrap().is_some());
        assert!(store.find("acme", &hash_key("abc")).await.unwrap().is_some());
        assert!(store.find("acme", &hash_key("nope")).await.unwrap().is_none());
        assert!(store.find("other", &hash_key("k1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_customer_active() {
        let config = AuthConfig {
            keys: vec![
                key("acme", Some("k1"), None, false),
                key("beta", Some("k2"), None, true),
            ],
            ..Default::default()
        };
        let store = MemoryCredentialStore::from_config(&config).unwrap();
        assert!(!store.customer_active("acme").await.unwrap());
        assert!(store.customer_active("beta").await.unwrap());
        assert!(!store.customer_active("ghost").await.unwrap());
    }

    #[test]
    fn test_reject_bad_digest() {
        let config = AuthConfig {
            keys: vec![key("acme", None, Some("zz"), true)],
            ..Default::default()
        };
        assert!(MemoryCredentialStore::from_config(&config).is_err());
    }
}
