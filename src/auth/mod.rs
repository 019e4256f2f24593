//! Customer authentication and quota gate
//!
//! A client presents a [`Credential`]. The key is hashed, looked up in a
//! [`CredentialStore`] (positive answers are cached), and the customer's quota
//! is asked from a [`UsageTracker`] on every session.

mod credential;
mod store;
pub mod usage;

pub use credential::{Credential, SessionType, Targeting};
pub use store::{hash_key, CredentialStore, KeyDigest, KeyRecord, MemoryCredentialStore};
pub use usage::{LocalUsageTracker, QuotaVerdict, RemoteUsageTracker, UsageRecord, UsageTracker};

use crate::config::AuthConfig;
use crate::{Error, Result};
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Outcome of a successful authentication
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub customer_id: String,
    pub targeting: Targeting,
    pub plan: Option<String>,
    pub quota: QuotaVerdict,
}

struct CachedKey {
    expires: Instant,
    plan: Option<String>,
}

pub struct Authenticator {
    store: Arc<dyn CredentialStore>,
    usage: Arc<dyn UsageTracker>,
    cache: DashMap<(String, KeyDigest), CachedKey>,
    cache_ttl: Duration,
    ip_bindings: HashMap<IpAddr, String>,
}

impl Authenticator {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        usage: Arc<dyn UsageTracker>,
        cache_ttl: Duration,
    ) -> Self {
        Authenticator {
            store,
            usage,
            cache: DashMap::new(),
            cache_ttl,
            ip_bindings: HashMap::new(),
        }
    }

    pub fn from_config(config: &AuthConfig, usage: Arc<dyn UsageTracker>) -> Result<Self> {
        let store = Arc::new(MemoryCredentialStore::from_config(config)?);
        let mut auth = Self::new(store, usage, Duration::from_secs(config.cache_ttl_secs));
        for (ip, customer) in &config.ip_bindings {
            let ip: IpAddr = ip
                .parse()
                .map_err(|_| Error::config(format!("invalid ip binding address: {}", ip)))?;
            auth.ip_bindings.insert(ip, customer.clone());
        }
        Ok(auth)
    }

    pub fn with_ip_binding(mut self, ip: IpAddr, customer_id: &str) -> Self {
        self.ip_bindings.insert(ip, customer_id.to_string());
        self
    }

    pub fn usage(&self) -> &Arc<dyn UsageTracker> {
        &self.usage
    }

    /// Customer bound to a client source address
    pub fn bound_customer(&self, ip: IpAddr) -> Option<&str> {
        self.ip_bindings.get(&ip).map(String::as_str)
    }

    /// Verify a credential and check the customer's quota
    pub async fn authenticate(&self, credential: &Credential) -> Result<AuthContext> {
        let digest = hash_key(&credential.api_key);
        let plan = self.verify_key(&credential.customer_id, digest).await?;
        let quota = self.check_quota(&credential.customer_id).await?;
        Ok(AuthContext {
            customer_id: credential.customer_id.clone(),
            targeting: credential.targeting.clone(),
            plan,
            quota,
        })
    }

    /// Authenticate by source address alone
    pub async fn authenticate_ip(&self, ip: IpAddr) -> Result<AuthContext> {
        let customer_id = self
            .bound_customer(ip)
            .ok_or_else(|| Error::auth(format!("no credential bound to {}", ip)))?
            .to_string();
        let active = self
            .store
            .customer_active(&customer_id)
            .await
            .map_err(|e| Error::internal(format!("credential store: {}", e)))?;
        if !active {
            return Err(Error::auth(format!("customer {} is inactive", customer_id)));
        }
        let quota = self.check_quota(&customer_id).await?;
        Ok(AuthContext {
            customer_id,
            targeting: Targeting::default(),
            plan: None,
            quota,
        })
    }

    /// Drop expired cache entries
    pub fn purge_cache(&self) {
        let now = Instant::now();
        self.cache.retain(|_, cached| cached.expires > now);
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    async fn verify_key(&self, customer_id: &str, digest: KeyDigest) -> Result<Option<String>> {
        let cache_key = (customer_id.to_string(), digest);
        if let Some(cached) = self.cache.get(&cache_key) {
            if cached.expires > Instant::now() {
                return Ok(cached.plan.clone());
            }
        }

        let record = self
            .store
            .find(customer_id, &digest)
            .await
            .map_err(|e| Error::internal(format!("credential store: {}", e)))?;
        let record = match record {
            Some(r) if r.active => r,
            Some(_) => {
                self.cache.remove(&cache_key);
                return Err(Error::auth(format!("key for {} is inactive", customer_id)));
            }
            None => {
                self.cache.remove(&cache_key);
                return Err(Error::auth(format!("unknown key for {}", customer_id)));
            }
        };

        debug!(customer = %customer_id, "credential verified");
        if !self.cache_ttl.is_zero() {
            self.cache.insert(
                cache_key,
                CachedKey {
                    expires: Instant::now() + self.cache_ttl,
                    plan: record.plan.clone(),
                },
            );
        }
        Ok(record.plan)
    }

    async fn check_quota(&self, customer_id: &str) -> Result<QuotaVerdict> {
        let verdict = match self.usage.check_quota(customer_id).await {
            Ok(v) => v,
            Err(e) => {
                warn!(customer = %customer_id, error = %e, "quota check failed");
                return Err(Error::internal(format!("quota check failed: {}", e)));
            }
        };
        if !verdict.allowed {
            return Err(Error::quota(format!(
                "customer {} is over its plan limit ({:.0}%)",
                customer_id, verdict.used_percent
            )));
        }
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        inner: MemoryCredentialStore,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl CredentialStore for CountingStore {
        async fn find(&self, customer_id: &str, digest: &KeyDigest) -> Result<Option<KeyRecord>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.find(customer_id, digest).await
        }

        async fn customer_active(&self, customer_id: &str) -> Result<bool> {
            self.inner.customer_active(customer_id).await
        }
    }

    struct FailingUsage;

    #[async_trait]
    impl UsageTracker for FailingUsage {
        async fn check_quota(&self, _customer_id: &str) -> Result<QuotaVerdict> {
            Err(Error::internal("usage service down"))
        }

        async fn record(&self, _record: UsageRecord) -> Result<()> {
            Ok(())
        }
    }

    fn records() -> Vec<KeyRecord> {
        vec![
            KeyRecord {
                customer_id: "acme".into(),
                digest: hash_key("good"),
                active: true,
                plan: Some("pro".into()),
            },
            KeyRecord {
                customer_id: "acme".into(),
                digest: hash_key("revoked"),
                active: false,
                plan: None,
            },
        ]
    }

    fn authenticator(usage: Arc<dyn UsageTracker>) -> (Authenticator, Arc<CountingStore>) {
        let store = Arc::new(CountingStore {
            inner: MemoryCredentialStore::new(records()),
            lookups: AtomicUsize::new(0),
        });
        let auth = Authenticator::new(store.clone(), usage, Duration::from_secs(60));
        (auth, store)
    }

    fn unlimited() -> Arc<dyn UsageTracker> {
        Arc::new(LocalUsageTracker::new(None, HashMap::new()))
    }

    #[tokio::test]
    async fn test_valid_key() {
        let (auth, _) = authenticator(unlimited());
        let cred = Credential::parse("acme", "good-country-us").unwrap();
        let ctx = auth.authenticate(&cred).await.unwrap();
        assert_eq!(ctx.customer_id, "acme");
        assert_eq!(ctx.plan.as_deref(), Some("pro"));
        assert_eq!(ctx.targeting.country.as_deref(), Some("US"));
        assert!(ctx.quota.allowed);
    }

    #[tokio::test]
    async fn test_unknown_and_inactive_keys() {
        let (auth, _) = authenticator(unlimited());
        let err = auth
            .authenticate(&Credential::parse("acme", "bad").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthFailure(_)));

        let err = auth
            .authenticate(&Credential::parse("acme", "revoked").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthFailure(_)));
        assert_eq!(auth.cached_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_positive_cache_expires() {
        let (auth, store) = authenticator(unlimited());
        let cred = Credential::parse("acme", "good").unwrap();

        auth.authenticate(&cred).await.unwrap();
        auth.authenticate(&cred).await.unwrap();
        assert_eq!(store.lookups.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        auth.authenticate(&cred).await.unwrap();
        assert_eq!(store.lookups.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        auth.purge_cache();
        assert_eq!(auth.cached_len(), 0);
    }

    #[tokio::test]
    async fn test_quota_exceeded() {
        let tracker = Arc::new(LocalUsageTracker::new(Some(100), HashMap::new()));
        tracker
            .record(UsageRecord {
                customer_id: "acme".into(),
                bytes: 100,
                request_count: 1,
                success: true,
                country: None,
                node_id: None,
            })
            .await
            .unwrap();
        let (auth, _) = authenticator(tracker);
        let err = auth
            .authenticate(&Credential::parse("acme", "good").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn test_usage_failure_is_internal() {
        let (auth, _) = authenticator(Arc::new(FailingUsage));
        let err = auth
            .authenticate(&Credential::parse("acme", "good").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn test_ip_binding() {
        let (auth, _) = authenticator(unlimited());
        let auth = auth.with_ip_binding("10.0.0.1".parse().unwrap(), "acme");

        let ctx = auth.authenticate_ip("10.0.0.1".parse().unwrap()).await.unwrap();
        assert_eq!(ctx.customer_id, "acme");

        let err = auth
            .authenticate_ip("10.0.0.2".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthFailure(_)));
    }
}
