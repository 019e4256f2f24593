//! Usage accounting and quota verdicts

use crate::config::{UsageConfig, UsageMode};
use crate::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Answer to "may this customer open another session"
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotaVerdict {
    pub allowed: bool,
    #[serde(default)]
    pub used_percent: f64,
}

impl QuotaVerdict {
    pub fn unlimited() -> Self {
        QuotaVerdict {
            allowed: true,
            used_percent: 0.0,
        }
    }
}

/// One finished session as reported to the usage service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub customer_id: String,
    pub bytes: u64,
    pub request_count: u64,
    pub success: bool,
    pub country: Option<String>,
    pub node_id: Option<String>,
}

#[async_trait]
pub trait UsageTracker: Send + Sync {
    async fn check_quota(&self, customer_id: &str) -> Result<QuotaVerdict>;

    async fn record(&self, record: UsageRecord) -> Result<()>;
}

/// Build the tracker selected by `usage.mode`
pub fn from_config(config: &UsageConfig) -> Result<Arc<dyn UsageTracker>> {
    match config.mode {
        UsageMode::Local => Ok(Arc::new(LocalUsageTracker::from_config(config))),
        UsageMode::Remote => {
            let endpoint = config
                .endpoint
                .as_deref()
                .ok_or_else(|| Error::config("usage.endpoint is required in remote mode"))?;
            Ok(Arc::new(RemoteUsageTracker::new(
                endpoint,
                Duration::from_millis(config.timeout_ms),
            )?))
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CustomerUsage {
    pub bytes: u64,
    pub requests: u64,
    pub failures: u64,
}

/// In-process byte allowances
pub struct LocalUsageTracker {
    default_limit: Option<u64>,
    limits: HashMap<String, u64>,
    usage: DashMap<String, CustomerUsage>,
}

impl LocalUsageTracker {
    pub fn new(default_limit: Option<u64>, limits: HashMap<String, u64>) -> Self {
        LocalUsageTracker {
            default_limit,
            limits,
            usage: DashMap::new(),
        }
    }

    pub fn from_config(config: &UsageConfig) -> Self {
        Self::new(config.default_limit_bytes, config.limits.clone())
    }

    pub fn usage(&self, customer_id: &str) -> CustomerUsage {
        self.usage
            .get(customer_id)
            .map(|u| *u)
            .unwrap_or_default()
    }

    fn limit(&self, customer_id: &str) -> Option<u64> {
        self.limits.get(customer_id).copied().or(self.default_limit)
    }
}

#[async_trait]
impl UsageTracker for LocalUsageTracker {
    async fn check_quota(&self, customer_id: &str) -> Result<QuotaVerdict> {
        let Some(limit) = self.limit(customer_id) else {
            return Ok(QuotaVerdict::unlimited());
        };
        let used = self.usage(customer_id).bytes;
        if limit == 0 {
            return Ok(QuotaVerdict {
                allowed: false,
                used_percent: 100.0,
            });
        }
        Ok(QuotaVerdict {
            allowed: used < limit,
            used_percent: (used as f64 / limit as f64 * 100.0).min(100.0),
        })
    }

    async fn record(&self, record: UsageRecord) -> Result<()> {
        let mut entry = self.usage.entry(record.customer_id).or_default();
        entry.bytes = entry.bytes.saturating_add(record.bytes);
        entry.requests = entry.requests.saturating_add(record.request_count);
        if !record.success {
            entry.failures += 1;
        }
        Ok(())
    }
}

/// Usage service reached over HTTP
pub struct RemoteUsageTracker {
    client: reqwest::Client,
    endpoint: String,
}

impl RemoteUsageTracker {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("usage client: {}", e)))?;
        Ok(RemoteUsageTracker {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl UsageTracker for RemoteUsageTracker {
    async fn check_quota(&self, customer_id: &str) -> Result<QuotaVerdict> {
        let url = format!(
            "{}/quota/{}",
            self.endpoint,
            urlencoding::encode(customer_id)
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::internal(format!("quota check failed: {}", e)))?;
        resp.json::<QuotaVerdict>()
            .await
            .map_err(|e| Error::internal(format!("bad quota response: {}", e)))
    }

    async fn record(&self, record: UsageRecord) -> Result<()> {
        let url = format!("{}/usage", self.endpoint);
        debug!(customer = %record.customer_id, bytes = record.bytes, "reporting usage");
        self.client
            .post(&url)
            .json(&record)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| Error::internal(format!("usage report failed: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(customer: &str, bytes: u64, success: bool) -> UsageRecord {
        UsageRecord {
            customer_id: customer.into(),
            bytes,
            request_count: 1,
            success,
            country: Some("US".into()),
            node_id: Some("n1".into()),
        }
    }

    #[tokio::test]
    async fn test_unlimited_without_limits() {
        let tracker = LocalUsageTracker::new(None, HashMap::new());
        tracker.record(record("acme", 1 << 40, true)).await.unwrap();
        assert_eq!(
            tracker.check_quota("acme").await.unwrap(),
            QuotaVerdict::unlimited()
        );
    }

    #[tokio::test]
    async fn test_limit_exhaustion() {
        let mut limits = HashMap::new();
        limits.insert("acme".to_string(), 1000);
        let tracker = LocalUsageTracker::new(Some(10), limits);

        let v = tracker.check_quota("acme").await.unwrap();
        assert!(v.allowed);
        assert_eq!(v.used_percent, 0.0);

        tracker.record(record("acme", 500, true)).await.unwrap();
        let v = tracker.check_quota("acme").await.unwrap();
        assert!(v.allowed);
        assert_eq!(v.used_percent, 50.0);

        tracker.record(record("acme", 500, false)).await.unwrap();
        let v = tracker.check_quota("acme").await.unwrap();
        assert!(!v.allowed);
        assert_eq!(v.used_percent, 100.0);

        let u = tracker.usage("acme");
        assert_eq!(u.requests, 2);
        assert_eq!(u.failures, 1);

        // default limit applies to everyone else
        tracker.record(record("beta", 10, true)).await.unwrap();
        assert!(!tracker.check_quota("beta").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_zero_limit_blocks() {
        let tracker = LocalUsageTracker::new(Some(0), HashMap::new());
        assert!(!tracker.check_quota("acme").await.unwrap().allowed);
    }

    #[test]
    fn test_remote_requires_endpoint() {
        let config = UsageConfig {
            mode: UsageMode::Remote,
            ..Default::default()
        };
        assert!(from_config(&config).is_err());
    }

    #[test]
    fn test_verdict_json() {
        let v: QuotaVerdict = serde_json::from_str(r#"{"allowed":false}"#).unwrap();
        assert!(!v.allowed);
        assert_eq!(v.used_percent, 0.0);
    }
}
