//! Configuration module

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::fs;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Node control channel and reverse tunnel listeners
    pub hub: HubConfig,

    /// Node lifecycle timing
    pub registry: RegistryConfig,

    /// Pre-probed node subset
    pub warm_pool: WarmPoolConfig,

    /// Pre-dialed tunnels
    pub tunnel_pool: TunnelPoolConfig,

    /// Sticky session affinity
    pub sticky: StickyConfig,

    /// Client-facing proxy listeners
    pub inbound: InboundConfig,

    /// Customer credentials
    pub auth: AuthConfig,

    /// Usage and quota collaborator
    pub usage: UsageConfig,

    /// Log level
    pub log_level: Option<String>,

    /// External controller address
    pub external_controller: Option<String>,

    /// External controller secret
    pub secret: Option<String>,

    /// Grace period for in-flight sessions on shutdown
    pub shutdown_grace_secs: u64,
}

impl Config {
    /// Load configuration from file (synchronous)
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from file (async)
    pub async fn load_async<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        Self::from_str(&content)
    }

    /// Load from string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.registry.heartbeat_interval_secs == 0 {
            return Err(Error::config("registry.heartbeat-interval-secs must be > 0"));
        }
        if self.registry.inactive_timeout_secs <= self.registry.heartbeat_interval_secs {
            return Err(Error::config(
                "registry.inactive-timeout-secs must exceed the heartbeat interval",
            ));
        }
        if self.registry.sweep_interval_secs == 0 {
            return Err(Error::config("registry.sweep-interval-secs must be > 0"));
        }
        if self.warm_pool.refresh_interval_secs == 0 || self.tunnel_pool.fill_interval_secs == 0 {
            return Err(Error::config("background loop intervals must be > 0"));
        }
        if self.tunnel_pool.max_dial_attempts == 0 {
            return Err(Error::config("tunnel-pool.max-dial-attempts must be > 0"));
        }

        for key in &self.auth.keys {
            key.validate()?;
        }
        for (ip, customer) in &self.auth.ip_bindings {
            ip.parse::<std::net::IpAddr>()
                .map_err(|_| Error::config(format!("invalid ip-binding address: {}", ip)))?;
            if !self.auth.keys.iter().any(|k| &k.customer_id == customer) {
                return Err(Error::config(format!(
                    "ip-binding {} references unknown customer {}",
                    ip, customer
                )));
            }
        }

        if self.usage.mode == UsageMode::Remote && self.usage.endpoint.is_none() {
            return Err(Error::config("usage.endpoint is required in remote mode"));
        }

        Ok(())
    }

    /// Save configuration to file
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content).await?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            hub: HubConfig::default(),
            registry: RegistryConfig::default(),
            warm_pool: WarmPoolConfig::default(),
            tunnel_pool: TunnelPoolConfig::default(),
            sticky: StickyConfig::default(),
            inbound: InboundConfig::default(),
            auth: AuthConfig::default(),
            usage: UsageConfig::default(),
            log_level: Some("info".to_string()),
            external_controller: None,
            secret: None,
            shutdown_grace_secs: 10,
        }
    }
}

/// Node control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct HubConfig {
    /// Control channel listen address
    pub listen: String,

    /// Reverse tunnel listen address
    pub tunnel_listen: String,

    /// Time allowed for the first `register` message
    pub handshake_timeout_secs: u64,

    /// Maximum control message size in bytes
    pub max_message_bytes: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        HubConfig {
            listen: "0.0.0.0:9000".to_string(),
            tunnel_listen: "0.0.0.0:9001".to_string(),
            handshake_timeout_secs: 10,
            max_message_bytes: 64 * 1024,
        }
    }
}

impl HubConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RegistryConfig {
    pub heartbeat_interval_secs: u64,
    pub inactive_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            heartbeat_interval_secs: 30,
            inactive_timeout_secs: 90,
            sweep_interval_secs: 15,
        }
    }
}

impl RegistryConfig {
    pub fn inactive_timeout(&self) -> Duration {
        Duration::from_secs(self.inactive_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct WarmPoolConfig {
    /// Number of nodes kept probed and ready
    pub target_size: usize,
    pub refresh_interval_secs: u64,
    pub probe_timeout_ms: u64,
    pub probe_concurrency: usize,
}

impl Default for WarmPoolConfig {
    fn default() -> Self {
        WarmPoolConfig {
            target_size: 200,
            refresh_interval_secs: 10,
            probe_timeout_ms: 5000,
            probe_concurrency: 32,
        }
    }
}

impl WarmPoolConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TunnelPoolConfig {
    /// Idle tunnels kept per warm node
    pub idle_per_node: usize,
    /// Idle tunnels kept overall
    pub max_idle_total: usize,
    pub fill_interval_secs: u64,
    pub fill_concurrency: usize,
    /// Idle tunnels older than this are closed instead of handed out
    pub max_idle_secs: u64,
    pub dial_timeout_ms: u64,
    /// Distinct nodes tried by one synchronous acquire
    pub max_dial_attempts: usize,
}

impl Default for TunnelPoolConfig {
    fn default() -> Self {
        TunnelPoolConfig {
            idle_per_node: 1,
            max_idle_total: 50,
            fill_interval_secs: 5,
            fill_concurrency: 10,
            max_idle_secs: 120,
            dial_timeout_ms: 8000,
            max_dial_attempts: 3,
        }
    }
}

impl TunnelPoolConfig {
    pub fn fill_interval(&self) -> Duration {
        Duration::from_secs(self.fill_interval_secs)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StickyConfig {
    pub ttl_secs: u64,
}

impl Default for StickyConfig {
    fn default() -> Self {
        StickyConfig { ttl_secs: 30 * 60 }
    }
}

impl StickyConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Inbound configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "kebab-case")]
pub struct InboundConfig {
    /// HTTP proxy listen address
    pub http: Option<ListenerConfig>,

    /// SOCKS5 proxy listen address
    pub socks: Option<ListenerConfig>,

    /// Concurrent client session cap (unbounded when absent)
    pub max_sessions: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// Listen address
    pub listen: String,
}

impl ListenerConfig {
    /// Get port from listen address
    pub fn port(&self) -> Option<u16> {
        self.listen.rsplit(':').next().and_then(|p| p.parse().ok())
    }
}

/// Customer credential configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AuthConfig {
    /// Positive lookups are cached this long
    pub cache_ttl_secs: u64,

    pub keys: Vec<ApiKeyConfig>,

    /// Source IP -> customer ID, for SOCKS5 clients that skip user/pass
    pub ip_bindings: HashMap<String, String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            cache_ttl_secs: 60,
            keys: Vec::new(),
            ip_bindings: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ApiKeyConfig {
    pub customer_id: String,

    /// Plaintext key, hashed at load
    pub key: Option<String>,

    /// Hex SHA-256 of the key
    pub key_sha256: Option<String>,

    #[serde(default = "default_true")]
    pub active: bool,

    pub plan: Option<String>,
}

impl ApiKeyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.customer_id.is_empty() {
            return Err(Error::config("auth key customer-id cannot be empty"));
        }
        if self.customer_id.contains(':') {
            return Err(Error::config("auth key customer-id cannot contain ':'"));
        }
        match (&self.key, &self.key_sha256) {
            (None, None) => Err(Error::config(format!(
                "auth key for {} needs key or key-sha256",
                self.customer_id
            ))),
            (_, Some(digest)) if digest.len() != 64 || hex::decode(digest).is_err() => {
                Err(Error::config(format!(
                    "auth key-sha256 for {} is not a hex SHA-256 digest",
                    self.customer_id
                )))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UsageMode {
    #[default]
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct UsageConfig {
    pub mode: UsageMode,

    /// Base URL of the usage service in remote mode
    pub endpoint: Option<String>,

    pub timeout_ms: u64,

    /// Byte allowance for customers without an override (unlimited when absent)
    pub default_limit_bytes: Option<u64>,

    /// Per-customer byte allowance
    pub limits: HashMap<String, u64>,
}

impl Default for UsageConfig {
    fn default() -> Self {
        UsageConfig {
            mode: UsageMode::Local,
            endpoint: None,
            timeout_ms: 3000,
            default_limit_bytes: None,
            limits: HashMap::new(),
        }
    }
}

fn default_true() -> bool {
    true
}
