//! nodegate - exit-node fleet registry and proxy gateway
//!
//! Exit nodes keep a control connection to the gateway and are indexed by
//! country, city and ASN. Customers connect over HTTP or SOCKS5, and each
//! session is relayed through a reverse tunnel to a node that matches their
//! targeting.
//!
//! # Architecture
//!
//! ```text
//!  exit nodes                                        clients
//!      |                                                |
//! +----v-----+    +-----------+              +----------v---------+
//! |   hub/   +--->| registry/ |              |  inbound/ (HTTP,   |
//! | (control,|    +-----+-----+              |  SOCKS5, session)  |
//! |  tunnels)|          |                    +----+----------+----+
//! +----^-----+    +-----v------------------+      |          |
//!      |          | pool/ index -> warm -> |<-----+     +----v----+
//!      +----------+  tunnel, sticky        |            |  auth/  |
//!                 +------------------------+            +---------+
//!
//!            statistic/ observes every session     api/ exposes status
//! ```

pub mod api;
pub mod auth;
pub mod common;
pub mod config;
pub mod hub;
pub mod inbound;
pub mod pool;
pub mod registry;
pub mod statistic;

pub use common::error::{Error, Result};
pub use config::Config;

use auth::Authenticator;
use futures::future::join_all;
use hub::NodeHub;
use inbound::{HttpListener, InboundListener, SessionCore, Socks5Listener};
use pool::{NodeIndex, StickySessions, TunnelPool, WarmPool};
use registry::{NodeRegistry, RegistryEvent};
use statistic::MetricsCollector;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);
/// Time allowed for aborted relays and background loops to unwind
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Gateway instance owning every component
pub struct Gateway {
    config: Config,
    registry: Arc<NodeRegistry>,
    hub: Arc<NodeHub>,
    warm: Arc<WarmPool>,
    tunnels: Arc<TunnelPool>,
    sticky: Arc<StickySessions>,
    metrics: Arc<MetricsCollector>,
    core: Arc<SessionCore>,
}

impl Gateway {
    /// Wire all components from configuration. Nothing is bound or spawned yet.
    pub fn new(config: Config) -> Result<Self> {
        info!("initializing nodegate v{}", VERSION);

        let registry = Arc::new(NodeRegistry::new(config.registry.inactive_timeout()));
        let hub = Arc::new(NodeHub::new(registry.clone(), config.hub.clone()));
        let index = Arc::new(NodeIndex::new(registry.clone()));
        let warm = Arc::new(WarmPool::new(
            index.clone(),
            hub.clone(),
            config.warm_pool.clone(),
        ));
        let tunnels = Arc::new(TunnelPool::new(
            index,
            warm.clone(),
            hub.clone(),
            config.tunnel_pool.clone(),
        ));
        let sticky = Arc::new(StickySessions::new(config.sticky.ttl()));
        let metrics = Arc::new(MetricsCollector::new());

        let usage = auth::usage::from_config(&config.usage)?;
        let authenticator = Arc::new(Authenticator::from_config(&config.auth, usage)?);
        info!(
            keys = config.auth.keys.len(),
            ip_bindings = config.auth.ip_bindings.len(),
            usage = ?config.usage.mode,
            "authenticator ready"
        );

        let core = Arc::new(SessionCore::new(
            authenticator,
            registry.clone(),
            tunnels.clone(),
            sticky.clone(),
            metrics.clone(),
            config.inbound.max_sessions,
        ));

        Ok(Gateway {
            config,
            registry,
            hub,
            warm,
            tunnels,
            sticky,
            metrics,
            core,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<NodeHub> {
        &self.hub
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    pub fn tunnels(&self) -> &Arc<TunnelPool> {
        &self.tunnels
    }

    /// Bind every listener and start the background loops
    pub async fn start(&self) -> Result<RunningGateway> {
        let controller: Option<SocketAddr> = match &self.config.external_controller {
            Some(addr) => Some(addr.parse().map_err(|_| {
                Error::config(format!("invalid external-controller address: {}", addr))
            })?),
            None => None,
        };

        // bind first: a failed bind must leave nothing running
        let control = TcpListener::bind(&self.config.hub.listen).await?;
        let tunnel_listener = TcpListener::bind(&self.config.hub.tunnel_listen).await?;
        let http = match &self.config.inbound.http {
            Some(cfg) => Some(TcpListener::bind(&cfg.listen).await?),
            None => None,
        };
        let socks = match &self.config.inbound.socks {
            Some(cfg) => Some(TcpListener::bind(&cfg.listen).await?),
            None => None,
        };
        let api_listener = match controller {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };

        let hub_addr = control.local_addr()?;
        let tunnel_addr = tunnel_listener.local_addr()?;
        let http_addr = http.as_ref().map(TcpListener::local_addr).transpose()?;
        let socks_addr = socks.as_ref().map(TcpListener::local_addr).transpose()?;
        let api_addr = api_listener.as_ref().map(TcpListener::local_addr).transpose()?;

        let listeners = CancellationToken::new();
        let background = CancellationToken::new();
        let mut tasks = Vec::new();

        // background loops
        tasks.push(
            self.registry
                .spawn_sweeper(self.config.registry.sweep_interval(), background.clone()),
        );
        tasks.push(self.hub.spawn_eviction_watcher(background.clone()));
        tasks.push(self.warm.start(background.clone()));
        tasks.push(self.tunnels.start(background.clone()));
        tasks.push(self.sticky.spawn_purger(MAINTENANCE_INTERVAL, background.clone()));
        tasks.push(self.metrics.start_ticker(background.clone()));
        tasks.push(self.spawn_maintenance(background.clone()));

        // node side
        tasks.push(tokio::spawn(self.hub.clone().serve(control, background.clone())));
        tasks.push(tokio::spawn(
            self.hub.clone().serve_tunnels(tunnel_listener, background.clone()),
        ));

        // client side
        if let Some(listener) = http {
            tasks.push(spawn_inbound(
                Arc::new(HttpListener::new(self.core.clone())),
                listener,
                listeners.clone(),
            ));
        }
        if let Some(listener) = socks {
            tasks.push(spawn_inbound(
                Arc::new(Socks5Listener::new(self.core.clone())),
                listener,
                listeners.clone(),
            ));
        }

        if let Some(listener) = api_listener {
            let state = self.app_state();
            let cancel = background.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = api::start_server(state, listener, cancel).await {
                    warn!("status API error: {}", e);
                }
            }));
        }

        info!(
            hub = %hub_addr,
            tunnels = %tunnel_addr,
            http = ?http_addr,
            socks = ?socks_addr,
            api = ?api_addr,
            "gateway started"
        );

        Ok(RunningGateway {
            hub_addr,
            tunnel_addr,
            http_addr,
            socks_addr,
            api_addr,
            core: self.core.clone(),
            grace: Duration::from_secs(self.config.shutdown_grace_secs),
            listeners,
            background,
            tasks,
        })
    }

    /// Start, wait for Ctrl-C, then shut down gracefully
    pub async fn run(&self) -> Result<()> {
        let running = self.start().await?;
        tokio::signal::ctrl_c().await?;
        info!("received shutdown signal");
        running.shutdown().await;
        Ok(())
    }

    fn app_state(&self) -> api::AppState {
        api::AppState {
            secret: self.config.secret.clone().unwrap_or_default(),
            registry: self.registry.clone(),
            hub: self.hub.clone(),
            warm: self.warm.clone(),
            tunnels: self.tunnels.clone(),
            metrics: self.metrics.clone(),
            started_at: Instant::now(),
        }
    }

    /// Drop per-node counters of removed nodes and expired credential cache entries
    fn spawn_maintenance(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let metrics = self.metrics.clone();
        let authenticator = self.core.authenticator().clone();
        let mut events = self.registry.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => authenticator.purge_cache(),
                    event = events.recv() => match event {
                        Ok(RegistryEvent::Removed { node_id, .. }) => metrics.forget_node(&node_id),
                        Ok(RegistryEvent::Registered { .. }) => {}
                        Err(RecvError::Lagged(n)) => debug!(skipped = n, "maintenance lagged behind registry events"),
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        })
    }
}

fn spawn_inbound(
    inbound: Arc<dyn InboundListener>,
    listener: TcpListener,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let name = inbound.name();
        if let Err(e) = inbound.serve(listener, cancel).await {
            warn!("{} listener error: {}", name, e);
        }
    })
}

/// A started gateway and the addresses it bound
pub struct RunningGateway {
    pub hub_addr: SocketAddr,
    pub tunnel_addr: SocketAddr,
    pub http_addr: Option<SocketAddr>,
    pub socks_addr: Option<SocketAddr>,
    pub api_addr: Option<SocketAddr>,
    core: Arc<SessionCore>,
    grace: Duration,
    listeners: CancellationToken,
    background: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningGateway {
    /// Stop accepting clients, drain sessions for the grace period, abort
    /// whatever is left, then stop the node side and background loops.
    pub async fn shutdown(self) {
        self.listeners.cancel();

        let tracker = self.core.tracker();
        tracker.close();
        info!(
            sessions = tracker.len(),
            grace_secs = self.grace.as_secs(),
            "draining client sessions"
        );
        if tokio::time::timeout(self.grace, tracker.wait()).await.is_err() {
            warn!(remaining = tracker.len(), "grace period expired, closing remaining sessions");
            self.core.force_token().cancel();
            if tokio::time::timeout(STOP_TIMEOUT, tracker.wait()).await.is_err() {
                warn!(remaining = tracker.len(), "sessions still open after force close");
            }
        }

        self.background.cancel();
        if tokio::time::timeout(STOP_TIMEOUT, join_all(self.tasks)).await.is_err() {
            warn!("background tasks did not stop in time");
        }
        info!("gateway stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ListenerConfig;

    fn local_config() -> Config {
        let mut config = Config::default();
        config.hub.listen = "127.0.0.1:0".to_string();
        config.hub.tunnel_listen = "127.0.0.1:0".to_string();
        config.inbound.http = Some(ListenerConfig {
            listen: "127.0.0.1:0".to_string(),
        });
        config.inbound.socks = Some(ListenerConfig {
            listen: "127.0.0.1:0".to_string(),
        });
        config.external_controller = Some("127.0.0.1:0".to_string());
        config.shutdown_grace_secs = 1;
        config
    }

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_new_with_defaults() {
        let gateway = Gateway::new(Config::default()).unwrap();
        assert!(gateway.registry().is_empty());
        assert_eq!(gateway.hub().connected_count(), 0);
        assert_eq!(gateway.metrics().session_count(), 0);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let gateway = Gateway::new(local_config()).unwrap();
        let running = gateway.start().await.unwrap();
        assert_ne!(running.hub_addr.port(), 0);
        assert!(running.http_addr.is_some());
        assert!(running.socks_addr.is_some());
        let api = running.api_addr.unwrap();

        // listeners are reachable
        tokio::net::TcpStream::connect(api).await.unwrap();
        tokio::net::TcpStream::connect(running.http_addr.unwrap())
            .await
            .unwrap();

        let http = running.http_addr.unwrap();
        running.shutdown().await;
        assert!(tokio::net::TcpStream::connect(http).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_controller_address() {
        let mut config = local_config();
        config.external_controller = Some("not an address".to_string());
        let gateway = Gateway::new(config).unwrap();
        assert!(matches!(gateway.start().await, Err(Error::Config(_))));
    }
}
