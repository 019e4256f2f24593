//! Routing core shared by the HTTP and SOCKS5 frontends
//!
//! A frontend owns the client protocol. Everything after the handshake goes
//! through [`SessionCore`]: admission, authentication, node selection with one
//! fallback retry, relay, and outcome reporting.

use crate::auth::{AuthContext, Authenticator, Credential, UsageRecord};
use crate::common::net::{relay, wait_closed};
use crate::pool::{ActiveTunnel, Criteria, StickySessions, TunnelPool};
use crate::registry::{NodeRegistry, Protocol, SessionLease};
use crate::statistic::{MetricsCollector, Outcome, SessionPhase, TrackedSession};
use crate::{Error, Result};
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

/// Bound on the client side of a handshake
pub const CLIENT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Tunnel bound to the client's target, plus the load accounting that goes with it
pub struct Connected {
    pub tunnel: ActiveTunnel,
    lease: SessionLease,
    country: Option<String>,
}

impl Connected {
    pub fn node_id(&self) -> &str {
        &self.tunnel.node_id
    }
}

/// How the client proved who it is
pub enum ClientIdentity {
    Credential(Credential),
    /// SOCKS5 no-auth, resolved through `auth.ip-bindings`
    SourceIp(IpAddr),
}

pub struct SessionCore {
    auth: Arc<Authenticator>,
    registry: Arc<NodeRegistry>,
    tunnels: Arc<TunnelPool>,
    sticky: Arc<StickySessions>,
    metrics: Arc<MetricsCollector>,
    limiter: Option<Arc<Semaphore>>,
    tracker: TaskTracker,
    /// Cancelled when the shutdown grace period runs out
    force: CancellationToken,
}

impl SessionCore {
    pub fn new(
        auth: Arc<Authenticator>,
        registry: Arc<NodeRegistry>,
        tunnels: Arc<TunnelPool>,
        sticky: Arc<StickySessions>,
        metrics: Arc<MetricsCollector>,
        max_sessions: Option<usize>,
    ) -> Self {
        SessionCore {
            auth,
            registry,
            tunnels,
            sticky,
            metrics,
            limiter: max_sessions.map(|n| Arc::new(Semaphore::new(n))),
            tracker: TaskTracker::new(),
            force: CancellationToken::new(),
        }
    }

    pub fn authenticator(&self) -> &Arc<Authenticator> {
        &self.auth
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Sessions are spawned here so shutdown can wait for them
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Token that aborts every relay still running
    pub fn force_token(&self) -> CancellationToken {
        self.force.clone()
    }

    /// Start tracking a new client connection
    pub fn begin(&self, frontend: &'static str, peer: SocketAddr) -> Arc<TrackedSession> {
        self.metrics.track(frontend, peer.to_string())
    }

    /// Stop tracking a client connection
    pub fn end(&self, session: &TrackedSession) {
        session.set_phase(SessionPhase::Closed);
        self.metrics.close(&session.id);
    }

    /// Take a slot under `inbound.max-sessions`
    pub fn admit(&self) -> Result<Option<OwnedSemaphorePermit>> {
        match &self.limiter {
            None => Ok(None),
            Some(limiter) => limiter
                .clone()
                .try_acquire_owned()
                .map(Some)
                .map_err(|_| Error::no_available_node("gateway at session capacity")),
        }
    }

    /// Authenticate the client. Failures are recorded before returning.
    pub async fn authenticate(
        &self,
        session: &TrackedSession,
        identity: &ClientIdentity,
    ) -> Result<AuthContext> {
        session.set_phase(SessionPhase::Authenticating);
        let (claimed, result) = match identity {
            ClientIdentity::Credential(c) => {
                (Some(c.customer_id.clone()), self.auth.authenticate(c).await)
            }
            ClientIdentity::SourceIp(ip) => (
                self.auth.bound_customer(*ip).map(String::from),
                self.auth.authenticate_ip(*ip).await,
            ),
        };
        match result {
            Ok(ctx) => {
                session.set_customer(&ctx.customer_id);
                Ok(ctx)
            }
            Err(e) => {
                // only a known customer can be charged for a rejection
                let customer = match &e {
                    Error::QuotaExceeded(_) => claimed.as_deref(),
                    _ => None,
                };
                self.fail(session, customer, None, &e);
                Err(e)
            }
        }
    }

    /// Select a node and bind a tunnel to `host:port`.
    ///
    /// A retryable failure (node gone, tunnel broken) is retried once without
    /// sticky affinity and with the failed node excluded. Gives up early if the
    /// client disconnects. Failures are recorded before returning.
    pub async fn connect(
        &self,
        session: &TrackedSession,
        ctx: &AuthContext,
        protocol: Protocol,
        host: &str,
        port: u16,
        client: &TcpStream,
    ) -> Result<Connected> {
        session.set_phase(SessionPhase::Selecting);
        session.set_target(format!("{}:{}", host, port));

        let result = tokio::select! {
            r = self.select(ctx, protocol, host, port) => r,
            _ = wait_closed(client) => Err(Error::protocol("client closed during node selection")),
        };

        match result {
            Ok(connected) => {
                session.set_node(connected.node_id());
                if let Some(token) = ctx.targeting.sticky_token() {
                    self.sticky.bind(token, connected.node_id());
                }
                Ok(connected)
            }
            Err(e) => {
                self.fail(session, Some(&ctx.customer_id), None, &e);
                Err(e)
            }
        }
    }

    async fn select(
        &self,
        ctx: &AuthContext,
        protocol: Protocol,
        host: &str,
        port: u16,
    ) -> Result<Connected> {
        let mut criteria = ctx.targeting.criteria(protocol);
        if let Some(token) = ctx.targeting.sticky_token() {
            match self.sticky.resolve(token) {
                Some(node) if self.registry.is_active(&node) => criteria = criteria.sticky(&node),
                Some(node) => debug!(token, node_id = %node, "sticky node gone, rebinding"),
                None => {}
            }
        }

        let mut exclude = HashSet::new();
        let (err, failed_node) = match self.attempt(&criteria, &exclude, host, port).await {
            Ok(connected) => return Ok(connected),
            Err(failure) => failure,
        };

        let has_affinity = criteria.sticky_node.is_some();
        let retry = err.is_retryable() || (has_affinity && matches!(err, Error::NoAvailableNode(_)));
        if !retry {
            return Err(err);
        }

        debug!(error = %err, node_id = ?failed_node, "selection failed, retrying without affinity");
        if let Some(node) = failed_node {
            exclude.insert(node);
        }
        match self
            .attempt(&criteria.without_affinity(), &exclude, host, port)
            .await
        {
            Ok(connected) => Ok(connected),
            Err((e, _)) if e.is_retryable() => Err(Error::no_available_node(format!(
                "fallback selection failed: {}",
                e
            ))),
            Err((e, _)) => Err(e),
        }
    }

    /// One acquire-and-activate round. The failing node, if any, rides along.
    async fn attempt(
        &self,
        criteria: &Criteria,
        exclude: &HashSet<String>,
        host: &str,
        port: u16,
    ) -> std::result::Result<Connected, (Error, Option<String>)> {
        let tunnel = self
            .tunnels
            .acquire(criteria, exclude)
            .await
            .map_err(|e| (e, None))?;
        let node_id = tunnel.node_id().to_string();

        let Some(lease) = self.registry.acquire_session(&node_id) else {
            return Err((
                Error::inconsistency(format!("node {} left before handoff", node_id)),
                Some(node_id),
            ));
        };
        let country = self.registry.get(&node_id).map(|n| n.attrs.country);

        let tunnel = tunnel
            .activate(host, port, self.tunnels.dial_timeout())
            .await
            .map_err(|e| (e, Some(node_id.clone())))?;

        Ok(Connected {
            tunnel,
            lease,
            country,
        })
    }

    /// Relay until either side closes, then report the outcome
    pub async fn relay<C>(
        &self,
        session: &Arc<TrackedSession>,
        ctx: &AuthContext,
        client: C,
        connected: Connected,
    ) -> Result<(u64, u64)>
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        session.set_phase(SessionPhase::Relaying);
        let Connected {
            tunnel,
            lease,
            country,
        } = connected;
        let node_id = tunnel.node_id.clone();
        let (stream, in_use) = tunnel.into_parts();
        let observer = Arc::new(self.metrics.observer(session, &node_id));

        let result = tokio::select! {
            r = relay(client, stream, observer) => r.map_err(Error::from),
            _ = self.force.cancelled() => Err(Error::internal("relay aborted at shutdown")),
        };
        drop(in_use);
        drop(lease);

        let (up, down) = (session.upload(), session.download());
        let success = result.is_ok();
        let outcome = if success { Outcome::Success } else { Outcome::Error };
        self.metrics.record_outcome(outcome, Some(&node_id));
        session.set_phase(if success {
            SessionPhase::Closed
        } else {
            SessionPhase::Failed
        });
        self.report_usage(UsageRecord {
            customer_id: ctx.customer_id.clone(),
            bytes: up + down,
            request_count: 1,
            success,
            country,
            node_id: Some(node_id.clone()),
        });

        debug!(
            session = %session.id,
            node_id = %node_id,
            upload = up,
            download = down,
            "relay finished"
        );
        result.map(|_| (up, down))
    }

    /// Release a bound tunnel whose client could not be told it was connected
    pub fn abandon(
        &self,
        session: &TrackedSession,
        ctx: &AuthContext,
        connected: Connected,
        err: &Error,
    ) {
        let node_id = connected.tunnel.node_id.clone();
        drop(connected);
        self.fail(session, Some(&ctx.customer_id), Some(&node_id), err);
    }

    /// Record a session that ended before relaying
    pub fn fail(
        &self,
        session: &TrackedSession,
        customer: Option<&str>,
        node_id: Option<&str>,
        err: &Error,
    ) {
        if !session.set_phase(SessionPhase::Failed) {
            return;
        }
        self.metrics.record_outcome(Outcome::from_error(err), node_id);
        if let Some(customer) = customer {
            self.report_usage(UsageRecord {
                customer_id: customer.to_string(),
                bytes: 0,
                request_count: 1,
                success: false,
                country: None,
                node_id: node_id.map(String::from),
            });
        }
        debug!(session = %session.id, error = %err, "session failed");
    }

    fn report_usage(&self, record: UsageRecord) {
        let usage = self.auth.usage().clone();
        self.tracker.spawn(async move {
            let customer = record.customer_id.clone();
            if let Err(e) = usage.record(record).await {
                warn!(customer = %customer, error = %e, "usage report dropped");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{hash_key, KeyRecord, LocalUsageTracker, MemoryCredentialStore, UsageTracker};
    use crate::config::{TunnelPoolConfig, WarmPoolConfig};
    use crate::pool::{NodeIndex, Prober, TunnelConnector, TunnelStream, WarmPool};
    use crate::registry::NodeAttributes;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    struct Idle;

    #[async_trait]
    impl Prober for Idle {
        async fn probe(&self, _node_id: &str) -> Result<Duration> {
            Err(Error::timeout("no probes in this test"))
        }
    }

    /// Connector whose tunnels behave like a node: accept activation, then echo.
    /// Nodes listed in `broken` hang up during activation.
    struct EchoConnector {
        broken: Mutex<HashSet<String>>,
    }

    #[async_trait]
    impl TunnelConnector for EchoConnector {
        async fn open_tunnel(&self, node_id: &str) -> Result<TunnelStream> {
            let (ours, theirs) = tokio::io::duplex(64 * 1024);
            let broken = self.broken.lock().contains(node_id);
            tokio::spawn(async move {
                let (r, mut w) = tokio::io::split(theirs);
                let mut r = BufReader::new(r);
                let mut line = String::new();
                if r.read_line(&mut line).await.is_err() || broken {
                    return;
                }
                let _ = w.write_all(b"{\"ok\":true}\n").await;
                let mut buf = [0u8; 1024];
                loop {
                    match r.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if w.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
            Ok(Box::new(ours))
        }
    }

    struct Fixture {
        core: SessionCore,
        registry: Arc<NodeRegistry>,
        connector: Arc<EchoConnector>,
        usage: Arc<LocalUsageTracker>,
        sticky: Arc<StickySessions>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(90)));
        let index = Arc::new(NodeIndex::new(registry.clone()));
        let warm = Arc::new(WarmPool::new(
            index.clone(),
            Arc::new(Idle),
            WarmPoolConfig::default(),
        ));
        let connector = Arc::new(EchoConnector {
            broken: Mutex::new(HashSet::new()),
        });
        let tunnels = Arc::new(TunnelPool::new(
            index,
            warm,
            connector.clone(),
            TunnelPoolConfig::default(),
        ));
        let usage = Arc::new(LocalUsageTracker::new(None, HashMap::new()));
        let store = Arc::new(MemoryCredentialStore::new(vec![KeyRecord {
            customer_id: "acme".into(),
            digest: hash_key("k"),
            active: true,
            plan: None,
        }]));
        let auth = Arc::new(Authenticator::new(
            store,
            usage.clone() as Arc<dyn UsageTracker>,
            Duration::from_secs(60),
        ));
        let sticky = Arc::new(StickySessions::new(Duration::from_secs(1800)));
        let core = SessionCore::new(
            auth,
            registry.clone(),
            tunnels,
            sticky.clone(),
            Arc::new(MetricsCollector::new()),
            Some(1),
        );
        Fixture {
            core,
            registry,
            connector,
            usage,
            sticky,
        }
    }

    async fn client_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_full_session_flow() {
        let f = fixture();
        f.registry.upsert("n1", NodeAttributes::new("US", "", 1), 1);

        let session = f.core.begin("socks5", peer());
        let cred = Credential::parse("acme", "k-country-us").unwrap();
        let ctx = f
            .core
            .authenticate(&session, &ClientIdentity::Credential(cred))
            .await
            .unwrap();

        let (mut client, server) = client_pair().await;
        let connected = f
            .core
            .connect(&session, &ctx, Protocol::Socks5, "example.com", 443, &server)
            .await
            .unwrap();
        assert_eq!(connected.node_id(), "n1");
        assert_eq!(f.registry.get("n1").unwrap().sessions, 1);

        let relay = {
            let session = session.clone();
            let ctx = ctx.clone();
            let core = &f.core;
            async move { core.relay(&session, &ctx, server, connected).await }
        };
        let driver = async {
            client.write_all(&[7u8; 1000]).await.unwrap();
            let mut back = vec![0u8; 1000];
            client.read_exact(&mut back).await.unwrap();
            drop(client);
        };
        let (result, _) = tokio::join!(relay, driver);
        assert_eq!(result.unwrap(), (1000, 1000));

        assert_eq!(f.core.metrics().outcomes().success, 1);
        assert_eq!(f.core.metrics().total(), (1000, 1000));
        assert_eq!(f.registry.get("n1").unwrap().sessions, 0);
        assert_eq!(session.phase(), SessionPhase::Closed);

        f.core.tracker().close();
        f.core.tracker().wait().await;
        assert_eq!(f.usage.usage("acme").bytes, 2000);
    }

    #[tokio::test]
    async fn test_client_gone_before_reply_is_reported() {
        let f = fixture();
        f.registry.upsert("n1", NodeAttributes::new("US", "", 1), 1);

        let session = f.core.begin("http", peer());
        let cred = Credential::parse("acme", "k-country-us").unwrap();
        let ctx = f
            .core
            .authenticate(&session, &ClientIdentity::Credential(cred))
            .await
            .unwrap();
        let (_client, server) = client_pair().await;
        let connected = f
            .core
            .connect(&session, &ctx, Protocol::Http, "example.com", 443, &server)
            .await
            .unwrap();
        assert_eq!(f.registry.get("n1").unwrap().sessions, 1);

        let err = Error::from(std::io::Error::from(std::io::ErrorKind::BrokenPipe));
        f.core.abandon(&session, &ctx, connected, &err);

        assert_eq!(f.core.metrics().outcome_count(Outcome::Error), 1);
        assert_eq!(f.registry.get("n1").unwrap().sessions, 0);
        assert_eq!(session.phase(), SessionPhase::Failed);

        f.core.tracker().close();
        f.core.tracker().wait().await;
        let usage = f.usage.usage("acme");
        assert_eq!(usage.requests, 1);
        assert_eq!(usage.failures, 1);
    }

    #[tokio::test]
    async fn test_auth_failure_records_outcome() {
        let f = fixture();
        let session = f.core.begin("http", peer());
        let cred = Credential::parse("acme", "wrong").unwrap();
        let err = f
            .core
            .authenticate(&session, &ClientIdentity::Credential(cred))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthFailure(_)));
        assert_eq!(f.core.metrics().outcomes().auth_rejected, 1);
        assert_eq!(session.phase(), SessionPhase::Failed);
    }

    #[tokio::test]
    async fn test_retry_excludes_failed_node() {
        let f = fixture();
        f.registry.upsert("b", NodeAttributes::new("US", "", 1), 2);
        f.registry.upsert("a", NodeAttributes::new("US", "", 1), 1);
        // "a" is preferred (fresher or equal heartbeat, lower id) and hangs up during activation
        f.connector.broken.lock().insert("a".into());

        let session = f.core.begin("socks5", peer());
        let ctx = f
            .core
            .authenticate(
                &session,
                &ClientIdentity::Credential(Credential::parse("acme", "k-country-us").unwrap()),
            )
            .await
            .unwrap();
        let (_client, server) = client_pair().await;
        let connected = f
            .core
            .connect(&session, &ctx, Protocol::Socks5, "example.com", 80, &server)
            .await
            .unwrap();
        assert_eq!(connected.node_id(), "b");
    }

    #[tokio::test]
    async fn test_sticky_rebinds_after_node_loss() {
        let f = fixture();
        f.registry.upsert("a", NodeAttributes::new("US", "", 1), 1);
        f.registry.upsert("b", NodeAttributes::new("US", "", 1), 2);
        f.sticky.bind("tok", "gone");

        let session = f.core.begin("socks5", peer());
        let ctx = f
            .core
            .authenticate(
                &session,
                &ClientIdentity::Credential(
                    Credential::parse("acme", "k-country-us-session-tok").unwrap(),
                ),
            )
            .await
            .unwrap();
        let (_client, server) = client_pair().await;
        let connected = f
            .core
            .connect(&session, &ctx, Protocol::Socks5, "example.com", 80, &server)
            .await
            .unwrap();
        assert_eq!(f.sticky.resolve("tok").as_deref(), Some(connected.node_id()));
    }

    #[tokio::test]
    async fn test_no_node_is_reported() {
        let f = fixture();
        let session = f.core.begin("http", peer());
        let ctx = f
            .core
            .authenticate(
                &session,
                &ClientIdentity::Credential(Credential::parse("acme", "k-country-de").unwrap()),
            )
            .await
            .unwrap();
        let (_client, server) = client_pair().await;
        let err = f
            .core
            .connect(&session, &ctx, Protocol::Http, "example.com", 80, &server)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::NoAvailableNode(_)));
        assert_eq!(f.core.metrics().outcomes().no_available_node, 1);
    }

    #[test]
    fn test_admission_cap() {
        let f = fixture();
        let permit = f.core.admit().unwrap();
        assert!(permit.is_some());
        assert!(matches!(f.core.admit(), Err(Error::NoAvailableNode(_))));
        drop(permit);
        assert!(f.core.admit().unwrap().is_some());
    }
}
