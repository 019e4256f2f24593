//! SOCKS5 frontend

use super::session::{ClientIdentity, SessionCore, CLIENT_HANDSHAKE_TIMEOUT};
use super::{accept_loop, InboundListener};
use crate::auth::Credential;
use crate::common::net::{Address, PrefixedStream};
use crate::common::socks::{
    reply_code, write_method_selection, AuthMethodFlags, Command, Request, Response,
    UsernamePasswordAuth, AUTH_NO_ACCEPTABLE, AUTH_NO_AUTH, AUTH_USERNAME_PASSWORD,
    REP_COMMAND_NOT_SUPPORTED,
};
use crate::registry::Protocol;
use crate::statistic::TrackedSession;
use crate::{Error, Result};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const FRONTEND: &str = "socks5";

/// Result of the greeting, request and optional RFC 1929 exchange
struct Handshake {
    /// A malformed credential is reported after CONNECT, like a wrong one
    identity: Result<ClientIdentity>,
    command: Command,
    address: Address,
    port: u16,
}

pub struct Socks5Listener {
    core: Arc<SessionCore>,
}

impl Socks5Listener {
    pub fn new(core: Arc<SessionCore>) -> Self {
        Socks5Listener { core }
    }

    async fn handle_connection(core: Arc<SessionCore>, stream: TcpStream, peer: SocketAddr) {
        let session = core.begin(FRONTEND, peer);
        if let Err(e) = Self::process_connection(&core, &session, stream, peer).await {
            debug!("SOCKS5 session from {} ended: {}", peer, e);
        }
        core.end(&session);
    }

    async fn process_connection(
        core: &SessionCore,
        session: &Arc<TrackedSession>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<()> {
        let mut stream = BufReader::with_capacity(4 * 1024, stream);

        let handshake = tokio::time::timeout(
            CLIENT_HANDSHAKE_TIMEOUT,
            Self::handshake(core, &mut stream, peer.ip()),
        )
        .await
        .map_err(|_| Error::protocol("SOCKS5 handshake timed out"))
        .and_then(|r| r);
        let handshake = match handshake {
            Ok(h) => h,
            Err(e) => {
                core.fail(session, None, None, &e);
                return Err(e);
            }
        };

        if handshake.command != Command::Connect {
            let err = Error::protocol(format!("unsupported command {:?}", handshake.command));
            core.fail(session, None, None, &err);
            Response::failure(REP_COMMAND_NOT_SUPPORTED)
                .write_to(stream.get_mut())
                .await?;
            return Err(err);
        }

        let host = handshake.address.to_host();
        let port = handshake.port;
        debug!("SOCKS5 CONNECT {} -> {}:{}", peer, host, port);

        let _permit = match core.admit() {
            Ok(permit) => permit,
            Err(e) => {
                core.fail(session, None, None, &e);
                return Self::reject(&mut stream, e).await;
            }
        };

        let identity = match handshake.identity {
            Ok(identity) => identity,
            Err(e) => {
                core.fail(session, None, None, &e);
                return Self::reject(&mut stream, e).await;
            }
        };
        let ctx = match core.authenticate(session, &identity).await {
            Ok(ctx) => ctx,
            Err(e) => return Self::reject(&mut stream, e).await,
        };

        let connected = match core
            .connect(session, &ctx, Protocol::Socks5, &host, port, stream.get_ref())
            .await
        {
            Ok(c) => c,
            Err(e) => return Self::reject(&mut stream, e).await,
        };

        let local = stream
            .get_ref()
            .local_addr()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
        if let Err(e) = Response::success(Address::from(local.ip()), local.port())
            .write_to(stream.get_mut())
            .await
        {
            core.abandon(session, &ctx, connected, &e);
            return Err(e);
        }

        let client = PrefixedStream::from_buf_reader(stream);
        core.relay(session, &ctx, client, connected).await?;
        Ok(())
    }

    async fn handshake(
        core: &SessionCore,
        stream: &mut BufReader<TcpStream>,
        peer_ip: IpAddr,
    ) -> Result<Handshake> {
        let methods = AuthMethodFlags::read_from(stream).await?;

        let identity = if methods.username_password {
            write_method_selection(stream.get_mut(), AUTH_USERNAME_PASSWORD).await?;
            let auth = UsernamePasswordAuth::read_from(stream).await?;
            UsernamePasswordAuth::write_response(stream.get_mut(), true).await?;
            Credential::parse(&auth.username, &auth.password).map(ClientIdentity::Credential)
        } else if methods.no_auth && core.authenticator().bound_customer(peer_ip).is_some() {
            write_method_selection(stream.get_mut(), AUTH_NO_AUTH).await?;
            Ok(ClientIdentity::SourceIp(peer_ip))
        } else {
            write_method_selection(stream.get_mut(), AUTH_NO_ACCEPTABLE).await?;
            return Err(Error::auth("no acceptable SOCKS5 authentication method"));
        };

        let request = Request::read_from(stream).await?;
        Ok(Handshake {
            identity,
            command: request.command,
            address: request.address,
            port: request.port,
        })
    }

    async fn reject(stream: &mut BufReader<TcpStream>, err: Error) -> Result<()> {
        Response::failure(reply_code(&err))
            .write_to(stream.get_mut())
            .await?;
        Err(err)
    }
}

#[async_trait]
impl InboundListener for Socks5Listener {
    fn name(&self) -> &'static str {
        "SOCKS5"
    }

    async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        accept_loop(self.name(), listener, self.core.clone(), cancel, Self::handle_connection).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{
        hash_key, Authenticator, KeyRecord, LocalUsageTracker, MemoryCredentialStore,
        UsageTracker,
    };
    use crate::common::socks::{REP_CONNECTION_NOT_ALLOWED, REP_GENERAL_FAILURE};
    use crate::config::{TunnelPoolConfig, WarmPoolConfig};
    use crate::pool::{NodeIndex, Prober, StickySessions, TunnelConnector, TunnelPool, TunnelStream, WarmPool};
    use crate::registry::NodeRegistry;
    use crate::statistic::MetricsCollector;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Nothing;

    #[async_trait]
    impl Prober for Nothing {
        async fn probe(&self, _node_id: &str) -> Result<Duration> {
            Err(Error::timeout("unused"))
        }
    }

    #[async_trait]
    impl TunnelConnector for Nothing {
        async fn open_tunnel(&self, node_id: &str) -> Result<TunnelStream> {
            Err(Error::node_unreachable(format!("{} unreachable", node_id)))
        }
    }

    async fn start(bind_local: bool) -> (SocketAddr, Arc<SessionCore>, CancellationToken) {
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(90)));
        let index = Arc::new(NodeIndex::new(registry.clone()));
        let warm = Arc::new(WarmPool::new(
            index.clone(),
            Arc::new(Nothing),
            WarmPoolConfig::default(),
        ));
        let tunnels = Arc::new(TunnelPool::new(
            index,
            warm,
            Arc::new(Nothing),
            TunnelPoolConfig::default(),
        ));
        let usage: Arc<dyn UsageTracker> = Arc::new(LocalUsageTracker::new(None, HashMap::new()));
        let store = Arc::new(MemoryCredentialStore::new(vec![KeyRecord {
            customer_id: "acme".into(),
            digest: hash_key("k"),
            active: true,
            plan: None,
        }]));
        let mut auth = Authenticator::new(store, usage, Duration::from_secs(60));
        if bind_local {
            auth = auth.with_ip_binding("127.0.0.1".parse().unwrap(), "acme");
        }
        let core = Arc::new(SessionCore::new(
            Arc::new(auth),
            registry,
            tunnels,
            Arc::new(StickySessions::new(Duration::from_secs(60))),
            Arc::new(MetricsCollector::new()),
            None,
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let socks = Arc::new(Socks5Listener::new(core.clone()));
        tokio::spawn(socks.serve(listener, cancel.clone()));
        (addr, core, cancel)
    }

    fn connect_request() -> Vec<u8> {
        let mut req = vec![0x05, 0x01, 0x00, 0x03, 11];
        req.extend_from_slice(b"example.com");
        req.extend_from_slice(&443u16.to_be_bytes());
        req
    }

    async fn userpass(client: &mut TcpStream, user: &str, pass: &str) {
        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        let mut sel = [0u8; 2];
        client.read_exact(&mut sel).await.unwrap();
        assert_eq!(sel, [0x05, 0x02]);

        let mut auth = vec![0x01, user.len() as u8];
        auth.extend_from_slice(user.as_bytes());
        auth.push(pass.len() as u8);
        auth.extend_from_slice(pass.as_bytes());
        client.write_all(&auth).await.unwrap();
        let mut status = [0u8; 2];
        client.read_exact(&mut status).await.unwrap();
        assert_eq!(status, [0x01, 0x00]);
    }

    async fn read_reply(client: &mut TcpStream) -> u8 {
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], 0x05);
        reply[1]
    }

    #[tokio::test]
    async fn test_bad_key_gets_not_allowed() {
        let (addr, core, cancel) = start(false).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        userpass(&mut client, "acme", "wrong").await;
        client.write_all(&connect_request()).await.unwrap();
        assert_eq!(read_reply(&mut client).await, REP_CONNECTION_NOT_ALLOWED);
        cancel.cancel();
        core.tracker().close();
        core.tracker().wait().await;
        assert_eq!(core.metrics().outcomes().auth_rejected, 1);
    }

    #[tokio::test]
    async fn test_no_node_is_general_failure() {
        let (addr, _core, cancel) = start(false).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        userpass(&mut client, "acme", "k-country-jp").await;
        client.write_all(&connect_request()).await.unwrap();
        assert_eq!(read_reply(&mut client).await, REP_GENERAL_FAILURE);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_bind_not_supported() {
        let (addr, _core, cancel) = start(true).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut sel = [0u8; 2];
        client.read_exact(&mut sel).await.unwrap();
        assert_eq!(sel, [0x05, 0x00]);

        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        assert_eq!(read_reply(&mut client).await, REP_COMMAND_NOT_SUPPORTED);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_unbound_no_auth_rejected() {
        let (addr, _core, cancel) = start(false).await;
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut sel = [0u8; 2];
        client.read_exact(&mut sel).await.unwrap();
        assert_eq!(sel, [0x05, AUTH_NO_ACCEPTABLE]);
        cancel.cancel();
    }
}
