//! TCP server for accepting and managing service connections.
//!
//! Every accepted socket passes admission (IP allow-list, connection cap)
//! before anything else happens. Admitted sockets become [`TcpConnection`]s
//! registered by [`ConnectionId`], each served on its own task until the peer
//! leaves, the idle timeout fires, or the server stops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::admission::{AdmissionPolicy, ConnectionSlot, Rejection};
use crate::codec::Codec;
use crate::connection::{Connection, ConnectionId, IdGenerator, TcpConnection, accept_handshake};
use crate::error::{NetError, NetResult};
use crate::framing::{FrameCodec, FrameConfig};
use crate::handler::{ConnectionCallback, MessageHandler};
use crate::platform::{SocketConfig, configure_stream, create_listener};
use crate::pool::Pools;
use crate::serve::{notify, serve_isolated};

/// Configuration for [`TcpServer`].
#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    /// Address to bind to, resolved at start. Default: `0.0.0.0:7777`.
    pub addr: String,
    /// Peers allowed to connect. Empty or `0.0.0.0` allows everyone.
    pub allowed_ips: Vec<String>,
    /// Cap on live connections; 0 means no cap. Default: 10 000.
    pub max_connections: usize,
    /// Require a handshake as the first message. Default: false.
    pub handshake_enable: bool,
    /// Time allowed for the handshake to arrive. Default: 5 s.
    pub handshake_timeout: Duration,
    /// Close a connection that sends nothing for this long. Default: 60 s.
    pub idle_timeout: Duration,
    /// Pause after a failed accept. Default: 200 ms.
    pub accept_backoff: Duration,
    /// Bound on `stop` waiting for connection tasks. Default: 10 s.
    pub shutdown_timeout: Duration,
    pub socket: SocketConfig,
    pub frame: FrameConfig,
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:7777".to_string(),
            allowed_ips: Vec::new(),
            max_connections: 10_000,
            handshake_enable: false,
            handshake_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            accept_backoff: Duration::from_millis(200),
            shutdown_timeout: Duration::from_secs(10),
            socket: SocketConfig::default(),
            frame: FrameConfig::default(),
        }
    }
}

impl From<&ashfall_config::Config> for TcpServerConfig {
    fn from(config: &ashfall_config::Config) -> Self {
        let s = &config.server;
        Self {
            addr: s.addr.clone(),
            allowed_ips: s.allowed_ips.clone(),
            max_connections: s.max_connections as usize,
            handshake_enable: s.handshake_enable,
            idle_timeout: Duration::from_secs(s.idle_timeout_secs),
            shutdown_timeout: Duration::from_secs(s.shutdown_timeout_secs),
            frame: FrameConfig {
                max_frame_size: s.max_frame_size as usize,
                compression: (&config.compression).into(),
            },
            ..Default::default()
        }
    }
}

/// Builder for [`TcpServer`].
pub struct TcpServerBuilder {
    config: TcpServerConfig,
    handler: Arc<dyn MessageHandler>,
    on_connected: Option<ConnectionCallback>,
    on_disconnected: Option<ConnectionCallback>,
    pools: Option<Pools>,
}

impl TcpServerBuilder {
    /// Called once a connection is admitted (and has handshaken, if required).
    pub fn on_connected(mut self, cb: ConnectionCallback) -> Self {
        self.on_connected = Some(cb);
        self
    }

    /// Called after a connection announced through `on_connected` ends.
    pub fn on_disconnected(mut self, cb: ConnectionCallback) -> Self {
        self.on_disconnected = Some(cb);
        self
    }

    /// Use these pools instead of [`Pools::shared`].
    pub fn pools(mut self, pools: Pools) -> Self {
        self.pools = Some(pools);
        self
    }

    pub fn build(self) -> TcpServer {
        let pools = self.pools.unwrap_or_else(Pools::shared);
        let admission = Arc::new(AdmissionPolicy::new(
            &self.config.allowed_ips,
            self.config.max_connections,
        ));
        TcpServer {
            inner: Arc::new(ServerInner {
                frame_codec: Arc::new(FrameCodec::new(self.config.frame.clone(), pools.clone())),
                codec: Codec::new(pools),
                config: self.config,
                handler: self.handler,
                on_connected: self.on_connected,
                on_disconnected: self.on_disconnected,
                ids: IdGenerator::new(),
                admission,
                connections: DashMap::new(),
                local_addr: Mutex::new(None),
                token: CancellationToken::new(),
                tasks: TaskTracker::new(),
                stopping: AtomicBool::new(false),
            }),
        }
    }
}

/// TCP server handle. Cheap to clone.
#[derive(Clone)]
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: TcpServerConfig,
    handler: Arc<dyn MessageHandler>,
    on_connected: Option<ConnectionCallback>,
    on_disconnected: Option<ConnectionCallback>,
    frame_codec: Arc<FrameCodec>,
    codec: Codec,
    ids: IdGenerator,
    admission: Arc<AdmissionPolicy>,
    connections: DashMap<ConnectionId, Arc<TcpConnection>>,
    local_addr: Mutex<Option<SocketAddr>>,
    token: CancellationToken,
    tasks: TaskTracker,
    stopping: AtomicBool,
}

impl TcpServer {
    pub fn builder(config: TcpServerConfig, handler: Arc<dyn MessageHandler>) -> TcpServerBuilder {
        TcpServerBuilder {
            config,
            handler,
            on_connected: None,
            on_disconnected: None,
            pools: None,
        }
    }

    /// Bind the configured address and start accepting in the background.
    /// Returns the bound address.
    pub async fn start(&self) -> NetResult<SocketAddr> {
        let addr = resolve(&self.inner.config.addr).await?;
        let listener = create_listener(addr, &self.inner.config.socket)?;
        self.start_with_listener(listener)
    }

    /// Start accepting on a pre-bound listener.
    pub fn start_with_listener(&self, listener: TcpListener) -> NetResult<SocketAddr> {
        if self.inner.stopping.load(Ordering::Acquire) {
            return Err(NetError::Stopping);
        }
        let addr = listener.local_addr()?;
        *self.inner.local_addr.lock() = Some(addr);
        tracing::info!("TCP server listening on {addr}");

        let inner = Arc::clone(&self.inner);
        self.inner.tasks.spawn(async move {
            inner.accept_loop(listener).await;
        });
        Ok(addr)
    }

    /// Stop accepting, close every connection, and wait at most
    /// `shutdown_timeout` for connection tasks. Safe to call more than once.
    pub async fn stop(&self) -> NetResult<()> {
        let inner = &self.inner;
        if inner
            .stopping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        tracing::info!("stopping TCP server ({} connections)", inner.connections.len());
        inner.token.cancel();

        let live: Vec<Arc<TcpConnection>> =
            inner.connections.iter().map(|entry| entry.value().clone()).collect();
        for conn in live {
            let _ = conn.close().await;
        }

        inner.tasks.close();
        if tokio::time::timeout(inner.config.shutdown_timeout, inner.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                "TCP server shutdown timed out after {:?}, {} connections remain",
                inner.config.shutdown_timeout,
                inner.connections.len()
            );
        }
        tracing::info!("TCP server stopped");
        Ok(())
    }

    /// Snapshot of the live connections.
    pub fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.inner
            .connections
            .iter()
            .map(|entry| entry.value().clone() as Arc<dyn Connection>)
            .collect()
    }

    pub fn connection(&self, id: ConnectionId) -> Option<Arc<dyn Connection>> {
        self.inner
            .connections
            .get(&id)
            .map(|entry| entry.value().clone() as Arc<dyn Connection>)
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Address the listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::Acquire)
    }
}

impl ServerInner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) => {
                    tracing::warn!("accept failed: {e}");
                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        _ = tokio::time::sleep(self.config.accept_backoff) => {}
                    }
                }
            }
        }
        tracing::info!("TCP accept loop stopped");
    }

    fn admit(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let slot = match self.admission.admit(peer.ip()) {
            Ok(slot) => slot,
            Err(Rejection::IpNotAllowed) => {
                tracing::warn!("rejected connection from {peer}: IP not allowed");
                return;
            }
            Err(Rejection::ServerFull) => {
                tracing::warn!(
                    "rejected connection from {peer}: max connections ({}) reached",
                    self.config.max_connections
                );
                return;
            }
        };

        if let Err(e) = configure_stream(&stream, &self.config.socket) {
            tracing::warn!("failed to apply socket options to {peer}: {e}");
        }
        let id = self.ids.next_id();
        let conn = match TcpConnection::new(id, stream, self.frame_codec.clone()) {
            Ok(conn) => Arc::new(conn),
            Err(e) => {
                tracing::warn!("dropping connection from {peer}: {e}");
                return;
            }
        };
        self.connections.insert(id, conn.clone());
        tracing::info!("accepted {id} from {peer} ({} live)", self.admission.live());

        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            this.run_connection(conn, slot).await;
        });
    }

    async fn run_connection(self: Arc<Self>, conn: Arc<TcpConnection>, _slot: ConnectionSlot) {
        let id = conn.id();
        let dyn_conn: Arc<dyn Connection> = conn.clone();

        let admitted = if self.config.handshake_enable {
            match accept_handshake(&*conn, &self.codec, self.config.handshake_timeout).await {
                Ok(hs) => {
                    tracing::debug!("{id} handshake: {hs:?}");
                    true
                }
                Err(e) => {
                    tracing::warn!("{id} from {} failed handshake: {e}", conn.remote_addr());
                    false
                }
            }
        } else {
            true
        };

        if admitted {
            notify(&self.on_connected, &dyn_conn);
            serve_isolated(
                dyn_conn.clone(),
                self.handler.clone(),
                self.codec.pools().clone(),
                self.config.idle_timeout,
                self.token.child_token(),
            )
            .await;
        }

        self.connections.remove(&id);
        let _ = conn.close().await;
        if admitted {
            notify(&self.on_disconnected, &dyn_conn);
        }
        tracing::info!("{id} closed ({} live)", self.admission.live().saturating_sub(1));
    }
}

/// Resolve a `host:port` string to the first matching address.
pub(crate) async fn resolve(addr: &str) -> NetResult<SocketAddr> {
    tokio::net::lookup_host(addr).await?.next().ok_or_else(|| {
        NetError::Io(std::io::Error::new(
            std::io::ErrorKind::AddrNotAvailable,
            format!("{addr} did not resolve to any address"),
        ))
    })
}
