//! WebSocket server for browser and mobile clients.
//!
//! Connections arrive as HTTP upgrades on the configured path. Admission is
//! decided during the upgrade so a refused client gets a real HTTP status
//! instead of a dropped socket. After the upgrade each binary WebSocket
//! message carries exactly one frame, served by the same loop as TCP.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::admission::{AdmissionPolicy, ConnectionSlot, Rejection};
use crate::codec::Codec;
use crate::connection::{Connection, ConnectionId, IdGenerator, WebSocketConnection, accept_handshake};
use crate::error::{NetError, NetResult};
use crate::framing::{FrameCodec, FrameConfig};
use crate::handler::{ConnectionCallback, MessageHandler};
use crate::platform::{SocketConfig, configure_stream, create_listener};
use crate::pool::Pools;
use crate::serve::{notify, serve_isolated};
use crate::tcp_server::resolve;

/// Decides whether an upgrade request's origin is acceptable.
pub type OriginCheck = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

type WsConnection = WebSocketConnection<TcpStream>;

/// Configuration for [`WsServer`].
#[derive(Clone)]
pub struct WsServerConfig {
    /// Address to bind to. Default: `0.0.0.0:7778`.
    pub addr: String,
    /// Request path that may be upgraded. Default: `/ws`.
    pub path: String,
    pub allowed_ips: Vec<String>,
    /// Cap on live connections; 0 means no cap. Default: 10 000.
    pub max_connections: usize,
    /// `None` accepts every origin.
    pub check_origin: Option<OriginCheck>,
    /// Require a handshake message after the upgrade. Default: false.
    pub handshake_enable: bool,
    pub handshake_timeout: Duration,
    /// Time allowed for the HTTP upgrade itself. Default: 10 s.
    pub upgrade_timeout: Duration,
    /// Default: 60 s.
    pub idle_timeout: Duration,
    pub accept_backoff: Duration,
    pub shutdown_timeout: Duration,
    pub socket: SocketConfig,
    pub frame: FrameConfig,
}

impl fmt::Debug for WsServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsServerConfig")
            .field("addr", &self.addr)
            .field("path", &self.path)
            .field("allowed_ips", &self.allowed_ips)
            .field("max_connections", &self.max_connections)
            .field("check_origin", &self.check_origin.is_some())
            .field("handshake_enable", &self.handshake_enable)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for WsServerConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:7778".to_string(),
            path: "/ws".to_string(),
            allowed_ips: Vec::new(),
            max_connections: 10_000,
            check_origin: None,
            handshake_enable: false,
            handshake_timeout: Duration::from_secs(5),
            upgrade_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            accept_backoff: Duration::from_millis(200),
            shutdown_timeout: Duration::from_secs(10),
            socket: SocketConfig::default(),
            frame: FrameConfig::default(),
        }
    }
}

impl From<&ashfall_config::Config> for WsServerConfig {
    fn from(config: &ashfall_config::Config) -> Self {
        let ws = &config.websocket;
        Self {
            addr: ws.addr.clone(),
            path: ws.path.clone(),
            allowed_ips: ws.allowed_ips.clone(),
            max_connections: ws.max_connections as usize,
            handshake_enable: ws.handshake_enable,
            idle_timeout: Duration::from_secs(ws.idle_timeout_secs),
            shutdown_timeout: Duration::from_secs(ws.shutdown_timeout_secs),
            frame: FrameConfig {
                max_frame_size: ws.max_frame_size as usize,
                compression: (&config.compression).into(),
            },
            ..Default::default()
        }
    }
}

/// Builder for [`WsServer`].
pub struct WsServerBuilder {
    config: WsServerConfig,
    handler: Arc<dyn MessageHandler>,
    on_connected: Option<ConnectionCallback>,
    on_disconnected: Option<ConnectionCallback>,
    pools: Option<Pools>,
}

impl WsServerBuilder {
    pub fn on_connected(mut self, cb: ConnectionCallback) -> Self {
        self.on_connected = Some(cb);
        self
    }

    pub fn on_disconnected(mut self, cb: ConnectionCallback) -> Self {
        self.on_disconnected = Some(cb);
        self
    }

    pub fn pools(mut self, pools: Pools) -> Self {
        self.pools = Some(pools);
        self
    }

    pub fn build(self) -> WsServer {
        let pools = self.pools.unwrap_or_else(Pools::shared);
        let admission = Arc::new(AdmissionPolicy::new(
            &self.config.allowed_ips,
            self.config.max_connections,
        ));
        WsServer {
            inner: Arc::new(WsInner {
                frame_codec: Arc::new(FrameCodec::new(self.config.frame.clone(), pools.clone())),
                codec: Codec::new(pools),
                config: self.config,
                handler: self.handler,
                on_connected: self.on_connected,
                on_disconnected: self.on_disconnected,
                ids: IdGenerator::new(),
                admission,
                connections: RwLock::new(HashMap::new()),
                local_addr: Mutex::new(None),
                token: CancellationToken::new(),
                tasks: TaskTracker::new(),
                stopping: AtomicBool::new(false),
            }),
        }
    }
}

/// WebSocket server handle. Cheap to clone.
#[derive(Clone)]
pub struct WsServer {
    inner: Arc<WsInner>,
}

struct WsInner {
    config: WsServerConfig,
    handler: Arc<dyn MessageHandler>,
    on_connected: Option<ConnectionCallback>,
    on_disconnected: Option<ConnectionCallback>,
    frame_codec: Arc<FrameCodec>,
    codec: Codec,
    ids: IdGenerator,
    admission: Arc<AdmissionPolicy>,
    connections: RwLock<HashMap<ConnectionId, Arc<WsConnection>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    token: CancellationToken,
    tasks: TaskTracker,
    stopping: AtomicBool,
}

impl WsServer {
    pub fn builder(config: WsServerConfig, handler: Arc<dyn MessageHandler>) -> WsServerBuilder {
        WsServerBuilder {
            config,
            handler,
            on_connected: None,
            on_disconnected: None,
            pools: None,
        }
    }

    /// Bind the configured address and start accepting upgrades.
    pub async fn start(&self) -> NetResult<SocketAddr> {
        let addr = resolve(&self.inner.config.addr).await?;
        let listener = create_listener(addr, &self.inner.config.socket)?;
        self.start_with_listener(listener)
    }

    pub fn start_with_listener(&self, listener: TcpListener) -> NetResult<SocketAddr> {
        if self.inner.stopping.load(Ordering::Acquire) {
            return Err(NetError::Stopping);
        }
        let addr = listener.local_addr()?;
        *self.inner.local_addr.lock() = Some(addr);
        tracing::info!("WebSocket server listening on ws://{addr}{}", self.inner.config.path);

        let inner = Arc::clone(&self.inner);
        self.inner.tasks.spawn(async move {
            inner.accept_loop(listener).await;
        });
        Ok(addr)
    }

    /// Stop accepting, close every connection, and wait at most
    /// `shutdown_timeout`. Safe to call more than once.
    pub async fn stop(&self) -> NetResult<()> {
        let inner = &self.inner;
        if inner
            .stopping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        let live: Vec<Arc<WsConnection>> = inner.connections.read().values().cloned().collect();
        tracing::info!("stopping WebSocket server ({} connections)", live.len());
        inner.token.cancel();
        for conn in live {
            let _ = conn.close().await;
        }

        inner.tasks.close();
        if tokio::time::timeout(inner.config.shutdown_timeout, inner.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                "WebSocket server shutdown timed out after {:?}",
                inner.config.shutdown_timeout
            );
        }
        tracing::info!("WebSocket server stopped");
        Ok(())
    }

    pub fn connections(&self) -> Vec<Arc<dyn Connection>> {
        self.inner
            .connections
            .read()
            .values()
            .map(|conn| conn.clone() as Arc<dyn Connection>)
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.read().len()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }
}

impl WsInner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.token.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let this = Arc::clone(&self);
                    self.tasks.spawn(async move {
                        this.upgrade(stream, peer).await;
                    });
                }
                Err(e) => {
                    tracing::warn!("accept failed: {e}");
                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        _ = tokio::time::sleep(self.config.accept_backoff) => {}
                    }
                }
            }
        }
        tracing::info!("WebSocket accept loop stopped");
    }

    /// Admission for one upgrade request.
    fn check_upgrade(
        &self,
        req: &Request,
        peer: SocketAddr,
    ) -> Result<ConnectionSlot, (StatusCode, &'static str)> {
        if self.stopping.load(Ordering::Acquire) {
            return Err((StatusCode::SERVICE_UNAVAILABLE, "server is stopping"));
        }
        if req.uri().path() != self.config.path {
            return Err((StatusCode::NOT_FOUND, "not found"));
        }
        if self.config.check_origin.as_ref().is_some_and(|check| !check(req)) {
            return Err((StatusCode::FORBIDDEN, "origin not allowed"));
        }
        self.admission.admit(peer.ip()).map_err(|rejection| match rejection {
            Rejection::IpNotAllowed => (StatusCode::FORBIDDEN, "ip not allowed"),
            Rejection::ServerFull => (StatusCode::SERVICE_UNAVAILABLE, "server full"),
        })
    }

    async fn upgrade(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = configure_stream(&stream, &self.config.socket) {
            tracing::warn!("failed to apply socket options to {peer}: {e}");
        }

        let mut slot = None;
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            match self.check_upgrade(req, peer) {
                Ok(granted) => {
                    slot = Some(granted);
                    Ok(resp)
                }
                Err((status, reason)) => {
                    tracing::warn!("rejected upgrade from {peer} for {}: {reason}", req.uri());
                    Err(reject(status, reason))
                }
            }
        };

        let upgraded = tokio::select! {
            _ = self.token.cancelled() => return,
            upgraded = tokio::time::timeout(self.config.upgrade_timeout, accept_hdr_async(stream, callback)) => upgraded,
        };
        let ws = match upgraded {
            Ok(Ok(ws)) => ws,
            Ok(Err(e)) => {
                tracing::debug!("upgrade from {peer} failed: {e}");
                return;
            }
            Err(_) => {
                tracing::warn!("upgrade from {peer} timed out after {:?}", self.config.upgrade_timeout);
                return;
            }
        };
        let Some(slot) = slot else {
            return;
        };

        let id = self.ids.next_id();
        let conn = Arc::new(WebSocketConnection::new(id, peer, ws, self.frame_codec.clone()));
        self.connections.write().insert(id, conn.clone());
        tracing::info!("accepted WebSocket {id} from {peer} ({} live)", self.admission.live());

        self.run_connection(conn, slot).await;
    }

    async fn run_connection(&self, conn: Arc<WsConnection>, _slot: ConnectionSlot) {
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

        self.connections.write().remove(&id);
        let _ = conn.close().await;
        if admitted {
            notify(&self.on_disconnected, &dyn_conn);
        }
        tracing::info!("WebSocket {id} closed");
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut resp = ErrorResponse::new(Some(reason.to_string()));
    *resp.status_mut() = status;
    resp
}
