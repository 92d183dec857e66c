//! Outbound TCP client with heartbeat and automatic reconnection.
//!
//! Manages the full connection lifecycle: dialling, an optional handshake,
//! heartbeat keepalive, disconnect detection, backoff reconnection, and clean
//! shutdown. State changes are broadcast via a [`watch`] channel so any
//! number of consumers can react without polling.
//!
//! Every physical connection gets a generation number and its own child
//! cancellation token. The receive and heartbeat loops of a connection only
//! ever tear down that generation, so a late failure from a superseded
//! connection cannot close its replacement.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::codec::Codec;
use crate::connection::{Connection, IdGenerator, TcpConnection, send_handshake};
use crate::error::{NetError, NetResult};
use crate::framing::{FrameCodec, FrameConfig};
use crate::handler::{ConnectionCallback, MessageHandler};
use crate::messages::{Handshake, Message};
use crate::platform::{SocketConfig, configure_stream};
use crate::pool::Pools;
use crate::reconnection::{ReconnectConfig, ReconnectState};

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected and not trying to be.
    Disconnected,
    /// Dialling the server.
    Connecting,
    /// TCP established, sending our handshake.
    Handshaking,
    /// Ready for communication.
    Connected,
    /// Waiting out a backoff delay between attempts.
    Reconnecting,
    /// `close` was called; terminal.
    Closed,
}

/// Observable connection state backed by a [`watch`] channel.
///
/// Multiple subscribers can observe state transitions without polling.
pub struct ConnectionStateWatch {
    tx: watch::Sender<ConnectionState>,
    rx: watch::Receiver<ConnectionState>,
}

impl Default for ConnectionStateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateWatch {
    /// Create a new watch initialized to [`ConnectionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx, rx }
    }

    /// Set the current connection state, notifying all subscribers.
    /// Once [`ConnectionState::Closed`], the state no longer changes.
    pub fn set(&self, state: ConnectionState) {
        self.tx.send_if_modified(|current| {
            if *current == ConnectionState::Closed || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.rx.clone()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> ConnectionState {
        *self.rx.borrow()
    }
}

/// Configuration for [`TcpClient`].
#[derive(Debug, Clone)]
pub struct TcpClientConfig {
    /// Bound on each dial. Default: 3 s.
    pub connect_timeout: Duration,
    /// Retry after a failed connect or a lost connection. Default: true.
    pub enable_reconnect: bool,
    pub reconnect: ReconnectConfig,
    /// Interval between heartbeat pings. Default: 5 s.
    pub heartbeat_interval: Duration,
    /// Bound on a single handler call. Default: 10 s.
    pub handler_timeout: Duration,
    /// Bound on `close` waiting for background tasks. Default: 10 s.
    pub close_timeout: Duration,
    /// Identity sent right after connecting; `None` skips the handshake.
    pub handshake: Option<Handshake>,
    pub socket: SocketConfig,
    pub frame: FrameConfig,
}

impl Default for TcpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            enable_reconnect: true,
            reconnect: ReconnectConfig::default(),
            heartbeat_interval: Duration::from_secs(5),
            handler_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(10),
            handshake: None,
            socket: SocketConfig::default(),
            frame: FrameConfig::default(),
        }
    }
}

impl From<&ashfall_config::Config> for TcpClientConfig {
    fn from(config: &ashfall_config::Config) -> Self {
        let c = &config.client;
        Self {
            connect_timeout: Duration::from_millis(c.connect_timeout_ms),
            enable_reconnect: c.enable_reconnect,
            reconnect: ReconnectConfig::from(&c.reconnect),
            heartbeat_interval: Duration::from_millis(c.heartbeat_interval_ms),
            handler_timeout: Duration::from_millis(c.handler_timeout_ms),
            close_timeout: Duration::from_millis(c.close_timeout_ms),
            handshake: None,
            socket: SocketConfig::default(),
            frame: FrameConfig {
                max_frame_size: c.max_frame_size as usize,
                compression: (&config.compression).into(),
            },
        }
    }
}

/// Builder for [`TcpClient`].
pub struct TcpClientBuilder {
    config: TcpClientConfig,
    handler: Arc<dyn MessageHandler>,
    on_connected: Option<ConnectionCallback>,
    on_disconnected: Option<ConnectionCallback>,
    pools: Option<Pools>,
}

impl TcpClientBuilder {
    /// Called (on a spawned task) after every successful connect or reconnect.
    pub fn on_connected(mut self, cb: ConnectionCallback) -> Self {
        self.on_connected = Some(cb);
        self
    }

    /// Called with the lost connection whenever a live connection drops.
    pub fn on_disconnected(mut self, cb: ConnectionCallback) -> Self {
        self.on_disconnected = Some(cb);
        self
    }

    /// Use these pools instead of [`Pools::shared`].
    pub fn pools(mut self, pools: Pools) -> Self {
        self.pools = Some(pools);
        self
    }

    pub fn build(self) -> TcpClient {
        let pools = self.pools.unwrap_or_else(Pools::shared);
        let frame_codec = Arc::new(FrameCodec::new(self.config.frame.clone(), pools.clone()));
        TcpClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                handler: self.handler,
                on_connected: self.on_connected,
                on_disconnected: self.on_disconnected,
                frame_codec,
                codec: Codec::new(pools),
                ids: IdGenerator::new(),
                addr: Mutex::new(None),
                root: CancellationToken::new(),
                live: Mutex::new(None),
                generation: AtomicU64::new(0),
                connected: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                retry_count: AtomicU32::new(0),
                tasks: TaskTracker::new(),
                state: ConnectionStateWatch::new(),
            }),
        }
    }
}

/// Handle to an outbound connection. Cheap to clone.
#[derive(Clone)]
pub struct TcpClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: TcpClientConfig,
    handler: Arc<dyn MessageHandler>,
    on_connected: Option<ConnectionCallback>,
    on_disconnected: Option<ConnectionCallback>,
    frame_codec: Arc<FrameCodec>,
    codec: Codec,
    ids: IdGenerator,
    addr: Mutex<Option<SocketAddr>>,
    /// Cancelled once, on shutdown; every loop runs under a child of it.
    root: CancellationToken,
    live: Mutex<Option<Live>>,
    generation: AtomicU64,
    connected: AtomicBool,
    reconnecting: AtomicBool,
    closed: AtomicBool,
    retry_count: AtomicU32,
    tasks: TaskTracker,
    state: ConnectionStateWatch,
}

/// The current physical connection.
struct Live {
    conn: Arc<TcpConnection>,
    generation: u64,
    /// Child of the root token; stops this connection's loops.
    token: CancellationToken,
}

impl TcpClient {
    pub fn builder(config: TcpClientConfig, handler: Arc<dyn MessageHandler>) -> TcpClientBuilder {
        TcpClientBuilder {
            config,
            handler,
            on_connected: None,
            on_disconnected: None,
            pools: None,
        }
    }

    /// Connect to `addr`.
    ///
    /// With reconnection enabled a failed first attempt is logged, handed to
    /// the reconnect loop, and reported as `Ok`. While a reconnect loop is
    /// running the call does nothing; the loop keeps dialling the first address.
    pub async fn connect(&self, addr: SocketAddr) -> NetResult<()> {
        self.connect_with(addr, None).await
    }

    /// Like [`connect`](Self::connect), but cancelling `parent` closes the
    /// client as [`close`](Self::close) would.
    pub async fn connect_with(
        &self,
        addr: SocketAddr,
        parent: Option<&CancellationToken>,
    ) -> NetResult<()> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(NetError::Stopping);
        }
        if let Some(parent) = parent {
            inner.watch_parent(parent.clone());
        }
        if inner.connected.load(Ordering::Acquire) {
            tracing::debug!("connect to {addr} ignored: already connected");
            return Ok(());
        }
        if inner.reconnecting.load(Ordering::Acquire) {
            tracing::debug!("connect to {addr} ignored: reconnect in progress");
            return Ok(());
        }

        *inner.addr.lock() = Some(addr);

        match inner.establish(addr).await {
            Ok(()) => Ok(()),
            Err(e) if inner.config.enable_reconnect && !matches!(e, NetError::Stopping) => {
                tracing::warn!("initial connection to {addr} failed: {e}, will retry");
                inner.start_reconnect();
                Ok(())
            }
            Err(e) => {
                inner.state.set(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Send a message on the live connection.
    pub async fn send_message(&self, msg: &Message) -> NetResult<()> {
        let conn = self.connection().ok_or_else(|| {
            NetError::NotConnected(
                self.inner
                    .addr
                    .lock()
                    .map_or_else(|| "no address".to_string(), |a| a.to_string()),
            )
        })?;
        conn.send_message(msg).await
    }

    /// Shut the client down.
    ///
    /// Stops every loop, closes the live connection, and waits at most
    /// `close_timeout` for background tasks. Safe to call more than once.
    pub async fn close(&self) -> NetResult<()> {
        let inner = &self.inner;
        let addr = *inner.addr.lock();
        if !inner.shutdown().await {
            return Ok(());
        }
        tracing::info!("closing TCP client to {addr:?}");

        inner.tasks.close();
        if tokio::time::timeout(inner.config.close_timeout, inner.tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!("timeout waiting for TCP client to {addr:?} to close");
        }
        inner.state.set(ConnectionState::Closed);
        tracing::info!("TCP client to {addr:?} closed");
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnecting.load(Ordering::Acquire)
    }

    /// Reconnect attempts made since the last successful connect.
    pub fn retry_count(&self) -> u32 {
        self.inner.retry_count.load(Ordering::Acquire)
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.inner
            .live
            .lock()
            .as_ref()
            .map(|live| live.conn.clone() as Arc<dyn Connection>)
    }

    /// Return the connection state watch.
    pub fn state(&self) -> &ConnectionStateWatch {
        &self.inner.state
    }
}

impl ClientInner {
    /// Mark the client closed, stop every loop, and close the live connection.
    /// Returns `false` if the client was already shut down.
    async fn shutdown(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.root.cancel();

        let live = {
            let mut live = self.live.lock();
            self.connected.store(false, Ordering::Release);
            live.take()
        };
        if let Some(live) = live {
            live.token.cancel();
            let _ = live.conn.close().await;
        }
        true
    }

    /// Shut down when `parent` is cancelled.
    fn watch_parent(self: &Arc<Self>, parent: CancellationToken) {
        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            tokio::select! {
                _ = this.root.cancelled() => {}
                _ = parent.cancelled() => {
                    if this.shutdown().await {
                        tracing::info!("parent token cancelled, TCP client closed");
                        this.state.set(ConnectionState::Closed);
                    }
                }
            }
        });
    }

    /// Dial, optionally handshake, and install the new connection.
    async fn establish(self: &Arc<Self>, addr: SocketAddr) -> NetResult<()> {
        self.state.set(ConnectionState::Connecting);
        let timeout = self.config.connect_timeout;

        let stream = tokio::select! {
            _ = self.root.cancelled() => return Err(NetError::Stopping),
            dialled = tokio::time::timeout(timeout, TcpStream::connect(addr)) => {
                dialled.map_err(|_| NetError::ConnectTimeout { addr, timeout })??
            }
        };
        if let Err(e) = configure_stream(&stream, &self.config.socket) {
            tracing::warn!("failed to apply socket options to {addr}: {e}");
        }
        let conn = Arc::new(TcpConnection::new(
            self.ids.next_id(),
            stream,
            self.frame_codec.clone(),
        )?);

        if let Some(hs) = &self.config.handshake {
            self.state.set(ConnectionState::Handshaking);
            if let Err(e) = send_handshake(&*conn, &self.codec, hs).await {
                let _ = conn.close().await;
                return Err(NetError::Handshake(e.to_string()));
            }
        }

        self.install(conn).await
    }

    /// Make `conn` the live connection and start its loops.
    /// Refused once the client is shut down.
    async fn install(self: &Arc<Self>, conn: Arc<TcpConnection>) -> NetResult<()> {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let token = self.root.child_token();

        let previous = {
            let mut live = self.live.lock();
            if self.closed.load(Ordering::Acquire) || self.root.is_cancelled() {
                None
            } else {
                let previous = live.replace(Live {
                    conn: conn.clone(),
                    generation,
                    token: token.clone(),
                });
                self.connected.store(true, Ordering::Release);
                Some(previous)
            }
        };
        let Some(previous) = previous else {
            let _ = conn.close().await;
            return Err(NetError::Stopping);
        };
        if let Some(previous) = previous {
            previous.token.cancel();
            let _ = previous.conn.close().await;
        }

        self.reconnecting.store(false, Ordering::Release);
        self.retry_count.store(0, Ordering::Release);
        self.state.set(ConnectionState::Connected);
        tracing::info!(
            "connected to {} ({}, generation {generation})",
            conn.remote_addr(),
            conn.id()
        );

        let this = Arc::clone(self);
        let (loop_conn, loop_token) = (conn.clone(), token.clone());
        self.tasks.spawn(async move {
            this.receive_loop(loop_conn, generation, loop_token).await;
        });

        let this = Arc::clone(self);
        let (loop_conn, loop_token) = (conn.clone(), token);
        self.tasks.spawn(async move {
            this.heartbeat_loop(loop_conn, generation, loop_token).await;
        });

        if let Some(cb) = self.on_connected.clone() {
            let conn: Arc<dyn Connection> = conn;
            self.tasks.spawn(async move { cb(conn) });
        }
        Ok(())
    }

    async fn receive_loop(
        self: Arc<Self>,
        conn: Arc<TcpConnection>,
        generation: u64,
        token: CancellationToken,
    ) {
        let dyn_conn: Arc<dyn Connection> = conn.clone();
        loop {
            let received = tokio::select! {
                _ = token.cancelled() => break,
                received = conn.receive_message() => received,
            };

            match received {
                Ok(msg) if msg.is_heartbeat() => self.codec.pools().recycle(msg),
                Ok(msg) => self.dispatch(&dyn_conn, msg).await,
                Err(e) => {
                    if !token.is_cancelled() {
                        match e {
                            NetError::ConnectionClosed => {
                                tracing::info!("{} closed by peer", conn.id());
                            }
                            e => tracing::error!("receive from {} failed: {e}", conn.id()),
                        }
                        self.handle_disconnect(generation).await;
                    }
                    break;
                }
            }
        }
        tracing::debug!("receive loop for {} exited", conn.id());
    }

    async fn dispatch(&self, conn: &Arc<dyn Connection>, msg: Message) {
        let call = self.handler.handle_message(conn, &msg);
        match tokio::time::timeout(self.config.handler_timeout, call).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("handle message type {:#04x} failed: {e}", msg.msg_type),
            Err(_) => tracing::error!(
                "handler for message type {:#04x} timed out after {:?}",
                msg.msg_type,
                self.config.handler_timeout
            ),
        }
        self.codec.pools().recycle(msg);
    }

    async fn heartbeat_loop(
        self: Arc<Self>,
        conn: Arc<TcpConnection>,
        generation: u64,
        token: CancellationToken,
    ) {
        let period = self.config.heartbeat_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(e) = conn.send_message(&Message::heartbeat()).await {
                if !token.is_cancelled() {
                    tracing::warn!("heartbeat to {} failed: {e}, connection lost", conn.remote_addr());
                    self.handle_disconnect(generation).await;
                }
                break;
            }
        }
    }

    /// Tear down generation `generation` if it is still the live connection.
    async fn handle_disconnect(self: &Arc<Self>, generation: u64) {
        let lost = {
            let mut live = self.live.lock();
            if live.as_ref().is_some_and(|current| current.generation == generation) {
                self.connected.store(false, Ordering::Release);
                live.take()
            } else {
                None
            }
        };
        let Some(lost) = lost else {
            return;
        };

        lost.token.cancel();
        let _ = lost.conn.close().await;
        tracing::warn!("connection to {} lost", lost.conn.remote_addr());

        if let Some(cb) = self.on_disconnected.clone() {
            let conn: Arc<dyn Connection> = lost.conn;
            self.tasks.spawn(async move { cb(conn) });
        }

        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if self.config.enable_reconnect {
            self.start_reconnect();
        } else {
            self.state.set(ConnectionState::Disconnected);
        }
    }

    /// Spawn the reconnect loop unless one is already running.
    fn start_reconnect(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.state.set(ConnectionState::Reconnecting);

        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            this.reconnect_loop().await;
        });
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let Some(addr) = *self.addr.lock() else {
            self.reconnecting.store(false, Ordering::Release);
            return;
        };
        let mut backoff = ReconnectState::new(self.config.reconnect.clone());

        loop {
            let Some(delay) = backoff.next_delay() else {
                tracing::error!(
                    "max retries ({}) reached for {addr}, giving up",
                    self.config.reconnect.max_attempts
                );
                self.reconnecting.store(false, Ordering::Release);
                self.state.set(ConnectionState::Disconnected);
                return;
            };
            let attempt = backoff.attempts();
            self.retry_count.store(attempt, Ordering::Release);
            self.state.set(ConnectionState::Reconnecting);
            tracing::info!("reconnecting to {addr} in {delay:?} (attempt {attempt})");

            tokio::select! {
                _ = self.root.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.establish(addr).await {
                Ok(()) => {
                    tracing::info!("reconnected to {addr} after {attempt} attempts");
                    return;
                }
                Err(NetError::Stopping) => break,
                Err(e) => tracing::warn!("reconnect to {addr} failed: {e}"),
            }
        }
        self.reconnecting.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerResult;
    use crate::messages::MessageType;
    use crate::platform::create_listener;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    /// Forwards every handled message to a channel.
    struct Recorder(mpsc::UnboundedSender<Message>);

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle_message(&self, _conn: &Arc<dyn Connection>, msg: &Message) -> HandlerResult {
            let _ = self.0.send(msg.clone());
            Ok(())
        }
    }

    fn recorder() -> (Arc<dyn MessageHandler>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Recorder(tx)), rx)
    }

    fn fast_config() -> TcpClientConfig {
        TcpClientConfig {
            connect_timeout: Duration::from_millis(500),
            reconnect: ReconnectConfig {
                initial_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(100),
                ..Default::default()
            },
            close_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn server_codec() -> Arc<FrameCodec> {
        Arc::new(FrameCodec::new(FrameConfig::default(), Pools::new()))
    }

    async fn accept(listener: &TcpListener) -> TcpConnection {
        let (stream, _) = listener.accept().await.unwrap();
        TcpConnection::new(crate::ConnectionId(0), stream, server_codec()).unwrap()
    }

    /// An address nothing is listening on.
    async fn dead_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    async fn wait_for_state(client: &TcpClient, want: ConnectionState) {
        let mut rx = client.state().subscribe();
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
            .await
            .unwrap_or_else(|_| panic!("state never became {want:?}"))
            .unwrap();
    }

    #[tokio::test]
    async fn test_connection_state_starts_disconnected() {
        let watch = ConnectionStateWatch::new();
        assert_eq!(watch.current(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_closed_state_is_terminal() {
        let watch = ConnectionStateWatch::new();
        watch.set(ConnectionState::Connected);
        watch.set(ConnectionState::Closed);
        watch.set(ConnectionState::Reconnecting);
        assert_eq!(watch.current(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_client_connects_and_sends() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (handler, _rx) = recorder();
        let client = TcpClient::builder(fast_config(), handler).build();

        client.connect(listener.local_addr().unwrap()).await.unwrap();
        let server_side = accept(&listener).await;
        assert!(client.is_connected());
        assert_eq!(client.state().current(), ConnectionState::Connected);

        let msg = Message::new(MessageType::RpcRequest, b"req".to_vec());
        client.send_message(&msg).await.unwrap();
        assert_eq!(server_side.receive_message().await.unwrap(), msg);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_handler_receives_messages_but_not_heartbeats() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (handler, mut rx) = recorder();
        let client = TcpClient::builder(fast_config(), handler).build();
        client.connect(listener.local_addr().unwrap()).await.unwrap();
        let server_side = accept(&listener).await;

        server_side.send_message(&Message::heartbeat()).await.unwrap();
        let msg = Message::new(MessageType::Client, b"to handler".to_vec());
        server_side.send_message(&msg).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, msg);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_heartbeat_is_sent_periodically() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (handler, _rx) = recorder();
        let config = TcpClientConfig {
            heartbeat_interval: Duration::from_millis(50),
            ..fast_config()
        };
        let client = TcpClient::builder(config, handler).build();
        client.connect(listener.local_addr().unwrap()).await.unwrap();
        let server_side = accept(&listener).await;

        for _ in 0..2 {
            let msg = tokio::time::timeout(Duration::from_secs(2), server_side.receive_message())
                .await
                .unwrap()
                .unwrap();
            assert!(msg.is_heartbeat());
            assert_eq!(msg.payload, b"ping");
        }
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_is_first_message() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (handler, _rx) = recorder();
        let hs = Handshake {
            server_type: 3,
            platform_id: 1,
            zone_id: 42,
            srv_type: 0,
        };
        let config = TcpClientConfig {
            handshake: Some(hs),
            ..fast_config()
        };
        let client = TcpClient::builder(config, handler).build();
        client.connect(listener.local_addr().unwrap()).await.unwrap();
        let server_side = accept(&listener).await;

        let received = crate::connection::accept_handshake(
            &server_side,
            &Codec::new(Pools::new()),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(received, hs);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_when_not_connected_fails() {
        let (handler, _rx) = recorder();
        let client = TcpClient::builder(fast_config(), handler).build();
        let result = client.send_message(&Message::heartbeat()).await;
        assert!(matches!(result, Err(NetError::NotConnected(_))));
    }

    #[tokio::test]
    async fn test_connect_failure_without_reconnect_is_returned() {
        let (handler, _rx) = recorder();
        let config = TcpClientConfig {
            enable_reconnect: false,
            ..fast_config()
        };
        let client = TcpClient::builder(config, handler).build();

        assert!(client.connect(dead_addr().await).await.is_err());
        assert!(!client.is_connected());
        assert!(!client.is_reconnecting());
        assert_eq!(client.state().current(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_initial_failure_retries_until_server_appears() {
        let addr = dead_addr().await;
        let (handler, _rx) = recorder();
        let client = TcpClient::builder(fast_config(), handler).build();

        client.connect(addr).await.unwrap();
        assert!(!client.is_connected());
        assert!(client.is_reconnecting());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let listener = create_listener(addr, &SocketConfig::default()).unwrap();
        wait_for_state(&client, ConnectionState::Connected).await;
        let _server_side = accept(&listener).await;
        assert!(!client.is_reconnecting());
        assert_eq!(client.retry_count(), 0);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnects_after_server_drops_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (handler, _rx) = recorder();
        let connects = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));
        let (c, d) = (connects.clone(), disconnects.clone());
        let client = TcpClient::builder(fast_config(), handler)
            .on_connected(Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .on_disconnected(Arc::new(move |_| {
                d.fetch_add(1, Ordering::SeqCst);
            }))
            .build();

        client.connect(listener.local_addr().unwrap()).await.unwrap();
        let first = accept(&listener).await;
        first.close().await.unwrap();
        drop(first);

        let second = tokio::time::timeout(Duration::from_secs(5), accept(&listener))
            .await
            .unwrap();
        wait_for_state(&client, ConnectionState::Connected).await;

        let msg = Message::new(MessageType::Client, b"after reconnect".to_vec());
        client.send_message(&msg).await.unwrap();
        assert_eq!(second.receive_message().await.unwrap(), msg);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let (handler, _rx) = recorder();
        let mut config = fast_config();
        config.reconnect.max_attempts = 2;
        config.reconnect.initial_delay = Duration::from_millis(10);
        let client = TcpClient::builder(config, handler).build();

        client.connect(dead_addr().await).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while client.is_reconnecting() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(client.retry_count(), 2);
        assert_eq!(client.state().current(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_stops_reconnect() {
        let (handler, _rx) = recorder();
        let client = TcpClient::builder(fast_config(), handler).build();
        client.connect(dead_addr().await).await.unwrap();
        assert!(client.is_reconnecting());

        let started = tokio::time::Instant::now();
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(client.state().current(), ConnectionState::Closed);
        assert!(matches!(
            client.connect(dead_addr().await).await,
            Err(NetError::Stopping)
        ));
    }

    #[tokio::test]
    async fn test_parent_token_cancels_client() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (handler, _rx) = recorder();
        let client = TcpClient::builder(fast_config(), handler).build();
        let parent = CancellationToken::new();

        client
            .connect_with(listener.local_addr().unwrap(), Some(&parent))
            .await
            .unwrap();
        let server_side = accept(&listener).await;
        parent.cancel();

        wait_for_state(&client, ConnectionState::Closed).await;
        assert!(!client.is_connected());
        assert!(!client.is_reconnecting());
        assert!(client.connection().is_none());
        assert!(matches!(
            client.send_message(&Message::heartbeat()).await,
            Err(NetError::NotConnected(_))
        ));

        // The socket itself is closed, not just abandoned.
        let read = tokio::time::timeout(Duration::from_secs(2), server_side.receive_message())
            .await
            .unwrap();
        assert!(read.is_err());

        // Nothing comes back.
        let redial = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(redial.is_err());
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_during_reconnect_is_stopped_by_close() {
        let addr = dead_addr().await;
        let (handler, _rx) = recorder();
        let client = TcpClient::builder(fast_config(), handler).build();

        client.connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.connect(addr).await.unwrap();
        assert!(client.is_reconnecting());

        let started = tokio::time::Instant::now();
        client.close().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));

        let listener = create_listener(addr, &SocketConfig::default()).unwrap();
        let accepted = tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
        assert!(accepted.is_err(), "a reconnect loop outlived close");
        assert!(!client.is_connected());
        assert_eq!(client.state().current(), ConnectionState::Closed);
    }
}
