//! The [`Connection`] abstraction shared by clients, servers, and handlers.
//!
//! A connection moves whole [`Message`]s. [`TcpConnection`] frames them on a
//! byte stream; [`WebSocketConnection`] puts exactly one frame in each binary
//! WebSocket message. Both carry an arbitrary metadata slot that servers fill
//! with the peer's [`Handshake`] once it has been received.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::codec::Codec;
use crate::error::{NetError, NetResult};
use crate::framing::FrameCodec;
use crate::messages::{Handshake, Message, MessageType};

/// Arbitrary per-connection data attached by the application.
pub type Meta = Arc<dyn Any + Send + Sync>;

/// Unique identifier for a connection within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Atomic generator for monotonically increasing [`ConnectionId`]s.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a new generator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Return the next unique [`ConnectionId`].
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// A bidirectional message channel to one peer.
///
/// `send_message` and `receive_message` may be called concurrently from
/// different tasks. `close` is idempotent and wakes a pending receive, which
/// then fails with [`NetError::ConnectionClosed`].
#[async_trait]
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    async fn send_message(&self, msg: &Message) -> NetResult<()>;

    async fn receive_message(&self) -> NetResult<Message>;

    async fn close(&self) -> NetResult<()>;

    fn is_closed(&self) -> bool;

    fn remote_addr(&self) -> SocketAddr;

    fn meta(&self) -> Option<Meta>;

    fn set_meta(&self, meta: Meta);
}

/// Typed access to [`Connection::meta`].
pub trait ConnectionExt {
    /// The metadata downcast to `T`, if present and of that type.
    fn meta_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>>;
}

impl<C: Connection + ?Sized> ConnectionExt for C {
    fn meta_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.meta()?.downcast::<T>().ok()
    }
}

#[derive(Default)]
struct MetaSlot(RwLock<Option<Meta>>);

impl MetaSlot {
    fn get(&self) -> Option<Meta> {
        self.0.read().clone()
    }

    fn set(&self, meta: Meta) {
        *self.0.write() = Some(meta);
    }
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

/// A framed TCP stream.
pub struct TcpConnection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    codec: Arc<FrameCodec>,
    closed: CancellationToken,
    meta: MetaSlot,
}

impl TcpConnection {
    pub fn new(id: ConnectionId, stream: TcpStream, codec: Arc<FrameCodec>) -> std::io::Result<Self> {
        let remote_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            id,
            remote_addr,
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(writer),
            codec,
            closed: CancellationToken::new(),
            meta: MetaSlot::default(),
        })
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn send_message(&self, msg: &Message) -> NetResult<()> {
        if self.closed.is_cancelled() {
            return Err(NetError::ConnectionClosed);
        }
        tokio::select! {
            _ = self.closed.cancelled() => Err(NetError::ConnectionClosed),
            result = async {
                let mut writer = self.writer.lock().await;
                self.codec.write_message(&mut *writer, msg).await
            } => result,
        }
    }

    async fn receive_message(&self) -> NetResult<Message> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(NetError::ConnectionClosed),
            result = async {
                let mut reader = self.reader.lock().await;
                self.codec.read_message(&mut *reader).await
            } => result,
        }
    }

    async fn close(&self) -> NetResult<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        let mut writer = self.writer.lock().await;
        match writer.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn meta(&self) -> Option<Meta> {
        self.meta.get()
    }

    fn set_meta(&self, meta: Meta) {
        self.meta.set(meta);
    }
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// A WebSocket stream carrying one frame per binary message.
pub struct WebSocketConnection<S> {
    id: ConnectionId,
    remote_addr: SocketAddr,
    sink: Mutex<SplitSink<WebSocketStream<S>, WsMessage>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
    codec: Arc<FrameCodec>,
    closed: CancellationToken,
    meta: MetaSlot,
}

impl<S> WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        id: ConnectionId,
        remote_addr: SocketAddr,
        ws: WebSocketStream<S>,
        codec: Arc<FrameCodec>,
    ) -> Self {
        let (sink, stream) = ws.split();
        Self {
            id,
            remote_addr,
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            codec,
            closed: CancellationToken::new(),
            meta: MetaSlot::default(),
        }
    }

    async fn next_frame(&self) -> NetResult<Message> {
        let mut stream = self.stream.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(WsMessage::Binary(data))) => return self.codec.decode(&data),
                Some(Ok(WsMessage::Text(_))) => {
                    return Err(NetError::InvalidMessage("text frames are not accepted"));
                }
                Some(Ok(WsMessage::Close(_))) | None => return Err(NetError::ConnectionClosed),
                // tungstenite answers pings itself.
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => continue,
                Some(Err(e)) => {
                    let e = NetError::from(e);
                    return Err(if e.is_disconnect() {
                        NetError::ConnectionClosed
                    } else {
                        e
                    });
                }
            }
        }
    }
}

#[async_trait]
impl<S> Connection for WebSocketConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn send_message(&self, msg: &Message) -> NetResult<()> {
        if self.closed.is_cancelled() {
            return Err(NetError::ConnectionClosed);
        }
        let frame = self.codec.encode(msg)?;
        tokio::select! {
            _ = self.closed.cancelled() => Err(NetError::ConnectionClosed),
            result = async {
                let mut sink = self.sink.lock().await;
                sink.send(WsMessage::Binary(frame.into())).await
            } => result.map_err(NetError::from),
        }
    }

    async fn receive_message(&self) -> NetResult<Message> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(NetError::ConnectionClosed),
            result = self.next_frame() => result,
        }
    }

    async fn close(&self) -> NetResult<()> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.closed.cancel();
        let mut sink = self.sink.lock().await;
        // The peer may already be gone; a failed close frame changes nothing.
        let _ = sink.close().await;
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn meta(&self) -> Option<Meta> {
        self.meta.get()
    }

    fn set_meta(&self, meta: Meta) {
        self.meta.set(meta);
    }
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// Wait up to `wait` for the peer's handshake and store it as metadata.
///
/// The first message must be [`MessageType::Handshake`]; anything else fails
/// with [`NetError::Handshake`].
pub async fn accept_handshake(
    conn: &dyn Connection,
    codec: &Codec,
    wait: Duration,
) -> NetResult<Handshake> {
    let msg = tokio::time::timeout(wait, conn.receive_message())
        .await
        .map_err(|_| NetError::Handshake(format!("no handshake within {wait:?}")))??;

    let result = if msg.kind() != Some(MessageType::Handshake) {
        Err(NetError::Handshake(format!(
            "expected handshake, got message type {:#04x}",
            msg.msg_type
        )))
    } else {
        codec
            .decode_handshake(&msg.payload)
            .map_err(|e| NetError::Handshake(e.to_string()))
    };
    codec.pools().recycle(msg);

    let handshake = result?;
    conn.set_meta(Arc::new(handshake));
    Ok(handshake)
}

/// Send our identity as the first message on `conn`.
pub async fn send_handshake(conn: &dyn Connection, codec: &Codec, hs: &Handshake) -> NetResult<()> {
    let payload = codec.encode_handshake(hs)?;
    let msg = codec.pools().message(MessageType::Handshake.into(), payload);
    let result = conn.send_message(&msg).await;
    codec.pools().recycle(msg);
    result
}
