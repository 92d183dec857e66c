//! Transport layer: frame codec, payload codecs, pooling, connections, TCP client and servers, WebSocket server.

pub mod admission;
pub mod codec;
pub mod compression;
pub mod connection;
pub mod error;
pub mod framing;
pub mod handler;
pub mod messages;
pub mod platform;
pub mod pool;
pub mod reconnection;
pub mod sender;
mod serve;
pub mod tcp_client;
pub mod tcp_server;
pub mod ws_server;

pub use admission::{AdmissionPolicy, ConnectionSlot, Rejection};
pub use codec::Codec;
pub use compression::{CompressionConfig, CompressionError, PayloadCompressor};
pub use connection::{
    Connection, ConnectionExt, ConnectionId, IdGenerator, Meta, TcpConnection,
    WebSocketConnection, accept_handshake, send_handshake,
};
pub use error::{NetError, NetResult};
pub use framing::{FrameCodec, FrameConfig};
pub use handler::{ConnectionCallback, HandlerError, HandlerResult, MessageHandler};
pub use messages::{
    ClientMessage, ForwardMessage, Handshake, Message, MessageType, RpcRequest, RpcResponse,
    SessionEvent, SessionEventType,
};
pub use platform::{Keepalive, SocketConfig};
pub use pool::{BufferPool, ObjectPool, Pools, Reset};
pub use reconnection::{ReconnectConfig, ReconnectState};
pub use sender::MessageSender;
pub use tcp_client::{ConnectionState, ConnectionStateWatch, TcpClient, TcpClientBuilder, TcpClientConfig};
pub use tcp_server::{TcpServer, TcpServerBuilder, TcpServerConfig};
pub use ws_server::{OriginCheck, WsServer, WsServerBuilder, WsServerConfig};
