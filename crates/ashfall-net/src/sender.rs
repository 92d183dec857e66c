//! Typed send helpers over a [`Connection`].
//!
//! Services rarely build [`Message`]s by hand: they send an RPC, forward a
//! payload to a session, or push a client message through a gateway.
//! [`MessageSender`] does the nested encoding with pooled buffers and hands
//! every intermediate buffer back once the frame is written.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::codec::Codec;
use crate::connection::Connection;
use crate::error::{NetError, NetResult};
use crate::messages::{Handshake, MessageType, RpcRequest, RpcResponse, SessionEvent};

/// Sends typed payloads on a swappable target connection.
pub struct MessageSender {
    conn: RwLock<Option<Arc<dyn Connection>>>,
    codec: Codec,
}

impl MessageSender {
    pub fn new(conn: Option<Arc<dyn Connection>>, codec: Codec) -> Self {
        Self {
            conn: RwLock::new(conn),
            codec,
        }
    }

    /// Point the sender at another connection, e.g. after a reconnect.
    pub fn set_conn(&self, conn: Arc<dyn Connection>) {
        *self.conn.write() = Some(conn);
    }

    pub fn conn(&self) -> Option<Arc<dyn Connection>> {
        self.conn.read().clone()
    }

    /// Send `data` to the client behind `session_id` as message `msg_id`.
    ///
    /// The body is a [`ClientMessage`](crate::ClientMessage) wrapped in a
    /// [`ForwardMessage`](crate::ForwardMessage), sent as
    /// [`MessageType::Client`].
    pub async fn send_to_client(&self, session_id: &str, msg_id: u16, data: &[u8]) -> NetResult<()> {
        let pools = self.codec.pools();
        let mut client_msg = pools.client_messages.get();
        client_msg.msg_id = msg_id;
        client_msg.data.extend_from_slice(data);
        let encoded = self.codec.encode_client_message(&client_msg);
        pools.client_messages.put(client_msg);

        self.forward_owned(session_id, encoded?).await
    }

    /// Like [`send_to_client`](Self::send_to_client) with `value` encoded as JSON.
    ///
    /// `value` is always serialized, so a byte slice becomes a JSON array.
    /// Bytes that already hold JSON go out unchanged through
    /// [`send_to_client`](Self::send_to_client).
    pub async fn send_to_client_json<T: Serialize + ?Sized>(
        &self,
        session_id: &str,
        msg_id: u16,
        value: &T,
    ) -> NetResult<()> {
        let body = self.codec.encode_client_message_json(msg_id, value)?;
        self.forward_owned(session_id, body).await
    }

    /// Forward an already-encoded client payload to `session_id`.
    pub async fn forward_client_msg(&self, session_id: &str, payload: &[u8]) -> NetResult<()> {
        let mut body = self.codec.pools().buffers.get_empty(payload.len());
        body.extend_from_slice(payload);
        self.forward_owned(session_id, body).await
    }

    pub async fn send_rpc_request(&self, req: &RpcRequest) -> NetResult<()> {
        let payload = self.codec.encode_rpc_request(req)?;
        self.send_payload(MessageType::RpcRequest, payload).await
    }

    pub async fn send_rpc_response(&self, resp: &RpcResponse) -> NetResult<()> {
        let payload = self.codec.encode_rpc_response(resp)?;
        self.send_payload(MessageType::RpcResponse, payload).await
    }

    pub async fn send_session_event(&self, event: &SessionEvent) -> NetResult<()> {
        let payload = self.codec.encode_session_event(event)?;
        self.send_payload(MessageType::SessionEvent, payload).await
    }

    pub async fn send_handshake(&self, hs: &Handshake) -> NetResult<()> {
        let payload = self.codec.encode_handshake(hs)?;
        self.send_payload(MessageType::Handshake, payload).await
    }

    /// Wrap `body` in a forward message for `session_id` and send it.
    /// `body` goes back to the buffer pool afterwards.
    async fn forward_owned(&self, session_id: &str, body: Vec<u8>) -> NetResult<()> {
        let pools = self.codec.pools();
        let mut forward = pools.forward_messages.get();
        forward.session_id.push_str(session_id);
        forward.payload = body;
        let encoded = self.codec.encode_forward_message(&forward);
        pools.buffers.put(std::mem::take(&mut forward.payload));
        pools.forward_messages.put(forward);

        self.send_payload(MessageType::Client, encoded?).await
    }

    async fn send_payload(&self, kind: MessageType, payload: Vec<u8>) -> NetResult<()> {
        let pools = self.codec.pools();
        let Some(conn) = self.conn() else {
            pools.buffers.put(payload);
            return Err(NetError::NotConnected("message sender has no connection".to_string()));
        };
        let msg = pools.message(kind.into(), payload);
        let result = conn.send_message(&msg).await;
        pools.recycle(msg);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionId, TcpConnection};
    use crate::framing::{FrameCodec, FrameConfig};
    use crate::messages::SessionEventType;
    use crate::pool::Pools;
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (Arc<dyn Connection>, TcpConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let codec = Arc::new(FrameCodec::new(FrameConfig::default(), Pools::new()));
        let local = TcpConnection::new(ConnectionId(1), client.unwrap(), codec.clone()).unwrap();
        let remote = TcpConnection::new(ConnectionId(2), accepted.unwrap().0, codec).unwrap();
        (Arc::new(local), remote)
    }

    fn sender(conn: Arc<dyn Connection>) -> (MessageSender, Codec) {
        let codec = Codec::new(Pools::new());
        (MessageSender::new(Some(conn), codec.clone()), codec)
    }

    #[tokio::test]
    async fn test_send_to_client_nests_client_in_forward() {
        let (local, remote) = pair().await;
        let (sender, codec) = sender(local);

        sender.send_to_client("sess-1", 1001, b"hp=10").await.unwrap();

        let msg = remote.receive_message().await.unwrap();
        assert_eq!(msg.kind(), Some(MessageType::Client));
        let forward = codec.decode_forward_message(&msg.payload).unwrap();
        assert_eq!(forward.session_id, "sess-1");
        let client = codec.decode_client_message(&forward.payload).unwrap();
        assert_eq!(client.msg_id, 1001);
        assert_eq!(client.data, b"hp=10");
    }

    #[tokio::test]
    async fn test_send_to_client_json() {
        #[derive(Serialize)]
        struct Loot<'a> {
            item: &'a str,
            count: u32,
        }

        let (local, remote) = pair().await;
        let (sender, codec) = sender(local);
        sender
            .send_to_client_json("s", 7, &Loot { item: "scrap", count: 3 })
            .await
            .unwrap();

        let msg = remote.receive_message().await.unwrap();
        let forward = codec.decode_forward_message(&msg.payload).unwrap();
        let client = codec.decode_client_message(&forward.payload).unwrap();
        assert_eq!(client.msg_id, 7);
        let json: serde_json::Value = serde_json::from_slice(&client.data).unwrap();
        assert_eq!(json["item"], "scrap");
        assert_eq!(json["count"], 3);
    }

    #[tokio::test]
    async fn test_pre_encoded_json_is_sent_verbatim() {
        let (local, remote) = pair().await;
        let (sender, codec) = sender(local);
        let raw = br#"{"item":"scrap"}"#;
        sender.send_to_client("s", 8, raw).await.unwrap();
        sender.send_to_client_json("s", 8, &raw[..]).await.unwrap();

        let msg = remote.receive_message().await.unwrap();
        let forward = codec.decode_forward_message(&msg.payload).unwrap();
        assert_eq!(codec.decode_client_message(&forward.payload).unwrap().data, raw);

        let msg = remote.receive_message().await.unwrap();
        let forward = codec.decode_forward_message(&msg.payload).unwrap();
        let data = codec.decode_client_message(&forward.payload).unwrap().data;
        assert!(data.starts_with(b"[123,"));
    }

    #[tokio::test]
    async fn test_forward_client_msg_keeps_payload_opaque() {
        let (local, remote) = pair().await;
        let (sender, codec) = sender(local);
        sender.forward_client_msg("s-9", &[0xde, 0xad]).await.unwrap();

        let msg = remote.receive_message().await.unwrap();
        let forward = codec.decode_forward_message(&msg.payload).unwrap();
        assert_eq!(forward.session_id, "s-9");
        assert_eq!(forward.payload, vec![0xde, 0xad]);
    }

    #[tokio::test]
    async fn test_rpc_and_session_event() {
        let (local, remote) = pair().await;
        let (sender, codec) = sender(local);

        let req = RpcRequest {
            request_id: 5,
            session_id: "s".to_string(),
            msg_id: 300,
            data: b"args".to_vec(),
        };
        sender.send_rpc_request(&req).await.unwrap();
        let resp = RpcResponse {
            request_id: 5,
            code: -2,
            data: Vec::new(),
        };
        sender.send_rpc_response(&resp).await.unwrap();
        let event = SessionEvent {
            event_type: SessionEventType::Close,
            session_id: "s".to_string(),
            user_id: "u".to_string(),
        };
        sender.send_session_event(&event).await.unwrap();

        let msg = remote.receive_message().await.unwrap();
        assert_eq!(msg.kind(), Some(MessageType::RpcRequest));
        assert_eq!(codec.decode_rpc_request(&msg.payload).unwrap(), req);

        let msg = remote.receive_message().await.unwrap();
        assert_eq!(msg.kind(), Some(MessageType::RpcResponse));
        assert_eq!(codec.decode_rpc_response(&msg.payload).unwrap(), resp);

        let msg = remote.receive_message().await.unwrap();
        assert_eq!(msg.kind(), Some(MessageType::SessionEvent));
        assert_eq!(codec.decode_session_event(&msg.payload).unwrap(), event);
    }

    #[tokio::test]
    async fn test_without_connection_fails() {
        let sender = MessageSender::new(None, Codec::new(Pools::new()));
        let result = sender.send_handshake(&Handshake::default()).await;
        assert!(matches!(result, Err(NetError::NotConnected(_))));
    }

    #[tokio::test]
    async fn test_set_conn_switches_target() {
        let (first, first_remote) = pair().await;
        let (second, second_remote) = pair().await;
        let (sender, codec) = sender(first);

        sender.send_handshake(&Handshake { zone_id: 1, ..Default::default() }).await.unwrap();
        sender.set_conn(second);
        sender.send_handshake(&Handshake { zone_id: 2, ..Default::default() }).await.unwrap();

        let msg = first_remote.receive_message().await.unwrap();
        assert_eq!(codec.decode_handshake(&msg.payload).unwrap().zone_id, 1);
        let msg = second_remote.receive_message().await.unwrap();
        assert_eq!(codec.decode_handshake(&msg.payload).unwrap().zone_id, 2);
    }
}
