//! Binary codecs for the payload kinds carried inside a [`Message`](crate::Message).
//!
//! All integers are little-endian. Strings are UTF-8 with a `u16` length
//! prefix. Layouts:
//!
//! ```text
//! ClientMessage   [msg_id u16][data ..]
//! ForwardMessage  [sid_len u16][sid][payload ..]
//! RpcRequest      [request_id u32][sid_len u16][sid][msg_id u16][data ..]
//! RpcResponse     [request_id u32][code i32][data ..]
//! SessionEvent    [event_type u8][sid_len u16][sid][uid_len u16][uid]
//! Handshake       [server_type u8][platform_id u32][zone_id u32][srv_type u8]
//! ```
//!
//! Encoders write into buffers from the injected [`Pools`]; decoders fill
//! pooled objects where one exists.

use serde::Serialize;

use crate::error::{NetError, NetResult};
use crate::messages::{
    ClientMessage, ForwardMessage, Handshake, RpcRequest, RpcResponse, SessionEvent,
    SessionEventType,
};
use crate::pool::Pools;

/// Encoded size of a [`Handshake`].
pub const HANDSHAKE_LEN: usize = 10;

/// Payload encoder/decoder bound to a set of pools.
#[derive(Clone)]
pub struct Codec {
    pools: Pools,
}

impl Codec {
    pub fn new(pools: Pools) -> Self {
        Self { pools }
    }

    pub fn pools(&self) -> &Pools {
        &self.pools
    }

    // --- ClientMessage ---

    pub fn encode_client_message(&self, msg: &ClientMessage) -> NetResult<Vec<u8>> {
        let mut buf = self.pools.buffers.get_empty(2 + msg.data.len());
        buf.extend_from_slice(&msg.msg_id.to_le_bytes());
        buf.extend_from_slice(&msg.data);
        Ok(buf)
    }

    /// Encode `value` as JSON straight into a client message body.
    pub fn encode_client_message_json<T: Serialize + ?Sized>(
        &self,
        msg_id: u16,
        value: &T,
    ) -> NetResult<Vec<u8>> {
        let mut buf = self.pools.buffers.get_empty(256);
        buf.extend_from_slice(&msg_id.to_le_bytes());
        if let Err(e) = serde_json::to_writer(&mut buf, value) {
            self.pools.buffers.put(buf);
            return Err(e.into());
        }
        Ok(buf)
    }

    pub fn decode_client_message(&self, data: &[u8]) -> NetResult<ClientMessage> {
        let mut r = Reader::new(data);
        let msg_id = r.u16()?;
        let mut msg = self.pools.client_messages.get();
        msg.msg_id = msg_id;
        msg.data.extend_from_slice(r.rest());
        Ok(msg)
    }

    // --- ForwardMessage ---

    pub fn encode_forward_message(&self, msg: &ForwardMessage) -> NetResult<Vec<u8>> {
        let mut buf = self
            .pools
            .buffers
            .get_empty(2 + msg.session_id.len() + msg.payload.len());
        put_str(&mut buf, &msg.session_id)?;
        buf.extend_from_slice(&msg.payload);
        Ok(buf)
    }

    pub fn decode_forward_message(&self, data: &[u8]) -> NetResult<ForwardMessage> {
        let mut r = Reader::new(data);
        let session_id = r.str()?;
        let mut msg = self.pools.forward_messages.get();
        msg.session_id.push_str(session_id);
        msg.payload.extend_from_slice(r.rest());
        Ok(msg)
    }

    // --- RPC ---

    pub fn encode_rpc_request(&self, req: &RpcRequest) -> NetResult<Vec<u8>> {
        let mut buf = self
            .pools
            .buffers
            .get_empty(8 + req.session_id.len() + req.data.len());
        buf.extend_from_slice(&req.request_id.to_le_bytes());
        put_str(&mut buf, &req.session_id)?;
        buf.extend_from_slice(&req.msg_id.to_le_bytes());
        buf.extend_from_slice(&req.data);
        Ok(buf)
    }

    pub fn decode_rpc_request(&self, data: &[u8]) -> NetResult<RpcRequest> {
        if data.len() < 8 {
            return Err(NetError::InvalidMessage("rpc request shorter than 8 bytes"));
        }
        let mut r = Reader::new(data);
        let request_id = r.u32()?;
        let session_id = r.str()?;
        let msg_id = r.u16()?;

        let mut req = self.pools.rpc_requests.get();
        req.request_id = request_id;
        req.session_id.push_str(session_id);
        req.msg_id = msg_id;
        req.data.extend_from_slice(r.rest());
        Ok(req)
    }

    pub fn encode_rpc_response(&self, resp: &RpcResponse) -> NetResult<Vec<u8>> {
        let mut buf = self.pools.buffers.get_empty(8 + resp.data.len());
        buf.extend_from_slice(&resp.request_id.to_le_bytes());
        buf.extend_from_slice(&resp.code.to_le_bytes());
        buf.extend_from_slice(&resp.data);
        Ok(buf)
    }

    pub fn decode_rpc_response(&self, data: &[u8]) -> NetResult<RpcResponse> {
        if data.len() < 8 {
            return Err(NetError::InvalidMessage("rpc response shorter than 8 bytes"));
        }
        let mut r = Reader::new(data);
        let request_id = r.u32()?;
        let code = r.i32()?;

        let mut resp = self.pools.rpc_responses.get();
        resp.request_id = request_id;
        resp.code = code;
        resp.data.extend_from_slice(r.rest());
        Ok(resp)
    }

    // --- SessionEvent ---

    pub fn encode_session_event(&self, event: &SessionEvent) -> NetResult<Vec<u8>> {
        let mut buf = self
            .pools
            .buffers
            .get_empty(5 + event.session_id.len() + event.user_id.len());
        buf.push(event.event_type as u8);
        put_str(&mut buf, &event.session_id)?;
        put_str(&mut buf, &event.user_id)?;
        Ok(buf)
    }

    pub fn decode_session_event(&self, data: &[u8]) -> NetResult<SessionEvent> {
        if data.len() < 5 {
            return Err(NetError::InvalidMessage("session event shorter than 5 bytes"));
        }
        let mut r = Reader::new(data);
        let event_type = SessionEventType::from_u8(r.u8()?)
            .ok_or(NetError::InvalidMessage("unknown session event type"))?;
        let session_id = r.str()?.to_owned();
        let user_id = r.str()?.to_owned();
        Ok(SessionEvent {
            event_type,
            session_id,
            user_id,
        })
    }

    // --- Handshake ---

    pub fn encode_handshake(&self, hs: &Handshake) -> NetResult<Vec<u8>> {
        let mut buf = self.pools.buffers.get_empty(HANDSHAKE_LEN);
        buf.push(hs.server_type);
        buf.extend_from_slice(&hs.platform_id.to_le_bytes());
        buf.extend_from_slice(&hs.zone_id.to_le_bytes());
        buf.push(hs.srv_type);
        Ok(buf)
    }

    pub fn decode_handshake(&self, data: &[u8]) -> NetResult<Handshake> {
        if data.len() < HANDSHAKE_LEN {
            return Err(NetError::InvalidMessage("handshake shorter than 10 bytes"));
        }
        let mut r = Reader::new(data);
        Ok(Handshake {
            server_type: r.u8()?,
            platform_id: r.u32()?,
            zone_id: r.u32()?,
            srv_type: r.u8()?,
        })
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(Pools::shared())
    }
}

fn put_str(buf: &mut Vec<u8>, s: &str) -> NetResult<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| NetError::InvalidMessage("string longer than 65535 bytes"))?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Bounds-checked little-endian cursor.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> NetResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or(NetError::InvalidMessage("truncated payload"))?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> NetResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> NetResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> NetResult<u16> {
        self.array().map(u16::from_le_bytes)
    }

    fn u32(&mut self) -> NetResult<u32> {
        self.array().map(u32::from_le_bytes)
    }

    fn i32(&mut self) -> NetResult<i32> {
        self.array().map(i32::from_le_bytes)
    }

    fn str(&mut self) -> NetResult<&'a str> {
        let len = self.u16()? as usize;
        std::str::from_utf8(self.take(len)?)
            .map_err(|_| NetError::InvalidMessage("string is not valid UTF-8"))
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}
