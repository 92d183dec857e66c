//! Message envelope and the typed payloads carried inside it.
//!
//! A [`Message`] is what handlers see: a type byte plus raw payload bytes.
//! The payload structs below are produced and consumed by [`crate::codec`].

use crate::pool::Reset;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Known values of the frame's message-type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Session created or closed on a gateway.
    SessionEvent = 0x01,
    /// Message bound for, or coming from, an end client.
    Client = 0x02,
    RpcRequest = 0x03,
    RpcResponse = 0x04,
    /// Identity exchange right after connect.
    Handshake = 0x05,
    /// Keepalive; never reaches a handler.
    Heartbeat = 0x06,
}

impl MessageType {
    /// Map a raw type byte to a known type.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::SessionEvent),
            0x02 => Some(Self::Client),
            0x03 => Some(Self::RpcRequest),
            0x04 => Some(Self::RpcResponse),
            0x05 => Some(Self::Handshake),
            0x06 => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        value as u8
    }
}

/// One framed message. `msg_type` stays a raw byte so unknown types survive
/// the transport and can be reported by the handler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub msg_type: u8,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            msg_type: msg_type.into(),
            payload,
        }
    }

    /// The typed message type, or `None` for an unknown byte.
    pub fn kind(&self) -> Option<MessageType> {
        MessageType::from_u8(self.msg_type)
    }

    /// A heartbeat carrying the conventional `"ping"` body.
    pub fn heartbeat() -> Self {
        Self::new(MessageType::Heartbeat, b"ping".to_vec())
    }

    pub fn is_heartbeat(&self) -> bool {
        self.kind() == Some(MessageType::Heartbeat)
    }
}

impl Reset for Message {
    fn reset(&mut self) {
        self.msg_type = 0;
        self.payload.clear();
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Service identity exchanged once after connect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Handshake {
    /// Kind of server this peer is (gateway, game, ...).
    pub server_type: u8,
    pub platform_id: u32,
    pub zone_id: u32,
    /// Sub-type within `server_type`.
    pub srv_type: u8,
}

/// Request half of an RPC exchanged between services.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcRequest {
    pub request_id: u32,
    /// Session the request acts for; empty for service-level calls.
    pub session_id: String,
    pub msg_id: u16,
    pub data: Vec<u8>,
}

impl Reset for RpcRequest {
    fn reset(&mut self) {
        self.request_id = 0;
        self.session_id.clear();
        self.msg_id = 0;
        self.data.clear();
    }
}

/// Response half of an RPC. `code == 0` means success.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcResponse {
    pub request_id: u32,
    pub code: i32,
    pub data: Vec<u8>,
}

impl RpcResponse {
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

impl Reset for RpcResponse {
    fn reset(&mut self) {
        self.request_id = 0;
        self.code = 0;
        self.data.clear();
    }
}

/// A message addressed to an end client by message id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientMessage {
    pub msg_id: u16,
    pub data: Vec<u8>,
}

impl Reset for ClientMessage {
    fn reset(&mut self) {
        self.msg_id = 0;
        self.data.clear();
    }
}

/// An opaque payload routed to a session, usually an encoded [`ClientMessage`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardMessage {
    pub session_id: String,
    pub payload: Vec<u8>,
}

impl Reset for ForwardMessage {
    fn reset(&mut self) {
        self.session_id.clear();
        self.payload.clear();
    }
}

/// What happened to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionEventType {
    New = 1,
    Close = 2,
}

impl SessionEventType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::New),
            2 => Some(Self::Close),
            _ => None,
        }
    }
}

/// Session lifecycle notification sent from a gateway to backend services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    pub event_type: SessionEventType,
    pub session_id: String,
    pub user_id: String,
}
