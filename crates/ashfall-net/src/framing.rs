//! Length-prefixed framing for TCP streams and WebSocket messages.
//!
//! Every message on the wire is one frame:
//!
//! ```text
//! +-------------------+----------+-------+-----------------+
//! | length (4 bytes)  | msg_type | flags |   payload       |
//! | u32 little-endian |  1 byte  | 1 byte| (length - 2)    |
//! +-------------------+----------+-------+-----------------+
//! ```
//!
//! `length` counts the type byte, the flags byte, and the payload, but not the
//! 4 prefix bytes. Flag bit 0 marks a zstd-compressed payload; bit 1 is
//! reserved for encryption and never set.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::compression::{CompressionConfig, CompressionError, PayloadCompressor};
use crate::error::{NetError, NetResult};
use crate::messages::Message;
use crate::pool::Pools;

/// Payload is stored as-is.
pub const FLAG_NONE: u8 = 0x00;
/// Payload is zstd-compressed.
pub const FLAG_COMPRESSED: u8 = 0x01;
/// Reserved.
pub const FLAG_ENCRYPTED: u8 = 0x02;

/// Bytes of the length prefix.
pub const LENGTH_PREFIX: usize = 4;
/// Bytes of type + flags at the start of every frame body.
pub const BODY_HEADER: usize = 2;
/// Default cap on a frame body: 1 MiB.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed body size (type + flags + payload). Default: 1 MiB.
    pub max_frame_size: usize,
    pub compression: CompressionConfig,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            compression: CompressionConfig::default(),
        }
    }
}

/// Turns [`Message`]s into frames and back, compressing on the way out.
pub struct FrameCodec {
    max_frame_size: usize,
    compressor: PayloadCompressor,
    pools: Pools,
}

impl FrameCodec {
    pub fn new(config: FrameConfig, pools: Pools) -> Self {
        Self {
            max_frame_size: config.max_frame_size,
            compressor: PayloadCompressor::new(config.compression, pools.buffers.clone()),
            pools,
        }
    }

    pub fn pools(&self) -> &Pools {
        &self.pools
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode `msg` into a complete frame held in a pooled buffer.
    ///
    /// Hand the buffer back with `pools().buffers.put` once written.
    pub fn encode(&self, msg: &Message) -> NetResult<Vec<u8>> {
        let compressed = or_uncompressed(self.compressor.compress(&msg.payload));
        let (flags, payload) = match &compressed {
            Some(bytes) => (FLAG_COMPRESSED, bytes.as_slice()),
            None => (FLAG_NONE, msg.payload.as_slice()),
        };

        let body_len = BODY_HEADER + payload.len();
        let result = if body_len > self.max_frame_size {
            Err(NetError::FrameTooLarge {
                size: body_len,
                max: self.max_frame_size,
            })
        } else {
            let mut frame = self.pools.buffers.get_empty(LENGTH_PREFIX + body_len);
            frame.extend_from_slice(&(body_len as u32).to_le_bytes());
            frame.push(msg.msg_type);
            frame.push(flags);
            frame.extend_from_slice(payload);
            Ok(frame)
        };

        if let Some(bytes) = compressed {
            self.pools.buffers.put(bytes);
        }
        result
    }

    /// Encode and write one frame, then flush.
    pub async fn write_message<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        msg: &Message,
    ) -> NetResult<()> {
        let frame = self.encode(msg)?;
        let written = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;
        self.pools.buffers.put(frame);
        written.map_err(NetError::from)
    }

    /// Read exactly one frame from the stream.
    ///
    /// An oversized length prefix is rejected before any body byte is read.
    /// Returns [`NetError::ConnectionClosed`] if the stream ends mid-frame.
    pub async fn read_message<R: AsyncRead + Unpin>(&self, reader: &mut R) -> NetResult<Message> {
        let mut len_buf = [0u8; LENGTH_PREFIX];
        reader.read_exact(&mut len_buf).await.map_err(eof_is_closed)?;
        let body_len = self.check_length(u32::from_le_bytes(len_buf) as usize)?;

        let mut header = [0u8; BODY_HEADER];
        reader.read_exact(&mut header).await.map_err(eof_is_closed)?;
        let [msg_type, flags] = header;

        let mut payload = self.pools.buffers.get(body_len - BODY_HEADER);
        if let Err(e) = reader.read_exact(&mut payload).await {
            self.pools.buffers.put(payload);
            return Err(eof_is_closed(e));
        }

        self.finish(msg_type, flags, payload)
    }

    /// Decode a frame that arrived whole, e.g. one WebSocket binary message.
    pub fn decode(&self, frame: &[u8]) -> NetResult<Message> {
        let Some((len_buf, body)) = frame.split_first_chunk::<LENGTH_PREFIX>() else {
            return Err(NetError::InvalidMessage("frame shorter than length prefix"));
        };
        let body_len = self.check_length(u32::from_le_bytes(*len_buf) as usize)?;
        if body.len() != body_len {
            return Err(NetError::InvalidMessage("frame length does not match data"));
        }

        let mut payload = self.pools.buffers.get_empty(body_len - BODY_HEADER);
        payload.extend_from_slice(&body[BODY_HEADER..]);
        self.finish(body[0], body[1], payload)
    }

    fn check_length(&self, body_len: usize) -> NetResult<usize> {
        if body_len > self.max_frame_size {
            return Err(NetError::FrameTooLarge {
                size: body_len,
                max: self.max_frame_size,
            });
        }
        if body_len < BODY_HEADER {
            return Err(NetError::InvalidMessage("frame shorter than type and flags"));
        }
        Ok(body_len)
    }

    fn finish(&self, msg_type: u8, flags: u8, payload: Vec<u8>) -> NetResult<Message> {
        if flags & FLAG_COMPRESSED == 0 {
            return Ok(self.pools.message(msg_type, payload));
        }
        let inflated = self.compressor.decompress(&payload);
        self.pools.buffers.put(payload);
        Ok(self.pools.message(msg_type, inflated?))
    }
}

/// A failed compression sends the payload as-is.
fn or_uncompressed(result: Result<Option<Vec<u8>>, CompressionError>) -> Option<Vec<u8>> {
    result.unwrap_or_else(|e| {
        tracing::debug!("{e}, sending payload uncompressed");
        None
    })
}

fn eof_is_closed(e: std::io::Error) -> NetError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        NetError::ConnectionClosed
    } else {
        NetError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::MessageType;
    use tokio::io::duplex;

    fn codec() -> FrameCodec {
        FrameCodec::new(FrameConfig::default(), Pools::new())
    }

    fn small_codec(max_frame_size: usize) -> FrameCodec {
        FrameCodec::new(
            FrameConfig {
                max_frame_size,
                ..Default::default()
            },
            Pools::new(),
        )
    }

    #[tokio::test]
    async fn test_single_message_roundtrip() {
        let (mut client, mut server) = duplex(8192);
        let codec = codec();
        let msg = Message::new(MessageType::Client, b"hello world".to_vec());

        codec.write_message(&mut client, &msg).await.unwrap();
        let received = codec.read_message(&mut server).await.unwrap();
        assert_eq!(received, msg);
    }

    #[test]
    fn test_frame_layout() {
        let frame = codec()
            .encode(&Message::new(MessageType::RpcRequest, b"abc".to_vec()))
            .unwrap();
        assert_eq!(&frame[..4], &5u32.to_le_bytes());
        assert_eq!(frame[4], 0x03);
        assert_eq!(frame[5], FLAG_NONE);
        assert_eq!(&frame[6..], b"abc");
    }

    #[tokio::test]
    async fn test_large_payload_is_compressed_on_wire() {
        let (mut client, mut server) = duplex(1 << 20);
        let codec = codec();
        let msg = Message::new(MessageType::Client, vec![b'x'; 64 * 1024]);

        let frame = codec.encode(&msg).unwrap();
        assert_eq!(frame[5], FLAG_COMPRESSED);
        assert!(frame.len() < msg.payload.len());

        codec.write_message(&mut client, &msg).await.unwrap();
        let received = codec.read_message(&mut server).await.unwrap();
        assert_eq!(received.payload.len(), 64 * 1024);
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn test_partial_read_resumes_correctly() {
        let (mut client, mut server) = duplex(8);
        let codec = std::sync::Arc::new(codec());
        let msg = Message::new(MessageType::Client, b"this message is larger than the buffer".to_vec());

        let write_codec = codec.clone();
        let write_msg = msg.clone();
        let write_task = tokio::spawn(async move {
            write_codec
                .write_message(&mut client, &write_msg)
                .await
                .unwrap();
        });

        let received = codec.read_message(&mut server).await.unwrap();
        write_task.await.unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn test_back_to_back_messages_dont_merge() {
        let (mut client, mut server) = duplex(8192);
        let codec = codec();

        codec
            .write_message(&mut client, &Message::new(MessageType::Client, b"aaa".to_vec()))
            .await
            .unwrap();
        codec
            .write_message(&mut client, &Message::heartbeat())
            .await
            .unwrap();

        let first = codec.read_message(&mut server).await.unwrap();
        let second = codec.read_message(&mut server).await.unwrap();
        assert_eq!(first.payload, b"aaa");
        assert!(second.is_heartbeat());
    }

    #[tokio::test]
    async fn test_empty_payload_is_valid() {
        let (mut client, mut server) = duplex(64);
        let codec = codec();
        codec
            .write_message(&mut client, &Message::new(MessageType::Heartbeat, Vec::new()))
            .await
            .unwrap();
        let received = codec.read_message(&mut server).await.unwrap();
        assert!(received.payload.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_message_rejected_on_read() {
        let (mut client, mut server) = duplex(8192);
        let codec = small_codec(16);

        // Only the prefix is ever written; the reader must not wait for a body.
        client.write_all(&1024u32.to_le_bytes()).await.unwrap();
        client.flush().await.unwrap();

        let result = codec.read_message(&mut server).await;
        assert!(matches!(
            result,
            Err(NetError::FrameTooLarge { size: 1024, max: 16 })
        ));
    }

    #[test]
    fn test_oversized_message_rejected_on_encode() {
        let codec = small_codec(16);
        let result = codec.encode(&Message::new(MessageType::Client, vec![0u8; 15]));
        assert!(matches!(result, Err(NetError::FrameTooLarge { size: 17, .. })));

        assert!(codec
            .encode(&Message::new(MessageType::Client, vec![0u8; 14]))
            .is_ok());
    }

    #[tokio::test]
    async fn test_length_below_header_is_invalid() {
        let (mut client, mut server) = duplex(64);
        client.write_all(&1u32.to_le_bytes()).await.unwrap();
        client.write_all(&[0x02]).await.unwrap();

        let result = codec().read_message(&mut server).await;
        assert!(matches!(result, Err(NetError::InvalidMessage(_))));
    }

    #[tokio::test]
    async fn test_connection_closed_during_length_read() {
        let (client, mut server) = duplex(8192);
        drop(client);

        let result = codec().read_message(&mut server).await;
        assert!(matches!(result, Err(NetError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_connection_closed_mid_body() {
        let (mut client, mut server) = duplex(8192);
        client.write_all(&10u32.to_le_bytes()).await.unwrap();
        client.write_all(&[0x02, FLAG_NONE, 1, 2]).await.unwrap();
        drop(client);

        let result = codec().read_message(&mut server).await;
        assert!(matches!(result, Err(NetError::ConnectionClosed)));
    }

    #[test]
    fn test_decode_whole_frame() {
        let codec = codec();
        let msg = Message::new(MessageType::RpcResponse, vec![5u8; 3000]);
        let frame = codec.encode(&msg).unwrap();
        assert_eq!(codec.decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let codec = codec();
        let mut frame = codec
            .encode(&Message::new(MessageType::Client, b"abc".to_vec()))
            .unwrap();
        frame.push(0);
        assert!(matches!(codec.decode(&frame), Err(NetError::InvalidMessage(_))));
        assert!(codec.decode(&[1, 0]).is_err());
    }

    #[test]
    fn test_compression_failure_falls_back_to_raw() {
        let failed = Err(CompressionError::Compress(std::io::Error::other("dst too small")));
        assert!(or_uncompressed(failed).is_none());
        assert_eq!(or_uncompressed(Ok(Some(vec![1, 2]))), Some(vec![1, 2]));
    }

    #[test]
    fn test_unknown_message_type_survives() {
        let codec = codec();
        let msg = Message {
            msg_type: 0xEE,
            payload: b"?".to_vec(),
        };
        let decoded = codec.decode(&codec.encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded.msg_type, 0xEE);
        assert_eq!(decoded.kind(), None);
    }
}
