//! Wire messages for P2P communication
//!
//! Two fixed-width record shapes share a leading type field, which is the only
//! framing signal on the wire: a receiver reads the type field first and picks
//! the body width from its content.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Width of the type field (31 characters + NUL)
pub const TYPE_WIDTH: usize = 32;

/// Width of the sender field (63 characters + NUL)
pub const SENDER_WIDTH: usize = 64;

/// Width of the payload field of a regular message (255 characters + NUL)
pub const PAYLOAD_WIDTH: usize = 256;

/// Width of the ttl field (signed 32-bit, little-endian)
pub const TTL_WIDTH: usize = 4;

/// Width of the peer list field of a discovery message (1023 characters + NUL)
pub const PEER_LIST_WIDTH: usize = 1024;

/// Total size of a regular message frame
pub const MESSAGE_FRAME_LEN: usize = TYPE_WIDTH + SENDER_WIDTH + PAYLOAD_WIDTH;

/// Total size of a discovery message frame
pub const DISCOVERY_FRAME_LEN: usize = TYPE_WIDTH + SENDER_WIDTH + TTL_WIDTH + PEER_LIST_WIDTH;

/// Longest peer list that fits on the wire
pub const MAX_PEER_LIST_LEN: usize = PEER_LIST_WIDTH - 1;

/// Type field literal that marks a discovery frame
pub const DISCOVERY_TYPE: &str = "DISCOVERY";

/// Wire decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: usize, actual: usize },
}

/// Application-level message used by send and broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: String,
    pub sender: String,
    pub payload: String,
}

impl Message {
    pub fn new(
        msg_type: impl Into<String>,
        sender: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            msg_type: msg_type.into(),
            sender: sender.into(),
            payload: payload.into(),
        }
    }
}

/// Peer announcement carried by the gossip protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryMessage {
    /// Node id of the announcing node
    pub sender: String,
    /// Remaining hop budget
    pub ttl: i32,
    /// Comma-separated `host:port` addresses
    pub peer_list: String,
}

impl DiscoveryMessage {
    pub fn new(sender: impl Into<String>, ttl: i32, peer_list: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            ttl,
            peer_list: peer_list.into(),
        }
    }

    /// Non-empty addresses of the peer list, trimmed, in wire order
    pub fn peers(&self) -> impl Iterator<Item = &str> {
        self.peer_list
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }
}

/// A decoded wire record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Message(Message),
    Discovery(DiscoveryMessage),
}

impl Frame {
    /// Bytes this frame occupies on the wire
    pub fn encoded_len(&self) -> usize {
        match self {
            Frame::Message(_) => MESSAGE_FRAME_LEN,
            Frame::Discovery(_) => DISCOVERY_FRAME_LEN,
        }
    }

    /// Append the fixed-width encoding of this frame to `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        match self {
            Frame::Message(msg) => {
                put_field(dst, &msg.msg_type, TYPE_WIDTH);
                put_field(dst, &msg.sender, SENDER_WIDTH);
                put_field(dst, &msg.payload, PAYLOAD_WIDTH);
            }
            Frame::Discovery(msg) => {
                put_field(dst, DISCOVERY_TYPE, TYPE_WIDTH);
                put_field(dst, &msg.sender, SENDER_WIDTH);
                dst.put_i32_le(msg.ttl);
                put_field(dst, &msg.peer_list, PEER_LIST_WIDTH);
            }
        }
    }

    /// Encode into a standalone buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode one frame from the start of `src`.
    ///
    /// Fails with [`CodecError::ShortRead`] when `src` holds fewer bytes than
    /// the type field, or than the full frame the type field selects.
    pub fn decode(src: &[u8]) -> Result<Self, CodecError> {
        let len = Self::frame_len(src)?;
        if src.len() < len {
            return Err(CodecError::ShortRead {
                expected: len,
                actual: src.len(),
            });
        }

        let sender_end = TYPE_WIDTH + SENDER_WIDTH;
        let sender = get_field(&src[TYPE_WIDTH..sender_end]);

        if len == DISCOVERY_FRAME_LEN {
            let ttl_end = sender_end + TTL_WIDTH;
            let mut ttl = [0u8; TTL_WIDTH];
            ttl.copy_from_slice(&src[sender_end..ttl_end]);
            let peer_list = get_field(&src[ttl_end..len]);
            Ok(Frame::Discovery(DiscoveryMessage {
                sender,
                ttl: i32::from_le_bytes(ttl),
                peer_list,
            }))
        } else {
            let msg_type = get_field(&src[..TYPE_WIDTH]);
            let payload = get_field(&src[sender_end..len]);
            Ok(Frame::Message(Message {
                msg_type,
                sender,
                payload,
            }))
        }
    }

    /// Classify a stream by its type field and return the full frame length.
    ///
    /// Needs only the first [`TYPE_WIDTH`] bytes.
    pub fn frame_len(src: &[u8]) -> Result<usize, CodecError> {
        if src.len() < TYPE_WIDTH {
            return Err(CodecError::ShortRead {
                expected: TYPE_WIDTH,
                actual: src.len(),
            });
        }
        let msg_type = get_field(&src[..TYPE_WIDTH]);
        if msg_type.trim() == DISCOVERY_TYPE {
            Ok(DISCOVERY_FRAME_LEN)
        } else {
            Ok(MESSAGE_FRAME_LEN)
        }
    }

    /// Type name for logging
    pub fn type_name(&self) -> &str {
        match self {
            Frame::Message(msg) => &msg.msg_type,
            Frame::Discovery(_) => DISCOVERY_TYPE,
        }
    }
}

/// Write `value` NUL-padded to `width`, keeping the last byte NUL.
fn put_field(dst: &mut BytesMut, value: &str, width: usize) {
    let value = truncate_to_boundary(value, width - 1);
    dst.put_slice(value.as_bytes());
    dst.put_bytes(0, width - value.len());
}

/// Read a field up to its first NUL. Bytes are taken as-is; anything that is
/// not UTF-8 becomes U+FFFD.
fn get_field(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Longest prefix of `value` that is at most `max` bytes and ends on a char boundary
pub(crate) fn truncate_to_boundary(value: &str, max: usize) -> &str {
    if value.len() <= max {
        return value;
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

/// Receiver of regular (non-discovery) messages
///
/// The node never decides what an application message means; whoever creates
/// the network supplies this capability.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &Message);
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) + Send + Sync,
{
    fn handle(&self, message: &Message) {
        self(message)
    }
}

/// Prints every received message to stdout
#[derive(Debug, Default, Clone, Copy)]
pub struct PrintHandler;

impl MessageHandler for PrintHandler {
    fn handle(&self, message: &Message) {
        println!(
            "Received {} from {}: {}",
            message.msg_type, message.sender, message.payload
        );
    }
}
