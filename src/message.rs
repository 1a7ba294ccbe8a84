use std::fmt::{Debug, Formatter};
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use tokio::time::Instant;
use tracing::warn;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ProtocolMessageType {
    None = 0,
    Regular = 1,
    Control = 2,
    Ack = 3,
    // 4 is reserved
    Disconnect = 5,
    ReplayRequest = 6,
    Pause = 7,
    Resume = 8,
    KeepAlive = 9,
}

impl ProtocolMessageType {
    /// Unknown type bytes are mapped to `None` so the frame's body is still consumed and framing
    ///  stays in sync - the message is then ignored by all receivers.
    pub fn from_wire(raw: u8) -> ProtocolMessageType {
        match ProtocolMessageType::try_from(raw) {
            Ok(t) => t,
            Err(_) => {
                warn!("received frame with unknown message type {} - ignoring", raw);
                ProtocolMessageType::None
            }
        }
    }
}

/// The unit of transmission. `id` is the sequence number for `Regular` messages and 0 otherwise,
///  `ack` is the highest sequence number the sender has received in order (0 meaning 'ignore').
#[derive(Clone)]
pub struct ProtocolMessage {
    pub message_type: ProtocolMessageType,
    pub id: u32,
    pub ack: u32,
    pub data: Bytes,
    /// set by the frame writer when the message is handed to it
    pub written_time: Option<Instant>,
}

impl ProtocolMessage {
    pub fn new(message_type: ProtocolMessageType, id: u32, ack: u32, data: Bytes) -> ProtocolMessage {
        ProtocolMessage {
            message_type,
            id,
            ack,
            data,
            written_time: None,
        }
    }

    pub fn empty(message_type: ProtocolMessageType, id: u32, ack: u32) -> ProtocolMessage {
        Self::new(message_type, id, ack, Bytes::new())
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            message_type: self.message_type,
            id: self.id,
            ack: self.ack,
            body_len: self.data.len()
                .try_into()
                .expect("this is a bug: payload length should have been checked when the message was sent"),
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.header().ser(buf);
        buf.put_slice(&self.data);
    }
}

/// The frame header holds the body length as a u32, so longer payloads can not be sent
pub fn check_payload_len(len: usize) -> anyhow::Result<()> {
    if u32::try_from(len).is_err() {
        bail!("payload of {} bytes exceeds the maximum frame body length of {} bytes", len, u32::MAX);
    }
    Ok(())
}

impl PartialEq for ProtocolMessage {
    /// the written time is local bookkeeping and not part of a message's identity
    fn eq(&self, other: &Self) -> bool {
        self.message_type == other.message_type
            && self.id == other.id
            && self.ack == other.ack
            && self.data == other.data
    }
}
impl Eq for ProtocolMessage {}

impl Debug for ProtocolMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}(id={}, ack={}, {} bytes)", self.message_type, self.id, self.ack, self.data.len())
    }
}

/// Fixed-size frame header, all numbers in network byte order (BE):
///
/// ```ascii
/// 0: message type (u8)
/// 1: sequence id (u32)
/// 5: ack id (u32)
/// 9: body length (u32)
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FrameHeader {
    pub message_type: ProtocolMessageType,
    pub id: u32,
    pub ack: u32,
    pub body_len: u32,
}

impl FrameHeader {
    pub const SERIALIZED_LEN: usize = 13;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.message_type.into());
        buf.put_u32(self.id);
        buf.put_u32(self.ack);
        buf.put_u32(self.body_len);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<FrameHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("frame header requires {} bytes, got {}", Self::SERIALIZED_LEN, buf.remaining());
        }

        let message_type = ProtocolMessageType::from_wire(buf.get_u8());
        let id = buf.get_u32();
        let ack = buf.get_u32();
        let body_len = buf.get_u32();
        Ok(FrameHeader {
            message_type,
            id,
            ack,
            body_len,
        })
    }
}
