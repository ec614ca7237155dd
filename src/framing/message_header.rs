use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};

/// The header of a length-prefixed frame: the payload length as a big-endian u32
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_len: u32,
}

impl MessageHeader {
    pub const SERIALIZED_LEN: usize = std::mem::size_of::<u32>();

    /// A length no regular message can have; a frame with this header has no payload
    pub const HEARTBEAT_LEN: u32 = u32::MAX;

    /// NB: callers must ensure that `payload_len` is below [MessageHeader::HEARTBEAT_LEN]
    pub(crate) fn for_payload(payload_len: usize) -> MessageHeader {
        debug_assert!(payload_len < Self::HEARTBEAT_LEN as usize);
        MessageHeader {
            message_len: payload_len as u32,
        }
    }

    pub fn heartbeat() -> MessageHeader {
        MessageHeader {
            message_len: Self::HEARTBEAT_LEN,
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.message_len == Self::HEARTBEAT_LEN
    }

    /// size of the complete frame, including this header
    pub fn frame_len(&self) -> usize {
        if self.is_heartbeat() {
            Self::SERIALIZED_LEN
        }
        else {
            Self::SERIALIZED_LEN + self.message_len as usize
        }
    }

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32(self.message_len);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Self> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("incomplete message header: {} bytes", buf.remaining());
        }
        Ok(MessageHeader {
            message_len: buf.get_u32(),
        })
    }

    /// reads the header at the start of `buf` without consuming it, `None` if `buf` is too short
    pub fn peek(mut buf: &[u8]) -> Option<MessageHeader> {
        Self::deser(&mut buf).ok()
    }
}
