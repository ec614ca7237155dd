//! Frames are a [MessageHeader] (the payload length as a big-endian u32) followed by the payload.
//!  A header with [MessageHeader::HEARTBEAT_LEN] and no payload is a heartbeat.

use std::io;
use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{trace, warn};

use crate::config::EndPointConfig;
use crate::framing::message_header::MessageHeader;
use crate::framing::read_buffer::ReadBuffer;
use crate::framing::{Packer, Unpacker};
use crate::message::MsgContainer;

pub struct LengthPrefixedPacker {
    max_msg_size: usize,
}

impl LengthPrefixedPacker {
    pub fn new(max_msg_size: usize) -> LengthPrefixedPacker {
        LengthPrefixedPacker {
            max_msg_size: max_msg_size.min(MessageHeader::HEARTBEAT_LEN as usize - 1),
        }
    }

    /// limited to the config's `max_msg_size`
    pub fn from_config(config: &EndPointConfig) -> LengthPrefixedPacker {
        Self::new(config.max_msg_size)
    }

    fn payload_len(&self, fragments: &[&[u8]]) -> Option<usize> {
        let len = fragments.iter().map(|f| f.len()).sum();
        if len > self.max_msg_size {
            warn!("message of {} bytes exceeds the maximum of {} bytes", len, self.max_msg_size);
            return None;
        }
        Some(len)
    }

    fn put_frame(buf: &mut BytesMut, fragments: &[&[u8]], payload_len: usize) {
        MessageHeader::for_payload(payload_len).ser(buf);
        for f in fragments {
            buf.put_slice(f);
        }
    }
}

impl Packer for LengthPrefixedPacker {
    type Msg = Bytes;

    fn pack(&self, fragments: &[&[u8]], native: bool) -> Bytes {
        if native {
            return Bytes::from(fragments.concat());
        }

        let Some(payload_len) = self.payload_len(fragments) else {
            return Bytes::new();
        };
        let mut buf = BytesMut::with_capacity(MessageHeader::SERIALIZED_LEN + payload_len);
        Self::put_frame(&mut buf, fragments, payload_len);
        buf.freeze()
    }

    fn pack_two(&self, first: &[u8], second: &[u8], out: &mut MsgContainer<Bytes>) -> bool {
        self.pack_batch(&[first, second], out)
    }

    /// fuses all frames into a single message
    fn pack_batch(&self, payloads: &[&[u8]], out: &mut MsgContainer<Bytes>) -> bool {
        let mut total_len = 0;
        for &payload in payloads {
            match self.payload_len(&[payload]) {
                Some(len) => total_len += MessageHeader::SERIALIZED_LEN + len,
                None => return false,
            }
        }
        if total_len == 0 {
            return true;
        }

        let mut buf = BytesMut::with_capacity(total_len);
        for &payload in payloads {
            Self::put_frame(&mut buf, &[payload], payload.len());
        }
        out.push_back(buf.freeze());
        true
    }

    fn pack_heartbeat(&self) -> Option<Bytes> {
        let mut buf = BytesMut::with_capacity(MessageHeader::SERIALIZED_LEN);
        MessageHeader::heartbeat().ser(&mut buf);
        Some(buf.freeze())
    }

    fn max_msg_size(&self) -> Option<usize> {
        Some(self.max_msg_size)
    }
}

pub struct LengthPrefixedUnpacker {
    buf: ReadBuffer,
    max_msg_size: usize,
    stripped: bool,
}

impl LengthPrefixedUnpacker {
    pub fn new(max_msg_size: usize, chunk_size: usize) -> LengthPrefixedUnpacker {
        LengthPrefixedUnpacker {
            buf: ReadBuffer::new(chunk_size),
            max_msg_size,
            stripped: true,
        }
    }

    /// limited to the config's `max_msg_size`, reading in `recv_chunk_size` steps
    pub fn from_config(config: &EndPointConfig) -> LengthPrefixedUnpacker {
        Self::new(config.max_msg_size, config.recv_chunk_size)
    }

    fn check_header(&self, header: &MessageHeader) -> anyhow::Result<()> {
        if !header.is_heartbeat() && header.message_len as usize > self.max_msg_size {
            bail!("corrupt frame: announced length {} exceeds the maximum of {}", header.message_len, self.max_msg_size);
        }
        Ok(())
    }
}

impl Unpacker for LengthPrefixedUnpacker {
    type Msg = Bytes;

    fn reset(&mut self) {
        self.buf.clear();
    }

    fn prepare_next_recv(&mut self) -> &mut [u8] {
        self.buf.prepare(0)
    }

    fn parse(&mut self, bytes_transferred: usize, out: &mut MsgContainer<Bytes>) -> anyhow::Result<()> {
        self.buf.commit(bytes_transferred);

        while let Some(header) = MessageHeader::peek(self.buf.data()) {
            self.check_header(&header)?;

            let frame_len = header.frame_len();
            if self.buf.data().len() < frame_len {
                break;
            }

            if header.is_heartbeat() {
                trace!("received heartbeat");
                self.buf.advance(frame_len);
                continue;
            }

            let mut frame = self.buf.split_to(frame_len);
            if self.stripped {
                frame.advance(MessageHeader::SERIALIZED_LEN);
            }
            out.push_back(frame.freeze());
        }
        Ok(())
    }

    fn completion_condition(&self, error: Option<&io::Error>, bytes_transferred: usize) -> usize {
        if error.is_some() {
            return 0;
        }

        let available = self.buf.data_with_pending(bytes_transferred);
        match MessageHeader::peek(available) {
            None => MessageHeader::SERIALIZED_LEN - available.len(),
            // corrupt headers are reported by `parse`
            Some(header) if self.check_header(&header).is_err() => 0,
            Some(header) => header.frame_len().saturating_sub(available.len()),
        }
    }

    fn stripped(&self) -> bool {
        self.stripped
    }

    fn set_stripped(&mut self, stripped: bool) {
        self.stripped = stripped;
    }

    fn max_msg_size(&self) -> Option<usize> {
        Some(self.max_msg_size)
    }
}
