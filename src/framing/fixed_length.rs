use std::io;
use anyhow::bail;
use bytes::Bytes;
use tracing::warn;

use crate::framing::read_buffer::ReadBuffer;
use crate::framing::{Packer, Unpacker};
use crate::message::MsgContainer;

/// Every message has exactly `msg_len` bytes, there is no framing metadata
pub struct FixedLengthPacker {
    msg_len: usize,
}

impl FixedLengthPacker {
    pub fn new(msg_len: usize) -> anyhow::Result<FixedLengthPacker> {
        if msg_len == 0 {
            bail!("fixed message length must be positive");
        }
        Ok(FixedLengthPacker { msg_len })
    }
}

impl Packer for FixedLengthPacker {
    type Msg = Bytes;

    fn pack(&self, fragments: &[&[u8]], native: bool) -> Bytes {
        let data = fragments.concat();
        if !native && data.len() != self.msg_len {
            warn!("message of {} bytes does not have the fixed length of {} bytes", data.len(), self.msg_len);
            return Bytes::new();
        }
        Bytes::from(data)
    }

    fn max_msg_size(&self) -> Option<usize> {
        Some(self.msg_len)
    }
}

pub struct FixedLengthUnpacker {
    buf: ReadBuffer,
    msg_len: usize,
}

impl FixedLengthUnpacker {
    pub fn new(msg_len: usize, chunk_size: usize) -> anyhow::Result<FixedLengthUnpacker> {
        if msg_len == 0 {
            bail!("fixed message length must be positive");
        }
        Ok(FixedLengthUnpacker {
            buf: ReadBuffer::new(chunk_size),
            msg_len,
        })
    }
}

impl Unpacker for FixedLengthUnpacker {
    type Msg = Bytes;

    fn reset(&mut self) {
        self.buf.clear();
    }

    fn prepare_next_recv(&mut self) -> &mut [u8] {
        self.buf.prepare(self.msg_len)
    }

    fn parse(&mut self, bytes_transferred: usize, out: &mut MsgContainer<Bytes>) -> anyhow::Result<()> {
        self.buf.commit(bytes_transferred);
        while self.buf.data().len() >= self.msg_len {
            out.push_back(self.buf.split_to(self.msg_len).freeze());
        }
        Ok(())
    }

    fn completion_condition(&self, error: Option<&io::Error>, bytes_transferred: usize) -> usize {
        if error.is_some() {
            return 0;
        }
        self.msg_len.saturating_sub(self.buf.data_with_pending(bytes_transferred).len())
    }

    /// there is no metadata to strip
    fn stripped(&self) -> bool {
        true
    }

    fn set_stripped(&mut self, _stripped: bool) {}

    fn max_msg_size(&self) -> Option<usize> {
        Some(self.msg_len)
    }
}
