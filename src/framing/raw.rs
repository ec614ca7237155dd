use bytes::Bytes;

use crate::framing::read_buffer::ReadBuffer;
use crate::framing::{Packer, Unpacker};
use crate::message::MsgContainer;

/// No framing at all: bytes are sent as they are. An empty message can not be represented.
pub struct RawPacker;

impl Packer for RawPacker {
    type Msg = Bytes;

    fn pack(&self, fragments: &[&[u8]], _native: bool) -> Bytes {
        Bytes::from(fragments.concat())
    }
}

/// Every read becomes a message, message boundaries on the sending side are not preserved
pub struct RawUnpacker {
    buf: ReadBuffer,
}

impl RawUnpacker {
    pub fn new(chunk_size: usize) -> RawUnpacker {
        RawUnpacker {
            buf: ReadBuffer::new(chunk_size),
        }
    }
}

impl Unpacker for RawUnpacker {
    type Msg = Bytes;

    fn reset(&mut self) {
        self.buf.clear();
    }

    fn prepare_next_recv(&mut self) -> &mut [u8] {
        self.buf.prepare(0)
    }

    fn parse(&mut self, bytes_transferred: usize, out: &mut MsgContainer<Bytes>) -> anyhow::Result<()> {
        self.buf.commit(bytes_transferred);
        if !self.buf.data().is_empty() {
            out.push_back(self.buf.split_all().freeze());
        }
        Ok(())
    }

    fn stripped(&self) -> bool {
        true
    }

    fn set_stripped(&mut self, _stripped: bool) {}
}
