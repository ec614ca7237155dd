//! Frames are a fixed prefix, the payload and a fixed suffix. A payload that contains the
//!  suffix can not be represented.

use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::framing::read_buffer::ReadBuffer;
use crate::framing::{Packer, Unpacker};
use crate::message::MsgContainer;

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len())
        .position(|w| w == needle)
}

pub struct DelimitedPacker {
    prefix: Bytes,
    suffix: Bytes,
    max_msg_size: usize,
}

impl DelimitedPacker {
    pub fn new(prefix: impl Into<Bytes>, suffix: impl Into<Bytes>, max_msg_size: usize) -> anyhow::Result<DelimitedPacker> {
        let suffix = suffix.into();
        if suffix.is_empty() {
            bail!("the suffix must not be empty");
        }
        Ok(DelimitedPacker {
            prefix: prefix.into(),
            suffix,
            max_msg_size,
        })
    }
}

impl Packer for DelimitedPacker {
    type Msg = Bytes;

    fn pack(&self, fragments: &[&[u8]], native: bool) -> Bytes {
        let payload = fragments.concat();
        if native {
            return Bytes::from(payload);
        }

        if payload.len() > self.max_msg_size {
            warn!("message of {} bytes exceeds the maximum of {} bytes", payload.len(), self.max_msg_size);
            return Bytes::new();
        }
        // the first occurrence of the suffix must be the one appended here
        let tail = &self.suffix[..self.suffix.len() - 1];
        if find(&[payload.as_slice(), tail].concat(), &self.suffix).is_some() {
            warn!("message contains the suffix, which can not be represented");
            return Bytes::new();
        }

        let mut buf = BytesMut::with_capacity(self.prefix.len() + payload.len() + self.suffix.len());
        buf.put_slice(&self.prefix);
        buf.put_slice(&payload);
        buf.put_slice(&self.suffix);
        buf.freeze()
    }

    fn max_msg_size(&self) -> Option<usize> {
        Some(self.max_msg_size)
    }
}

pub struct DelimitedUnpacker {
    buf: ReadBuffer,
    prefix: Bytes,
    suffix: Bytes,
    max_msg_size: usize,
    stripped: bool,
    /// buffered bytes that are known not to contain the start of the suffix
    scanned: usize,
}

impl DelimitedUnpacker {
    pub fn new(prefix: impl Into<Bytes>, suffix: impl Into<Bytes>, max_msg_size: usize, chunk_size: usize) -> anyhow::Result<DelimitedUnpacker> {
        let suffix = suffix.into();
        if suffix.is_empty() {
            bail!("the suffix must not be empty");
        }
        Ok(DelimitedUnpacker {
            buf: ReadBuffer::new(chunk_size),
            prefix: prefix.into(),
            suffix,
            max_msg_size,
            stripped: true,
            scanned: 0,
        })
    }

    fn max_frame_len(&self) -> usize {
        self.prefix.len() + self.max_msg_size + self.suffix.len()
    }
}

impl Unpacker for DelimitedUnpacker {
    type Msg = Bytes;

    fn reset(&mut self) {
        self.buf.clear();
        self.scanned = 0;
    }

    fn prepare_next_recv(&mut self) -> &mut [u8] {
        self.buf.prepare(0)
    }

    fn parse(&mut self, bytes_transferred: usize, out: &mut MsgContainer<Bytes>) -> anyhow::Result<()> {
        self.buf.commit(bytes_transferred);

        loop {
            let data = self.buf.data();
            let prefix_checked = data.len().min(self.prefix.len());
            if data[..prefix_checked] != self.prefix[..prefix_checked] {
                bail!("frame does not start with the expected prefix");
            }

            let search_start = self.scanned.max(self.prefix.len());
            let Some(pos) = data.get(search_start..).and_then(|d| find(d, &self.suffix)) else {
                if data.len() > self.max_frame_len() {
                    bail!("no suffix within {} bytes", self.max_frame_len());
                }
                // the suffix may start in the last bytes and be completed by the next read
                self.scanned = data.len().saturating_sub(self.suffix.len() - 1);
                return Ok(());
            };

            let frame_len = search_start + pos + self.suffix.len();
            if frame_len > self.max_frame_len() {
                bail!("frame of {} bytes exceeds the maximum of {} bytes", frame_len, self.max_frame_len());
            }

            let mut frame = self.buf.split_to(frame_len);
            self.scanned = 0;
            if self.stripped {
                frame.advance(self.prefix.len());
                frame.truncate(frame.len() - self.suffix.len());
            }
            out.push_back(frame.freeze());
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
