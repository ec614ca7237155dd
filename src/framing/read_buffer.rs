use bytes::{Buf, BytesMut};

/// A receive buffer shared by the stream unpackers: received bytes accumulate at the end and
///  complete frames are split off the front.
///
/// A read is a two-step process: [ReadBuffer::prepare] offers a region after the buffered
///  data, and [ReadBuffer::commit] makes the bytes that were actually read part of the
///  buffered data.
pub struct ReadBuffer {
    buf: BytesMut,
    chunk_size: usize,
    /// start of the region offered by `prepare` that was not committed yet
    read_start: Option<usize>,
}

impl ReadBuffer {
    pub fn new(chunk_size: usize) -> ReadBuffer {
        ReadBuffer {
            buf: BytesMut::with_capacity(chunk_size),
            chunk_size,
            read_start: None,
        }
    }

    /// Returns the region for the next read - at least `chunk_size` bytes, and at least
    ///  `min_len` bytes. Repeated calls return the same region until the next `commit`.
    pub fn prepare(&mut self, min_len: usize) -> &mut [u8] {
        let start = match self.read_start {
            Some(start) => start,
            None => {
                let start = self.buf.len();
                self.buf.resize(start + self.chunk_size.max(min_len), 0);
                self.read_start = Some(start);
                start
            }
        };
        &mut self.buf[start..]
    }

    /// Appends the first `bytes_transferred` bytes of the prepared region to the buffered data.
    ///
    /// NB: the caller is responsible for not committing more than the prepared region.
    pub fn commit(&mut self, bytes_transferred: usize) {
        let start = self.read_start.take()
            .unwrap_or(self.buf.len());
        self.buf.truncate(start + bytes_transferred);
    }

    /// buffered data, excluding a prepared region that was not committed yet
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.filled()]
    }

    /// buffered data plus the first `bytes_transferred` bytes of a prepared region
    pub fn data_with_pending(&self, bytes_transferred: usize) -> &[u8] {
        let end = (self.filled() + bytes_transferred).min(self.buf.len());
        &self.buf[..end]
    }

    pub fn filled(&self) -> usize {
        self.read_start.unwrap_or(self.buf.len())
    }

    /// Splits off the first `len` bytes of buffered data.
    ///
    /// NB: `len` must not exceed the buffered data, and there must be no pending region
    pub fn split_to(&mut self, len: usize) -> BytesMut {
        debug_assert!(self.read_start.is_none());
        self.buf.split_to(len)
    }

    /// Splits off all buffered data
    pub fn split_all(&mut self) -> BytesMut {
        debug_assert!(self.read_start.is_none());
        self.buf.split()
    }

    pub fn advance(&mut self, len: usize) {
        debug_assert!(self.read_start.is_none());
        self.buf.advance(len);
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.read_start = None;
    }
}
