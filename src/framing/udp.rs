//! Framing for connectionless transports, where messages carry their peer's address

use std::net::SocketAddr;
use bytes::{Bytes, BytesMut};

use crate::framing::{Packer, Unpacker};
use crate::message::{MsgContainer, UdpMessage};

/// Wraps a packer, tagging its messages with a destination address
pub struct UdpPacker<P> {
    inner: P,
}

impl <P: Packer> UdpPacker<P> {
    pub fn new(inner: P) -> UdpPacker<P> {
        UdpPacker { inner }
    }

    pub fn pack_to(&self, peer: SocketAddr, fragments: &[&[u8]], native: bool) -> UdpMessage<P::Msg> {
        UdpMessage::new(Some(peer), self.inner.pack(fragments, native))
    }

    fn untagged(packed: MsgContainer<P::Msg>, out: &mut MsgContainer<UdpMessage<P::Msg>>) {
        out.extend(packed.into_iter().map(|msg| UdpMessage::new(None, msg)));
    }
}

impl <P: Packer> Packer for UdpPacker<P> {
    type Msg = UdpMessage<P::Msg>;

    fn pack(&self, fragments: &[&[u8]], native: bool) -> UdpMessage<P::Msg> {
        UdpMessage::new(None, self.inner.pack(fragments, native))
    }

    fn pack_two(&self, first: &[u8], second: &[u8], out: &mut MsgContainer<UdpMessage<P::Msg>>) -> bool {
        let mut packed = MsgContainer::new();
        if !self.inner.pack_two(first, second, &mut packed) {
            return false;
        }
        Self::untagged(packed, out);
        true
    }

    fn pack_batch(&self, payloads: &[&[u8]], out: &mut MsgContainer<UdpMessage<P::Msg>>) -> bool {
        let mut packed = MsgContainer::new();
        if !self.inner.pack_batch(payloads, &mut packed) {
            return false;
        }
        Self::untagged(packed, out);
        true
    }

    fn pack_heartbeat(&self) -> Option<UdpMessage<P::Msg>> {
        self.inner.pack_heartbeat()
            .map(|msg| UdpMessage::new(None, msg))
    }

    fn max_msg_size(&self) -> Option<usize> {
        self.inner.max_msg_size()
    }
}

/// The largest possible UDP payload
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Every datagram is a message, tagged with its sender
pub struct DatagramUnpacker {
    buf: BytesMut,
    max_datagram_size: usize,
    peer: Option<SocketAddr>,
}

impl Default for DatagramUnpacker {
    fn default() -> Self {
        Self::new(MAX_DATAGRAM_SIZE)
    }
}

impl DatagramUnpacker {
    /// Datagrams bigger than `max_datagram_size` are truncated by the OS
    pub fn new(max_datagram_size: usize) -> DatagramUnpacker {
        DatagramUnpacker {
            buf: BytesMut::new(),
            max_datagram_size,
            peer: None,
        }
    }
}

impl Unpacker for DatagramUnpacker {
    type Msg = UdpMessage<Bytes>;

    fn reset(&mut self) {
        self.buf.clear();
        self.peer = None;
    }

    fn prepare_next_recv(&mut self) -> &mut [u8] {
        if self.buf.len() != self.max_datagram_size {
            self.buf.clear();
            self.buf.resize(self.max_datagram_size, 0);
        }
        &mut self.buf[..]
    }

    /// NB: an empty datagram yields an empty message - unlike a stream, a datagram transport
    ///  can carry those
    fn parse(&mut self, bytes_transferred: usize, out: &mut MsgContainer<UdpMessage<Bytes>>) -> anyhow::Result<()> {
        let transferred = bytes_transferred.min(self.buf.len());
        let msg = self.buf.split_to(transferred).freeze();
        self.buf.clear();
        out.push_back(UdpMessage::new(self.peer.take(), msg));
        Ok(())
    }

    fn stripped(&self) -> bool {
        true
    }

    fn set_stripped(&mut self, _stripped: bool) {}

    fn on_datagram_from(&mut self, peer: SocketAddr) {
        self.peer = Some(peer);
    }
}
