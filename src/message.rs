use std::collections::VecDeque;
use std::fmt::Debug;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};

/// The container that framing, queues and dispatch use to hand over runs of messages
pub type MsgContainer<M> = VecDeque<M>;

/// An owned, byte-bearing value that is moved between the application, a queue and the wire
///  layer. Messages are never implicitly copied between those owners.
///
/// Swapping two messages is [std::mem::swap].
pub trait Message: Debug + Send + Sync + 'static {
    fn data(&self) -> &[u8];

    fn size(&self) -> usize {
        self.data().len()
    }

    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    fn clear(&mut self);

    /// destination for connectionless transports, `None` means 'the connected peer'
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl Message for Bytes {
    fn data(&self) -> &[u8] {
        self.as_ref()
    }

    fn clear(&mut self) {
        Bytes::clear(self);
    }
}

impl Message for BytesMut {
    fn data(&self) -> &[u8] {
        self.as_ref()
    }

    fn clear(&mut self) {
        BytesMut::clear(self);
    }
}

impl Message for Vec<u8> {
    fn data(&self) -> &[u8] {
        self.as_slice()
    }

    fn clear(&mut self) {
        Vec::clear(self);
    }
}

/// A message with an attached destination (or, for received messages, sender) address
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UdpMessage<M> {
    pub peer_addr: Option<SocketAddr>,
    pub msg: M,
}

impl <M> UdpMessage<M> {
    pub fn new(peer_addr: Option<SocketAddr>, msg: M) -> UdpMessage<M> {
        UdpMessage { peer_addr, msg }
    }
}

impl <M: Message> Message for UdpMessage<M> {
    fn data(&self) -> &[u8] {
        self.msg.data()
    }

    fn size(&self) -> usize {
        self.msg.size()
    }

    fn clear(&mut self) {
        self.msg.clear();
        self.peer_addr = None;
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

/// sum of [Message::size] over all messages in a container
pub fn size_in_byte<'a, M: Message>(msgs: impl IntoIterator<Item = &'a M>) -> usize {
    msgs.into_iter()
        .map(|m| m.size())
        .sum()
}
