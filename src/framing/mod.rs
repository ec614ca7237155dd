//! The contract between an endpoint and a wire format: a [Packer] turns application payloads
//!  into wire-ready messages, an [Unpacker] turns received bytes back into messages.
//!
//! A packer holds no per-connection state and is shared between endpoints through an `Arc`.
//!  An unpacker owns the partial-frame state of exactly one connection.

pub mod delimited;
pub mod fixed_length;
pub mod length_prefixed;
pub mod message_header;
pub mod raw;
pub mod read_buffer;
pub mod udp;

use std::io;
use std::net::SocketAddr;

use crate::message::{Message, MsgContainer};

pub trait Packer: Send + Sync + 'static {
    type Msg: Message;

    /// Packs the concatenation of `fragments` into a single message. With `native`, the bytes
    ///  are sent as they are, without framing.
    ///
    /// Returns an empty message if the input can not be represented in this format (e.g. it
    ///  is too big); callers treat that as a usage error.
    fn pack(&self, fragments: &[&[u8]], native: bool) -> Self::Msg;

    /// Packs two payloads, appending the result to `out` - all or nothing. A packer may fuse
    ///  both into a single wire message.
    fn pack_two(&self, first: &[u8], second: &[u8], out: &mut MsgContainer<Self::Msg>) -> bool {
        self.pack_batch(&[first, second], out)
    }

    /// Packs each payload into a message, appending the result to `out` - all or nothing. A
    ///  packer may fuse the payloads into fewer wire messages.
    fn pack_batch(&self, payloads: &[&[u8]], out: &mut MsgContainer<Self::Msg>) -> bool {
        let mut packed = MsgContainer::with_capacity(payloads.len());
        for &payload in payloads {
            let msg = self.pack(&[payload], false);
            if msg.is_empty() {
                return false;
            }
            packed.push_back(msg);
        }
        out.append(&mut packed);
        true
    }

    /// A message the peer's unpacker recognizes and filters out, for formats that have one
    fn pack_heartbeat(&self) -> Option<Self::Msg> {
        None
    }

    /// the biggest payload this packer accepts, for formats that enforce a limit
    fn max_msg_size(&self) -> Option<usize> {
        None
    }
}

pub trait Unpacker: Send + 'static {
    type Msg: Message;

    /// drops all partially received data, e.g. when an endpoint is reused for a new connection
    fn reset(&mut self);

    /// The region the next read should go to. Until the next call to [Unpacker::parse], this
    ///  returns the same region.
    fn prepare_next_recv(&mut self) -> &mut [u8];

    /// Consumes `bytes_transferred` bytes that were read into the region returned by
    ///  [Unpacker::prepare_next_recv], appending every complete message to `out`.
    ///
    /// An error means the received data does not match the format, which is fatal for the
    ///  connection.
    fn parse(&mut self, bytes_transferred: usize, out: &mut MsgContainer<Self::Msg>) -> anyhow::Result<()>;

    /// The number of additional bytes to read before parsing is worthwhile, given that
    ///  `bytes_transferred` bytes were read into the current region so far. `0` means 'parse
    ///  now'.
    fn completion_condition(&self, _error: Option<&io::Error>, _bytes_transferred: usize) -> usize {
        0
    }

    /// whether framing metadata is stripped from returned messages
    fn stripped(&self) -> bool;

    fn set_stripped(&mut self, stripped: bool);

    /// called by datagram drivers with the sender of the data that is about to be parsed
    fn on_datagram_from(&mut self, _peer: SocketAddr) {}

    /// the biggest message this unpacker accepts, for formats that enforce a limit
    fn max_msg_size(&self) -> Option<usize> {
        None
    }
}
