//! The core of an asynchronous message transport: it turns a byte stream or a datagram socket
//!  into a stream of discrete messages and back.
//!
//! * [framing] defines how messages are put on the wire ([framing::Packer]) and recovered from
//!   it ([framing::Unpacker]), with a number of ready-made formats
//! * [queue::MessageQueue] buffers messages with byte accounting, under a locking policy that
//!   is picked per queue
//! * [end_point::EndPoint] ties framing, queues, backpressure and [statistics] together for a
//!   single connection, offering fire-and-forget, synchronous and 'safe' sends
//! * [pool] keeps endpoints under stable ids
//!
//! Driving the I/O is left to the caller: an endpoint offers hooks (`flush`, `receive`,
//!  `dispatch` and loops built from them) that work on any tokio reader / [wire::WireSink].

pub mod admission;
pub mod call_result;
pub mod config;
pub mod end_point;
pub mod framing;
pub mod message;
pub mod message_dispatcher;
pub mod pool;
pub mod queue;
pub mod statistics;
pub mod wire;

#[cfg(test)]
mod test_util;
