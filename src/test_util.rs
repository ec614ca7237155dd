//! Helpers for unit tests: feeding bytes through unpackers, and recording stand-ins for the
//!  application's handler and the wire.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::admission::SendAdmission;
use crate::framing::Unpacker;
use crate::message::{Message, MsgContainer};
use crate::message_dispatcher::MessageHandler;
use crate::wire::WireSink;

/// copies `data` into the unpacker as a single logical read, parsing after each region is filled
pub fn feed<U: Unpacker>(unpacker: &mut U, data: &[u8]) -> anyhow::Result<Vec<U::Msg>> {
    let mut out = MsgContainer::new();
    let mut data = data;
    loop {
        let region = unpacker.prepare_next_recv();
        let n = region.len().min(data.len());
        region[..n].copy_from_slice(&data[..n]);
        unpacker.parse(n, &mut out)?;
        data = &data[n..];
        if data.is_empty() {
            break;
        }
    }
    Ok(out.into_iter().collect())
}

/// simulates the wire delivering `data` in reads of at most `chunk` bytes
pub fn feed_in_chunks<U: Unpacker>(unpacker: &mut U, data: &[u8], chunk: usize) -> anyhow::Result<Vec<U::Msg>> {
    let mut result = Vec::new();
    for part in data.chunks(chunk) {
        result.extend(feed(unpacker, part)?);
    }
    Ok(result)
}

/// refuses admission a given number of times, and admits everything after that
pub struct CountdownAdmission {
    refusals_left: AtomicUsize,
}
impl CountdownAdmission {
    pub fn new(num_refusals: usize) -> CountdownAdmission {
        CountdownAdmission {
            refusals_left: AtomicUsize::new(num_refusals),
        }
    }
}
impl SendAdmission for CountdownAdmission {
    fn is_send_buffer_available(&self, _pending_msgs: usize, _pending_bytes: usize) -> bool {
        self.refusals_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_err()
    }
}

#[derive(Default)]
pub struct RecordingSink {
    frames: Mutex<Vec<(Option<SocketAddr>, Vec<u8>)>>,
    num_flushes: AtomicUsize,
}
impl RecordingSink {
    pub fn new() -> RecordingSink {
        Default::default()
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap()
            .iter()
            .map(|(_, frame)| frame.clone())
            .collect()
    }

    pub fn peers(&self) -> Vec<Option<SocketAddr>> {
        self.frames.lock().unwrap()
            .iter()
            .map(|(peer, _)| *peer)
            .collect()
    }

    pub fn num_flushes(&self) -> usize {
        self.num_flushes.load(Ordering::Acquire)
    }
}

#[async_trait]
impl WireSink for RecordingSink {
    async fn write_frame(&self, peer: Option<SocketAddr>, frame: &[u8]) -> io::Result<()> {
        self.frames.lock().unwrap().push((peer, frame.to_vec()));
        Ok(())
    }

    async fn flush(&self) -> io::Result<()> {
        self.num_flushes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// Records the messages it consumes. It consumes up to `capacity` messages in total, refusing
///  everything after that until capacity is added.
pub struct RecordingHandler<M: Message + Clone = Bytes> {
    state: Mutex<HandlerState<M>>,
}
struct HandlerState<M> {
    capacity: usize,
    received: Vec<M>,
    max_batch_len: usize,
}

impl <M: Message + Clone> RecordingHandler<M> {
    pub fn new() -> RecordingHandler<M> {
        RecordingHandler::with_capacity(usize::MAX)
    }

    pub fn with_capacity(capacity: usize) -> RecordingHandler<M> {
        RecordingHandler {
            state: Mutex::new(HandlerState {
                capacity,
                received: Vec::new(),
                max_batch_len: 0,
            }),
        }
    }

    pub fn add_capacity(&self, n: usize) {
        let mut state = self.state.lock().unwrap();
        state.capacity = state.capacity.saturating_add(n);
    }

    pub fn received(&self) -> Vec<M> {
        self.state.lock().unwrap().received.clone()
    }

    /// the longest run of messages offered in a single call
    pub fn max_batch_len(&self) -> usize {
        self.state.lock().unwrap().max_batch_len
    }
}

#[async_trait]
impl <M: Message + Clone> MessageHandler<M> for RecordingHandler<M> {
    async fn on_msg(&self, msg: &M) -> bool {
        self.on_msgs(std::slice::from_ref(msg)).await == 1
    }

    async fn on_msgs(&self, msgs: &[M]) -> usize {
        let mut state = self.state.lock().unwrap();
        state.max_batch_len = state.max_batch_len.max(msgs.len());

        let num_consumed = state.capacity.min(msgs.len());
        state.capacity -= num_consumed;
        state.received.extend_from_slice(&msgs[..num_consumed]);
        num_consumed
    }
}
