//! The send family, and the hooks that write queued messages to the wire.
//!
//! Every operation comes in four flavors:
//! * `send_*` enqueues and returns whether the message was accepted. With `can_overflow`, the
//!   send buffer's limits are ignored.
//! * `sync_send_*` additionally waits until the message was written (or dropped), bounded by an
//!   optional duration - `None` or zero meaning 'wait indefinitely'.
//! * `safe_send_*` waits for room in the send buffer instead of failing, for as long as the
//!   endpoint is ready.
//! * `safe_sync_send_*` combines both.
//!
//! Payloads that the packer can not represent are usage errors (`Err`), while a full buffer or
//!  an endpoint that is not ready are regular outcomes (`Ok(false)` / `NotApplicable`).

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;
use anyhow::{anyhow, bail};
use tracing::{debug, error, trace, warn};

use crate::call_result::{CallOutcome, CompletionSignal, Completer, QueuedMsg};
use crate::end_point::EndPoint;
use crate::framing::udp::UdpPacker;
use crate::framing::{Packer, Unpacker};
use crate::message::{size_in_byte, Message, MsgContainer};
use crate::statistics::{AutoDuration, StatClock};
use crate::wire::WireSink;

impl <P: Packer, U: Unpacker, C: StatClock> EndPoint<P, U, C> {
    pub fn send(&self, payload: &[u8], can_overflow: bool) -> anyhow::Result<bool> {
        self.try_send(can_overflow, || self.pack_single(&[payload], false))
    }

    /// sends the concatenation of `fragments` as a single message
    pub fn send_fragments(&self, fragments: &[&[u8]], can_overflow: bool) -> anyhow::Result<bool> {
        self.try_send(can_overflow, || self.pack_single(fragments, false))
    }

    /// sends the payload as it is, without framing
    pub fn send_native(&self, payload: &[u8], can_overflow: bool) -> anyhow::Result<bool> {
        self.try_send(can_overflow, || self.pack_single(&[payload], true))
    }

    /// sends two messages, both or neither
    pub fn send_two(&self, first: &[u8], second: &[u8], can_overflow: bool) -> anyhow::Result<bool> {
        self.try_send(can_overflow, || self.pack_multiple(&[first, second]))
    }

    /// sends all payloads as separate messages, all or none
    pub fn send_batch(&self, payloads: &[&[u8]], can_overflow: bool) -> anyhow::Result<bool> {
        self.try_send(can_overflow, || self.pack_multiple(payloads))
    }

    /// enqueues a message that was packed already
    pub fn direct_send_msg(&self, msg: P::Msg, can_overflow: bool) -> anyhow::Result<bool> {
        self.try_send(can_overflow, || Self::packed(msg))
    }

    /// Enqueues the packer's heartbeat, regardless of the send buffer's limits. Fails for
    ///  packers without heartbeat support.
    pub fn send_heartbeat(&self) -> anyhow::Result<bool> {
        self.try_send(true, || {
            match self.packer.pack_heartbeat() {
                Some(msg) => Ok([msg].into()),
                None => bail!("the packer does not support heartbeats"),
            }
        })
    }

    pub async fn sync_send(&self, payload: &[u8], can_overflow: bool, duration: Option<Duration>) -> anyhow::Result<CallOutcome> {
        self.try_sync_send(can_overflow, duration, || self.pack_single(&[payload], false)).await
    }

    pub async fn sync_send_fragments(&self, fragments: &[&[u8]], can_overflow: bool, duration: Option<Duration>) -> anyhow::Result<CallOutcome> {
        self.try_sync_send(can_overflow, duration, || self.pack_single(fragments, false)).await
    }

    pub async fn sync_send_native(&self, payload: &[u8], can_overflow: bool, duration: Option<Duration>) -> anyhow::Result<CallOutcome> {
        self.try_sync_send(can_overflow, duration, || self.pack_single(&[payload], true)).await
    }

    /// completes when the second message is written
    pub async fn sync_send_two(&self, first: &[u8], second: &[u8], can_overflow: bool, duration: Option<Duration>) -> anyhow::Result<CallOutcome> {
        self.try_sync_send(can_overflow, duration, || self.pack_multiple(&[first, second])).await
    }

    /// completes when the last message is written
    pub async fn sync_send_batch(&self, payloads: &[&[u8]], can_overflow: bool, duration: Option<Duration>) -> anyhow::Result<CallOutcome> {
        self.try_sync_send(can_overflow, duration, || self.pack_multiple(payloads)).await
    }

    pub async fn sync_direct_send_msg(&self, msg: P::Msg, can_overflow: bool, duration: Option<Duration>) -> anyhow::Result<CallOutcome> {
        self.try_sync_send(can_overflow, duration, || Self::packed(msg)).await
    }

    pub async fn safe_send(&self, payload: &[u8]) -> anyhow::Result<bool> {
        self.try_safe_send(|| self.pack_single(&[payload], false)).await
    }

    pub async fn safe_send_fragments(&self, fragments: &[&[u8]]) -> anyhow::Result<bool> {
        self.try_safe_send(|| self.pack_single(fragments, false)).await
    }

    pub async fn safe_send_native(&self, payload: &[u8]) -> anyhow::Result<bool> {
        self.try_safe_send(|| self.pack_single(&[payload], true)).await
    }

    pub async fn safe_send_two(&self, first: &[u8], second: &[u8]) -> anyhow::Result<bool> {
        self.try_safe_send(|| self.pack_multiple(&[first, second])).await
    }

    pub async fn safe_send_batch(&self, payloads: &[&[u8]]) -> anyhow::Result<bool> {
        self.try_safe_send(|| self.pack_multiple(payloads)).await
    }

    pub async fn safe_direct_send_msg(&self, msg: P::Msg) -> anyhow::Result<bool> {
        self.try_safe_send(|| Self::packed(msg)).await
    }

    pub async fn safe_sync_send(&self, payload: &[u8], duration: Option<Duration>) -> anyhow::Result<CallOutcome> {
        self.try_safe_sync_send(duration, || self.pack_single(&[payload], false)).await
    }

    pub async fn safe_sync_send_fragments(&self, fragments: &[&[u8]], duration: Option<Duration>) -> anyhow::Result<CallOutcome> {
        self.try_safe_sync_send(duration, || self.pack_single(fragments, false)).await
    }

    pub async fn safe_sync_send_native(&self, payload: &[u8], duration: Option<Duration>) -> anyhow::Result<CallOutcome> {
        self.try_safe_sync_send(duration, || self.pack_single(&[payload], true)).await
    }

    pub async fn safe_sync_send_two(&self, first: &[u8], second: &[u8], duration: Option<Duration>) -> anyhow::Result<CallOutcome> {
        self.try_safe_sync_send(duration, || self.pack_multiple(&[first, second])).await
    }

    pub async fn safe_sync_send_batch(&self, payloads: &[&[u8]], duration: Option<Duration>) -> anyhow::Result<CallOutcome> {
        self.try_safe_sync_send(duration, || self.pack_multiple(payloads)).await
    }

    pub async fn safe_sync_direct_send_msg(&self, msg: P::Msg, duration: Option<Duration>) -> anyhow::Result<CallOutcome> {
        self.try_safe_sync_send(duration, || Self::packed(msg)).await
    }

    fn admits(&self, can_overflow: bool) -> bool {
        if !self.is_ready() {
            trace!("endpoint {}: not ready, refusing send", self.id());
            return false;
        }
        can_overflow || self.is_send_buffer_available()
    }

    fn try_send(&self, can_overflow: bool, pack: impl FnOnce() -> anyhow::Result<MsgContainer<P::Msg>>) -> anyhow::Result<bool> {
        if !self.admits(can_overflow) {
            return Ok(false);
        }
        let msgs = pack()?;
        Ok(self.enqueue_msgs(msgs, None))
    }

    async fn try_sync_send(&self, can_overflow: bool, duration: Option<Duration>, pack: impl FnOnce() -> anyhow::Result<MsgContainer<P::Msg>>) -> anyhow::Result<CallOutcome> {
        if !self.admits(can_overflow) {
            return Ok(CallOutcome::NotApplicable);
        }
        let msgs = pack()?;
        Ok(self.enqueue_and_wait(msgs, duration).await)
    }

    async fn try_safe_send(&self, pack: impl FnOnce() -> anyhow::Result<MsgContainer<P::Msg>>) -> anyhow::Result<bool> {
        if !self.wait_for_send_buffer().await {
            return Ok(false);
        }
        let msgs = pack()?;
        Ok(self.enqueue_msgs(msgs, None))
    }

    async fn try_safe_sync_send(&self, duration: Option<Duration>, pack: impl FnOnce() -> anyhow::Result<MsgContainer<P::Msg>>) -> anyhow::Result<CallOutcome> {
        if !self.wait_for_send_buffer().await {
            return Ok(CallOutcome::NotApplicable);
        }
        let msgs = pack()?;
        Ok(self.enqueue_and_wait(msgs, duration).await)
    }

    /// Waits until the send buffer has room, returning `false` as soon as the endpoint is not
    ///  ready
    async fn wait_for_send_buffer(&self) -> bool {
        loop {
            if !self.is_ready() {
                return false;
            }

            let drained = self.send_space.notified();
            if self.is_send_buffer_available() {
                return true;
            }

            trace!("endpoint {}: send buffer full, retrying in {:?}", self.id(), self.config.safe_send_retry_interval);
            if self.config.wake_safe_send_on_drain {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.safe_send_retry_interval) => {}
                    _ = drained => {}
                }
            }
            else {
                tokio::time::sleep(self.config.safe_send_retry_interval).await;
            }
        }
    }

    async fn enqueue_and_wait(&self, msgs: MsgContainer<P::Msg>, duration: Option<Duration>) -> CallOutcome {
        let (signal, completer) = CompletionSignal::new();
        if !self.enqueue_msgs(msgs, Some(completer)) {
            return CallOutcome::NotApplicable;
        }

        match duration.filter(|d| !d.is_zero()) {
            None => signal.wait().await,
            Some(duration) => match tokio::time::timeout(duration, signal.wait()).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!("endpoint {}: sync send timed out after {:?}", self.id(), duration);
                    CallOutcome::Timeout
                }
            },
        }
    }

    /// Appends messages to the send queue, attaching a completer to the last of them. Returns
    ///  `false` if the messages were dropped, which resolves the completer.
    fn enqueue_msgs(&self, msgs: MsgContainer<P::Msg>, completer: Option<Completer>) -> bool {
        let byte_size = size_in_byte(&msgs);
        let mut queued = msgs.into_iter()
            .map(QueuedMsg::new)
            .collect::<MsgContainer<_>>();
        if let (Some(last), Some(completer)) = (queued.back_mut(), completer) {
            last.completer = Some(completer);
        }

        if queued.len() == 1 {
            if let Some(msg) = queued.pop_front() {
                if !self.send_queue.enqueue(msg) {
                    return false;
                }
            }
        }
        else {
            self.send_queue.move_items_in(&mut queued, Some(byte_size));
        }

        // a concurrent shutdown may have cleared the queue before these messages were added
        if !self.ready.load(Ordering::Acquire) {
            debug!("endpoint {}: shut down while enqueueing, dropping unsent messages", self.id());
            self.send_queue.clear();
            return false;
        }

        self.send_work.notify_one();
        true
    }

    fn pack_single(&self, fragments: &[&[u8]], native: bool) -> anyhow::Result<MsgContainer<P::Msg>> {
        let mut pack_time = C::Duration::default();
        let msg = {
            let _timer = AutoDuration::<C>::new(&mut pack_time);
            self.packer.pack(fragments, native)
        };
        self.stats().pack_time_sum += pack_time;

        if msg.is_empty() {
            let len = fragments.iter().map(|f| f.len()).sum::<usize>();
            bail!("a message of {} bytes can not be packed", len);
        }
        Ok([msg].into())
    }

    fn pack_multiple(&self, payloads: &[&[u8]]) -> anyhow::Result<MsgContainer<P::Msg>> {
        if payloads.is_empty() {
            bail!("an empty batch can not be sent");
        }

        let mut pack_time = C::Duration::default();
        let mut msgs = MsgContainer::new();
        let packed = {
            let _timer = AutoDuration::<C>::new(&mut pack_time);
            match payloads {
                [first, second] => self.packer.pack_two(first, second, &mut msgs),
                _ => self.packer.pack_batch(payloads, &mut msgs),
            }
        };
        self.stats().pack_time_sum += pack_time;

        if !packed {
            bail!("a batch of {} messages can not be packed", payloads.len());
        }
        Ok(msgs)
    }

    fn packed(msg: P::Msg) -> anyhow::Result<MsgContainer<P::Msg>> {
        if msg.is_empty() {
            bail!("empty messages can not be sent");
        }
        Ok([msg].into())
    }

    /// Writes up to `send_batch_size` queued messages to `sink`, returning the number of messages
    ///  written. Synchronous sends waiting for these messages complete successfully once the
    ///  sink is flushed.
    ///
    /// A write error is fatal for the connection if the sink says so (see
    ///  [WireSink::write_errors_are_fatal]): messages written before the error still count as
    ///  sent, the failed message and the rest of the batch are dropped, the endpoint is shut
    ///  down, and the error returned. Otherwise only the failed message is dropped.
    pub async fn flush(&self, sink: &(impl WireSink + ?Sized)) -> anyhow::Result<usize> {
        let in_flight = self.in_flight.lock().await;

        let mut batch = MsgContainer::new();
        self.send_queue.move_items_out(&mut batch, Some(self.config.send_batch_size));
        if batch.is_empty() {
            return Ok(0);
        }
        in_flight.move_items_in(&mut batch, None);
        self.send_space.notify_waiters();

        let mut send_delay = C::Duration::default();
        let mut send_time = C::Duration::default();
        let mut written = MsgContainer::with_capacity(in_flight.len());
        let mut failure = None;

        loop {
            let Some(msg) = in_flight.try_dequeue() else {
                break;
            };
            send_delay += C::elapsed(msg.begin_time);

            let result = {
                let _timer = AutoDuration::<C>::new(&mut send_time);
                sink.write_frame(msg.peer_addr(), msg.data()).await
            };
            match result {
                Ok(()) => written.push_back(msg),
                Err(e) if !sink.write_errors_are_fatal() => {
                    warn!("endpoint {}: error writing {} bytes to {:?} - dropping the message: {}", self.id(), msg.size(), msg.peer_addr(), e);
                }
                Err(e) => {
                    error!("endpoint {}: error writing {} bytes - shutting down: {}", self.id(), msg.size(), e);
                    failure = Some(anyhow!(e).context("error writing to the wire"));
                    break;
                }
            }
        }

        if failure.is_none() {
            let result = {
                let _timer = AutoDuration::<C>::new(&mut send_time);
                sink.flush().await
            };
            if let Err(e) = result {
                error!("endpoint {}: error flushing - shutting down: {}", self.id(), e);
                failure = Some(anyhow!(e).context("error flushing the wire"));
            }
        }
        in_flight.clear();
        drop(in_flight);

        {
            let mut stats = self.stats();
            for msg in &written {
                stats.on_sent(msg.size());
            }
            stats.send_delay_sum += send_delay;
            stats.send_time_sum += send_time;
        }

        let num_written = written.len();
        trace!("endpoint {}: wrote {} messages", self.id(), num_written);
        for msg in written {
            if let Some(completer) = msg.completer {
                if completer.resolve(CallOutcome::Success) == CallOutcome::Duplicate {
                    warn!("endpoint {}: completion of a written message was resolved before", self.id());
                }
            }
        }

        if let Some(e) = failure {
            self.shut_down();
            return Err(e);
        }
        Ok(num_written)
    }

    /// Flushes queued messages whenever there are any, until the endpoint is shut down (`Ok`) or
    ///  writing fails (`Err`)
    pub async fn send_loop(&self, sink: &(impl WireSink + ?Sized)) -> anyhow::Result<()> {
        debug!("endpoint {}: starting send loop", self.id());
        loop {
            let work = self.send_work.notified();
            if !self.is_ready() {
                debug!("endpoint {}: not ready, ending send loop", self.id());
                return Ok(());
            }
            if self.send_queue.is_empty() {
                work.await;
                continue;
            }
            self.flush(sink).await?;
        }
    }
}

/// Sending to explicit destinations, for connectionless transports
impl <P: Packer, U: Unpacker, C: StatClock> EndPoint<UdpPacker<P>, U, C> {
    pub fn send_to(&self, peer: SocketAddr, payload: &[u8], can_overflow: bool) -> anyhow::Result<bool> {
        self.try_send(can_overflow, || self.pack_to(peer, payload))
    }

    pub async fn sync_send_to(&self, peer: SocketAddr, payload: &[u8], can_overflow: bool, duration: Option<Duration>) -> anyhow::Result<CallOutcome> {
        self.try_sync_send(can_overflow, duration, || self.pack_to(peer, payload)).await
    }

    pub async fn safe_send_to(&self, peer: SocketAddr, payload: &[u8]) -> anyhow::Result<bool> {
        self.try_safe_send(|| self.pack_to(peer, payload)).await
    }

    pub async fn safe_sync_send_to(&self, peer: SocketAddr, payload: &[u8], duration: Option<Duration>) -> anyhow::Result<CallOutcome> {
        self.try_safe_sync_send(duration, || self.pack_to(peer, payload)).await
    }

    fn pack_to(&self, peer: SocketAddr, payload: &[u8]) -> anyhow::Result<MsgContainer<<UdpPacker<P> as Packer>::Msg>> {
        let mut pack_time = C::Duration::default();
        let msg = {
            let _timer = AutoDuration::<C>::new(&mut pack_time);
            self.packer.pack_to(peer, &[payload], false)
        };
        self.stats().pack_time_sum += pack_time;

        if msg.is_empty() {
            bail!("a message of {} bytes to {:?} can not be packed", payload.len(), peer);
        }
        Ok([msg].into())
    }
}
