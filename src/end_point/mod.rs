//! EndPoint is the place where all other parts come together: it owns the framing for one
//!  connection, the send and receive queues and the connection's statistics.
//!
//! The application talks to an endpoint through the send family (see [send]) and a
//!  [crate::message_dispatcher::MessageHandler]. The I/O driver calls the hooks
//!  [EndPoint::flush] / [EndPoint::send_loop] for the sending side and [EndPoint::receive] /
//!  [EndPoint::dispatch] / [EndPoint::receive_loop] for the receiving side.

pub mod receive;
pub mod send;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError};
use anyhow::bail;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

use crate::admission::{HighWaterMarks, SendAdmission};
use crate::call_result::QueuedMsg;
use crate::config::EndPointConfig;
use crate::framing::{Packer, Unpacker};
use crate::message::MsgContainer;
use crate::queue::lock_policy::Unlocked;
use crate::queue::MessageQueue;
use crate::statistics::{DefaultClock, StatClock, Statistics};

struct DispatchState<M, C: StatClock> {
    /// messages taken from the receive queue but not yet consumed by the handler
    pending: MsgContainer<M>,
    /// set while the handler refuses messages
    paused_since: Option<C::Time>,
}

pub struct EndPoint<P: Packer, U: Unpacker, C: StatClock = DefaultClock> {
    id: AtomicU64,
    config: Arc<EndPointConfig>,
    packer: Arc<P>,
    unpacker: Mutex<U>,
    admission: Arc<dyn SendAdmission>,

    send_queue: MessageQueue<QueuedMsg<P::Msg, C>>,
    /// holds the batch that is being written; owning it serializes flushes
    in_flight: Mutex<MessageQueue<QueuedMsg<P::Msg, C>, Unlocked>>,
    recv_queue: MessageQueue<QueuedMsg<U::Msg, C>>,
    dispatch: Mutex<DispatchState<U::Msg, C>>,

    ready: AtomicBool,
    stats: std::sync::Mutex<Statistics<C>>,

    /// signalled when messages are enqueued for sending, and on shutdown
    send_work: Notify,
    /// signalled when a flush takes messages from the send queue, and on shutdown
    send_space: Notify,
}

impl <P: Packer, U: Unpacker, C: StatClock> EndPoint<P, U, C> {
    /// Fails if the config is invalid, or if the framing accepts messages bigger than the
    ///  config's `max_msg_size`.
    pub fn new(config: Arc<EndPointConfig>, packer: Arc<P>, unpacker: U) -> anyhow::Result<EndPoint<P, U, C>> {
        config.validate()?;
        if let Some(limit) = packer.max_msg_size() {
            if limit > config.max_msg_size {
                bail!("packer accepts messages of up to {} bytes, exceeding the configured maximum of {}", limit, config.max_msg_size);
            }
        }
        if let Some(limit) = unpacker.max_msg_size() {
            if limit > config.max_msg_size {
                bail!("unpacker accepts messages of up to {} bytes, exceeding the configured maximum of {}", limit, config.max_msg_size);
            }
        }

        Ok(EndPoint {
            id: AtomicU64::new(0),
            admission: Arc::new(HighWaterMarks::new(&config)),
            config,
            packer,
            unpacker: Mutex::new(unpacker),
            send_queue: MessageQueue::new(),
            in_flight: Mutex::new(MessageQueue::new()),
            recv_queue: MessageQueue::new(),
            dispatch: Mutex::new(DispatchState {
                pending: MsgContainer::new(),
                paused_since: None,
            }),
            ready: AtomicBool::new(false),
            stats: Default::default(),
            send_work: Notify::new(),
            send_space: Notify::new(),
        })
    }

    /// replaces the default admission policy (high water marks from the config)
    pub fn with_send_admission(mut self, admission: Arc<dyn SendAdmission>) -> EndPoint<P, U, C> {
        self.admission = admission;
        self
    }

    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    pub fn set_id(&self, id: u64) {
        self.id.store(id, Ordering::Release);
    }

    pub fn config(&self) -> &EndPointConfig {
        &self.config
    }

    pub fn packer(&self) -> &Arc<P> {
        &self.packer
    }

    /// Called by the I/O driver once the connection is established: from now on, sends are
    ///  accepted.
    pub fn on_connected(&self) {
        info!("endpoint {}: connected", self.id());
        self.stats().mark_established();
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_send_buffer_available(&self) -> bool {
        self.admission.is_send_buffer_available(self.send_queue.len(), self.send_queue.size_in_byte())
    }

    /// whether the I/O driver should read more data, or wait for dispatch to catch up first
    pub fn is_recv_buffer_available(&self) -> bool {
        self.recv_queue.len() < self.config.max_recv_buffered_msgs
    }

    pub fn send_queue_len(&self) -> usize {
        self.send_queue.len()
    }

    pub fn recv_queue_len(&self) -> usize {
        self.recv_queue.len()
    }

    /// Tears the connection down: further sends fail fast, and all messages that are waiting to
    ///  be sent are dropped - which resolves their pending synchronous sends as
    ///  [crate::call_result::CallOutcome::NotApplicable].
    ///
    /// Received messages stay available for dispatch.
    pub fn shut_down(&self) {
        if !self.ready.swap(false, Ordering::AcqRel) {
            debug!("endpoint {}: shut down although it was not ready - ignoring", self.id());
            return;
        }
        info!("endpoint {}: shutting down, dropping {} unsent messages", self.id(), self.send_queue.len());

        self.stats().mark_broken();
        self.send_queue.clear();
        // a flush in progress holds the lock: it finishes writing its batch
        if let Ok(in_flight) = self.in_flight.try_lock() {
            in_flight.clear();
        }

        self.send_work.notify_one();
        self.send_space.notify_waiters();
    }

    /// Prepares the endpoint for reuse with a new connection. Everything connection specific
    ///  is dropped, including statistics.
    pub async fn reset(&self) {
        self.shut_down();
        debug!("endpoint {}: reset", self.id());

        self.send_queue.clear();
        self.in_flight.lock().await.clear();
        self.recv_queue.clear();
        {
            let mut dispatch = self.dispatch.lock().await;
            dispatch.pending.clear();
            dispatch.paused_since = None;
        }
        self.unpacker.lock().await.reset();
        self.stats().reset();
    }

    /// a snapshot of this endpoint's statistics
    pub fn statistics(&self) -> Statistics<C> {
        self.stats().clone()
    }

    fn stats(&self) -> MutexGuard<'_, Statistics<C>> {
        self.stats.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_result::CallOutcome;
    use crate::framing::length_prefixed::{LengthPrefixedPacker, LengthPrefixedUnpacker};
    use crate::statistics::LightClock;
    use crate::wire::WireSink;
    use rstest::rstest;
    use std::time::Duration;
    use tokio::time::timeout;

    type TestEndPoint = EndPoint<LengthPrefixedPacker, LengthPrefixedUnpacker, LightClock>;

    fn end_point(config: EndPointConfig) -> TestEndPoint {
        EndPoint::new(
            Arc::new(config),
            Arc::new(LengthPrefixedPacker::new(1000)),
            LengthPrefixedUnpacker::new(1000, 64),
        ).unwrap()
    }

    #[test]
    fn test_new_validates_config() {
        let result = TestEndPoint::new(
            Arc::new(EndPointConfig { send_batch_size: 0, ..Default::default() }),
            Arc::new(LengthPrefixedPacker::new(1000)),
            LengthPrefixedUnpacker::new(1000, 64),
        );
        assert!(result.is_err());
    }

    #[rstest]
    #[case::within_limit(1000, 1000, true)]
    #[case::packer_too_big(1001, 1000, false)]
    #[case::unpacker_too_big(1000, 1001, false)]
    fn test_new_checks_framing_limits(#[case] packer_max: usize, #[case] unpacker_max: usize, #[case] expected_ok: bool) {
        let result = TestEndPoint::new(
            Arc::new(EndPointConfig { max_msg_size: 1000, ..Default::default() }),
            Arc::new(LengthPrefixedPacker::new(packer_max)),
            LengthPrefixedUnpacker::new(unpacker_max, 64),
        );
        assert_eq!(result.is_ok(), expected_ok);
    }

    #[test]
    fn test_framing_from_config() {
        let config = Arc::new(EndPointConfig { max_msg_size: 300, recv_chunk_size: 50, ..Default::default() });
        let end_point = TestEndPoint::new(
            config.clone(),
            Arc::new(LengthPrefixedPacker::from_config(&config)),
            LengthPrefixedUnpacker::from_config(&config),
        ).unwrap();
        end_point.on_connected();

        assert!(end_point.send(&[7u8; 300], false).unwrap());
        assert!(end_point.send(&[7u8; 301], false).is_err());
    }

    #[test]
    fn test_lifecycle() {
        let end_point = end_point(Default::default());
        assert!(!end_point.is_ready());
        assert!(end_point.statistics().establish_time.is_none());

        end_point.set_id(17);
        assert_eq!(end_point.id(), 17);

        end_point.on_connected();
        assert!(end_point.is_ready());
        assert!(end_point.statistics().establish_time.is_some());

        end_point.shut_down();
        assert!(!end_point.is_ready());
        let broken = end_point.statistics().break_time;
        assert!(broken.is_some());

        end_point.shut_down();
        assert_eq!(end_point.statistics().break_time, broken);
    }

    #[tokio::test]
    async fn test_shut_down_resolves_pending_sync_sends() {
        let end_point = Arc::new(end_point(Default::default()));
        end_point.on_connected();

        let waiters = (0..3)
            .map(|_| {
                let end_point = end_point.clone();
                tokio::spawn(async move {
                    end_point.sync_send(b"abc", false, None).await.unwrap()
                })
            })
            .collect::<Vec<_>>();

        while end_point.send_queue_len() < 3 {
            tokio::task::yield_now().await;
        }
        end_point.shut_down();

        for waiter in waiters {
            let outcome = timeout(Duration::from_secs(5), waiter).await.unwrap().unwrap();
            assert_eq!(outcome, CallOutcome::NotApplicable);
        }
        assert_eq!(end_point.send_queue_len(), 0);
        assert!(!end_point.send(b"x", true).unwrap());
    }

    /// shuts the endpoint down while a flush is writing
    struct ShutDownOnWrite {
        end_point: Arc<TestEndPoint>,
        num_written: std::sync::atomic::AtomicUsize,
    }

    #[async_trait::async_trait]
    impl WireSink for ShutDownOnWrite {
        async fn write_frame(&self, _peer: Option<std::net::SocketAddr>, _frame: &[u8]) -> std::io::Result<()> {
            self.end_point.shut_down();
            self.num_written.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }

        async fn flush(&self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shut_down_during_flush_finishes_batch() {
        let end_point = Arc::new(end_point(Default::default()));
        end_point.on_connected();
        let sink = ShutDownOnWrite {
            end_point: end_point.clone(),
            num_written: Default::default(),
        };

        let first = end_point.sync_send(b"a", false, None);
        let second = end_point.sync_send(b"b", false, None);
        let (first, second, flushed) = tokio::join!(first, second, end_point.flush(&sink));

        assert_eq!(flushed.unwrap(), 2);
        assert_eq!(sink.num_written.load(Ordering::Acquire), 2);
        assert_eq!(first.unwrap(), CallOutcome::Success);
        assert_eq!(second.unwrap(), CallOutcome::Success);
        assert!(!end_point.is_ready());
    }

    #[tokio::test]
    async fn test_reset() {
        let end_point = end_point(Default::default());
        end_point.on_connected();
        end_point.send(b"abc", false).unwrap();

        end_point.reset().await;
        assert!(!end_point.is_ready());
        assert_eq!(end_point.send_queue_len(), 0);
        assert!(end_point.statistics().break_time.is_none());

        end_point.on_connected();
        assert!(end_point.send(b"abc", false).unwrap());
    }
}
