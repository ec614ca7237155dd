//! The receiving side: reading into the unpacker, parsing, and dispatching parsed messages to
//!  the application's handler.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use anyhow::{anyhow, Context};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};

use crate::call_result::QueuedMsg;
use crate::end_point::EndPoint;
use crate::framing::{Packer, Unpacker};
use crate::message::{size_in_byte, MsgContainer};
use crate::message_dispatcher::MessageHandler;
use crate::statistics::{AutoDuration, StatClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStatus {
    /// the number of complete messages that were parsed, possibly zero
    Received(usize),
    /// the peer closed the connection; the endpoint was shut down
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    /// all received messages were consumed
    Drained,
    /// the handler stopped consuming; `remaining` messages are waiting for dispatch
    Paused { remaining: usize },
}

impl <P: Packer, U: Unpacker, C: StatClock> EndPoint<P, U, C> {
    /// Reads from `reader` into the unpacker's buffer - until the unpacker's completion
    ///  condition is met or its region is full - and parses the data. Parsed messages are added
    ///  to the receive queue.
    ///
    /// Read and parse errors are fatal for the connection: the endpoint is shut down, and the
    ///  error returned.
    pub async fn receive<R: AsyncRead + Unpin + ?Sized>(&self, reader: &mut R) -> anyhow::Result<ReceiveStatus> {
        let mut unpacker = self.unpacker.lock().await;

        let mut transferred = 0;
        let mut eof = false;
        loop {
            let region = unpacker.prepare_next_recv();
            if transferred >= region.len() {
                break;
            }

            match reader.read(&mut region[transferred..]).await {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => transferred += n,
                Err(e) => {
                    let remaining = unpacker.completion_condition(Some(&e), transferred);
                    error!("endpoint {}: read error with {} bytes missing - shutting down: {}", self.id(), remaining, e);
                    drop(unpacker);
                    self.shut_down();
                    return Err(anyhow!(e).context("error reading from the wire"));
                }
            }

            let remaining = unpacker.completion_condition(None, transferred);
            if remaining == 0 {
                break;
            }
            trace!("endpoint {}: {} more bytes needed before parsing", self.id(), remaining);
        }

        let num_msgs = self.parse(&mut unpacker, transferred)?;

        if eof {
            info!("endpoint {}: connection closed by peer", self.id());
            drop(unpacker);
            self.shut_down();
            return Ok(ReceiveStatus::Closed);
        }
        Ok(ReceiveStatus::Received(num_msgs))
    }

    /// Receives a single datagram, parsing it with the unpacker. Socket errors are returned, but
    ///  do not shut the endpoint down since they are not specific to a connection.
    pub async fn receive_datagram(&self, socket: &UdpSocket) -> anyhow::Result<usize> {
        let mut unpacker = self.unpacker.lock().await;

        let region = unpacker.prepare_next_recv();
        let (transferred, from) = socket.recv_from(region).await
            .context("error receiving datagram")?;
        trace!("endpoint {}: received {} bytes from {:?}", self.id(), transferred, from);

        unpacker.on_datagram_from(from);
        self.parse(&mut unpacker, transferred)
    }

    fn parse(&self, unpacker: &mut U, transferred: usize) -> anyhow::Result<usize> {
        let mut unpack_time = C::Duration::default();
        let mut msgs = MsgContainer::new();
        let parsed = {
            let _timer = AutoDuration::<C>::new(&mut unpack_time);
            unpacker.parse(transferred, &mut msgs)
        };
        self.stats().unpack_time_sum += unpack_time;

        if let Err(e) = parsed {
            error!("endpoint {}: received data can not be parsed - shutting down: {}", self.id(), e);
            self.shut_down();
            return Err(e.context("error parsing received data"));
        }

        let num_msgs = msgs.len();
        let byte_size = size_in_byte(&msgs);
        self.stats().on_received(num_msgs, byte_size);

        let mut queued = msgs.into_iter()
            .map(QueuedMsg::new)
            .collect::<MsgContainer<_>>();
        self.recv_queue.move_items_in(&mut queued, Some(byte_size));
        Ok(num_msgs)
    }

    /// Offers received messages to `handler` in batches of up to `dispatch_batch_size`, until
    ///  the receive queue is drained or the handler stops consuming. Messages that were not
    ///  consumed are offered again, first, on the next call.
    pub async fn dispatch<H: MessageHandler<U::Msg> + ?Sized>(&self, handler: &H) -> DispatchStatus {
        let mut state = self.dispatch.lock().await;
        let batch_size = self.config.dispatch_batch_size;

        loop {
            if state.pending.is_empty() {
                let mut batch = MsgContainer::new();
                self.recv_queue.move_items_out(&mut batch, Some(batch_size));
                if batch.is_empty() {
                    return DispatchStatus::Drained;
                }

                let mut dispatch_delay = C::Duration::default();
                for msg in batch {
                    dispatch_delay += C::elapsed(msg.begin_time);
                    state.pending.push_back(msg.msg);
                }
                self.stats().dispatch_delay_sum += dispatch_delay;
            }

            if let Some(paused_since) = state.paused_since.take() {
                self.stats().recv_idle_sum += C::elapsed(paused_since);
            }

            let num_offered = state.pending.len().min(batch_size);
            let mut handle_time = C::Duration::default();
            let num_consumed = {
                let _timer = AutoDuration::<C>::new(&mut handle_time);
                let offered = &state.pending.make_contiguous()[..num_offered];
                handler.on_msgs(offered).await
            };
            self.stats().handle_time_sum += handle_time;

            if num_consumed > num_offered {
                warn!("endpoint {}: handler reported {} consumed messages out of {}", self.id(), num_consumed, num_offered);
            }
            state.pending.drain(..num_consumed.min(num_offered));

            if num_consumed < num_offered {
                state.paused_since = Some(C::now());
                let remaining = state.pending.len() + self.recv_queue.len();
                trace!("endpoint {}: dispatch paused with {} messages remaining", self.id(), remaining);
                return DispatchStatus::Paused { remaining };
            }
        }
    }

    /// Reads, parses and dispatches until the peer closes the connection (`Ok`) or receiving
    ///  fails (`Err`).
    ///
    /// Reading and dispatching run concurrently: a paused dispatch is retried every
    ///  `dispatch_retry_interval` while the read waits for data, and reading pauses while the
    ///  receive queue is full. After the peer closed the connection, this returns once all
    ///  received messages are dispatched.
    pub async fn receive_loop<R, H>(&self, reader: &mut R, handler: &H) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin + ?Sized,
        H: MessageHandler<U::Msg> + ?Sized,
    {
        debug!("endpoint {}: starting receive loop", self.id());
        let signals = ReceiveLoopSignals::default();
        self.run_receive_loop(self.read_until_closed(reader, &signals), handler, &signals).await
    }

    /// Receives and dispatches datagrams until receiving fails. Datagram transports have no
    ///  notion of a closed connection, so this only ends with an error. Dispatch is retried
    ///  while waiting for datagrams, the same as in [EndPoint::receive_loop].
    pub async fn datagram_receive_loop<H: MessageHandler<U::Msg> + ?Sized>(&self, socket: &UdpSocket, handler: &H) -> anyhow::Result<()> {
        debug!("endpoint {}: starting datagram receive loop", self.id());
        let signals = ReceiveLoopSignals::default();
        self.run_receive_loop(self.read_datagrams(socket, &signals), handler, &signals).await
    }

    async fn run_receive_loop<F, H>(&self, reading: F, handler: &H, signals: &ReceiveLoopSignals) -> anyhow::Result<()>
    where
        F: Future<Output = anyhow::Result<()>>,
        H: MessageHandler<U::Msg> + ?Sized,
    {
        let reading = async {
            let result = reading.await;
            signals.finish_reading(result.is_err());
            result
        };
        let (result, _) = tokio::join!(reading, self.dispatch_loop(handler, signals));
        result
    }

    async fn read_until_closed<R: AsyncRead + Unpin + ?Sized>(&self, reader: &mut R, signals: &ReceiveLoopSignals) -> anyhow::Result<()> {
        loop {
            self.wait_for_recv_buffer(signals).await;
            match self.receive(reader).await? {
                ReceiveStatus::Received(_) => signals.received.notify_one(),
                ReceiveStatus::Closed => return Ok(()),
            }
        }
    }

    async fn read_datagrams(&self, socket: &UdpSocket, signals: &ReceiveLoopSignals) -> anyhow::Result<()> {
        loop {
            self.wait_for_recv_buffer(signals).await;
            self.receive_datagram(socket).await?;
            signals.received.notify_one();
        }
    }

    async fn wait_for_recv_buffer(&self, signals: &ReceiveLoopSignals) {
        while !self.is_recv_buffer_available() {
            signals.dispatched.notified().await;
        }
    }

    /// Dispatches whenever messages arrive, and every `dispatch_retry_interval` while the handler
    ///  refuses messages. Ends when reading is finished and all messages are dispatched, or right
    ///  away if reading failed.
    async fn dispatch_loop<H: MessageHandler<U::Msg> + ?Sized>(&self, handler: &H, signals: &ReceiveLoopSignals) {
        loop {
            let status = self.dispatch(handler).await;
            signals.dispatched.notify_one();

            match status {
                DispatchStatus::Paused { remaining } => {
                    if signals.read_failed.load(Ordering::Acquire) {
                        debug!("endpoint {}: receiving failed, dropping {} undispatched messages", self.id(), remaining);
                        return;
                    }
                    tokio::time::sleep(self.config.dispatch_retry_interval).await;
                }
                DispatchStatus::Drained => {
                    if signals.reading_finished.load(Ordering::Acquire) {
                        return;
                    }
                    signals.received.notified().await;
                }
            }
        }
    }
}

/// Wake-ups between the reading and the dispatching half of a receive loop. `notify_one` keeps
///  a permit if nobody is waiting, so a signal sent between a check and the following wait is
///  not lost.
#[derive(Default)]
struct ReceiveLoopSignals {
    /// reading added messages to the receive queue, or finished
    received: Notify,
    /// a dispatch attempt ended, possibly freeing space in the receive queue
    dispatched: Notify,
    reading_finished: AtomicBool,
    read_failed: AtomicBool,
}

impl ReceiveLoopSignals {
    fn finish_reading(&self, failed: bool) {
        self.read_failed.store(failed, Ordering::Release);
        self.reading_finished.store(true, Ordering::Release);
        self.received.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndPointConfig;
    use crate::framing::length_prefixed::{LengthPrefixedPacker, LengthPrefixedUnpacker};
    use crate::framing::udp::{DatagramUnpacker, UdpPacker};
    use crate::framing::raw::RawPacker;
    use crate::message::UdpMessage;
    use crate::statistics::{FullClock, LightClock};
    use crate::test_util::RecordingHandler;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    type TestEndPoint<C> = EndPoint<LengthPrefixedPacker, LengthPrefixedUnpacker, C>;

    fn end_point<C: StatClock>(config: EndPointConfig) -> TestEndPoint<C> {
        let end_point = EndPoint::new(
            Arc::new(config),
            Arc::new(LengthPrefixedPacker::new(100)),
            LengthPrefixedUnpacker::new(100, 16),
        ).unwrap();
        end_point.on_connected();
        end_point
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut result = (payload.len() as u32).to_be_bytes().to_vec();
        result.extend_from_slice(payload);
        result
    }

    fn bytes(msgs: &[&[u8]]) -> Vec<Bytes> {
        msgs.iter()
            .map(|m| Bytes::copy_from_slice(m))
            .collect()
    }

    #[tokio::test]
    async fn test_receive_reads_until_complete() {
        let end_point = end_point::<LightClock>(Default::default());
        let wire = [frame(b"hello"), frame(b""), frame(b"world")].concat();
        let mut reader = wire.as_slice();

        // a region of 16 bytes holds the first two frames and part of the third
        assert_eq!(end_point.receive(&mut reader).await.unwrap(), ReceiveStatus::Received(2));
        assert_eq!(end_point.receive(&mut reader).await.unwrap(), ReceiveStatus::Received(1));
        assert_eq!(end_point.recv_queue_len(), 3);

        assert_eq!(end_point.receive(&mut reader).await.unwrap(), ReceiveStatus::Closed);
        assert!(!end_point.is_ready());

        let handler = RecordingHandler::new();
        assert_eq!(end_point.dispatch(&handler).await, DispatchStatus::Drained);
        assert_eq!(handler.received(), bytes(&[b"hello".as_slice(), b"", b"world"]));

        let stats = end_point.statistics();
        assert_eq!(stats.recv_msg_sum, 3);
        assert_eq!(stats.recv_byte_sum, 10);
    }

    #[tokio::test]
    async fn test_receive_waits_for_completion_condition() {
        let end_point = end_point::<LightClock>(Default::default());
        let (mut client, mut server) = tokio::io::duplex(64);

        let wire = frame(b"split");
        client.write_all(&wire[..2]).await.unwrap();
        let receiving = end_point.receive(&mut server);
        let writing = async {
            tokio::task::yield_now().await;
            client.write_all(&wire[2..]).await.unwrap();
        };
        let (received, _) = tokio::join!(receiving, writing);
        assert_eq!(received.unwrap(), ReceiveStatus::Received(1));
    }

    #[tokio::test]
    async fn test_parse_error_shuts_down() {
        let end_point = end_point::<LightClock>(Default::default());
        let wire = frame(&[0; 101]);
        let mut reader = wire.as_slice();

        assert!(end_point.receive(&mut reader).await.is_err());
        assert!(!end_point.is_ready());
    }

    #[tokio::test]
    async fn test_dispatch_backpressure() {
        let config = EndPointConfig {
            dispatch_batch_size: 2,
            ..Default::default()
        };
        let end_point = end_point::<LightClock>(config);
        let wire = [frame(b"1"), frame(b"2"), frame(b"3")].concat();
        end_point.receive(&mut wire.as_slice()).await.unwrap();

        let handler = RecordingHandler::with_capacity(1);
        assert_eq!(end_point.dispatch(&handler).await, DispatchStatus::Paused { remaining: 2 });
        assert_eq!(handler.received(), bytes(&[b"1".as_slice()]));

        // refused messages are offered again, in order
        assert_eq!(end_point.dispatch(&handler).await, DispatchStatus::Paused { remaining: 2 });
        handler.add_capacity(10);
        assert_eq!(end_point.dispatch(&handler).await, DispatchStatus::Drained);
        assert_eq!(handler.received(), bytes(&[b"1".as_slice(), b"2", b"3"]));
        assert_eq!(handler.max_batch_len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_statistics_full() {
        let end_point = end_point::<FullClock>(Default::default());
        let wire = [frame(b"ab"), frame(b"c")].concat();
        end_point.receive(&mut wire.as_slice()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        let handler = RecordingHandler::with_capacity(0);
        end_point.dispatch(&handler).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        handler.add_capacity(2);
        assert_eq!(end_point.dispatch(&handler).await, DispatchStatus::Drained);

        let stats = end_point.statistics();
        assert_eq!(stats.recv_msg_sum, 2);
        assert_eq!(stats.recv_byte_sum, 3);
        assert_eq!(stats.dispatch_delay_sum, Duration::from_millis(20));
        assert_eq!(stats.recv_idle_sum, Duration::from_millis(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_loop_end_to_end() {
        let config = EndPointConfig {
            max_recv_buffered_msgs: 2,
            ..Default::default()
        };
        let receiver = end_point::<LightClock>(config);
        let sender = end_point::<LightClock>(Default::default());
        let (client, mut server) = tokio::io::duplex(1024);
        let sink = crate::wire::StreamSink::new(client);

        let payloads = (0..20u8).map(|i| vec![i; i as usize]).collect::<Vec<_>>();
        for p in &payloads {
            assert!(sender.send(p, false).unwrap());
        }
        while sender.flush(&sink).await.unwrap() > 0 {}
        drop(sink);

        let handler = RecordingHandler::with_capacity(5);
        let receiving = receiver.receive_loop(&mut server, &handler);
        let consuming = async {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_millis(200)).await;
                handler.add_capacity(5);
            }
        };
        let (received, _) = tokio::join!(receiving, consuming);
        received.unwrap();

        assert_eq!(handler.received(), payloads.iter().map(|p| Bytes::copy_from_slice(p)).collect::<Vec<_>>());
        assert!(!receiver.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_loop_redispatches_while_connection_is_open() {
        let receiver = &end_point::<LightClock>(Default::default());
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&[frame(b"first"), frame(b"second")].concat()).await.unwrap();

        let handler = RecordingHandler::with_capacity(0);
        let handler = &handler;
        let receiving = receiver.receive_loop(&mut server, handler);
        let consuming = async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handler.add_capacity(10);
            // nothing more is written: the refused messages must be dispatched without new data
            while handler.received().len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(receiver.is_ready());
            drop(client);
        };

        let (received, _) = timeout(Duration::from_secs(5), async { tokio::join!(receiving, consuming) }).await.unwrap();
        received.unwrap();
        assert_eq!(handler.received(), bytes(&[b"first".as_slice(), b"second"]));
        assert!(!receiver.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_loop_returns_read_error() {
        let receiver = end_point::<LightClock>(Default::default());
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&[frame(b"ok"), frame(&[0; 101])].concat()).await.unwrap();

        let handler = RecordingHandler::with_capacity(0);
        let result = timeout(Duration::from_secs(5), receiver.receive_loop(&mut server, &handler)).await.unwrap();
        assert!(result.is_err());
        assert!(handler.received().is_empty());
        assert!(!receiver.is_ready());
    }

    #[tokio::test]
    async fn test_datagram_receive_loop_redispatches_while_waiting() {
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for data in [b"one".as_slice(), b"two"] {
            peer.send_to(data, socket.local_addr().unwrap()).await.unwrap();
        }

        let end_point = EndPoint::<UdpPacker<RawPacker>, DatagramUnpacker, LightClock>::new(
            Arc::new(EndPointConfig { dispatch_retry_interval: Duration::from_millis(10), ..Default::default() }),
            Arc::new(UdpPacker::new(RawPacker)),
            DatagramUnpacker::default(),
        ).unwrap();

        let handler = RecordingHandler::<UdpMessage<Bytes>>::with_capacity(0);
        let consuming = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handler.add_capacity(10);
            while handler.received().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        timeout(Duration::from_secs(5), async {
            tokio::select! {
                result = end_point.datagram_receive_loop(&socket, &handler) => panic!("receive loop ended: {:?}", result),
                _ = consuming => {}
            }
        }).await.unwrap();

        let received = handler.received().into_iter()
            .map(|m| m.msg)
            .collect::<Vec<_>>();
        assert_eq!(received, bytes(&[b"one".as_slice(), b"two"]));
    }

    #[tokio::test]
    async fn test_receive_datagram() {
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        peer.send_to(b"datagram", socket.local_addr().unwrap()).await.unwrap();

        let end_point = EndPoint::<UdpPacker<RawPacker>, DatagramUnpacker, LightClock>::new(
            Arc::new(Default::default()),
            Arc::new(UdpPacker::new(RawPacker)),
            DatagramUnpacker::default(),
        ).unwrap();
        assert_eq!(end_point.receive_datagram(&socket).await.unwrap(), 1);

        let handler = RecordingHandler::<UdpMessage<Bytes>>::new();
        end_point.dispatch(&handler).await;
        let received = handler.received();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].peer_addr, Some(peer.local_addr().unwrap()));
        assert_eq!(received[0].msg.as_ref(), b"datagram");
    }
}
