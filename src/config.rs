use std::time::Duration;
use anyhow::bail;

pub struct EndPointConfig {
    /// This is the biggest message (payload, without framing) that framings which enforce a
    ///  limit accept in either direction. Incoming frames announcing a bigger message are
    ///  treated as corrupt, which is fatal for the connection. An endpoint refuses framings whose
    ///  own limit is bigger than this.
    pub max_msg_size: usize,

    /// This is the size of the region an unpacker offers for a single read. Unpackers that need
    ///  to hold a complete message before parsing it grow their buffer beyond this as needed.
    ///  Framings built with `from_config` use it.
    pub recv_chunk_size: usize,

    /// Sends are admitted as long as the send queue holds fewer messages than this.
    pub max_send_buffered_msgs: usize,

    /// If set, sends are admitted only as long as the send queue holds fewer bytes than this -
    ///  in addition to the limit on the number of messages.
    pub max_send_buffered_bytes: Option<usize>,

    /// Receiving pauses (i.e. the I/O driver stops reading) while the receive queue holds this
    ///  many messages or more, which propagates backpressure to the peer.
    pub max_recv_buffered_msgs: usize,

    /// This is the maximum number of messages written to the wire in a single flush.
    pub send_batch_size: usize,

    /// This is the maximum number of messages offered to the handler in a single call.
    pub dispatch_batch_size: usize,

    /// While the handler does not consume all offered messages, the receive loop offers them
    ///  again after this interval.
    pub dispatch_retry_interval: Duration,

    /// Safe sends retry after this interval if the send buffer was full.
    pub safe_send_retry_interval: Duration,

    /// If set, safe sends that are waiting for buffer space are additionally woken up when
    ///  a flush frees space rather than only polling in `safe_send_retry_interval` steps.
    pub wake_safe_send_on_drain: bool,
}

impl Default for EndPointConfig {
    fn default() -> Self {
        EndPointConfig {
            max_msg_size: 4000,
            recv_chunk_size: 4000,
            max_send_buffered_msgs: 1024,
            max_send_buffered_bytes: None,
            max_recv_buffered_msgs: 1024,
            send_batch_size: 64,
            dispatch_batch_size: 64,
            dispatch_retry_interval: Duration::from_millis(50),
            safe_send_retry_interval: Duration::from_millis(50),
            wake_safe_send_on_drain: false,
        }
    }
}

impl EndPointConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_msg_size == 0 {
            bail!("max message size must be positive");
        }
        // the length header is a u32, and u32::MAX is reserved for heartbeats
        if self.max_msg_size >= u32::MAX as usize {
            bail!("max message size must be less than {}", u32::MAX);
        }
        if self.recv_chunk_size == 0 {
            bail!("receive chunk size must be positive");
        }
        if self.max_send_buffered_msgs == 0 {
            bail!("send buffer must have room for at least one message");
        }
        if self.max_send_buffered_bytes == Some(0) {
            bail!("send buffer byte limit must be positive");
        }
        if self.max_recv_buffered_msgs == 0 {
            bail!("receive buffer must have room for at least one message");
        }
        if self.send_batch_size == 0 || self.dispatch_batch_size == 0 {
            bail!("batch sizes must be positive");
        }
        if self.dispatch_retry_interval.is_zero() {
            bail!("dispatch retry interval must be positive");
        }
        if self.safe_send_retry_interval.is_zero() {
            bail!("safe send retry interval must be positive");
        }

        Ok(())
    }
}
