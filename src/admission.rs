#[cfg(test)] use mockall::automock;

use crate::config::EndPointConfig;

/// Decides whether an endpoint's send buffer can take more messages. Sends that are not allowed
///  to overflow the buffer are refused while this returns `false`.
#[cfg_attr(test, automock)]
pub trait SendAdmission: Send + Sync + 'static {
    fn is_send_buffer_available(&self, pending_msgs: usize, pending_bytes: usize) -> bool;
}

/// Admits sends while the send queue is below configured limits for both the number of
///  messages and (optionally) their total size
#[derive(Debug, Clone)]
pub struct HighWaterMarks {
    pub max_msgs: usize,
    pub max_bytes: Option<usize>,
}

impl HighWaterMarks {
    pub fn new(config: &EndPointConfig) -> HighWaterMarks {
        HighWaterMarks {
            max_msgs: config.max_send_buffered_msgs,
            max_bytes: config.max_send_buffered_bytes,
        }
    }
}

impl SendAdmission for HighWaterMarks {
    fn is_send_buffer_available(&self, pending_msgs: usize, pending_bytes: usize) -> bool {
        pending_msgs < self.max_msgs
            && self.max_bytes.map(|max| pending_bytes < max).unwrap_or(true)
    }
}
