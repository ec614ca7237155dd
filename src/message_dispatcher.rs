use async_trait::async_trait;

use crate::message::Message;

/// The application's receiving side. Messages are offered in the order they were parsed, and
///  never concurrently for the same endpoint.
#[async_trait]
pub trait MessageHandler<M: Message>: Send + Sync + 'static {
    /// Returns `false` if the handler can not take the message now. Dispatch then pauses, and
    ///  the same message is offered again on the next dispatch.
    async fn on_msg(&self, msg: &M) -> bool;

    /// Handles a run of messages, returning how many of them (counted from the front) were
    ///  consumed. Consuming fewer than offered pauses dispatch.
    async fn on_msgs(&self, msgs: &[M]) -> usize {
        let mut consumed = 0;
        for msg in msgs {
            if !self.on_msg(msg).await {
                break;
            }
            consumed += 1;
        }
        consumed
    }
}
