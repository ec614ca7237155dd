//! Outcome of send calls, and the one-shot completion that connects a synchronous send with the
//!  I/O driver that eventually writes (or drops) its message.

use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::sync::Notify;
use tracing::trace;

use crate::message::Message;
use crate::statistics::StatClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    /// the operation could not be attempted (buffer full and overflow disallowed, endpoint not
    ///  ready), or its message was dropped without being sent
    NotApplicable,
    /// a completion was fulfilled a second time - the first resolution stands
    Duplicate,
    /// only returned by synchronous sends: the wait elapsed, but the message may still be sent
    ///  later
    Timeout,
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        *self == CallOutcome::Success
    }
}

#[derive(Default)]
struct CompletionCell {
    outcome: OnceLock<CallOutcome>,
    notify: Notify,
}

/// The waiting side of a one-shot completion. There is exactly one per synchronous send call.
pub struct CompletionSignal {
    cell: Arc<CompletionCell>,
}

impl Debug for CompletionSignal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CompletionSignal({:?})", self.cell.outcome.get())
    }
}

impl CompletionSignal {
    pub fn new() -> (CompletionSignal, Completer) {
        let cell = Arc::new(CompletionCell::default());
        (CompletionSignal { cell: cell.clone() }, Completer { cell })
    }

    /// Waits until the completion is resolved, returning the (first) outcome
    pub async fn wait(&self) -> CallOutcome {
        loop {
            if let Some(outcome) = self.try_outcome() {
                return outcome;
            }
            // `notify_one` stores a permit if nobody is waiting yet, so a resolution between the
            //  check and this call is not lost
            self.cell.notify.notified().await;
        }
    }

    pub fn try_outcome(&self) -> Option<CallOutcome> {
        self.cell.outcome.get().cloned()
    }

    pub fn is_resolved(&self) -> bool {
        self.cell.outcome.get().is_some()
    }
}

/// The resolving side of a one-shot completion. It travels with the queued message; if it is
///  dropped without being resolved (e.g. the message is discarded on teardown), it resolves
///  itself to [CallOutcome::NotApplicable] so no waiter can hang.
pub struct Completer {
    cell: Arc<CompletionCell>,
}

impl Debug for Completer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Completer({:?})", self.cell.outcome.get())
    }
}

impl Completer {
    /// Fulfills the completion. Returns [CallOutcome::Success] if this call set the outcome, and
    ///  [CallOutcome::Duplicate] if it had already been set - in which case the first outcome
    ///  stands.
    pub fn resolve(&self, outcome: CallOutcome) -> CallOutcome {
        match self.cell.outcome.set(outcome) {
            Ok(()) => {
                self.cell.notify.notify_one();
                CallOutcome::Success
            }
            Err(_) => {
                trace!("completion already resolved as {:?}, ignoring {:?}", self.cell.outcome.get(), outcome);
                CallOutcome::Duplicate
            }
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.cell.outcome.get().is_some()
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        if !self.is_resolved() {
            self.resolve(CallOutcome::NotApplicable);
        }
    }
}

/// A message in a queue, stamped with the time it entered the queue and - for synchronous
///  sends - the completion to resolve when it is written.
pub struct QueuedMsg<M, C: StatClock> {
    pub msg: M,
    pub begin_time: C::Time,
    pub completer: Option<Completer>,
}

impl <M: Debug, C: StatClock> Debug for QueuedMsg<M, C> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedMsg")
            .field("msg", &self.msg)
            .field("completer", &self.completer)
            .finish()
    }
}

impl <M: Message, C: StatClock> QueuedMsg<M, C> {
    pub fn new(msg: M) -> QueuedMsg<M, C> {
        QueuedMsg {
            msg,
            begin_time: C::now(),
            completer: None,
        }
    }

    pub fn with_completer(msg: M, completer: Completer) -> QueuedMsg<M, C> {
        QueuedMsg {
            msg,
            begin_time: C::now(),
            completer: Some(completer),
        }
    }
}

impl <M: Message, C: StatClock> Message for QueuedMsg<M, C> {
    fn data(&self) -> &[u8] {
        self.msg.data()
    }

    fn size(&self) -> usize {
        self.msg.size()
    }

    fn clear(&mut self) {
        self.msg.clear();
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.msg.peer_addr()
    }
}
