//! A FIFO of pending messages with byte accounting, shared between producers (application
//!  calls) and the consumer (I/O driver).
//!
//! The queue never refuses a message on capacity grounds: deciding whether there is room is
//!  the endpoint's job (see [crate::admission]). The queue only keeps [MessageQueue::size_in_byte]
//!  exact, so that decision can be made.

pub mod lock_policy;

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::error;

use crate::message::{size_in_byte, Message, MsgContainer};
use crate::queue::lock_policy::{Lock, LockPolicy, Locked};

struct QueueState<M> {
    items: VecDeque<M>,
    byte_size: usize,
}

pub struct MessageQueue<M, P: LockPolicy = Locked> {
    state: P::Lock<QueueState<M>>,

    // mirrors of the state's length and byte size, readable without taking the lock
    len: AtomicUsize,
    byte_size: AtomicUsize,

    _policy: PhantomData<fn() -> P>,
}

impl <M: Message, P: LockPolicy> Default for MessageQueue<M, P> {
    fn default() -> Self {
        Self::new()
    }
}

impl <M: Message, P: LockPolicy> MessageQueue<M, P> {
    pub fn new() -> MessageQueue<M, P> {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> MessageQueue<M, P> {
        MessageQueue {
            state: Lock::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                byte_size: 0,
            }),
            len: AtomicUsize::new(0),
            byte_size: AtomicUsize::new(0),
            _policy: PhantomData,
        }
    }

    pub fn is_thread_safe(&self) -> bool {
        P::IS_THREAD_SAFE
    }

    /// number of queued messages - may be stale if other threads modify the queue concurrently
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// may be stale if other threads modify the queue concurrently
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// sum of the queued messages' sizes - may be stale if other threads modify the queue
    ///  concurrently
    pub fn size_in_byte(&self) -> usize {
        self.byte_size.load(Ordering::Acquire)
    }

    /// Appends a message at the tail. Returns `false` only if the queue's storage can not grow.
    pub fn enqueue(&self, msg: M) -> bool {
        let mut state = self.state.lock();
        if let Err(e) = state.items.try_reserve(1) {
            error!("cannot hold more messages ({} queued): {}", state.items.len(), e);
            return false;
        }

        state.byte_size += msg.size();
        state.items.push_back(msg);
        self.publish(&state);
        true
    }

    /// Moves all of `src` to the tail, leaving `src` empty. If the caller knows the total byte
    ///  size of `src`, passing it saves iterating over the messages.
    pub fn move_items_in(&self, src: &mut MsgContainer<M>, known_byte_size: Option<usize>) {
        if src.is_empty() {
            return;
        }
        let byte_size = known_byte_size
            .unwrap_or_else(|| size_in_byte(src.iter()));

        let mut state = self.state.lock();
        if state.items.is_empty() {
            std::mem::swap(&mut state.items, src);
        }
        else {
            state.items.append(src);
        }
        state.byte_size += byte_size;
        self.publish(&state);
    }

    /// Removes and returns the oldest message
    pub fn try_dequeue(&self) -> Option<M> {
        let mut state = self.state.lock();
        let msg = state.items.pop_front()?;
        state.byte_size -= msg.size();
        self.publish(&state);
        Some(msg)
    }

    /// Moves the oldest `max_items` messages (all messages for `None`) to the tail of `dest`,
    ///  preserving their order.
    pub fn move_items_out(&self, dest: &mut MsgContainer<M>, max_items: Option<usize>) {
        let mut state = self.state.lock();

        let num_items = match max_items {
            None => state.items.len(),
            Some(max) => max.min(state.items.len()),
        };
        if num_items == state.items.len() {
            Self::move_all(&mut state, dest);
        }
        else {
            let moved_bytes = size_in_byte(state.items.range(..num_items));
            dest.extend(state.items.drain(..num_items));
            state.byte_size -= moved_bytes;
        }
        self.publish(&state);
    }

    /// Moves the longest run of the oldest messages whose combined size does not exceed
    ///  `max_bytes` (all messages for `None`) to the tail of `dest`. At least one message is
    ///  moved if the queue is not empty, so a single message bigger than `max_bytes` can not
    ///  block the queue.
    pub fn move_items_out_bytes(&self, dest: &mut MsgContainer<M>, max_bytes: Option<usize>) {
        let mut state = self.state.lock();

        let Some(max_bytes) = max_bytes else {
            Self::move_all(&mut state, dest);
            self.publish(&state);
            return;
        };

        let mut num_items = 0;
        let mut moved_bytes = 0;
        for msg in state.items.iter() {
            if num_items > 0 && moved_bytes + msg.size() > max_bytes {
                break;
            }
            moved_bytes += msg.size();
            num_items += 1;
        }

        if num_items == state.items.len() {
            Self::move_all(&mut state, dest);
        }
        else {
            dest.extend(state.items.drain(..num_items));
            state.byte_size -= moved_bytes;
        }
        self.publish(&state);
    }

    /// Removes all messages, dropping them
    pub fn clear(&self) {
        let removed = {
            let mut state = self.state.lock();
            state.byte_size = 0;
            let removed = std::mem::take(&mut state.items);
            self.publish(&state);
            removed
        };
        // dropping outside the lock: a message's drop code may touch this queue again
        drop(removed);
    }

    /// Exchanges the queue's content with `other`
    pub fn swap(&self, other: &mut MsgContainer<M>) {
        let other_size = size_in_byte(other.iter());

        let mut state = self.state.lock();
        std::mem::swap(&mut state.items, other);
        state.byte_size = other_size;
        self.publish(&state);
    }

    /// Calls `f` for every queued message, oldest first, while holding the queue's lock.
    ///
    /// NB: `f` may modify messages, but it must not change their size.
    pub fn for_each(&self, mut f: impl FnMut(&mut M)) {
        let mut state = self.state.lock();
        for msg in state.items.iter_mut() {
            f(msg);
        }
    }

    /// Calls `f` for queued messages, oldest first, while holding the queue's lock - until `f`
    ///  returns `true`.
    ///
    /// NB: `f` may modify messages, but it must not change their size.
    pub fn for_each_until(&self, mut f: impl FnMut(&mut M) -> bool) {
        let mut state = self.state.lock();
        for msg in state.items.iter_mut() {
            if f(msg) {
                break;
            }
        }
    }

    fn move_all(state: &mut QueueState<M>, dest: &mut MsgContainer<M>) {
        if dest.is_empty() {
            std::mem::swap(&mut state.items, dest);
        }
        else {
            dest.append(&mut state.items);
        }
        state.byte_size = 0;
    }

    fn publish(&self, state: &QueueState<M>) {
        self.len.store(state.items.len(), Ordering::Release);
        self.byte_size.store(state.byte_size, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::lock_policy::Unlocked;
    use rstest::rstest;
    use std::sync::Arc;

    fn msg(len: usize, marker: u8) -> Vec<u8> {
        vec![marker; len]
    }

    fn markers(msgs: &MsgContainer<Vec<u8>>) -> Vec<u8> {
        msgs.iter()
            .map(|m| m.first().cloned().unwrap_or(0))
            .collect()
    }

    #[rstest]
    #[case::locked(true)]
    #[case::unlocked(false)]
    fn test_enqueue_dequeue_accounting(#[case] locked: bool) {
        fn check<P: LockPolicy>() {
            let queue = MessageQueue::<Vec<u8>, P>::new();
            let sizes = [3, 0, 7, 1, 12];
            for (i, &s) in sizes.iter().enumerate() {
                assert!(queue.enqueue(msg(s, i as u8 + 1)));
            }
            assert_eq!(queue.len(), sizes.len());
            assert_eq!(queue.size_in_byte(), 23);

            let mut remaining = 23;
            for (i, &s) in sizes.iter().enumerate() {
                let dequeued = queue.try_dequeue().unwrap();
                assert_eq!(dequeued.len(), s);
                assert_eq!(dequeued.first().cloned().unwrap_or(i as u8 + 1), i as u8 + 1);
                remaining -= s;
                assert_eq!(queue.size_in_byte(), remaining);
            }

            assert!(queue.try_dequeue().is_none());
            assert!(queue.is_empty());
            assert_eq!(queue.size_in_byte(), 0);
        }

        if locked {
            check::<Locked>();
        }
        else {
            check::<Unlocked>();
        }
    }

    #[rstest]
    #[case::none(5, 0)]
    #[case::some(5, 2)]
    #[case::all(5, 5)]
    #[case::more_than_all(5, 9)]
    #[case::empty(0, 3)]
    fn test_move_items_out(#[case] n: usize, #[case] k: usize) {
        let queue = MessageQueue::<Vec<u8>>::new();
        for i in 0..n {
            queue.enqueue(msg(i + 1, i as u8 + 1));
        }

        let mut dest = MsgContainer::new();
        dest.push_back(msg(1, 100));
        queue.move_items_out(&mut dest, Some(k));

        let moved = k.min(n);
        assert_eq!(queue.len(), n - moved);
        assert_eq!(dest.len(), moved + 1);

        let mut expected_dest = vec![100];
        expected_dest.extend((1..=moved).map(|i| i as u8));
        assert_eq!(markers(&dest), expected_dest);

        let expected_bytes: usize = (moved + 1..=n).sum();
        assert_eq!(queue.size_in_byte(), expected_bytes);

        let mut rest = MsgContainer::new();
        queue.move_items_out(&mut rest, None);
        assert_eq!(markers(&rest), (moved + 1..=n).map(|i| i as u8).collect::<Vec<_>>());
        assert_eq!(queue.size_in_byte(), 0);
    }

    #[rstest]
    #[case::unlimited(None, vec![1,2,3,4])]
    #[case::exact_boundary(Some(5), vec![1,2])]
    #[case::inside_message(Some(6), vec![1,2])]
    #[case::too_small_for_first(Some(1), vec![1])]
    #[case::everything(Some(100), vec![1,2,3,4])]
    fn test_move_items_out_bytes(#[case] max_bytes: Option<usize>, #[case] expected: Vec<u8>) {
        let queue = MessageQueue::<Vec<u8>>::new();
        for (i, s) in [2, 3, 4, 5].into_iter().enumerate() {
            queue.enqueue(msg(s, i as u8 + 1));
        }

        let mut dest = MsgContainer::new();
        queue.move_items_out_bytes(&mut dest, max_bytes);
        assert_eq!(markers(&dest), expected);
        assert_eq!(queue.size_in_byte(), 14 - size_in_byte(dest.iter()));
        assert_eq!(queue.len(), 4 - expected.len());
    }

    #[rstest]
    #[case::known_size(true)]
    #[case::computed_size(false)]
    fn test_move_items_in(#[case] pass_size: bool) {
        let queue = MessageQueue::<Vec<u8>>::new();
        queue.enqueue(msg(2, 1));

        let mut src: MsgContainer<Vec<u8>> = vec![msg(3, 2), msg(4, 3)].into();
        queue.move_items_in(&mut src, pass_size.then_some(7));
        assert!(src.is_empty());
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.size_in_byte(), 9);

        let mut all = MsgContainer::new();
        queue.move_items_out(&mut all, None);
        assert_eq!(markers(&all), vec![1, 2, 3]);
    }

    #[test]
    fn test_clear_and_swap() {
        let queue = MessageQueue::<Vec<u8>>::new();
        queue.enqueue(msg(5, 1));
        queue.enqueue(msg(6, 2));

        let mut other: MsgContainer<Vec<u8>> = vec![msg(1, 9)].into();
        queue.swap(&mut other);
        assert_eq!(markers(&other), vec![1, 2]);
        assert_eq!(queue.size_in_byte(), 1);
        assert_eq!(queue.len(), 1);

        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.size_in_byte(), 0);
    }

    #[test]
    fn test_visitors() {
        let queue = MessageQueue::<Vec<u8>, Unlocked>::new();
        for i in 1..=4 {
            queue.enqueue(msg(1, i));
        }

        let mut all = Vec::new();
        queue.for_each(|m| all.push(m[0]));
        assert_eq!(all, vec![1, 2, 3, 4]);

        let mut visited = Vec::new();
        queue.for_each_until(|m| {
            visited.push(m[0]);
            m[0] == 2
        });
        assert_eq!(visited, vec![1, 2]);

        queue.for_each(|m| m[0] += 10);
        assert_eq!(queue.try_dequeue(), Some(vec![11]));
        assert!(!queue.is_thread_safe());
    }

    #[test]
    fn test_concurrent_producers() {
        let queue = Arc::new(MessageQueue::<Vec<u8>>::new());
        assert!(queue.is_thread_safe());

        let producers = (0..4u8)
            .map(|producer| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..250u8 {
                        queue.enqueue(vec![producer, i]);
                    }
                })
            })
            .collect::<Vec<_>>();
        for p in producers {
            p.join().unwrap();
        }

        assert_eq!(queue.len(), 1000);
        assert_eq!(queue.size_in_byte(), 2000);

        // each producer's messages keep their relative order
        let mut last_seen = [None::<u8>; 4];
        while let Some(m) = queue.try_dequeue() {
            let prev = last_seen[m[0] as usize];
            assert!(prev.map(|p| p < m[1]).unwrap_or(true));
            last_seen[m[0] as usize] = Some(m[1]);
        }
        assert_eq!(queue.size_in_byte(), 0);
    }
}
