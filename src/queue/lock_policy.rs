use std::cell::{RefCell, RefMut};
use std::ops::DerefMut;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A container providing access to a `T` through a guard - with or without mutual exclusion,
///  depending on the implementation
pub trait Lock<T> {
    type Guard<'a>: DerefMut<Target = T> where Self: 'a;

    fn new(value: T) -> Self;

    fn lock(&self) -> Self::Guard<'_>;
}

impl <T> Lock<T> for Mutex<T> {
    type Guard<'a> = MutexGuard<'a, T> where Self: 'a;

    fn new(value: T) -> Self {
        Mutex::new(value)
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        // queue state is consistent after every mutation, so a panic in a visitor does not
        //  leave it corrupted
        Mutex::lock(self)
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl <T> Lock<T> for RefCell<T> {
    type Guard<'a> = RefMut<'a, T> where Self: 'a;

    fn new(value: T) -> Self {
        RefCell::new(value)
    }

    /// NB: panics on re-entrant access (e.g. modifying a queue from inside its own visitor)
    fn lock(&self) -> RefMut<'_, T> {
        self.borrow_mut()
    }
}

/// Selects the [Lock] a [super::MessageQueue] uses, at the type level
pub trait LockPolicy: 'static {
    type Lock<T>: Lock<T>;

    const IS_THREAD_SAFE: bool;
}

/// Mutual exclusion through a [Mutex]: the queue can be shared between arbitrary threads
pub enum Locked {}
impl LockPolicy for Locked {
    type Lock<T> = Mutex<T>;
    const IS_THREAD_SAFE: bool = true;
}

/// No mutual exclusion: the queue is `!Sync` and can only be used by a single owner at a time,
///  e.g. a buffer that belongs exclusively to the I/O driver
pub enum Unlocked {}
impl LockPolicy for Unlocked {
    type Lock<T> = RefCell<T>;
    const IS_THREAD_SAFE: bool = false;
}
