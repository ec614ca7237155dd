//! Endpoints are kept in a pool under stable ids, so that an endpoint's identity survives it
//!  being taken out for reuse and put back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, PoisonError};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::end_point::EndPoint;
use crate::framing::{Packer, Unpacker};
use crate::statistics::{DefaultClock, StatClock, Statistics};

/// The lookup / removal / re-insertion contract an endpoint pool provides
pub trait EndPointPool {
    type Handle;

    fn find_by_id(&self, id: u64) -> Option<Self::Handle>;

    /// removes the endpoint from the pool, returning `false` if it was not pooled
    fn delete(&self, handle: &Self::Handle) -> bool;

    /// (re-)inserts an endpoint under the given id, which is assigned to the endpoint. Returns
    ///  `false` if the id is taken by a different endpoint.
    fn restore(&self, handle: Self::Handle, id: u64) -> bool;
}

pub struct InMemoryPool<P: Packer, U: Unpacker, C: StatClock = DefaultClock> {
    end_points: RwLock<FxHashMap<u64, Arc<EndPoint<P, U, C>>>>,
    next_id: AtomicU64,
}

impl <P: Packer, U: Unpacker, C: StatClock> Default for InMemoryPool<P, U, C> {
    fn default() -> Self {
        InMemoryPool {
            end_points: Default::default(),
            next_id: AtomicU64::new(1),
        }
    }
}

impl <P: Packer, U: Unpacker, C: StatClock> InMemoryPool<P, U, C> {
    pub fn new() -> InMemoryPool<P, U, C> {
        Default::default()
    }

    /// adds an endpoint under a fresh id, returning that id
    pub fn add(&self, end_point: Arc<EndPoint<P, U, C>>) -> u64 {
        let mut end_points = self.write();
        let id = loop {
            let candidate = self.next_id.fetch_add(1, Ordering::AcqRel);
            if !end_points.contains_key(&candidate) {
                break candidate;
            }
        };
        end_point.set_id(id);
        end_points.insert(id, end_point);
        debug!("added endpoint {} to pool", id);
        id
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// the sum of all pooled endpoints' statistics
    pub fn statistics(&self) -> Statistics<C> {
        let mut result = Statistics::new();
        for end_point in self.read().values() {
            result += end_point.statistics();
        }
        result
    }

    fn read(&self) -> RwLockReadGuard<'_, FxHashMap<u64, Arc<EndPoint<P, U, C>>>> {
        self.end_points.read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, FxHashMap<u64, Arc<EndPoint<P, U, C>>>> {
        self.end_points.write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl <P: Packer, U: Unpacker, C: StatClock> EndPointPool for InMemoryPool<P, U, C> {
    type Handle = Arc<EndPoint<P, U, C>>;

    fn find_by_id(&self, id: u64) -> Option<Self::Handle> {
        self.read().get(&id).cloned()
    }

    fn delete(&self, handle: &Self::Handle) -> bool {
        let mut end_points = self.write();
        let id = handle.id();
        match end_points.get(&id) {
            Some(pooled) if Arc::ptr_eq(pooled, handle) => {
                end_points.remove(&id);
                debug!("deleted endpoint {} from pool", id);
                true
            }
            _ => false,
        }
    }

    fn restore(&self, handle: Self::Handle, id: u64) -> bool {
        let mut end_points = self.write();
        if let Some(pooled) = end_points.get(&id) {
            if !Arc::ptr_eq(pooled, &handle) {
                warn!("can not restore endpoint with id {}: the id is taken", id);
                return false;
            }
        }
        handle.set_id(id);
        end_points.insert(id, handle);
        debug!("restored endpoint {} to pool", id);
        true
    }
}
