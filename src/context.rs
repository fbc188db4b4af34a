use crate::config::ApplierOptions;
use crate::counters::ApplyCounters;
use crate::locks::LockRegistry;
use crate::multikey::MultikeyPathTracker;
use crate::storage::{ApplySession, Catalog, StorageEngine};
use std::time::Instant;

/// Monotonic clock seam, injectable for tests. Millisecond precision is
/// sufficient.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Shared services for one batch: the collaborators behind the applier plus
/// the options the driver fixed for the batch. Cheap to copy into workers.
#[derive(Clone, Copy)]
pub struct ApplierEnv<'a> {
    pub storage: &'a dyn StorageEngine,
    pub catalog: &'a dyn Catalog,
    pub locks: &'a LockRegistry,
    pub clock: &'a dyn Clock,
    pub counters: &'a ApplyCounters,
    pub options: &'a ApplierOptions,
}

impl<'a> ApplierEnv<'a> {
    /// Context for one apply worker: the shared services plus the worker's
    /// own apply session and multikey tracker.
    pub fn worker_context(&self) -> ApplyContext<'a> {
        ApplyContext {
            storage: self.storage,
            catalog: self.catalog,
            locks: self.locks,
            clock: self.clock,
            counters: self.counters,
            options: self.options,
            session: ApplySession::for_batch_worker(),
            multikey: MultikeyPathTracker::new(),
        }
    }
}

/// Everything a single apply call needs. One per worker; never shared across
/// threads.
pub struct ApplyContext<'a> {
    pub storage: &'a dyn StorageEngine,
    pub catalog: &'a dyn Catalog,
    pub locks: &'a LockRegistry,
    pub clock: &'a dyn Clock,
    pub counters: &'a ApplyCounters,
    pub options: &'a ApplierOptions,
    pub session: ApplySession,
    pub multikey: MultikeyPathTracker,
}
