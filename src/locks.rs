use crate::entry::Namespace;
use parking_lot::{ArcRwLockReadGuard, ArcRwLockWriteGuard, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    IntentShared,
    IntentExclusive,
    Exclusive,
}

impl LockMode {
    /// IS and IX both admit concurrent holders at this layer; only X is
    /// exclusive. Document-level conflicts belong to the storage engine.
    pub fn is_exclusive(self) -> bool {
        matches!(self, LockMode::Exclusive)
    }
}

/// Scoped database and collection locks with guaranteed release. One
/// registry is shared by every worker applying a batch.
#[derive(Default)]
pub struct LockRegistry {
    dbs: Mutex<HashMap<String, Arc<RwLock<()>>>>,
    collections: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

pub struct LockGuard {
    _inner: GuardInner,
}

enum GuardInner {
    Shared(ArcRwLockReadGuard<parking_lot::RawRwLock, ()>),
    Exclusive(ArcRwLockWriteGuard<parking_lot::RawRwLock, ()>),
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(map: &Mutex<HashMap<String, Arc<RwLock<()>>>>, key: &str) -> Arc<RwLock<()>> {
        let mut map = map.lock();
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    pub fn lock_db(&self, db: &str, mode: LockMode) -> LockGuard {
        Self::acquire(Self::handle(&self.dbs, db), mode)
    }

    pub fn lock_collection(&self, ns: &Namespace, mode: LockMode) -> LockGuard {
        Self::acquire(Self::handle(&self.collections, &ns.full_name()), mode)
    }

    fn acquire(lock: Arc<RwLock<()>>, mode: LockMode) -> LockGuard {
        let inner = if mode.is_exclusive() {
            GuardInner::Exclusive(lock.write_arc())
        } else {
            GuardInner::Shared(lock.read_arc())
        };
        LockGuard { _inner: inner }
    }
}
