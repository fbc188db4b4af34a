use crate::entry::Namespace;
use crate::locks::{LockMode, LockRegistry};
use crate::storage::{Catalog, CollectionProps};
use std::collections::HashMap;

/// Per-namespace cache of the collection properties every CRUD entry needs.
/// One instance per partitioning pass or worker, single-threaded, valid for
/// the duration of one batch only (collection schema may change between
/// batches). Misses are cached too, including namespaces with no backing
/// collection.
#[derive(Default)]
pub struct CollectionPropsCache {
    cache: HashMap<String, CollectionProps>,
}

impl CollectionPropsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(
        &mut self,
        catalog: &dyn Catalog,
        locks: &LockRegistry,
        ns: &Namespace,
    ) -> CollectionProps {
        let key = ns.full_name();
        if let Some(props) = self.cache.get(&key) {
            return *props;
        }
        let props = {
            let _db_lock = locks.lock_db(&ns.db, LockMode::IntentShared);
            catalog.collection_props(ns).unwrap_or_default()
        };
        self.cache.insert(key, props);
        props
    }
}
