//! In-memory storage engine and catalog.
//!
//! A thread-safe document store implementing the applier's storage seams:
//! databases of collections keyed by normalized document identity, with an
//! oplog index for transaction chain reads. Write-conflict injection and
//! multikey registration hooks exist so tests can exercise the retry and
//! tracking paths.

use crate::collation::Collation;
use crate::config::ApplyMode;
use crate::entry::{CommandKind, Namespace, OpKind, OpTime, OplogEntry};
use crate::error::ApplyError;
use crate::multikey::{MultikeyPathInfo, MultikeyPathTracker};
use crate::storage::{ApplySession, Catalog, CollectionProps, StorageEngine};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

#[derive(Default)]
struct StoreState {
    databases: HashMap<String, DatabaseState>,
}

#[derive(Default)]
struct DatabaseState {
    collections: HashMap<String, CollectionState>,
}

struct CollectionState {
    uuid: Uuid,
    props: CollectionProps,
    docs: HashMap<String, Value>,
    /// Document identities in first-insert order. Capped collections must
    /// preserve it; kept for all collections since it is cheap.
    insert_order: Vec<Value>,
}

impl CollectionState {
    fn new(props: CollectionProps) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            props,
            docs: HashMap::new(),
            insert_order: Vec::new(),
        }
    }

    fn key_for(&self, id: &Value) -> String {
        self.props.collation.identity_key(id)
    }

    fn insert_doc(&mut self, id: &Value, doc: Value) {
        let key = self.key_for(id);
        if !self.docs.contains_key(&key) {
            self.insert_order.push(id.clone());
        }
        self.docs.insert(key, doc);
    }

    fn update_doc(
        &mut self,
        ns: &Namespace,
        id: &Value,
        payload: &Value,
        always_upsert: bool,
    ) -> Result<(), ApplyError> {
        let key = self.key_for(id);
        if let Some(doc) = self.docs.get_mut(&key) {
            merge_into(doc, payload);
            return Ok(());
        }
        if !always_upsert {
            return Err(ApplyError::UpdateOperationFailed {
                ns: ns.full_name(),
            });
        }
        let mut doc = serde_json::json!({ "_id": id });
        merge_into(&mut doc, payload);
        self.insert_order.push(id.clone());
        self.docs.insert(key, doc);
        Ok(())
    }

    fn delete_doc(&mut self, id: &Value) {
        let key = self.key_for(id);
        if self.docs.remove(&key).is_some() {
            let collation = self.props.collation;
            self.insert_order
                .retain(|existing| collation.identity_key(existing) != key);
        }
    }
}

/// Shallow merge: object payloads overwrite field by field, anything else
/// replaces the document wholesale. `_id` is never removed.
fn merge_into(doc: &mut Value, payload: &Value) {
    match (doc.as_object_mut(), payload.as_object()) {
        (Some(target), Some(fields)) => {
            for (k, v) in fields {
                target.insert(k.clone(), v.clone());
            }
        }
        _ => *doc = payload.clone(),
    }
}

pub struct MemoryStorage {
    inner: RwLock<StoreState>,
    doc_locking: bool,
    oplog: Mutex<HashMap<OpTime, OplogEntry>>,
    injected_conflicts: Mutex<HashMap<(String, String), u32>>,
    pending_multikey: Mutex<HashMap<String, Vec<MultikeyPathInfo>>>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::with_doc_locking(true)
    }

    pub fn with_doc_locking(doc_locking: bool) -> Self {
        Self {
            inner: RwLock::new(StoreState::default()),
            doc_locking,
            oplog: Mutex::new(HashMap::new()),
            injected_conflicts: Mutex::new(HashMap::new()),
            pending_multikey: Mutex::new(HashMap::new()),
        }
    }

    pub fn create_database(&self, db: &str) {
        self.inner
            .write()
            .databases
            .entry(db.to_string())
            .or_default();
    }

    /// Creates the collection (and its database) with the given properties.
    /// Returns the collection UUID.
    pub fn create_collection(&self, ns: &Namespace, props: CollectionProps) -> Uuid {
        let mut state = self.inner.write();
        let db = state.databases.entry(ns.db.clone()).or_default();
        let coll = db
            .collections
            .entry(ns.coll.clone())
            .or_insert_with(|| CollectionState::new(props));
        coll.uuid
    }

    pub fn drop_collection(&self, ns: &Namespace) {
        let mut state = self.inner.write();
        if let Some(db) = state.databases.get_mut(&ns.db) {
            db.collections.remove(&ns.coll);
        }
    }

    /// Makes an entry visible to `read_txn_operations_from_oplog_chain`, as
    /// if it had been written to the durable log.
    pub fn record_oplog_entry(&self, entry: OplogEntry) {
        self.oplog.lock().insert(entry.op_time, entry);
    }

    /// Arranges for the next `count` writes to the given document to fail
    /// with a write conflict.
    pub fn inject_write_conflicts(&self, ns: &Namespace, doc_id: &Value, count: u32) {
        self.injected_conflicts
            .lock()
            .insert(conflict_key(ns, doc_id), count);
    }

    /// Registers multikey path info reported on the next tracked write to
    /// the namespace.
    pub fn register_multikey_paths(&self, ns: &Namespace, info: MultikeyPathInfo) {
        self.pending_multikey
            .lock()
            .entry(ns.full_name())
            .or_default()
            .push(info);
    }

    pub fn document(&self, ns: &Namespace, id: &Value) -> Option<Value> {
        let state = self.inner.read();
        let coll = state.databases.get(&ns.db)?.collections.get(&ns.coll)?;
        coll.docs.get(&coll.key_for(id)).cloned()
    }

    pub fn document_count(&self, ns: &Namespace) -> usize {
        let state = self.inner.read();
        state
            .databases
            .get(&ns.db)
            .and_then(|db| db.collections.get(&ns.coll))
            .map(|coll| coll.docs.len())
            .unwrap_or(0)
    }

    /// Document identities in first-insert order.
    pub fn insertion_order(&self, ns: &Namespace) -> Vec<Value> {
        let state = self.inner.read();
        state
            .databases
            .get(&ns.db)
            .and_then(|db| db.collections.get(&ns.coll))
            .map(|coll| coll.insert_order.clone())
            .unwrap_or_default()
    }

    /// Full content dump, sorted, for state-equivalence assertions.
    pub fn dump(&self) -> BTreeMap<String, BTreeMap<String, Value>> {
        let state = self.inner.read();
        let mut out = BTreeMap::new();
        for (db_name, db) in &state.databases {
            for (coll_name, coll) in &db.collections {
                let docs: BTreeMap<String, Value> = coll
                    .docs
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                out.insert(format!("{db_name}.{coll_name}"), docs);
            }
        }
        out
    }

    fn consume_injected_conflict(
        &self,
        ns: &Namespace,
        id: Option<&Value>,
    ) -> Result<(), ApplyError> {
        let Some(id) = id else { return Ok(()) };
        let mut conflicts = self.injected_conflicts.lock();
        let key = conflict_key(ns, id);
        if let Some(remaining) = conflicts.get_mut(&key) {
            *remaining -= 1;
            if *remaining == 0 {
                conflicts.remove(&key);
            }
            return Err(ApplyError::WriteConflict);
        }
        Ok(())
    }

    fn report_multikey(&self, ns: &Namespace, tracker: &MultikeyPathTracker) {
        if !tracker.is_tracking() {
            return;
        }
        if let Some(infos) = self.pending_multikey.lock().remove(&ns.full_name()) {
            for info in infos {
                tracker.add_path_info(info);
            }
        }
    }
}

fn conflict_key(ns: &Namespace, id: &Value) -> (String, String) {
    (ns.full_name(), Collation::Binary.identity_key(id))
}

fn entry_doc_id(entry: &OplogEntry) -> Result<Value, ApplyError> {
    entry
        .doc_id
        .clone()
        .or_else(|| entry.payload.get("_id").cloned())
        .ok_or_else(|| {
            ApplyError::InvalidEntry(format!(
                "crud entry missing document identity: {}",
                entry.redacted()
            ))
        })
}

impl StorageEngine for MemoryStorage {
    fn supports_doc_locking(&self) -> bool {
        self.doc_locking
    }

    fn apply_operation(
        &self,
        _session: &ApplySession,
        ns: &Namespace,
        entry: &OplogEntry,
        always_upsert: bool,
        _mode: ApplyMode,
        multikey: &MultikeyPathTracker,
    ) -> Result<(), ApplyError> {
        if !entry.kind.is_crud() {
            return Err(ApplyError::PreconditionFailed(
                "apply_operation requires a CRUD entry".into(),
            ));
        }
        let id = entry_doc_id(entry)?;
        self.consume_injected_conflict(ns, Some(&id))?;

        let mut state = self.inner.write();
        let db = state
            .databases
            .get_mut(&ns.db)
            .ok_or_else(|| ApplyError::NamespaceNotFound { ns: ns.db.clone() })?;

        match entry.kind {
            OpKind::Insert => {
                // Inserts create the collection implicitly, like the real
                // engine; commands do not.
                let coll = db
                    .collections
                    .entry(ns.coll.clone())
                    .or_insert_with(|| CollectionState::new(CollectionProps::default()));
                coll.insert_doc(&id, entry.payload.clone());
            }
            OpKind::Update => {
                let coll = db.collections.get_mut(&ns.coll).ok_or_else(|| {
                    ApplyError::NamespaceNotFound {
                        ns: ns.full_name(),
                    }
                })?;
                coll.update_doc(ns, &id, &entry.payload, always_upsert)?;
            }
            OpKind::Delete => {
                let coll = db.collections.get_mut(&ns.coll).ok_or_else(|| {
                    ApplyError::NamespaceNotFound {
                        ns: ns.full_name(),
                    }
                })?;
                // Deleting an already-missing document is a no-op.
                coll.delete_doc(&id);
            }
            _ => {}
        }
        drop(state);

        self.report_multikey(ns, multikey);
        Ok(())
    }

    fn apply_inserts(
        &self,
        _session: &ApplySession,
        ns: &Namespace,
        entries: &[&OplogEntry],
        _mode: ApplyMode,
        multikey: &MultikeyPathTracker,
    ) -> Result<(), ApplyError> {
        let mut ids = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.kind != OpKind::Insert {
                return Err(ApplyError::PreconditionFailed(
                    "apply_inserts requires insert entries".into(),
                ));
            }
            ids.push(entry_doc_id(entry)?);
        }
        // A conflict anywhere aborts the group before any document lands.
        for id in &ids {
            self.consume_injected_conflict(ns, Some(id))?;
        }

        let mut state = self.inner.write();
        let db = state
            .databases
            .get_mut(&ns.db)
            .ok_or_else(|| ApplyError::NamespaceNotFound { ns: ns.db.clone() })?;
        let coll = db
            .collections
            .entry(ns.coll.clone())
            .or_insert_with(|| CollectionState::new(CollectionProps::default()));
        for (entry, id) in entries.iter().zip(&ids) {
            coll.insert_doc(id, entry.payload.clone());
        }
        drop(state);

        self.report_multikey(ns, multikey);
        Ok(())
    }

    fn apply_command(
        &self,
        _session: &ApplySession,
        entry: &OplogEntry,
        _mode: ApplyMode,
    ) -> Result<(), ApplyError> {
        let kind = entry.command_kind.ok_or_else(|| {
            ApplyError::InvalidEntry(format!("command entry missing command kind: {}", entry.redacted()))
        })?;
        match kind {
            CommandKind::CreateCollection => {
                let name = entry
                    .payload
                    .get("create")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ApplyError::InvalidEntry("create command missing collection name".into())
                    })?;
                let props = CollectionProps {
                    is_capped: entry
                        .payload
                        .get("capped")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                    collation: match entry.payload.get("collation").and_then(Value::as_str) {
                        Some("nocase") => Collation::CaseInsensitiveAscii,
                        _ => Collation::Binary,
                    },
                };
                let mut state = self.inner.write();
                let db = state
                    .databases
                    .get_mut(&entry.ns.db)
                    .ok_or_else(|| ApplyError::NamespaceNotFound {
                        ns: entry.ns.db.clone(),
                    })?;
                db.collections
                    .entry(name.to_string())
                    .or_insert_with(|| CollectionState::new(props));
                Ok(())
            }
            CommandKind::DropCollection => {
                let name = entry
                    .payload
                    .get("drop")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ApplyError::InvalidEntry("drop command missing collection name".into())
                    })?;
                let mut state = self.inner.write();
                if let Some(db) = state.databases.get_mut(&entry.ns.db)
                    && db.collections.remove(name).is_none()
                {
                    tracing::debug!(ns = %entry.ns.db, collection = name, "drop of missing collection ignored");
                }
                Ok(())
            }
            // Transaction prepares and terminators belong to the transaction
            // participant; this store has nothing left to do once component
            // operations are applied.
            CommandKind::AbortTransaction | CommandKind::CommitTransaction => Ok(()),
            CommandKind::ApplyOps if entry.prepare => Ok(()),
            CommandKind::ApplyOps => Err(ApplyError::PreconditionFailed(
                "composite applyOps entries are decomposed before apply".into(),
            )),
        }
    }

    fn read_txn_operations_from_oplog_chain(
        &self,
        terminal: &OplogEntry,
        buffered: &[&OplogEntry],
    ) -> Result<Vec<OplogEntry>, ApplyError> {
        let mut fragments: BTreeMap<OpTime, OplogEntry> = buffered
            .iter()
            .map(|entry| (entry.op_time, (*entry).clone()))
            .collect();

        // Complete the back-pointer chain from the log for fragments the
        // partitioner never saw (typical during initial sync).
        let log = self.oplog.lock();
        let mut cursor = terminal.prev_op_time_in_txn;
        while let Some(t) = cursor {
            if let Some(known) = fragments.get(&t) {
                cursor = known.prev_op_time_in_txn;
                continue;
            }
            let Some(fragment) = log.get(&t) else {
                return Err(ApplyError::Storage(format!(
                    "transaction chain broken at optime {t}"
                )));
            };
            cursor = fragment.prev_op_time_in_txn;
            fragments.insert(t, fragment.clone());
        }
        drop(log);

        let mut ops: Vec<OplogEntry> = fragments
            .into_values()
            .flat_map(|fragment| fragment.apply_ops_components)
            .collect();
        ops.extend(terminal.apply_ops_components.iter().cloned());
        Ok(ops)
    }
}

impl Catalog for MemoryStorage {
    fn lookup_ns_by_uuid(&self, uuid: &Uuid) -> Option<Namespace> {
        let state = self.inner.read();
        for (db_name, db) in &state.databases {
            for (coll_name, coll) in &db.collections {
                if coll.uuid == *uuid {
                    return Some(Namespace::new(db_name.clone(), coll_name.clone()));
                }
            }
        }
        None
    }

    fn collection_props(&self, ns: &Namespace) -> Option<CollectionProps> {
        let state = self.inner.read();
        state
            .databases
            .get(&ns.db)?
            .collections
            .get(&ns.coll)
            .map(|coll| coll.props)
    }

    fn database_exists(&self, db: &str) -> bool {
        self.inner.read().databases.contains_key(db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session() -> ApplySession {
        ApplySession::for_batch_worker()
    }

    fn tracker() -> MultikeyPathTracker {
        MultikeyPathTracker::new()
    }

    #[test]
    fn insert_creates_the_collection_implicitly() {
        let store = MemoryStorage::new();
        store.create_database("app");
        let ns = Namespace::new("app", "users");
        let entry = OplogEntry::insert(OpTime(1), ns.clone(), json!({"_id": 1, "name": "ada"}));
        store
            .apply_operation(&session(), &ns, &entry, true, ApplyMode::Secondary, &tracker())
            .unwrap();
        assert_eq!(
            store.document(&ns, &json!(1)).unwrap()["name"],
            json!("ada")
        );
    }

    #[test]
    fn strict_update_of_a_missing_document_fails() {
        let store = MemoryStorage::new();
        let ns = Namespace::new("app", "users");
        store.create_collection(&ns, CollectionProps::default());
        let entry = OplogEntry::update(OpTime(2), ns.clone(), json!(5), json!({"name": "bo"}));

        let err = store
            .apply_operation(&session(), &ns, &entry, false, ApplyMode::InitialSync, &tracker())
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ApplyErrorCode::UpdateOperationFailed);

        store
            .apply_operation(&session(), &ns, &entry, true, ApplyMode::Secondary, &tracker())
            .unwrap();
        assert_eq!(store.document(&ns, &json!(5)).unwrap()["name"], json!("bo"));
    }

    #[test]
    fn delete_of_a_missing_document_is_a_noop() {
        let store = MemoryStorage::new();
        let ns = Namespace::new("app", "users");
        store.create_collection(&ns, CollectionProps::default());
        let entry = OplogEntry::delete(OpTime(3), ns.clone(), json!(9));
        store
            .apply_operation(&session(), &ns, &entry, true, ApplyMode::Secondary, &tracker())
            .unwrap();
    }

    #[test]
    fn update_on_a_dropped_collection_reports_namespace_not_found() {
        let store = MemoryStorage::new();
        store.create_database("app");
        let ns = Namespace::new("app", "gone");
        let entry = OplogEntry::update(OpTime(4), ns.clone(), json!(1), json!({"x": 1}));
        let err = store
            .apply_operation(&session(), &ns, &entry, true, ApplyMode::Secondary, &tracker())
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ApplyErrorCode::NamespaceNotFound);
    }

    #[test]
    fn injected_conflicts_fire_once_per_write() {
        let store = MemoryStorage::new();
        store.create_database("app");
        let ns = Namespace::new("app", "users");
        let entry = OplogEntry::insert(OpTime(5), ns.clone(), json!({"_id": 1}));
        store.inject_write_conflicts(&ns, &json!(1), 2);

        for _ in 0..2 {
            let err = store
                .apply_operation(&session(), &ns, &entry, true, ApplyMode::Secondary, &tracker())
                .unwrap_err();
            assert!(err.is_write_conflict());
        }
        store
            .apply_operation(&session(), &ns, &entry, true, ApplyMode::Secondary, &tracker())
            .unwrap();
    }

    #[test]
    fn nocase_collection_stores_equal_identities_once() {
        let store = MemoryStorage::new();
        let ns = Namespace::new("app", "tags");
        store.create_collection(
            &ns,
            CollectionProps {
                is_capped: false,
                collation: Collation::CaseInsensitiveAscii,
            },
        );
        let a = OplogEntry::insert(OpTime(1), ns.clone(), json!({"_id": "Rust"}));
        let b = OplogEntry::insert(OpTime(2), ns.clone(), json!({"_id": "rust", "n": 2}));
        store
            .apply_operation(&session(), &ns, &a, true, ApplyMode::Secondary, &tracker())
            .unwrap();
        store
            .apply_operation(&session(), &ns, &b, true, ApplyMode::Secondary, &tracker())
            .unwrap();
        assert_eq!(store.document_count(&ns), 1);
    }

    #[test]
    fn chain_read_combines_log_and_buffered_fragments() {
        let store = MemoryStorage::new();
        let ns = Namespace::new("app", "users");
        let u1 = OplogEntry::insert(OpTime(0), ns.clone(), json!({"_id": 1}));
        let u2 = OplogEntry::insert(OpTime(0), ns.clone(), json!({"_id": 2}));
        let u3 = OplogEntry::insert(OpTime(0), ns, json!({"_id": 3}));

        // f1 only exists in the log; f2 is still buffered in memory.
        let f1 = OplogEntry::apply_ops(OpTime(10), "app", vec![u1.clone()]).partial();
        store.record_oplog_entry(f1);
        let f2 = OplogEntry::apply_ops(OpTime(11), "app", vec![u2.clone()])
            .partial()
            .with_prev_in_txn(OpTime(10));
        let terminal =
            OplogEntry::apply_ops(OpTime(12), "app", vec![u3.clone()]).with_prev_in_txn(OpTime(11));

        let ops = store
            .read_txn_operations_from_oplog_chain(&terminal, &[&f2])
            .unwrap();
        let ids: Vec<_> = ops.iter().map(|op| op.doc_id.clone().unwrap()).collect();
        assert_eq!(ids, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn broken_chain_is_a_storage_error() {
        let store = MemoryStorage::new();
        let terminal =
            OplogEntry::apply_ops(OpTime(12), "app", vec![]).with_prev_in_txn(OpTime(11));
        let err = store
            .read_txn_operations_from_oplog_chain(&terminal, &[])
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ApplyErrorCode::Storage);
    }

    #[test]
    fn create_command_requires_an_existing_database() {
        let store = MemoryStorage::new();
        let cmd = OplogEntry::command(
            OpTime(1),
            Namespace::new("app", "$cmd"),
            CommandKind::CreateCollection,
            json!({"create": "events", "capped": true}),
        );
        let err = store
            .apply_command(&session(), &cmd, ApplyMode::Secondary)
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ApplyErrorCode::NamespaceNotFound);

        store.create_database("app");
        store
            .apply_command(&session(), &cmd, ApplyMode::Secondary)
            .unwrap();
        let props = store
            .collection_props(&Namespace::new("app", "events"))
            .unwrap();
        assert!(props.is_capped);
    }
}
