//! Contracts the applier requires from the storage engine and catalog, plus
//! the per-worker apply session. The in-memory implementation lives in
//! [`memory`].

pub mod memory;

use crate::collation::Collation;
use crate::config::ApplyMode;
use crate::entry::{Namespace, OplogEntry};
use crate::error::ApplyError;
use crate::multikey::MultikeyPathTracker;
use uuid::Uuid;

/// Per-namespace properties the applier needs for every CRUD entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CollectionProps {
    pub is_capped: bool,
    pub collation: Collation,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadSource {
    /// Read transactions start without a timestamp.
    NoTimestamp,
    LastApplied,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrepareConflictBehavior {
    Enforce,
    /// Prepared transactions that did not exist on the primary at the time
    /// of the source batch must not stall secondary apply.
    IgnoreConflictsAllowWrites,
}

/// Write behavior installed for the duration of one worker's bin. Replaces
/// the source system's per-thread operation state with an explicit value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApplySession {
    /// Secondary apply never writes its own oplog.
    pub record_replicated_writes: bool,
    /// Documents that failed validation on the primary must still apply.
    pub validate_documents: bool,
    pub conflict_with_batch_application: bool,
    pub read_source: ReadSource,
    pub prepare_conflicts: PrepareConflictBehavior,
}

impl Default for ApplySession {
    fn default() -> Self {
        Self {
            record_replicated_writes: true,
            validate_documents: true,
            conflict_with_batch_application: true,
            read_source: ReadSource::LastApplied,
            prepare_conflicts: PrepareConflictBehavior::Enforce,
        }
    }
}

impl ApplySession {
    pub fn for_batch_worker() -> Self {
        Self {
            record_replicated_writes: false,
            validate_documents: false,
            conflict_with_batch_application: false,
            read_source: ReadSource::NoTimestamp,
            prepare_conflicts: PrepareConflictBehavior::IgnoreConflictsAllowWrites,
        }
    }

    pub fn is_batch_worker(&self) -> bool {
        !self.record_replicated_writes
            && !self.validate_documents
            && !self.conflict_with_batch_application
    }
}

/// Storage engine seam. Thread-safe; the applier holds it for the lifetime
/// of a batch and calls it from every worker.
pub trait StorageEngine: Send + Sync {
    fn supports_doc_locking(&self) -> bool;

    /// Applies one CRUD entry to `ns`. May fail with `WriteConflict` (the
    /// caller retries), `NamespaceNotFound`, `UpdateOperationFailed`, or a
    /// generic storage error.
    fn apply_operation(
        &self,
        session: &ApplySession,
        ns: &Namespace,
        entry: &OplogEntry,
        always_upsert: bool,
        mode: ApplyMode,
        multikey: &MultikeyPathTracker,
    ) -> Result<(), ApplyError>;

    /// Bulk path for a grouped run of inserts into one namespace.
    /// Semantically identical to applying the entries individually in order.
    fn apply_inserts(
        &self,
        session: &ApplySession,
        ns: &Namespace,
        entries: &[&OplogEntry],
        mode: ApplyMode,
        multikey: &MultikeyPathTracker,
    ) -> Result<(), ApplyError>;

    /// Applies a command entry. Commands never create databases implicitly.
    fn apply_command(
        &self,
        session: &ApplySession,
        entry: &OplogEntry,
        mode: ApplyMode,
    ) -> Result<(), ApplyError>;

    /// Reconstructs a transaction's full operation list from a terminal
    /// entry, completing the `prev_op_time_in_txn` chain from the on-disk log
    /// where the in-memory fragments don't cover it. Buffered fragments'
    /// operations precede the terminal entry's own components.
    fn read_txn_operations_from_oplog_chain(
        &self,
        terminal: &OplogEntry,
        buffered: &[&OplogEntry],
    ) -> Result<Vec<OplogEntry>, ApplyError>;
}

/// Catalog seam: namespace resolution and collection metadata.
pub trait Catalog: Send + Sync {
    fn lookup_ns_by_uuid(&self, uuid: &Uuid) -> Option<Namespace>;

    /// Capped flag and default collation for a collection, or `None` when no
    /// backing collection exists.
    fn collection_props(&self, ns: &Namespace) -> Option<CollectionProps>;

    fn database_exists(&self, db: &str) -> bool;
}
