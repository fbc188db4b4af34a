use crate::entry::OpTime;
use std::time::Duration;

/// Oplog application mode. Governs upsert policy and error tolerance; always
/// threaded through [`ApplierOptions`], never read from a global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    Secondary,
    InitialSync,
    Recovering,
    ApplyOps,
}

impl ApplyMode {
    /// CRUD updates are converted to upserts except during initial sync,
    /// where a missing update target is tolerated instead.
    pub fn should_always_upsert(self) -> bool {
        !matches!(self, ApplyMode::InitialSync)
    }

    /// During recovery, storage may not have checkpointed drops, so a missing
    /// namespace is not an error for any CRUD op.
    pub fn tolerates_ns_not_found_on_crud(self) -> bool {
        matches!(self, ApplyMode::Recovering)
    }

    /// An update whose target document is missing will be reconciled by a
    /// later delete in the source timeline during initial sync.
    pub fn tolerates_update_failure(self) -> bool {
        matches!(self, ApplyMode::InitialSync)
    }

    /// Prepared-transaction commits are flattened at partition time only
    /// during initial sync.
    pub fn flattens_prepared_commit(self) -> bool {
        matches!(self, ApplyMode::InitialSync)
    }

    /// Prepare entries are buffered with the transaction's partial fragments
    /// instead of being applied, only during initial sync.
    pub fn defers_prepares(self) -> bool {
        matches!(self, ApplyMode::InitialSync)
    }
}

/// Runtime options for one applier instance. A batch is always applied under
/// a single, fixed set of options.
#[derive(Debug, Clone)]
pub struct ApplierOptions {
    pub mode: ApplyMode,
    /// Entries at or before this optime are discarded by the partitioner.
    pub begin_applying: OpTime,
    pub writer_count: usize,
    /// Bin-level allowlist: skip CRUD ops whose namespace has already been
    /// dropped (set during initial sync and recovery).
    pub allow_ns_not_found_on_crud: bool,
    pub slow_op_threshold: Duration,
    /// Byte budget for one grouped bulk insert.
    pub group_max_bytes: usize,
    /// Maximum number of entries in one grouped bulk insert.
    pub group_max_ops: usize,
}

impl Default for ApplierOptions {
    fn default() -> Self {
        Self {
            mode: ApplyMode::Secondary,
            begin_applying: OpTime::ZERO,
            writer_count: std::thread::available_parallelism()
                .map(|n| n.get().max(2))
                .unwrap_or(4),
            allow_ns_not_found_on_crud: false,
            slow_op_threshold: Duration::from_millis(100),
            group_max_bytes: 64 * 1024,
            group_max_ops: 64,
        }
    }
}

impl ApplierOptions {
    pub fn for_initial_sync(begin_applying: OpTime) -> Self {
        Self {
            mode: ApplyMode::InitialSync,
            begin_applying,
            allow_ns_not_found_on_crud: true,
            ..Self::default()
        }
    }

    pub fn for_recovery() -> Self {
        Self {
            mode: ApplyMode::Recovering,
            allow_ns_not_found_on_crud: true,
            ..Self::default()
        }
    }
}
