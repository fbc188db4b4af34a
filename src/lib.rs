//! Parallel oplog application for a replicated document store secondary.
//!
//! A batch of replication log entries is partitioned single-threaded into
//! per-worker bins (all writes to one logical document land in one bin),
//! then applied by parallel workers that bulk-group inserts and tolerate the
//! errors idempotent re-application produces. Composite transaction entries
//! are flattened into derived operation groups before placement.
//!
//! The three core surfaces mirror the phases:
//! [`fill_writer_vectors`] partitions, [`multi_sync_apply`] drains one bin,
//! [`sync_apply`] applies one entry. [`apply_oplog_batch`] chains them with
//! one scoped thread per non-empty bin.

pub mod apply;
pub mod collation;
pub mod config;
pub mod context;
pub mod counters;
pub mod entry;
pub mod error;
pub mod fingerprint;
pub mod grouper;
pub mod locks;
pub mod multikey;
pub mod partition;
pub mod props;
pub mod session;
pub mod storage;
pub mod txn;
pub mod worker;

pub use apply::{sync_apply, write_conflict_retry};
pub use collation::Collation;
pub use config::{ApplierOptions, ApplyMode};
pub use context::{ApplierEnv, ApplyContext, Clock, SystemClock};
pub use counters::ApplyCounters;
pub use entry::{CommandKind, Namespace, OpKind, OpTime, OplogEntry, SessionId};
pub use error::{ApplyError, ApplyErrorCode};
pub use locks::{LockMode, LockRegistry};
pub use multikey::{MultikeyPathInfo, MultikeyPathTracker};
pub use partition::{OpRef, OpStore, PartitionedBatch, fill_writer_vectors};
pub use props::CollectionPropsCache;
pub use session::{SessionTableTracker, SessionUpdates};
pub use storage::{ApplySession, Catalog, CollectionProps, StorageEngine};
pub use worker::multi_sync_apply;

use std::panic::AssertUnwindSafe;

/// What one batch left behind for the scheduler.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Multikey path info collected across all workers.
    pub multikey_paths: Vec<MultikeyPathInfo>,
}

/// Partitions and applies one batch: a single-threaded partition pass, then
/// one scoped worker thread per non-empty bin. Returns the first worker
/// failure; in-flight workers run to completion either way. Cross-batch
/// ordering is the caller's: do not start the next batch until this returns
/// success.
pub fn apply_oplog_batch(
    env: &ApplierEnv<'_>,
    batch: &mut [OplogEntry],
) -> Result<BatchOutcome, ApplyError> {
    let writer_count = env.options.writer_count.max(1);
    let PartitionedBatch {
        mut bins, derived, ..
    } = fill_writer_vectors(env, batch, writer_count)?;

    let store = OpStore {
        batch: &*batch,
        derived: &derived,
    };

    let mut worker_outputs: Vec<Vec<MultikeyPathInfo>> = Vec::new();
    worker_outputs.resize_with(bins.len(), Vec::new);

    let mut first_error: Option<ApplyError> = None;
    std::thread::scope(|scope| {
        let handles: Vec<_> = bins
            .iter_mut()
            .zip(worker_outputs.iter_mut())
            .filter(|(bin, _)| !bin.is_empty())
            .map(|(bin, out)| {
                scope.spawn(move || {
                    let ctx = env.worker_context();
                    std::panic::catch_unwind(AssertUnwindSafe(|| {
                        multi_sync_apply(&ctx, store, bin, out)
                    }))
                    .unwrap_or(Err(ApplyError::WorkerPanicked))
                })
            })
            .collect();

        for handle in handles {
            let result = handle.join().unwrap_or(Err(ApplyError::WorkerPanicked));
            if let Err(error) = result
                && first_error.is_none()
            {
                first_error = Some(error);
            }
        }
    });

    if let Some(error) = first_error {
        return Err(error);
    }
    Ok(BatchOutcome {
        multikey_paths: worker_outputs.into_iter().flatten().collect(),
    })
}
