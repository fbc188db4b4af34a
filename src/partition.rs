//! Batch decomposition and worker-bin assignment.
//!
//! Runs single-threaded before any worker starts. Every batch entry is
//! filtered, session-tracked, transaction-assembled, fingerprinted, and
//! placed so that all entries touching the same logical document land in the
//! same bin. Composite applyOps entries are decomposed into derived operation
//! groups; bins reference both the batch and those groups by index, and the
//! driver keeps both alive for the whole parallel apply.

use crate::context::ApplierEnv;
use crate::entry::{CommandKind, OpKind, OplogEntry};
use crate::error::ApplyError;
use crate::fingerprint::{bin_index, fold_identity, namespace_hash};
use crate::locks::LockRegistry;
use crate::props::CollectionPropsCache;
use crate::session::{SessionTableTracker, SessionUpdates};
use crate::storage::Catalog;
use crate::txn::{PartialTxnBuffers, extract_operations, flatten_for_commit};
use serde_json::Value;

/// Non-owning reference to an entry: either in the batch or in a derived
/// group. Valid exactly as long as the batch and the partition output live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpRef {
    Batch(usize),
    Derived { group: usize, index: usize },
}

/// Read-only view resolving [`OpRef`]s during the apply phase.
#[derive(Clone, Copy)]
pub struct OpStore<'a> {
    pub batch: &'a [OplogEntry],
    pub derived: &'a [Vec<OplogEntry>],
}

impl<'a> OpStore<'a> {
    pub fn get(&self, op_ref: OpRef) -> &'a OplogEntry {
        match op_ref {
            OpRef::Batch(i) => &self.batch[i],
            OpRef::Derived { group, index } => &self.derived[group][index],
        }
    }
}

#[derive(Debug, Default)]
pub struct PartitionedBatch {
    /// One bin per writer, in batch order (modulo later per-worker sorting).
    pub bins: Vec<Vec<OpRef>>,
    /// Derived operation groups; bins point into these. Stable for the
    /// lifetime of the apply phase.
    pub derived: Vec<Vec<OplogEntry>>,
    /// Entries dropped by the begin-applying filter.
    pub discarded: usize,
    /// Composite entries replaced by their derived operations.
    pub absorbed: usize,
    /// Transaction fragments still buffered when the batch ended.
    pub buffered_remaining: usize,
}

impl PartitionedBatch {
    pub fn placed(&self) -> usize {
        self.bins.iter().map(Vec::len).sum()
    }

    pub fn derived_total(&self) -> usize {
        self.derived.iter().map(Vec::len).sum()
    }
}

/// Partitions a batch into per-writer bins plus derived operation groups,
/// deriving session-table bookkeeping with the default tracker.
pub fn fill_writer_vectors(
    env: &ApplierEnv<'_>,
    batch: &mut [OplogEntry],
    writer_count: usize,
) -> Result<PartitionedBatch, ApplyError> {
    let mut tracker = SessionTableTracker::new();
    fill_writer_vectors_with(env, batch, writer_count, &mut tracker)
}

pub fn fill_writer_vectors_with(
    env: &ApplierEnv<'_>,
    batch: &mut [OplogEntry],
    writer_count: usize,
    tracker: &mut dyn SessionUpdates,
) -> Result<PartitionedBatch, ApplyError> {
    let mut partitioner = Partitioner::new(*env, writer_count);
    partitioner.run(batch, tracker)?;

    // Trailing session-table writes become one final derived group, fanned
    // out under the filter but never re-tracked.
    let trailing = tracker.flush_all();
    if !trailing.is_empty() {
        let group = partitioner.push_derived(trailing);
        partitioner.fan_out_group(group, true);
    }

    Ok(partitioner.finish())
}

struct Partitioner<'a> {
    env: ApplierEnv<'a>,
    bins: Vec<Vec<OpRef>>,
    derived: Vec<Vec<OplogEntry>>,
    props: CollectionPropsCache,
    txn_buffers: PartialTxnBuffers,
    doc_locking: bool,
    discarded: usize,
    absorbed: usize,
}

impl<'a> Partitioner<'a> {
    fn new(env: ApplierEnv<'a>, writer_count: usize) -> Self {
        Self {
            env,
            bins: vec![Vec::new(); writer_count.max(1)],
            derived: Vec::new(),
            props: CollectionPropsCache::new(),
            txn_buffers: PartialTxnBuffers::new(),
            doc_locking: env.storage.supports_doc_locking(),
            discarded: 0,
            absorbed: 0,
        }
    }

    fn run(
        &mut self,
        batch: &mut [OplogEntry],
        tracker: &mut dyn SessionUpdates,
    ) -> Result<(), ApplyError> {
        for i in 0..batch.len() {
            if batch[i].op_time <= self.env.options.begin_applying {
                self.discarded += 1;
                continue;
            }

            if let Some(new_ops) = tracker.update_session(&batch[i]) {
                let group = self.push_derived(new_ops);
                self.fan_out_group(group, false);
            }

            // Fragments of a multi-entry transaction wait for the commit.
            // Prepares wait too during initial sync.
            if batch[i].partial_txn
                || (batch[i].prepare && self.env.options.mode.defers_prepares())
            {
                self.txn_buffers.push(batch, i)?;
                continue;
            }

            if batch[i].command_kind == Some(CommandKind::AbortTransaction) {
                let session_id = batch[i].session_id.ok_or_else(|| {
                    ApplyError::InvalidEntry(format!(
                        "abortTransaction missing session id: {}",
                        batch[i].redacted()
                    ))
                })?;
                self.txn_buffers.clear(&session_id);
                // The abort itself still applies; it places normally below.
            }

            let mut hash = namespace_hash(&batch[i].ns);
            if batch[i].kind.is_crud() {
                hash = crud_fingerprint(
                    &mut self.props,
                    self.env.catalog,
                    self.env.locks,
                    self.doc_locking,
                    &mut batch[i],
                );
            }

            if batch[i].terminal_apply_ops {
                if let (Some(session_id), Some(_)) = (batch[i].session_id, batch[i].txn_number) {
                    // Commit of an unprepared transaction: flatten the whole
                    // transaction and fan out its operations instead of the
                    // composite entry.
                    let fragments = self.txn_buffers.take(&session_id);
                    let flattened =
                        flatten_for_commit(self.env.storage, batch, &batch[i], &fragments)?;
                    let group = self.push_derived(flattened);
                    self.fan_out_group(group, false);
                } else {
                    let operations = extract_operations(&batch[i])?;
                    let group = self.push_derived(operations);
                    self.fan_out_group(group, false);
                }
                self.absorbed += 1;
                continue;
            }

            if batch[i].prepared_commit && self.env.options.mode.flattens_prepared_commit() {
                let session_id = batch[i].session_id.ok_or_else(|| {
                    ApplyError::InvalidEntry(format!(
                        "prepared commit missing session id: {}",
                        batch[i].redacted()
                    ))
                })?;
                let fragments = self.txn_buffers.take(&session_id);
                let flattened =
                    flatten_for_commit(self.env.storage, batch, &batch[i], &fragments)?;
                let group = self.push_derived(flattened);
                self.fan_out_group(group, false);
                self.absorbed += 1;
                continue;
            }

            self.place(OpRef::Batch(i), hash);
        }
        Ok(())
    }

    fn push_derived(&mut self, group: Vec<OplogEntry>) -> usize {
        self.derived.push(group);
        self.derived.len() - 1
    }

    /// Places every entry of a derived group. Derived entries never undergo
    /// session tracking or transaction assembly, only the CRUD fingerprint
    /// refresh.
    fn fan_out_group(&mut self, group: usize, filter: bool) {
        for index in 0..self.derived[group].len() {
            if filter && self.derived[group][index].op_time <= self.env.options.begin_applying {
                self.discarded += 1;
                continue;
            }
            let mut hash = namespace_hash(&self.derived[group][index].ns);
            if self.derived[group][index].kind.is_crud() {
                hash = crud_fingerprint(
                    &mut self.props,
                    self.env.catalog,
                    self.env.locks,
                    self.doc_locking,
                    &mut self.derived[group][index],
                );
            }
            self.place(OpRef::Derived { group, index }, hash);
        }
    }

    fn place(&mut self, op_ref: OpRef, hash: u32) {
        let index = bin_index(hash, self.bins.len());
        let bin = &mut self.bins[index];
        if bin.is_empty() {
            bin.reserve(8);
        }
        bin.push(op_ref);
    }

    fn finish(self) -> PartitionedBatch {
        PartitionedBatch {
            bins: self.bins,
            derived: self.derived,
            discarded: self.discarded,
            absorbed: self.absorbed,
            buffered_remaining: self.txn_buffers.buffered_len(),
        }
    }
}

/// Refreshes a CRUD entry's fingerprint and capped annotation. Doc-locking
/// engines fold the document identity in so a hot collection still spreads
/// across workers; capped collections must apply in insertion order, so they
/// keep the bare namespace hash and serialize on one worker.
fn crud_fingerprint(
    props: &mut CollectionPropsCache,
    catalog: &dyn Catalog,
    locks: &LockRegistry,
    doc_locking: bool,
    entry: &mut OplogEntry,
) -> u32 {
    let collection = props.get(catalog, locks, &entry.ns);
    let mut hash = namespace_hash(&entry.ns);
    if doc_locking && !collection.is_capped {
        let id = entry.doc_id.as_ref().unwrap_or(&Value::Null);
        hash = fold_identity(hash, collection.collation.identity_hash(id));
    }
    if entry.kind == OpKind::Insert && collection.is_capped {
        entry.for_capped_collection = true;
    }
    hash
}
