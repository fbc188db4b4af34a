//! Partial-transaction assembly.
//!
//! Multi-entry transactions arrive as partial applyOps fragments followed by
//! a terminal entry. Fragments are buffered per session during partitioning;
//! the terminal entry flattens the whole transaction into a linear operation
//! list, completing the chain from the on-disk log when fragments are not in
//! memory.

use crate::entry::{OplogEntry, SessionId};
use crate::error::ApplyError;
use crate::storage::StorageEngine;
use std::collections::HashMap;

/// Per-session fragment buffers, holding indices into the batch. A buffer
/// never mixes transactions: a fragment with a different `txn_number` than
/// the buffered ones is a precondition failure.
#[derive(Default)]
pub struct PartialTxnBuffers {
    buffers: HashMap<SessionId, Vec<usize>>,
}

impl PartialTxnBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, batch: &[OplogEntry], index: usize) -> Result<(), ApplyError> {
        let entry = &batch[index];
        let session_id = entry.session_id.ok_or_else(|| {
            ApplyError::InvalidEntry(format!(
                "transaction fragment missing session id: {}",
                entry.redacted()
            ))
        })?;
        let buffer = self.buffers.entry(session_id).or_default();
        if let Some(&first) = buffer.first()
            && batch[first].txn_number != entry.txn_number
        {
            return Err(ApplyError::PreconditionFailed(format!(
                "transaction fragment {} does not match buffered transaction {:?}",
                entry.redacted(),
                batch[first].txn_number,
            )));
        }
        buffer.push(index);
        Ok(())
    }

    /// Clears the session's buffer (transaction aborted).
    pub fn clear(&mut self, session_id: &SessionId) {
        self.buffers.remove(session_id);
    }

    /// Removes and returns the session's buffered fragment indices.
    pub fn take(&mut self, session_id: &SessionId) -> Vec<usize> {
        self.buffers.remove(session_id).unwrap_or_default()
    }

    /// Fragments still buffered, across all sessions.
    pub fn buffered_len(&self) -> usize {
        self.buffers.values().map(Vec::len).sum()
    }
}

/// Flattens a committing transaction: the buffered fragments' operations
/// (chain-completed from the log) followed by the terminal entry's own
/// components.
pub fn flatten_for_commit(
    storage: &dyn StorageEngine,
    batch: &[OplogEntry],
    terminal: &OplogEntry,
    fragment_indices: &[usize],
) -> Result<Vec<OplogEntry>, ApplyError> {
    let buffered: Vec<&OplogEntry> = fragment_indices.iter().map(|&i| &batch[i]).collect();
    storage.read_txn_operations_from_oplog_chain(terminal, &buffered)
}

/// Component operations of a standalone (non-transactional) applyOps entry.
pub fn extract_operations(terminal: &OplogEntry) -> Result<Vec<OplogEntry>, ApplyError> {
    if terminal.prev_op_time_in_txn.is_some() {
        return Err(ApplyError::PreconditionFailed(format!(
            "standalone applyOps must not carry a transaction back-pointer: {}",
            terminal.redacted()
        )));
    }
    Ok(terminal.apply_ops_components.clone())
}
