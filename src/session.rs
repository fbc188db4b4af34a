//! Session-table bookkeeping derived during partitioning.
//!
//! Retryable writes and transactions carry session metadata; the secondary
//! mirrors the primary's durable session state by synthesizing upserts
//! against the session table while partitioning a batch.

use crate::entry::{Namespace, OpTime, OplogEntry, SessionId};
use serde_json::json;
use std::collections::HashMap;

/// Source of synthetic session-table writes. The partitioner drives it once
/// per batch entry and flushes it at end of batch.
pub trait SessionUpdates {
    /// Synthetic entries this op induces, if any.
    fn update_session(&mut self, entry: &OplogEntry) -> Option<Vec<OplogEntry>>;

    /// Trailing entries at end of batch. The tracker is empty afterwards.
    fn flush_all(&mut self) -> Vec<OplogEntry>;
}

pub fn session_table_ns() -> Namespace {
    Namespace::new("config", "transactions")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SessionRecord {
    txn_number: u64,
    last_op_time: OpTime,
}

/// Default tracker: one pending record per session, newest transaction
/// number and optime win, everything emitted as upserts on
/// `config.transactions` at flush.
#[derive(Default)]
pub struct SessionTableTracker {
    pending: HashMap<SessionId, SessionRecord>,
}

impl SessionTableTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn make_entry(session_id: SessionId, record: SessionRecord) -> OplogEntry {
        OplogEntry::update(
            record.last_op_time,
            session_table_ns(),
            json!({"id": session_id.to_string()}),
            json!({
                "_id": {"id": session_id.to_string()},
                "txnNum": record.txn_number,
                "lastWriteOpTime": record.last_op_time.0,
            }),
        )
    }
}

impl SessionUpdates for SessionTableTracker {
    fn update_session(&mut self, entry: &OplogEntry) -> Option<Vec<OplogEntry>> {
        // A direct write to the session table supersedes derived records;
        // emit what is pending so it applies first.
        if entry.ns == session_table_ns() {
            let flushed = self.flush_all();
            return (!flushed.is_empty()).then_some(flushed);
        }

        let (session_id, txn_number) = match (entry.session_id, entry.txn_number) {
            (Some(s), Some(t)) => (s, t),
            _ => return None,
        };
        // Interior transaction entries update the table when the commit or
        // abort arrives, not per fragment.
        if entry.partial_txn || entry.prepare {
            return None;
        }

        let record = self.pending.entry(session_id).or_insert(SessionRecord {
            txn_number,
            last_op_time: entry.op_time,
        });
        if txn_number > record.txn_number
            || (txn_number == record.txn_number && entry.op_time > record.last_op_time)
        {
            record.txn_number = txn_number;
            record.last_op_time = entry.op_time;
        }
        None
    }

    fn flush_all(&mut self) -> Vec<OplogEntry> {
        let mut entries: Vec<OplogEntry> = self
            .pending
            .drain()
            .map(|(session_id, record)| Self::make_entry(session_id, record))
            .collect();
        entries.sort_by_key(|entry| entry.op_time);
        entries
    }
}
