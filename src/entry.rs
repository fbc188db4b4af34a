//! Oplog entry data model.
//!
//! An entry is an immutable record of one logical mutation from the primary's
//! replication log. The only field the applier ever mutates is
//! `for_capped_collection`, an annotation the partitioner sets before the
//! parallel apply phase starts.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Logical timestamp assigned by the primary. Totally ordered within one
/// primary's log.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OpTime(pub u64);

impl OpTime {
    pub const ZERO: OpTime = OpTime(0);

    pub fn new(t: u64) -> Self {
        OpTime(t)
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpKind {
    Noop,
    Insert,
    Update,
    Delete,
    Command,
}

impl OpKind {
    pub fn is_crud(self) -> bool {
        matches!(self, OpKind::Insert | OpKind::Update | OpKind::Delete)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    CreateCollection,
    DropCollection,
    AbortTransaction,
    CommitTransaction,
    ApplyOps,
}

/// Target namespace as a (database, collection) pair. Ordered so worker bins
/// can be stably sorted by namespace.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Namespace {
            db: db.into(),
            coll: coll.into(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}.{}", self.db, self.coll)
    }

    /// Writes to the views catalog require an exclusive lock instead of the
    /// usual intent lock.
    pub fn is_system_views(&self) -> bool {
        self.coll == "system.views"
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

pub type SessionId = Uuid;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    pub op_time: OpTime,
    pub kind: OpKind,
    pub ns: Namespace,
    /// When set, the target collection is addressed by UUID and must be
    /// resolved through the catalog at apply time.
    pub collection_uuid: Option<Uuid>,
    /// Identity of the affected document, for CRUD kinds.
    pub doc_id: Option<Value>,
    /// Opaque body handed verbatim to the storage engine.
    pub payload: Value,
    pub session_id: Option<SessionId>,
    pub txn_number: Option<u64>,
    pub prev_op_time_in_txn: Option<OpTime>,
    pub partial_txn: bool,
    pub prepare: bool,
    pub prepared_commit: bool,
    pub terminal_apply_ops: bool,
    pub command_kind: Option<CommandKind>,
    /// Component operations carried by an applyOps-style composite entry.
    pub apply_ops_components: Vec<OplogEntry>,
    /// Set by the partitioner when the target collection is capped and the
    /// op is an insert. Blocks bulk grouping.
    pub for_capped_collection: bool,
}

impl OplogEntry {
    fn base(op_time: OpTime, kind: OpKind, ns: Namespace) -> Self {
        OplogEntry {
            op_time,
            kind,
            ns,
            collection_uuid: None,
            doc_id: None,
            payload: Value::Null,
            session_id: None,
            txn_number: None,
            prev_op_time_in_txn: None,
            partial_txn: false,
            prepare: false,
            prepared_commit: false,
            terminal_apply_ops: false,
            command_kind: None,
            apply_ops_components: Vec::new(),
            for_capped_collection: false,
        }
    }

    pub fn noop(op_time: OpTime, ns: Namespace) -> Self {
        Self::base(op_time, OpKind::Noop, ns)
    }

    /// Insert of a full document. The identity is taken from the document's
    /// `_id` field when present.
    pub fn insert(op_time: OpTime, ns: Namespace, doc: Value) -> Self {
        let doc_id = doc.get("_id").cloned();
        let mut entry = Self::base(op_time, OpKind::Insert, ns);
        entry.doc_id = doc_id;
        entry.payload = doc;
        entry
    }

    pub fn update(op_time: OpTime, ns: Namespace, doc_id: Value, payload: Value) -> Self {
        let mut entry = Self::base(op_time, OpKind::Update, ns);
        entry.doc_id = Some(doc_id);
        entry.payload = payload;
        entry
    }

    pub fn delete(op_time: OpTime, ns: Namespace, doc_id: Value) -> Self {
        let mut entry = Self::base(op_time, OpKind::Delete, ns);
        entry.doc_id = Some(doc_id);
        entry
    }

    pub fn command(op_time: OpTime, ns: Namespace, kind: CommandKind, payload: Value) -> Self {
        let mut entry = Self::base(op_time, OpKind::Command, ns);
        entry.command_kind = Some(kind);
        entry.payload = payload;
        entry
    }

    /// Terminal applyOps composite carrying its component operations.
    pub fn apply_ops(op_time: OpTime, db: impl Into<String>, components: Vec<OplogEntry>) -> Self {
        let mut entry = Self::base(op_time, OpKind::Command, Namespace::new(db, "$cmd"));
        entry.command_kind = Some(CommandKind::ApplyOps);
        entry.terminal_apply_ops = true;
        entry.apply_ops_components = components;
        entry
    }

    pub fn with_session(mut self, session_id: SessionId, txn_number: u64) -> Self {
        self.session_id = Some(session_id);
        self.txn_number = Some(txn_number);
        self
    }

    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.collection_uuid = Some(uuid);
        self
    }

    pub fn with_prev_in_txn(mut self, prev: OpTime) -> Self {
        self.prev_op_time_in_txn = Some(prev);
        self
    }

    /// Marks the entry as a partial-transaction fragment (non-terminal
    /// applyOps inside a multi-entry transaction).
    pub fn partial(mut self) -> Self {
        self.partial_txn = true;
        self.terminal_apply_ops = false;
        self
    }

    pub fn prepared(mut self) -> Self {
        self.prepare = true;
        self.terminal_apply_ops = false;
        self
    }

    pub fn is_crud(&self) -> bool {
        self.kind.is_crud()
    }

    /// Loggable one-line summary. Never includes the payload or the document
    /// identity.
    pub fn redacted(&self) -> String {
        match self.kind {
            OpKind::Command => format!(
                "command {:?} on {} t={}",
                self.command_kind, self.ns, self.op_time
            ),
            kind => format!("{:?} on {} t={}", kind, self.ns, self.op_time),
        }
    }

    /// Cheap structural estimate of the payload size, used by the insert
    /// grouper's byte budget. Not an exact wire size.
    pub fn approx_payload_bytes(&self) -> usize {
        value_size(&self.payload)
    }
}

fn value_size(v: &Value) -> usize {
    match v {
        Value::Null => 4,
        Value::Bool(_) => 5,
        Value::Number(_) => 8,
        Value::String(s) => s.len() + 2,
        Value::Array(items) => 2 + items.iter().map(value_size).sum::<usize>(),
        Value::Object(map) => {
            2 + map
                .iter()
                .map(|(k, v)| k.len() + 3 + value_size(v))
                .sum::<usize>()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn insert_takes_identity_from_the_document() {
        let entry = OplogEntry::insert(
            OpTime(4),
            Namespace::new("app", "users"),
            json!({"_id": 7, "name": "ada"}),
        );
        assert_eq!(entry.doc_id, Some(json!(7)));
        assert_eq!(entry.kind, OpKind::Insert);
        assert!(entry.is_crud());
    }

    #[test]
    fn redacted_summary_never_contains_the_payload() {
        let entry = OplogEntry::insert(
            OpTime(9),
            Namespace::new("app", "users"),
            json!({"_id": 1, "secret": "hunter2"}),
        );
        let summary = entry.redacted();
        assert!(summary.contains("app.users"));
        assert!(summary.contains("t=9"));
        assert!(!summary.contains("hunter2"));
    }

    #[test]
    fn payload_estimate_grows_with_document_size() {
        let small = OplogEntry::insert(
            OpTime(1),
            Namespace::new("a", "b"),
            json!({"_id": 1}),
        );
        let large = OplogEntry::insert(
            OpTime(2),
            Namespace::new("a", "b"),
            json!({"_id": 2, "blob": "x".repeat(1024)}),
        );
        assert!(large.approx_payload_bytes() > small.approx_payload_bytes() + 1000);
    }

    #[test]
    fn namespace_ordering_sorts_by_db_then_collection() {
        let mut namespaces = vec![
            Namespace::new("b", "a"),
            Namespace::new("a", "z"),
            Namespace::new("a", "a"),
        ];
        namespaces.sort();
        assert_eq!(namespaces[0], Namespace::new("a", "a"));
        assert_eq!(namespaces[2], Namespace::new("b", "a"));
    }
}
