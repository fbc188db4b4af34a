//! Opportunistic bulk grouping of contiguous inserts.
//!
//! Within a namespace-sorted bin, a run of inserts into one collection can
//! go to the storage engine as a single bulk call. Grouping is observable
//! only as performance: any failure falls back to applying the entries
//! individually, where the usual retry and tolerance rules apply.

use crate::context::ApplyContext;
use crate::entry::OpKind;
use crate::partition::{OpRef, OpStore};

pub struct InsertGroup<'a> {
    store: OpStore<'a>,
    max_bytes: usize,
    max_ops: usize,
}

impl<'a> InsertGroup<'a> {
    pub fn new(store: OpStore<'a>, ctx: &ApplyContext<'_>) -> Self {
        Self {
            store,
            max_bytes: ctx.options.group_max_bytes,
            max_ops: ctx.options.group_max_ops,
        }
    }

    /// Tries to consume a maximal groupable run starting at `pos` and apply
    /// it as one bulk insert. Returns the index of the last consumed entry,
    /// or `None` when no group formed or the bulk call failed; the caller
    /// then applies entries one at a time.
    pub fn group_and_apply(&self, ctx: &ApplyContext<'_>, bin: &[OpRef], pos: usize) -> Option<usize> {
        let first = self.store.get(bin[pos]);
        if first.kind != OpKind::Insert || first.for_capped_collection {
            return None;
        }

        let mut total_bytes = first.approx_payload_bytes();
        let mut end = pos;
        while end + 1 < bin.len() {
            let next = self.store.get(bin[end + 1]);
            if next.kind != OpKind::Insert
                || next.for_capped_collection
                || next.ns != first.ns
            {
                break;
            }
            let next_bytes = next.approx_payload_bytes();
            if end + 2 - pos > self.max_ops || total_bytes + next_bytes > self.max_bytes {
                break;
            }
            total_bytes += next_bytes;
            end += 1;
        }
        if end == pos {
            return None;
        }

        let entries: Vec<_> = bin[pos..=end].iter().map(|&r| self.store.get(r)).collect();
        match ctx.storage.apply_inserts(
            &ctx.session,
            &first.ns,
            &entries,
            ctx.options.mode,
            &ctx.multikey,
        ) {
            Ok(()) => {
                let count = entries.len() as u64;
                ctx.counters.record_applied(count);
                ctx.counters.record_grouped(count);
                Some(end)
            }
            Err(error) => {
                // Includes write conflicts: the individual fallback retries
                // each entry under its own conflict loop.
                tracing::debug!(
                    ns = %first.ns,
                    ops = entries.len(),
                    %error,
                    "grouped insert failed, falling back to individual apply"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::InsertGroup;
    use crate::config::ApplierOptions;
    use crate::context::{ApplierEnv, SystemClock};
    use crate::counters::ApplyCounters;
    use crate::entry::{Namespace, OpTime, OplogEntry};
    use crate::locks::LockRegistry;
    use crate::partition::{OpRef, OpStore};
    use crate::storage::memory::MemoryStorage;
    use crate::storage::CollectionProps;
    use serde_json::json;

    struct Fixture {
        storage: MemoryStorage,
        locks: LockRegistry,
        clock: SystemClock,
        counters: ApplyCounters,
        options: ApplierOptions,
    }

    impl Fixture {
        fn new(options: ApplierOptions) -> Self {
            let storage = MemoryStorage::new();
            storage.create_database("app");
            storage.create_collection(&Namespace::new("app", "users"), CollectionProps::default());
            Self {
                storage,
                locks: LockRegistry::new(),
                clock: SystemClock,
                counters: ApplyCounters::new(),
                options,
            }
        }

        fn env(&self) -> ApplierEnv<'_> {
            ApplierEnv {
                storage: &self.storage,
                catalog: &self.storage,
                locks: &self.locks,
                clock: &self.clock,
                counters: &self.counters,
                options: &self.options,
            }
        }
    }

    fn inserts(ns: &Namespace, n: u64) -> Vec<OplogEntry> {
        (0..n)
            .map(|i| OplogEntry::insert(OpTime(i + 1), ns.clone(), json!({"_id": i})))
            .collect()
    }

    #[test]
    fn consumes_a_contiguous_run_and_applies_it_once() {
        let fixture = Fixture::new(ApplierOptions::default());
        let ns = Namespace::new("app", "users");
        let batch = inserts(&ns, 5);
        let bin: Vec<OpRef> = (0..5).map(OpRef::Batch).collect();
        let store = OpStore {
            batch: &batch,
            derived: &[],
        };

        let env = fixture.env();
        let ctx = env.worker_context();
        let grouper = InsertGroup::new(store, &ctx);
        let consumed = grouper.group_and_apply(&ctx, &bin, 0);
        assert_eq!(consumed, Some(4));
        assert_eq!(fixture.storage.document_count(&ns), 5);
        assert_eq!(fixture.counters.grouped_inserts(), 5);
    }

    #[test]
    fn a_namespace_change_ends_the_run() {
        let fixture = Fixture::new(ApplierOptions::default());
        let ns = Namespace::new("app", "users");
        let other = Namespace::new("app", "zz");
        fixture
            .storage
            .create_collection(&other, CollectionProps::default());

        let mut batch = inserts(&ns, 2);
        batch.push(OplogEntry::insert(OpTime(3), other, json!({"_id": 9})));
        let bin: Vec<OpRef> = (0..3).map(OpRef::Batch).collect();
        let store = OpStore {
            batch: &batch,
            derived: &[],
        };

        let env = fixture.env();
        let ctx = env.worker_context();
        let grouper = InsertGroup::new(store, &ctx);
        assert_eq!(grouper.group_and_apply(&ctx, &bin, 0), Some(1));
    }

    #[test]
    fn singleton_runs_are_not_grouped() {
        let fixture = Fixture::new(ApplierOptions::default());
        let ns = Namespace::new("app", "users");
        let batch = inserts(&ns, 1);
        let bin = vec![OpRef::Batch(0)];
        let store = OpStore {
            batch: &batch,
            derived: &[],
        };

        let env = fixture.env();
        let ctx = env.worker_context();
        let grouper = InsertGroup::new(store, &ctx);
        assert_eq!(grouper.group_and_apply(&ctx, &bin, 0), None);
        assert_eq!(fixture.storage.document_count(&ns), 0, "nothing applied");
    }

    #[test]
    fn the_op_count_cap_bounds_a_run() {
        let fixture = Fixture::new(ApplierOptions {
            group_max_ops: 3,
            ..ApplierOptions::default()
        });
        let ns = Namespace::new("app", "users");
        let batch = inserts(&ns, 10);
        let bin: Vec<OpRef> = (0..10).map(OpRef::Batch).collect();
        let store = OpStore {
            batch: &batch,
            derived: &[],
        };

        let env = fixture.env();
        let ctx = env.worker_context();
        let grouper = InsertGroup::new(store, &ctx);
        assert_eq!(grouper.group_and_apply(&ctx, &bin, 0), Some(2));
    }

    #[test]
    fn the_byte_budget_bounds_a_run() {
        let fixture = Fixture::new(ApplierOptions {
            group_max_bytes: 600,
            ..ApplierOptions::default()
        });
        let ns = Namespace::new("app", "users");
        let batch: Vec<OplogEntry> = (0..5)
            .map(|i| {
                OplogEntry::insert(
                    OpTime(i + 1),
                    ns.clone(),
                    json!({"_id": i, "blob": "x".repeat(256)}),
                )
            })
            .collect();
        let bin: Vec<OpRef> = (0..5).map(OpRef::Batch).collect();
        let store = OpStore {
            batch: &batch,
            derived: &[],
        };

        let env = fixture.env();
        let ctx = env.worker_context();
        let grouper = InsertGroup::new(store, &ctx);
        let consumed = grouper.group_and_apply(&ctx, &bin, 0).unwrap();
        assert!(consumed >= 1 && consumed < 4, "byte budget cut the run, got {consumed}");
    }

    #[test]
    fn a_write_conflict_aborts_the_group_without_side_effects() {
        let fixture = Fixture::new(ApplierOptions::default());
        let ns = Namespace::new("app", "users");
        let batch = inserts(&ns, 3);
        fixture.storage.inject_write_conflicts(&ns, &json!(2), 1);
        let bin: Vec<OpRef> = (0..3).map(OpRef::Batch).collect();
        let store = OpStore {
            batch: &batch,
            derived: &[],
        };

        let env = fixture.env();
        let ctx = env.worker_context();
        let grouper = InsertGroup::new(store, &ctx);
        assert_eq!(grouper.group_and_apply(&ctx, &bin, 0), None);
        assert_eq!(fixture.storage.document_count(&ns), 0);
    }
}
