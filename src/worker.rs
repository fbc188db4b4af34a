//! Per-bin apply loop driven by one worker thread.

use crate::apply::sync_apply;
use crate::context::ApplyContext;
use crate::error::{ApplyError, ApplyErrorCode};
use crate::grouper::InsertGroup;
use crate::multikey::MultikeyPathInfo;
use crate::partition::{OpRef, OpStore};

/// Drains one writer bin: stable-sorts by namespace, groups contiguous
/// inserts, applies the rest one at a time, and hands collected multikey
/// path info back through `out_multikey` (which must be empty on entry).
///
/// The context's apply session must be the batch-worker one: no replicated
/// write recording, no document validation, no batch-application conflicts,
/// timestamp-less reads, prepared transactions ignored.
pub fn multi_sync_apply(
    ctx: &ApplyContext<'_>,
    store: OpStore<'_>,
    bin: &mut [OpRef],
    out_multikey: &mut Vec<MultikeyPathInfo>,
) -> Result<(), ApplyError> {
    if !out_multikey.is_empty() {
        return Err(ApplyError::PreconditionFailed(
            "multikey output must be empty before the bin is applied".into(),
        ));
    }
    if !ctx.session.is_batch_worker() {
        return Err(ApplyError::PreconditionFailed(
            "multi_sync_apply requires a batch-worker apply session".into(),
        ));
    }

    // Stable, so the relative order of entries on one namespace survives.
    bin.sort_by(|&a, &b| store.get(a).ns.cmp(&store.get(b).ns));

    ctx.multikey.start_tracking();
    let result = apply_bin(ctx, store, bin);
    ctx.multikey.stop_tracking();

    let paths = ctx.multikey.drain();
    if !paths.is_empty() {
        *out_multikey = paths;
    }
    result
}

fn apply_bin(ctx: &ApplyContext<'_>, store: OpStore<'_>, bin: &[OpRef]) -> Result<(), ApplyError> {
    let grouper = InsertGroup::new(store, ctx);
    let mut pos = 0;
    while pos < bin.len() {
        if let Some(last_consumed) = grouper.group_and_apply(ctx, bin, pos) {
            pos = last_consumed + 1;
            continue;
        }

        let entry = store.get(bin[pos]);
        match sync_apply(ctx, entry) {
            Ok(()) => {}
            Err(error)
                if error.code() == ApplyErrorCode::UpdateOperationFailed
                    && ctx.options.mode.tolerates_update_failure() =>
            {
                // A later delete in the source timeline reconciles this.
                tracing::debug!(op = %entry.redacted(), "update target missing, skipped");
            }
            Err(error)
                if error.code() == ApplyErrorCode::NamespaceNotFound
                    && entry.is_crud()
                    && ctx.options.allow_ns_not_found_on_crud =>
            {
                tracing::debug!(op = %entry.redacted(), "namespace already dropped, skipped");
            }
            Err(error) => {
                tracing::error!(%error, op = %entry.redacted(), "failed to apply oplog entry");
                return Err(error);
            }
        }
        pos += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::multi_sync_apply;
    use crate::config::{ApplierOptions, ApplyMode};
    use crate::context::{ApplierEnv, SystemClock};
    use crate::counters::ApplyCounters;
    use crate::entry::{Namespace, OpTime, OplogEntry};
    use crate::error::ApplyErrorCode;
    use crate::locks::LockRegistry;
    use crate::multikey::MultikeyPathInfo;
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

    #[test]
    fn the_sort_keeps_order_within_a_namespace() {
        let fixture = Fixture::new(ApplierOptions::default());
        let ns_a = Namespace::new("app", "aaa");
        let ns_z = Namespace::new("app", "zzz");
        for ns in [&ns_a, &ns_z] {
            fixture
                .storage
                .create_collection(ns, CollectionProps::default());
        }

        // Interleave two namespaces; id encodes original position.
        let batch = vec![
            OplogEntry::insert(OpTime(1), ns_z.clone(), json!({"_id": 0})),
            OplogEntry::insert(OpTime(2), ns_a.clone(), json!({"_id": 1})),
            OplogEntry::insert(OpTime(3), ns_z.clone(), json!({"_id": 2})),
            OplogEntry::insert(OpTime(4), ns_a.clone(), json!({"_id": 3})),
        ];
        let mut bin: Vec<OpRef> = (0..4).map(OpRef::Batch).collect();
        let store = OpStore {
            batch: &batch,
            derived: &[],
        };

        let env = fixture.env();
        let ctx = env.worker_context();
        let mut out = Vec::new();
        multi_sync_apply(&ctx, store, &mut bin, &mut out).unwrap();

        let order: Vec<usize> = bin
            .iter()
            .map(|r| match r {
                OpRef::Batch(i) => *i,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(order, vec![1, 3, 0, 2], "namespaces sorted, stable within");
        assert_eq!(fixture.storage.document_count(&ns_a), 2);
        assert_eq!(fixture.storage.document_count(&ns_z), 2);
    }

    #[test]
    fn initial_sync_skips_failed_updates() {
        let fixture = Fixture::new(ApplierOptions {
            mode: ApplyMode::InitialSync,
            ..ApplierOptions::default()
        });
        let ns = Namespace::new("app", "users");
        fixture
            .storage
            .create_collection(&ns, CollectionProps::default());

        let batch = vec![
            OplogEntry::update(OpTime(1), ns.clone(), json!(1), json!({"x": 1})),
            OplogEntry::insert(OpTime(2), ns.clone(), json!({"_id": 2})),
        ];
        let mut bin: Vec<OpRef> = (0..2).map(OpRef::Batch).collect();
        let store = OpStore {
            batch: &batch,
            derived: &[],
        };

        let env = fixture.env();
        let ctx = env.worker_context();
        let mut out = Vec::new();
        multi_sync_apply(&ctx, store, &mut bin, &mut out).unwrap();
        assert_eq!(fixture.storage.document_count(&ns), 1);
    }

    #[test]
    fn the_allowlist_skips_crud_on_dropped_namespaces() {
        let fixture = Fixture::new(ApplierOptions {
            mode: ApplyMode::InitialSync,
            allow_ns_not_found_on_crud: true,
            ..ApplierOptions::default()
        });
        let live = Namespace::new("app", "live");
        fixture
            .storage
            .create_collection(&live, CollectionProps::default());

        let batch = vec![
            OplogEntry::insert(OpTime(1), Namespace::new("gone", "users"), json!({"_id": 1})),
            OplogEntry::insert(OpTime(2), live.clone(), json!({"_id": 2})),
        ];
        let mut bin: Vec<OpRef> = (0..2).map(OpRef::Batch).collect();
        let store = OpStore {
            batch: &batch,
            derived: &[],
        };

        let env = fixture.env();
        let ctx = env.worker_context();
        let mut out = Vec::new();
        multi_sync_apply(&ctx, store, &mut bin, &mut out).unwrap();
        assert_eq!(fixture.storage.document_count(&live), 1);
    }

    #[test]
    fn without_the_allowlist_a_dropped_namespace_fails_the_bin() {
        let fixture = Fixture::new(ApplierOptions::default());
        let batch = vec![OplogEntry::insert(
            OpTime(1),
            Namespace::new("gone", "users"),
            json!({"_id": 1}),
        )];
        let mut bin = vec![OpRef::Batch(0)];
        let store = OpStore {
            batch: &batch,
            derived: &[],
        };

        let env = fixture.env();
        let ctx = env.worker_context();
        let mut out = Vec::new();
        let err = multi_sync_apply(&ctx, store, &mut bin, &mut out).unwrap_err();
        assert_eq!(err.code(), ApplyErrorCode::NamespaceNotFound);
    }

    #[test]
    fn multikey_paths_collected_during_the_bin_are_returned() {
        let fixture = Fixture::new(ApplierOptions::default());
        let ns = Namespace::new("app", "users");
        fixture
            .storage
            .create_collection(&ns, CollectionProps::default());
        let info = MultikeyPathInfo {
            ns: ns.clone(),
            index_name: "tags_1".into(),
            paths: vec!["tags".into()],
        };
        fixture.storage.register_multikey_paths(&ns, info.clone());

        let batch = vec![OplogEntry::insert(
            OpTime(1),
            ns,
            json!({"_id": 1, "tags": ["a", "b"]}),
        )];
        let mut bin = vec![OpRef::Batch(0)];
        let store = OpStore {
            batch: &batch,
            derived: &[],
        };

        let env = fixture.env();
        let ctx = env.worker_context();
        let mut out = Vec::new();
        multi_sync_apply(&ctx, store, &mut bin, &mut out).unwrap();
        assert_eq!(out, vec![info]);
        assert!(!ctx.multikey.is_tracking(), "tracking stopped on exit");
    }

    #[test]
    fn a_non_empty_output_vector_is_rejected() {
        let fixture = Fixture::new(ApplierOptions::default());
        let env = fixture.env();
        let ctx = env.worker_context();
        let store = OpStore {
            batch: &[],
            derived: &[],
        };
        let mut out = vec![MultikeyPathInfo {
            ns: Namespace::new("app", "users"),
            index_name: "stale".into(),
            paths: vec![],
        }];
        let err = multi_sync_apply(&ctx, store, &mut [], &mut out).unwrap_err();
        assert_eq!(err.code(), ApplyErrorCode::PreconditionFailed);
    }
}
