//! Single-entry apply: dispatch one oplog entry into a storage mutation
//! under locks, with write-conflict retry and mode-aware error tolerance.

use crate::context::ApplyContext;
use crate::entry::{Namespace, OpKind, OplogEntry};
use crate::error::{ApplyError, ApplyErrorCode};
use crate::locks::LockMode;
use std::time::Instant;

/// Runs `body` until it stops failing with a write conflict. Every other
/// result is returned as-is. The retry budget is unbounded; attempts are
/// counted through the injected counter sink.
pub fn write_conflict_retry<T>(
    ctx: &ApplyContext<'_>,
    op_name: &str,
    ns: &Namespace,
    mut body: impl FnMut() -> Result<T, ApplyError>,
) -> Result<T, ApplyError> {
    let mut attempts = 0u64;
    loop {
        match body() {
            Err(error) if error.is_write_conflict() => {
                attempts += 1;
                ctx.counters.record_conflict_retry();
                tracing::debug!(op = op_name, %ns, attempts, "write conflict, retrying");
            }
            other => return other,
        }
    }
}

/// Applies a single oplog entry in the context's mode.
pub fn sync_apply(ctx: &ApplyContext<'_>, entry: &OplogEntry) -> Result<(), ApplyError> {
    // The caller must have installed batch-worker write behavior; applying
    // with primary-side recording or validation active would corrupt the
    // secondary's oplog and reject documents the primary accepted.
    if !ctx.session.is_batch_worker() {
        return Err(ApplyError::PreconditionFailed(
            "sync_apply requires a batch-worker apply session".into(),
        ));
    }

    let start = ctx.clock.now();
    match entry.kind {
        OpKind::Noop => {
            ctx.counters.record_applied(1);
            Ok(())
        }
        OpKind::Insert | OpKind::Update | OpKind::Delete => {
            let result = write_conflict_retry(ctx, "apply_crud", &entry.ns, || {
                let lock_mode = if entry.ns.is_system_views() {
                    LockMode::Exclusive
                } else {
                    LockMode::IntentExclusive
                };
                let _db_lock = ctx.locks.lock_db(&entry.ns.db, lock_mode);
                let ns = resolve_namespace(ctx, entry)?;
                let _coll_lock = ctx.locks.lock_collection(&ns, lock_mode);
                if !ctx.catalog.database_exists(&ns.db) {
                    return Err(ApplyError::NamespaceNotFound { ns: ns.db.clone() });
                }
                ctx.storage.apply_operation(
                    &ctx.session,
                    &ns,
                    entry,
                    ctx.options.mode.should_always_upsert(),
                    ctx.options.mode,
                    &ctx.multikey,
                )
            });
            let result = match result {
                Ok(()) => {
                    ctx.counters.record_applied(1);
                    Ok(())
                }
                Err(error) if error.code() == ApplyErrorCode::NamespaceNotFound => {
                    // Deletes on dropped namespaces are success for
                    // idempotency; during recovery, storage may not have
                    // checkpointed drops yet, so every CRUD kind tolerates it.
                    if entry.kind == OpKind::Delete
                        || ctx.options.mode.tolerates_ns_not_found_on_crud()
                    {
                        tracing::debug!(op = %entry.redacted(), "namespace missing, treated as applied");
                        Ok(())
                    } else {
                        Err(error.with_op_context(entry.redacted()))
                    }
                }
                Err(error) => Err(error),
            };
            finish_and_log(ctx, entry, start, result)
        }
        OpKind::Command => {
            let result = write_conflict_retry(ctx, "apply_command", &entry.ns, || {
                ctx.storage
                    .apply_command(&ctx.session, entry, ctx.options.mode)
            });
            if result.is_ok() {
                ctx.counters.record_applied(1);
            }
            finish_and_log(ctx, entry, start, result)
        }
    }
}

fn resolve_namespace(ctx: &ApplyContext<'_>, entry: &OplogEntry) -> Result<Namespace, ApplyError> {
    match entry.collection_uuid {
        Some(uuid) => ctx
            .catalog
            .lookup_ns_by_uuid(&uuid)
            .ok_or_else(|| ApplyError::NamespaceNotFound {
                ns: format!("uuid {uuid}"),
            }),
        None => Ok(entry.ns.clone()),
    }
}

/// Emits a report for entries that were slow to apply, then passes the
/// result through.
fn finish_and_log(
    ctx: &ApplyContext<'_>,
    entry: &OplogEntry,
    start: Instant,
    result: Result<(), ApplyError>,
) -> Result<(), ApplyError> {
    if result.is_ok() {
        let elapsed = ctx.clock.now().saturating_duration_since(start);
        if elapsed > ctx.options.slow_op_threshold {
            tracing::info!(
                kind = ?entry.kind,
                elapsed_ms = elapsed.as_millis() as u64,
                op = %entry.redacted(),
                "slow oplog entry apply"
            );
        }
    }
    result
}
