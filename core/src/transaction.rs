// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

//! Watch-then-commit template.
//!
//! `execute_watched` drives one optimistic attempt on a fresh connection:
//! WATCH the key, read a snapshot, open MULTI, queue a redundant GET (some
//! stores reject an empty transaction), then let the caller's plan decide
//! between queueing writes and abandoning. Any fault after MULTI discards the
//! transaction before the error is returned.

use spike_api::Connection;
use spike_api::ExecOutcome;
use spike_api::KeyValueStore;
use spike_api::QueuedOp;
use spike_api::Reply;
use spike_api::StoreError;
use tracing::debug;
use tracing::warn;

use crate::error::SpikeResult;

/// What the plan wants done with the open transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Queue these operations and EXEC.
    Commit(Vec<QueuedOp>),
    /// DISCARD without writing.
    Abandon,
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitResult {
    Committed(Vec<Reply>),
    /// A watched key changed; nothing was applied.
    Aborted,
    /// The plan chose not to write.
    Discarded,
}

/// State of one optimistic attempt. Never reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionContext {
    pub key: String,
    /// Value read after WATCH, before MULTI.
    pub snapshot: Option<String>,
    pub queued: Vec<QueuedOp>,
    pub result: Option<CommitResult>,
}

impl TransactionContext {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            snapshot: None,
            queued: Vec::new(),
            result: None,
        }
    }
}

/// Run one watched transaction on `key`. `plan` sees the snapshot and runs
/// while MULTI is open.
pub async fn execute_watched<S, F>(store: &S, key: &str, plan: F) -> SpikeResult<TransactionContext>
where
    S: KeyValueStore,
    F: FnOnce(&TransactionContext) -> SpikeResult<Plan>,
{
    let mut conn = store.connect().await?;
    let mut ctx = TransactionContext::new(key);

    conn.watch(key).await?;
    ctx.snapshot = conn.get(key).await?;
    if let Err(e) = conn.multi().await {
        discard_after_failure(&mut conn, key).await;
        return Err(e.into());
    }

    match run_in_multi(&mut conn, &mut ctx, plan).await {
        Ok(result) => {
            debug!(key = key, result = ?result, "Watched transaction finished");
            ctx.result = Some(result);
            Ok(ctx)
        }
        Err(e) => {
            discard_after_failure(&mut conn, key).await;
            Err(e)
        }
    }
}

/// Best-effort DISCARD once a command at or after MULTI failed. The failed
/// MULTI may or may not have reached the store, so a "DISCARD without MULTI"
/// reply is expected and ignored.
pub(crate) async fn discard_after_failure<C: Connection>(conn: &mut C, key: &str) {
    match conn.discard().await {
        Ok(()) => debug!(key = key, "Discarded after failure"),
        Err(StoreError::Protocol(reason)) => {
            debug!(key = key, reason = %reason, "Nothing to discard after failure")
        }
        Err(e) => warn!(key = key, error = %e, "Discard after failure also failed"),
    }
}

async fn run_in_multi<C, F>(
    conn: &mut C,
    ctx: &mut TransactionContext,
    plan: F,
) -> SpikeResult<CommitResult>
where
    C: Connection,
    F: FnOnce(&TransactionContext) -> SpikeResult<Plan>,
{
    let redundant_read = QueuedOp::get(&ctx.key);
    conn.queue(redundant_read.clone()).await?;
    ctx.queued.push(redundant_read);

    match plan(ctx)? {
        Plan::Abandon => {
            conn.discard().await?;
            Ok(CommitResult::Discarded)
        }
        Plan::Commit(ops) => {
            for op in ops {
                conn.queue(op.clone()).await?;
                ctx.queued.push(op);
            }
            match conn.exec().await? {
                ExecOutcome::Committed(replies) if !replies.is_empty() => {
                    Ok(CommitResult::Committed(replies))
                }
                _ => Ok(CommitResult::Aborted),
            }
        }
    }
}
