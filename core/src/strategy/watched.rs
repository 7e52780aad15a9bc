// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

use spike_api::KeyValueStore;
use spike_api::QueuedOp;
use tracing::debug;

use super::DecrementOutcome;
use super::DecrementStrategy;
use super::StrategyId;
use super::decremented;
use crate::counter::Counter;
use crate::error::SpikeResult;
use crate::transaction::CommitResult;
use crate::transaction::Plan;
use crate::transaction::execute_watched;

/// Optimistic decrement through the watched-transaction template.
pub struct WatchedTransactionStrategy<S> {
    store: S,
    counter: Counter,
}

impl<S: KeyValueStore> WatchedTransactionStrategy<S> {
    pub fn new(store: S, counter: Counter) -> Self {
        Self { store, counter }
    }
}

impl<S: KeyValueStore> DecrementStrategy for WatchedTransactionStrategy<S> {
    fn id(&self) -> StrategyId {
        StrategyId::WatchedTransaction
    }

    async fn apply(&self) -> SpikeResult<DecrementOutcome> {
        let counter = &self.counter;
        let mut remaining = None;
        let ctx = execute_watched(&self.store, counter.key(), |ctx| {
            let stock = counter.parse(ctx.snapshot.as_deref())?;
            remaining = decremented(stock);
            Ok(match remaining {
                Some(value) => Plan::Commit(vec![QueuedOp::set(counter.key(), value.to_string())]),
                None => Plan::Abandon,
            })
        })
        .await?;

        let outcome = match (ctx.result, remaining) {
            (Some(CommitResult::Committed(_)), Some(remaining)) => {
                DecrementOutcome::Success { remaining }
            }
            (Some(CommitResult::Aborted), _) => DecrementOutcome::ConcurrentModification,
            _ => DecrementOutcome::InsufficientStock,
        };
        debug!(key = counter.key(), outcome = ?outcome, "Watched decrement finished");
        Ok(outcome)
    }
}
