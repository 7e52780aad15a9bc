// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

use spike_api::Connection;
use spike_api::ExecOutcome;
use spike_api::KeyValueStore;
use spike_api::QueuedOp;
use tracing::debug;

use super::DecrementOutcome;
use super::DecrementStrategy;
use super::StrategyId;
use super::decremented;
use crate::counter::Counter;
use crate::error::SpikeResult;
use crate::transaction::discard_after_failure;

/// Optimistic decrement driven command by command on a dedicated connection
/// from its own store handle.
///
/// MULTI is only opened when the snapshot is positive; otherwise the watch is
/// dropped with UNWATCH. A fault after MULTI is followed by DISCARD.
pub struct DirectTransactionStrategy<D> {
    store: D,
    counter: Counter,
}

impl<D: KeyValueStore> DirectTransactionStrategy<D> {
    pub fn new(store: D, counter: Counter) -> Self {
        Self { store, counter }
    }
}

async fn commit_decrement<C: Connection>(
    conn: &mut C,
    key: &str,
    remaining: u64,
) -> SpikeResult<ExecOutcome> {
    conn.queue(QueuedOp::set(key, remaining.to_string())).await?;
    Ok(conn.exec().await?)
}

impl<D: KeyValueStore> DecrementStrategy for DirectTransactionStrategy<D> {
    fn id(&self) -> StrategyId {
        StrategyId::DirectTransaction
    }

    async fn apply(&self) -> SpikeResult<DecrementOutcome> {
        let key = self.counter.key();
        let mut conn = self.store.connect().await?;

        conn.watch(key).await?;
        let snapshot = conn.get(key).await?;
        let stock = match self.counter.parse(snapshot.as_deref()) {
            Ok(stock) => stock,
            Err(e) => {
                conn.unwatch().await?;
                return Err(e);
            }
        };
        let Some(remaining) = decremented(stock) else {
            conn.unwatch().await?;
            return Ok(DecrementOutcome::InsufficientStock);
        };

        if let Err(e) = conn.multi().await {
            discard_after_failure(&mut conn, key).await;
            return Err(e.into());
        }
        match commit_decrement(&mut conn, key, remaining).await {
            Ok(outcome) if outcome.is_committed() => Ok(DecrementOutcome::Success { remaining }),
            Ok(_) => {
                debug!(key = key, "Transaction error, watched key changed");
                Ok(DecrementOutcome::ConcurrentModification)
            }
            Err(e) => {
                discard_after_failure(&mut conn, key).await;
                Err(e)
            }
        }
    }
}
