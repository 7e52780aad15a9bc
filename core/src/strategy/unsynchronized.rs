// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

use spike_api::KeyValueStore;
use tracing::debug;

use super::DecrementOutcome;
use super::DecrementStrategy;
use super::StrategyId;
use super::decremented;
use crate::counter::Counter;
use crate::error::SpikeResult;

/// GET, then SET, as two independent round-trips.
///
/// Two callers that both read the same positive value both write the same
/// result, and one decrement is lost. Kept as the baseline the coordinated
/// strategies are measured against.
pub struct UnsynchronizedStrategy<S> {
    store: S,
    counter: Counter,
}

impl<S: KeyValueStore> UnsynchronizedStrategy<S> {
    pub fn new(store: S, counter: Counter) -> Self {
        Self { store, counter }
    }
}

/// Read-check-write without any coordination. Also the critical section of
/// the locked strategy.
pub(crate) async fn read_check_write<S: KeyValueStore>(
    store: &S,
    counter: &Counter,
) -> SpikeResult<DecrementOutcome> {
    let stock = counter.read(store).await?;
    let Some(remaining) = decremented(stock) else {
        debug!(key = counter.key(), "Stock exhausted");
        return Ok(DecrementOutcome::InsufficientStock);
    };
    counter.write(store, remaining).await?;
    Ok(DecrementOutcome::Success { remaining })
}

impl<S: KeyValueStore> DecrementStrategy for UnsynchronizedStrategy<S> {
    fn id(&self) -> StrategyId {
        StrategyId::Unsynchronized
    }

    async fn apply(&self) -> SpikeResult<DecrementOutcome> {
        read_check_write(&self.store, &self.counter).await
    }
}
