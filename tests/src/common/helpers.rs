// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

use std::collections::HashMap;

use futures::future::join_all;
use spike_api::Environment;
use spike_api::KeyValueStore;
use spike_api::LeaseStore;
use spike_core::DecrementOutcome;
use spike_core::Spike;
use spike_core::SpikeResult;
use spike_core::SpikeService;
use spike_core::StrategyId;
use spike_core::service::DecrementReport;
use spike_proto_rust::spike::*;

pub async fn init_stock<T: Spike>(spike: &T, stock: u64) -> InitSkuResponse {
    spike
        .init_sku(InitSkuRequest { stock })
        .await
        .expect("init_sku should succeed")
}

pub async fn status<T: Spike>(spike: &T) -> SuccessNumResponse {
    spike
        .success_num(SuccessNumRequest {})
        .await
        .expect("success_num should succeed")
}

pub async fn reduce<T: Spike>(spike: &T, strategy: StrategyId) -> ReduceSkuResponse {
    spike
        .reduce_sku(ReduceSkuRequest {
            strategy: Strategy::from(strategy) as i32,
        })
        .await
        .expect("reduce_sku should succeed")
}

/// Fire `n` reduce requests at once and wait for all of them.
pub async fn reduce_concurrently<T: Spike>(
    spike: &T,
    strategy: StrategyId,
    n: usize,
) -> Vec<ReduceSkuResponse> {
    join_all((0..n).map(|_| reduce(spike, strategy))).await
}

pub fn count_outcomes(responses: &[ReduceSkuResponse]) -> HashMap<Outcome, usize> {
    let mut counts = HashMap::new();
    for response in responses {
        *counts.entry(response.outcome()).or_insert(0) += 1;
    }
    counts
}

/// Run `n` decrements at once against the service, keeping faults.
pub async fn decrement_concurrently<S, D, E>(
    service: &SpikeService<S, D, E>,
    strategy: StrategyId,
    n: usize,
) -> Vec<SpikeResult<DecrementReport>>
where
    S: KeyValueStore + LeaseStore + Clone + 'static,
    D: KeyValueStore,
    E: Environment + 'static,
{
    join_all((0..n).map(|_| service.decrement(strategy))).await
}

/// Successful decrements among `results`.
pub fn successes(results: &[SpikeResult<DecrementReport>]) -> u64 {
    results
        .iter()
        .filter(|result| {
            matches!(result, Ok(report) if matches!(report.outcome, DecrementOutcome::Success { .. }))
        })
        .count() as u64
}

/// Read the counter straight from the store.
pub async fn read_stock<S: KeyValueStore>(store: &S, key: &str) -> Option<u64> {
    store
        .get(key)
        .await
        .expect("GET should succeed")
        .map(|raw| raw.parse().expect("counter should be numeric"))
}
