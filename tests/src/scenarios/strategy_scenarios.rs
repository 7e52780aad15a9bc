// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

//! Decrement strategy scenarios: safety under contention and agreement
//! between the two optimistic variants

use std::time::Duration;

use anyhow::Result;
use anyhow::ensure;
use rand::Rng;
use spike_api::Environment;
use spike_api::KeyValueStore;
use spike_core::DecrementOutcome;
use spike_core::SpikeConfig;
use spike_core::SpikeService;
use spike_core::StrategyId;
use spike_core::lock::AcquireOptions;
use spike_core::strategy::LockedSettings;

use crate::common::helpers::decrement_concurrently;
use crate::common::helpers::read_stock;
use crate::common::helpers::successes;
use crate::fixtures::SpikeTestFixture;
use crate::impls::concurrent_writer_store::ConcurrentWriterStore;

const SKU: &str = "product_sku";

fn config_with_hold(hold_delay: Duration) -> SpikeConfig {
    SpikeConfig {
        locked: LockedSettings {
            hold_delay,
            ..LockedSettings::default()
        },
        ..SpikeConfig::default()
    }
}

/// N concurrent locked decrements against stock S sell exactly min(N, S).
pub async fn run_test_locked_never_oversells<F: SpikeTestFixture>(fixture: &F) -> Result<()> {
    let env = fixture.get_env();
    for _ in 0..3 {
        let (requests, stock) = env.with_rng(|rng| (rng.gen_range(1..=30usize), rng.gen_range(0..=20u64)));
        let service = fixture.create_service(config_with_hold(Duration::from_millis(5)))?;
        service.initialize(stock).await?;

        let results = decrement_concurrently(&service, StrategyId::DistributedLock, requests).await;
        let sold = successes(&results);
        let expected = stock.min(requests as u64);
        ensure!(
            sold == expected,
            "{} requests on stock {} sold {}, expected {}",
            requests,
            stock,
            sold,
            expected
        );
        for result in &results {
            let report = result.as_ref().map_err(Clone::clone)?;
            ensure!(matches!(
                report.outcome,
                DecrementOutcome::Success { .. } | DecrementOutcome::InsufficientStock
            ));
        }
        ensure!(service.status().await?.stock == Some(stock - expected));
        ensure!(service.status().await?.success_count == expected);
    }
    Ok(())
}

/// Reentrant acquisitions inside one request still exclude other requests.
pub async fn run_test_locked_reentrant_depth<F: SpikeTestFixture>(fixture: &F) -> Result<()> {
    let config = SpikeConfig {
        locked: LockedSettings {
            reentrant_depth: 3,
            hold_delay: Duration::from_millis(5),
            ..LockedSettings::default()
        },
        ..SpikeConfig::default()
    };
    let service = fixture.create_service(config)?;
    service.initialize(4).await?;

    let results = decrement_concurrently(&service, StrategyId::DistributedLock, 10).await;
    ensure!(successes(&results) == 4);
    ensure!(service.status().await?.stock == Some(0));
    Ok(())
}

/// A bounded wait reports LockTimeout instead of blocking.
pub async fn run_test_locked_timeout_outcome<F: SpikeTestFixture>(fixture: &F) -> Result<()> {
    let service = fixture.create_service(SpikeConfig {
        locked: LockedSettings {
            options: AcquireOptions {
                wait: Some(Duration::from_millis(100)),
                lease: None,
            },
            ..LockedSettings::default()
        },
        ..SpikeConfig::default()
    })?;
    service.initialize(5).await?;

    let locks = service.locks();
    let squatter = locks.new_holder();
    let guard = locks.acquire("cauto", &squatter, AcquireOptions::default()).await?;

    let report = service.decrement(StrategyId::DistributedLock).await?;
    ensure!(report.outcome == DecrementOutcome::LockTimeout);
    ensure!(report.success_count == 0);
    ensure!(service.status().await?.stock == Some(5), "a timed-out request must not write");

    guard.release().await?;
    let report = service.decrement(StrategyId::DistributedLock).await?;
    ensure!(report.outcome == DecrementOutcome::Success { remaining: 4 });
    Ok(())
}

/// Optimistic decrements may abort under contention but never oversell and
/// never lose an update.
pub async fn run_test_optimistic_never_oversells<F: SpikeTestFixture>(fixture: &F) -> Result<()> {
    for strategy in [StrategyId::WatchedTransaction, StrategyId::DirectTransaction] {
        let service = fixture.create_service(SpikeConfig::default())?;
        let stock = 5;
        service.initialize(stock).await?;

        let mut sold = 0;
        for _round in 0..20 {
            let results = decrement_concurrently(&service, strategy, 8).await;
            for result in &results {
                let report = result.as_ref().map_err(Clone::clone)?;
                ensure!(report.outcome != DecrementOutcome::LockTimeout);
            }
            sold += successes(&results);
            let remaining = service.status().await?.stock;
            ensure!(
                remaining == Some(stock - sold),
                "{}: {} successes but stock is {:?}",
                strategy,
                sold,
                remaining
            );
            if remaining == Some(0) {
                break;
            }
        }
        ensure!(sold == stock, "{} should sell out within 20 rounds", strategy);
        ensure!(service.status().await?.success_count == stock);
    }
    Ok(())
}

/// A write that lands between WATCH and EXEC aborts the decrement and
/// survives it.
pub async fn run_test_optimistic_abort_keeps_concurrent_write<F: SpikeTestFixture>(
    fixture: &F,
) -> Result<()> {
    for strategy in [StrategyId::WatchedTransaction, StrategyId::DirectTransaction] {
        let plain = fixture.create_store();
        plain.set(SKU, "5".to_string()).await?;

        let racing = ConcurrentWriterStore::new(fixture.create_store(), SKU, "42");
        let service =
            SpikeService::new(racing.clone(), racing, fixture.get_env(), SpikeConfig::default())?;

        let report = service.decrement(strategy).await?;
        ensure!(
            report.outcome == DecrementOutcome::ConcurrentModification,
            "{} returned {:?}",
            strategy,
            report.outcome
        );
        ensure!(report.success_count == 0);
        ensure!(read_stock(&plain, SKU).await == Some(42), "the racing write must survive");
    }
    Ok(())
}

/// Watched and direct transactions report the same outcomes for the same
/// starting states.
pub async fn run_test_direct_matches_watched<F: SpikeTestFixture>(fixture: &F) -> Result<()> {
    async fn outcomes<F: SpikeTestFixture>(
        fixture: &F,
        strategy: StrategyId,
        stock: u64,
    ) -> Result<Vec<DecrementOutcome>> {
        let service = fixture.create_service(SpikeConfig::default())?;
        service.initialize(stock).await?;
        let mut outcomes = Vec::new();
        for _ in 0..stock + 2 {
            outcomes.push(service.decrement(strategy).await?.outcome);
        }
        Ok(outcomes)
    }

    for stock in [0, 1, 3] {
        let watched = outcomes(fixture, StrategyId::WatchedTransaction, stock).await?;
        let direct = outcomes(fixture, StrategyId::DirectTransaction, stock).await?;
        ensure!(watched == direct, "stock {}: {:?} vs {:?}", stock, watched, direct);
        ensure!(watched.last() == Some(&DecrementOutcome::InsufficientStock));
    }
    Ok(())
}

/// Every strategy refuses to run on a missing or corrupt counter and leaves
/// it untouched.
pub async fn run_test_strategies_reject_bad_counter<F: SpikeTestFixture>(fixture: &F) -> Result<()> {
    let store = fixture.create_store();
    let service = fixture.create_service(SpikeConfig::default())?;

    for strategy in StrategyId::ALL {
        ensure!(
            matches!(
                service.decrement(strategy).await,
                Err(spike_core::SpikeError::CounterMissing(_))
            ),
            "{} should report a missing counter",
            strategy
        );
    }

    store.set(SKU, "lots".to_string()).await?;
    for strategy in StrategyId::ALL {
        ensure!(
            matches!(
                service.decrement(strategy).await,
                Err(spike_core::SpikeError::CorruptCounter { .. })
            ),
            "{} should report a corrupt counter",
            strategy
        );
    }
    ensure!(store.get(SKU).await?.as_deref() == Some("lots"));
    ensure!(fixture.open_transactions().unwrap_or(0) == 0);
    Ok(())
}

/// Unsynchronized decrements that overlap lose updates: more successes are
/// reported than stock actually left the counter.
pub async fn run_test_unsynchronized_loses_updates<F: SpikeTestFixture>(fixture: &F) -> Result<()> {
    let service = fixture.create_service(SpikeConfig::default())?;
    service.initialize(100).await?;

    let results = decrement_concurrently(&service, StrategyId::Unsynchronized, 20).await;
    let sold = successes(&results);
    let stock = service.status().await?.stock.unwrap_or(0);
    ensure!(sold == 20, "every unsynchronized request sees stock and succeeds");
    ensure!(
        100 - stock < sold,
        "expected lost updates: {} successes but stock only fell to {}",
        sold,
        stock
    );
    Ok(())
}

/// Two overlapping unsynchronized decrements on the last unit both succeed.
pub async fn run_test_unsynchronized_double_sell<F: SpikeTestFixture>(fixture: &F) -> Result<()> {
    let service = fixture.create_service(SpikeConfig::default())?;
    service.initialize(1).await?;

    let results = decrement_concurrently(&service, StrategyId::Unsynchronized, 2).await;
    ensure!(successes(&results) == 2, "both requests should see the last unit");
    ensure!(service.status().await?.stock == Some(0));
    ensure!(service.status().await?.success_count == 2);
    Ok(())
}
