// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

//! SpikeService: initialize / status / decrement over the four strategies.

use std::rc::Rc;
use std::time::Duration;

use anyhow::Result;
use spike_api::Environment;
use spike_api::KeyValueStore;
use spike_api::LeaseStore;
use spike_api::validate_key;
use spike_proto_rust::spike::InitSkuRequest;
use spike_proto_rust::spike::InitSkuResponse;
use spike_proto_rust::spike::Outcome;
use spike_proto_rust::spike::ReduceSkuRequest;
use spike_proto_rust::spike::ReduceSkuResponse;
use spike_proto_rust::spike::Strategy;
use spike_proto_rust::spike::SuccessNumRequest;
use spike_proto_rust::spike::SuccessNumResponse;
use tracing::info;
use tracing::warn;

use crate::counter::Counter;
use crate::counter::SuccessCounter;
use crate::error::SpikeResult;
use crate::lock::LockClient;
use crate::lock::LockConfig;
use crate::strategy::DecrementOutcome;
use crate::strategy::DecrementStrategy;
use crate::strategy::DirectTransactionStrategy;
use crate::strategy::LockedSettings;
use crate::strategy::LockedStrategy;
use crate::strategy::StrategyId;
use crate::strategy::UnsynchronizedStrategy;
use crate::strategy::WatchedTransactionStrategy;
use crate::timed_store::TimedStore;

/// Default counter key.
pub const DEFAULT_SKU_KEY: &str = "product_sku";

/// Default limit on a single store round-trip.
pub const DEFAULT_ROUND_TRIP_TIMEOUT: Duration = Duration::from_secs(5);

/// Service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpikeConfig {
    pub sku_key: String,
    pub locked: LockedSettings,
    pub lock_client: LockConfig,
    /// Every store command, lease commands included, fails as unavailable
    /// after this long. `None` waits on the store indefinitely.
    pub round_trip_timeout: Option<Duration>,
}

impl Default for SpikeConfig {
    fn default() -> Self {
        Self {
            sku_key: DEFAULT_SKU_KEY.to_string(),
            locked: LockedSettings::default(),
            lock_client: LockConfig::default(),
            round_trip_timeout: Some(DEFAULT_ROUND_TRIP_TIMEOUT),
        }
    }
}

impl SpikeConfig {
    pub fn validate(&self) -> Result<()> {
        validate_key(&self.sku_key)?;
        validate_key(&self.locked.lock_name)?;
        anyhow::ensure!(
            self.locked.reentrant_depth >= 1,
            "reentrant depth must be at least 1"
        );
        anyhow::ensure!(
            !self.lock_client.default_lease.is_zero(),
            "default lease must be positive"
        );
        if let Some(lease) = self.locked.options.lease {
            anyhow::ensure!(!lease.is_zero(), "explicit lease must be positive");
        }
        if let Some(limit) = self.round_trip_timeout {
            anyhow::ensure!(!limit.is_zero(), "round-trip timeout must be positive");
        }
        Ok(())
    }
}

/// Counter value and successes since the last initialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpikeStatus {
    /// `None` until the counter is initialized.
    pub stock: Option<u64>,
    pub success_count: u64,
}

/// Result of `SpikeService::decrement`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecrementReport {
    pub strategy: StrategyId,
    pub outcome: DecrementOutcome,
    pub success_count: u64,
}

/// Orchestrates the decrement strategies over one counter.
///
/// `S` is the shared client used by every strategy except the direct
/// transaction, which uses its own handle `D`. Both are wrapped in the
/// configured round-trip timeout.
pub struct SpikeService<S, D, E>
where
    S: KeyValueStore + LeaseStore + Clone + 'static,
    D: KeyValueStore,
    E: Environment + 'static,
{
    store: TimedStore<S, E>,
    counter: Counter,
    successes: SuccessCounter,
    unsynchronized: UnsynchronizedStrategy<TimedStore<S, E>>,
    locked: LockedStrategy<TimedStore<S, E>, E>,
    watched: WatchedTransactionStrategy<TimedStore<S, E>>,
    direct: DirectTransactionStrategy<TimedStore<D, E>>,
}

impl<S, D, E> SpikeService<S, D, E>
where
    S: KeyValueStore + LeaseStore + Clone + 'static,
    D: KeyValueStore,
    E: Environment + 'static,
{
    pub fn new(store: S, direct_store: D, env: Rc<E>, config: SpikeConfig) -> Result<Self> {
        config.validate()?;
        let counter = Counter::new(config.sku_key);
        let store = TimedStore::new(store, env.clone(), config.round_trip_timeout);
        let direct_store = TimedStore::new(direct_store, env.clone(), config.round_trip_timeout);
        let locks = LockClient::new(store.clone(), env.clone(), config.lock_client);

        Ok(Self {
            unsynchronized: UnsynchronizedStrategy::new(store.clone(), counter.clone()),
            locked: LockedStrategy::new(store.clone(), counter.clone(), locks, env, config.locked),
            watched: WatchedTransactionStrategy::new(store.clone(), counter.clone()),
            direct: DirectTransactionStrategy::new(direct_store, counter.clone()),
            successes: SuccessCounter::new(),
            counter,
            store,
        })
    }

    pub fn counter(&self) -> &Counter {
        &self.counter
    }

    pub fn locks(&self) -> &LockClient<TimedStore<S, E>, E> {
        self.locked.locks()
    }

    /// Set the counter to `stock` and reset the success count. Returns the
    /// stock read back from the store.
    pub async fn initialize(&self, stock: u64) -> SpikeResult<u64> {
        self.counter.write(&self.store, stock).await?;
        self.successes.reset();
        let stored = self.counter.read(&self.store).await?;
        info!(key = self.counter.key(), stock = stored, "Stock initialized");
        Ok(stored)
    }

    pub async fn status(&self) -> SpikeResult<SpikeStatus> {
        let stock = self.counter.try_read(&self.store).await?;
        Ok(SpikeStatus {
            stock,
            success_count: self.successes.get(),
        })
    }

    pub async fn decrement(&self, strategy: StrategyId) -> SpikeResult<DecrementReport> {
        let result = match strategy {
            StrategyId::Unsynchronized => self.unsynchronized.apply().await,
            StrategyId::DistributedLock => self.locked.apply().await,
            StrategyId::WatchedTransaction => self.watched.apply().await,
            StrategyId::DirectTransaction => self.direct.apply().await,
        };
        let outcome = result.inspect_err(|e| {
            warn!(strategy = %strategy, error = %e, "Decrement failed");
        })?;

        let success_count = if outcome.is_success() {
            let count = self.successes.increment();
            info!(strategy = %strategy, outcome = ?outcome, success_count = count, "Decrement succeeded");
            count
        } else {
            self.successes.get()
        };
        Ok(DecrementReport {
            strategy,
            outcome,
            success_count,
        })
    }
}

/// The spike RPC surface, implemented by the service itself and by the gRPC
/// client so tests and tools can drive either.
pub trait Spike {
    fn init_sku(
        &self,
        request: InitSkuRequest,
    ) -> impl std::future::Future<Output = Result<InitSkuResponse>>;

    fn success_num(
        &self,
        request: SuccessNumRequest,
    ) -> impl std::future::Future<Output = Result<SuccessNumResponse>>;

    fn reduce_sku(
        &self,
        request: ReduceSkuRequest,
    ) -> impl std::future::Future<Output = Result<ReduceSkuResponse>>;
}

impl From<StrategyId> for Strategy {
    fn from(id: StrategyId) -> Self {
        match id {
            StrategyId::Unsynchronized => Strategy::Unsynchronized,
            StrategyId::DistributedLock => Strategy::DistributedLock,
            StrategyId::WatchedTransaction => Strategy::WatchedTransaction,
            StrategyId::DirectTransaction => Strategy::DirectTransaction,
        }
    }
}

/// Decode the wire strategy; `Unspecified` and unknown values are rejected.
pub fn strategy_from_wire(value: i32) -> Result<StrategyId> {
    match Strategy::try_from(value) {
        Ok(Strategy::Unsynchronized) => Ok(StrategyId::Unsynchronized),
        Ok(Strategy::DistributedLock) => Ok(StrategyId::DistributedLock),
        Ok(Strategy::WatchedTransaction) => Ok(StrategyId::WatchedTransaction),
        Ok(Strategy::DirectTransaction) => Ok(StrategyId::DirectTransaction),
        _ => Err(anyhow::anyhow!("Missing or unknown strategy {}", value)),
    }
}

fn outcome_message(outcome: DecrementOutcome) -> String {
    match outcome {
        DecrementOutcome::Success { remaining } => format!("Reduced, remaining stock: {}", remaining),
        DecrementOutcome::InsufficientStock => "Insufficient stock".to_string(),
        DecrementOutcome::ConcurrentModification => {
            "Transaction error, stock changed concurrently".to_string()
        }
        DecrementOutcome::LockTimeout => "Timed out waiting for the lock".to_string(),
    }
}

impl<S, D, E> Spike for SpikeService<S, D, E>
where
    S: KeyValueStore + LeaseStore + Clone + 'static,
    D: KeyValueStore,
    E: Environment + 'static,
{
    async fn init_sku(&self, request: InitSkuRequest) -> Result<InitSkuResponse> {
        let stock = self.initialize(request.stock).await?;
        Ok(InitSkuResponse {
            stock,
            message: format!("Stock initialized: {}", stock),
        })
    }

    async fn success_num(&self, _request: SuccessNumRequest) -> Result<SuccessNumResponse> {
        let status = self.status().await?;
        let stock = status
            .stock
            .map_or_else(|| "uninitialized".to_string(), |stock| stock.to_string());
        Ok(SuccessNumResponse {
            stock: status.stock,
            success_count: status.success_count,
            message: format!("Stock: {}, successes: {}", stock, status.success_count),
        })
    }

    async fn reduce_sku(&self, request: ReduceSkuRequest) -> Result<ReduceSkuResponse> {
        let strategy = strategy_from_wire(request.strategy)?;
        let report = self.decrement(strategy).await?;
        let (outcome, remaining) = match report.outcome {
            DecrementOutcome::Success { remaining } => (Outcome::Success, Some(remaining)),
            DecrementOutcome::InsufficientStock => (Outcome::InsufficientStock, None),
            DecrementOutcome::ConcurrentModification => (Outcome::ConcurrentModification, None),
            DecrementOutcome::LockTimeout => (Outcome::LockTimeout, None),
        };
        Ok(ReduceSkuResponse {
            outcome: outcome as i32,
            remaining,
            success_count: report.success_count,
            message: outcome_message(report.outcome),
        })
    }
}
