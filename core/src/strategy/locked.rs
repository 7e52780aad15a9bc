// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

use std::rc::Rc;
use std::time::Duration;

use spike_api::Environment;
use spike_api::KeyValueStore;
use spike_api::LeaseStore;
use tracing::debug;
use tracing::error;

use super::DecrementOutcome;
use super::DecrementStrategy;
use super::StrategyId;
use super::unsynchronized::read_check_write;
use crate::counter::Counter;
use crate::error::SpikeResult;
use crate::lock::AcquireOptions;
use crate::lock::LockClient;
use crate::lock::LockError;
use crate::lock::LockGuard;

/// Settings for the lock-guarded decrement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockedSettings {
    pub lock_name: String,
    pub options: AcquireOptions,
    /// Acquisitions per call by the same holder. Values above one exercise
    /// reentrancy; only the first reaches the store.
    pub reentrant_depth: u32,
    /// Time spent inside the critical section after the write, to make
    /// contention observable.
    pub hold_delay: Duration,
}

impl Default for LockedSettings {
    fn default() -> Self {
        Self {
            lock_name: "cauto".to_string(),
            options: AcquireOptions::default(),
            reentrant_depth: 1,
            hold_delay: Duration::ZERO,
        }
    }
}

/// Read-check-write inside the distributed lock.
///
/// Each call is its own logical holder. All holds are released on every
/// exit path: explicitly after the critical section, or by the guards' drop
/// when the call is cancelled.
pub struct LockedStrategy<S, E>
where
    S: KeyValueStore + LeaseStore + Clone + 'static,
    E: Environment + 'static,
{
    store: S,
    counter: Counter,
    locks: LockClient<S, E>,
    env: Rc<E>,
    settings: LockedSettings,
}

impl<S, E> LockedStrategy<S, E>
where
    S: KeyValueStore + LeaseStore + Clone + 'static,
    E: Environment + 'static,
{
    pub fn new(
        store: S,
        counter: Counter,
        locks: LockClient<S, E>,
        env: Rc<E>,
        settings: LockedSettings,
    ) -> Self {
        Self {
            store,
            counter,
            locks,
            env,
            settings,
        }
    }

    pub fn locks(&self) -> &LockClient<S, E> {
        &self.locks
    }

    async fn release_all(&self, guards: Vec<LockGuard<S, E>>) {
        for guard in guards.into_iter().rev() {
            if let Err(e) = guard.release().await {
                error!(lock = %self.settings.lock_name, error = %e, "Failed to release lock");
            }
        }
    }
}

impl<S, E> DecrementStrategy for LockedStrategy<S, E>
where
    S: KeyValueStore + LeaseStore + Clone + 'static,
    E: Environment + 'static,
{
    fn id(&self) -> StrategyId {
        StrategyId::DistributedLock
    }

    async fn apply(&self) -> SpikeResult<DecrementOutcome> {
        let holder = self.locks.new_holder();
        let name = &self.settings.lock_name;
        let mut guards = Vec::new();

        for _ in 0..self.settings.reentrant_depth.max(1) {
            match self.locks.acquire(name, &holder, self.settings.options).await {
                Ok(guard) => guards.push(guard),
                Err(LockError::Timeout { waited, .. }) => {
                    debug!(lock = %name, holder = %holder, waited = ?waited, "Gave up waiting for lock");
                    self.release_all(guards).await;
                    return Ok(DecrementOutcome::LockTimeout);
                }
                Err(e) => {
                    self.release_all(guards).await;
                    return Err(e.into());
                }
            }
        }

        let result = read_check_write(&self.store, &self.counter).await;
        if !self.settings.hold_delay.is_zero() {
            self.env.sleep(self.settings.hold_delay).await;
        }

        self.release_all(guards).await;
        result
    }
}
