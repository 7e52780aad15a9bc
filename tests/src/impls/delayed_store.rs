// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

//! DelayedStore: a store that is slow to answer lease acquisitions and reads
//!
//! The delay runs before the command is forwarded, so a slow acquire is
//! granted only once it elapses, whether or not the caller is still waiting.

use std::rc::Rc;
use std::time::Duration;

use spike_api::Environment;
use spike_api::HolderId;
use spike_api::KeyValueStore;
use spike_api::LeaseGrant;
use spike_api::LeaseStore;
use spike_api::StoreResult;

use crate::simulator::Simulator;

pub struct DelayedStore<S> {
    inner: S,
    env: Rc<Simulator>,
    acquire_delay: Duration,
    read_delay: Duration,
}

impl<S: Clone> Clone for DelayedStore<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            env: self.env.clone(),
            acquire_delay: self.acquire_delay,
            read_delay: self.read_delay,
        }
    }
}

impl<S> DelayedStore<S> {
    pub fn new(inner: S, env: Rc<Simulator>) -> Self {
        Self {
            inner,
            env,
            acquire_delay: Duration::ZERO,
            read_delay: Duration::ZERO,
        }
    }

    pub fn with_acquire_delay(mut self, delay: Duration) -> Self {
        self.acquire_delay = delay;
        self
    }

    /// Delay for GETs through the shared client.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    async fn pause(&self, delay: Duration) {
        if !delay.is_zero() {
            self.env.sleep(delay).await;
        }
    }
}

impl<S: KeyValueStore> KeyValueStore for DelayedStore<S> {
    type Connection = S::Connection;

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.pause(self.read_delay).await;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: String) -> StoreResult<()> {
        self.inner.set(key, value).await
    }

    async fn connect(&self) -> StoreResult<Self::Connection> {
        self.inner.connect().await
    }
}

impl<S: LeaseStore> LeaseStore for DelayedStore<S> {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &HolderId,
        lease: Duration,
    ) -> StoreResult<LeaseGrant> {
        self.pause(self.acquire_delay).await;
        self.inner.try_acquire(name, holder, lease).await
    }

    async fn renew(&self, name: &str, holder: &HolderId, lease: Duration) -> StoreResult<bool> {
        self.inner.renew(name, holder, lease).await
    }

    async fn release(&self, name: &str, holder: &HolderId) -> StoreResult<bool> {
        self.inner.release(name, holder).await
    }
}
