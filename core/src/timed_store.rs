// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

//! Per-round-trip time limit for any store.
//!
//! Every command races a sleep from the environment; a command that loses is
//! dropped and reported as `StoreError::Unavailable`. The simulator's sleeps
//! are logical, so timeouts replay deterministically there.

use std::future::Future;
use std::pin::pin;
use std::rc::Rc;
use std::time::Duration;

use futures::future::Either;
use futures::future::select;
use spike_api::Connection;
use spike_api::Environment;
use spike_api::ExecOutcome;
use spike_api::HolderId;
use spike_api::KeyValueStore;
use spike_api::LeaseGrant;
use spike_api::LeaseStore;
use spike_api::QueuedOp;
use spike_api::StoreError;
use spike_api::StoreResult;
use tracing::warn;

async fn bounded<E, T>(
    env: &E,
    limit: Option<Duration>,
    command: &'static str,
    request: impl Future<Output = StoreResult<T>>,
) -> StoreResult<T>
where
    E: Environment,
{
    let Some(limit) = limit else {
        return request.await;
    };
    let request = pin!(request);
    let expiry = pin!(env.sleep(limit));
    match select(request, expiry).await {
        Either::Left((result, _)) => result,
        Either::Right(((), _)) => {
            warn!(command = command, limit = ?limit, "Store round-trip timed out");
            Err(StoreError::Unavailable(format!(
                "{} timed out after {:?}",
                command, limit
            )))
        }
    }
}

/// Store handle whose commands give up after `limit`. `None` never gives up.
pub struct TimedStore<S, E> {
    inner: S,
    env: Rc<E>,
    limit: Option<Duration>,
}

impl<S: Clone, E> Clone for TimedStore<S, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            env: self.env.clone(),
            limit: self.limit,
        }
    }
}

impl<S, E> TimedStore<S, E> {
    pub fn new(inner: S, env: Rc<E>, limit: Option<Duration>) -> Self {
        Self { inner, env, limit }
    }

    pub fn limit(&self) -> Option<Duration> {
        self.limit
    }
}

impl<S, E> KeyValueStore for TimedStore<S, E>
where
    S: KeyValueStore,
    E: Environment + 'static,
{
    type Connection = TimedConnection<S::Connection, E>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        bounded(self.env.as_ref(), self.limit, "GET", self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: String) -> StoreResult<()> {
        bounded(self.env.as_ref(), self.limit, "SET", self.inner.set(key, value)).await
    }

    async fn connect(&self) -> StoreResult<Self::Connection> {
        let inner = bounded(self.env.as_ref(), self.limit, "CONNECT", self.inner.connect()).await?;
        Ok(TimedConnection {
            inner,
            env: self.env.clone(),
            limit: self.limit,
        })
    }
}

impl<S, E> LeaseStore for TimedStore<S, E>
where
    S: LeaseStore,
    E: Environment,
{
    async fn try_acquire(
        &self,
        name: &str,
        holder: &HolderId,
        lease: Duration,
    ) -> StoreResult<LeaseGrant> {
        let request = self.inner.try_acquire(name, holder, lease);
        bounded(self.env.as_ref(), self.limit, "ACQUIRE", request).await
    }

    async fn renew(&self, name: &str, holder: &HolderId, lease: Duration) -> StoreResult<bool> {
        let request = self.inner.renew(name, holder, lease);
        bounded(self.env.as_ref(), self.limit, "RENEW", request).await
    }

    async fn release(&self, name: &str, holder: &HolderId) -> StoreResult<bool> {
        let request = self.inner.release(name, holder);
        bounded(self.env.as_ref(), self.limit, "RELEASE", request).await
    }
}

pub struct TimedConnection<C, E> {
    inner: C,
    env: Rc<E>,
    limit: Option<Duration>,
}

impl<C: Connection, E: Environment> Connection for TimedConnection<C, E> {
    async fn watch(&mut self, key: &str) -> StoreResult<()> {
        bounded(self.env.as_ref(), self.limit, "WATCH", self.inner.watch(key)).await
    }

    async fn unwatch(&mut self) -> StoreResult<()> {
        bounded(self.env.as_ref(), self.limit, "UNWATCH", self.inner.unwatch()).await
    }

    async fn get(&mut self, key: &str) -> StoreResult<Option<String>> {
        bounded(self.env.as_ref(), self.limit, "GET", self.inner.get(key)).await
    }

    async fn multi(&mut self) -> StoreResult<()> {
        bounded(self.env.as_ref(), self.limit, "MULTI", self.inner.multi()).await
    }

    async fn queue(&mut self, op: QueuedOp) -> StoreResult<()> {
        bounded(self.env.as_ref(), self.limit, "QUEUE", self.inner.queue(op)).await
    }

    async fn exec(&mut self) -> StoreResult<ExecOutcome> {
        bounded(self.env.as_ref(), self.limit, "EXEC", self.inner.exec()).await
    }

    async fn discard(&mut self) -> StoreResult<()> {
        bounded(self.env.as_ref(), self.limit, "DISCARD", self.inner.discard()).await
    }
}
