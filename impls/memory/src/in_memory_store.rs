// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use spike_api::Connection;
use spike_api::ExecOutcome;
use spike_api::HolderId;
use spike_api::KeyValueStore;
use spike_api::LeaseGrant;
use spike_api::LeaseStore;
use spike_api::QueuedOp;
use spike_api::StoreResult;
use spike_api::environment::Environment;
use tracing::debug;

use crate::in_memory_store_state::InMemoryStoreState;
use crate::in_memory_store_state::SessionId;
use crate::in_memory_store_state::StoreStats;

/// In-memory remote store.
///
/// This is a cloneable wrapper around `InMemoryStoreState` using `Rc<RefCell<>>`.
/// All clones share the same underlying state. Lease expiry follows the
/// environment's clock.
pub struct InMemoryStore<E: Environment> {
    state: Rc<RefCell<InMemoryStoreState>>,
    environment: Rc<E>,
}

impl<E: Environment> InMemoryStore<E> {
    pub fn new(environment: Rc<E>) -> Self {
        Self {
            state: Rc::new(RefCell::new(InMemoryStoreState::new())),
            environment,
        }
    }

    pub fn environment(&self) -> Rc<E> {
        self.environment.clone()
    }

    pub fn stats(&self) -> StoreStats {
        self.state.borrow().stats()
    }

    pub fn open_transactions(&self) -> usize {
        self.state.borrow().open_transactions()
    }

    pub fn open_sessions(&self) -> usize {
        self.state.borrow().open_sessions()
    }

    pub fn lease_holder(&self, name: &str) -> Option<HolderId> {
        self.state.borrow().lease_holder(name, self.environment.now())
    }
}

impl<E: Environment> Clone for InMemoryStore<E> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            environment: self.environment.clone(),
        }
    }
}

impl<E: Environment> KeyValueStore for InMemoryStore<E> {
    type Connection = InMemoryConnection;

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.state.borrow_mut().get(key))
    }

    async fn set(&self, key: &str, value: String) -> StoreResult<()> {
        self.state.borrow_mut().set(key, value);
        Ok(())
    }

    async fn connect(&self) -> StoreResult<InMemoryConnection> {
        let id = self.state.borrow_mut().open_session();
        debug!(session = id, "Opened in-memory store connection");
        Ok(InMemoryConnection {
            id,
            state: self.state.clone(),
        })
    }
}

impl<E: Environment> LeaseStore for InMemoryStore<E> {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &HolderId,
        lease: Duration,
    ) -> StoreResult<LeaseGrant> {
        let now = self.environment.now();
        Ok(self.state.borrow_mut().try_acquire(name, holder, lease, now))
    }

    async fn renew(&self, name: &str, holder: &HolderId, lease: Duration) -> StoreResult<bool> {
        let now = self.environment.now();
        Ok(self.state.borrow_mut().renew(name, holder, lease, now))
    }

    async fn release(&self, name: &str, holder: &HolderId) -> StoreResult<bool> {
        let now = self.environment.now();
        Ok(self.state.borrow_mut().release(name, holder, now))
    }
}

/// A dedicated connection; closing it (on drop) drops its watches and any
/// pending transaction.
pub struct InMemoryConnection {
    id: SessionId,
    state: Rc<RefCell<InMemoryStoreState>>,
}

impl InMemoryConnection {
    pub fn id(&self) -> SessionId {
        self.id
    }
}

impl Drop for InMemoryConnection {
    fn drop(&mut self) {
        self.state.borrow_mut().close_session(self.id);
    }
}

impl Connection for InMemoryConnection {
    async fn watch(&mut self, key: &str) -> StoreResult<()> {
        self.state.borrow_mut().watch(self.id, key)
    }

    async fn unwatch(&mut self) -> StoreResult<()> {
        self.state.borrow_mut().unwatch(self.id)
    }

    async fn get(&mut self, key: &str) -> StoreResult<Option<String>> {
        self.state.borrow_mut().session_get(self.id, key)
    }

    async fn multi(&mut self) -> StoreResult<()> {
        self.state.borrow_mut().multi(self.id)
    }

    async fn queue(&mut self, op: QueuedOp) -> StoreResult<()> {
        self.state.borrow_mut().queue(self.id, op)
    }

    async fn exec(&mut self) -> StoreResult<ExecOutcome> {
        self.state.borrow_mut().exec(self.id)
    }

    async fn discard(&mut self) -> StoreResult<()> {
        self.state.borrow_mut().discard(self.id)
    }
}
