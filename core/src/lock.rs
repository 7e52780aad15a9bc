// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

//! Reentrant distributed lock on top of the store's lease primitive.
//!
//! The store only knows "who holds `name` until when". This client adds:
//! - reentrancy: a hold count per (name, holder), only the first acquire and
//!   the last release talk to the store
//! - blocking waits with exponential backoff and jitter, bounded by an
//!   optional wait timeout that also cuts short a slow store reply
//! - a watchdog that renews the lease every third of the default lease window
//!   while an acquisition without an explicit lease is held
//! - guards that release on drop, so a cancelled caller still gives the lock
//!   back

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::hash_map;
use std::future::Future;
use std::pin::pin;
use std::rc::Rc;
use std::time::Duration;
use std::time::Instant;

use futures::future::AbortHandle;
use futures::future::Either;
use futures::future::abortable;
use futures::future::select;
use rand::Rng;
use spike_api::Environment;
use spike_api::HolderId;
use spike_api::LeaseGrant;
use spike_api::LeaseStore;
use spike_api::StoreError;
use thiserror::Error;
use tracing::debug;
use tracing::warn;

/// Configuration for the lock client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockConfig {
    /// Lease used when the caller does not pass one; the watchdog keeps it
    /// alive.
    pub default_lease: Duration,
    /// Initial backoff between acquisition attempts.
    pub initial_backoff: Duration,
    /// Maximum backoff between acquisition attempts.
    pub max_backoff: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_lease: Duration::from_secs(30),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl LockConfig {
    pub fn renewal_interval(&self) -> Duration {
        self.default_lease / 3
    }
}

/// Per-acquisition options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquireOptions {
    /// Give up after waiting this long. `None` waits forever.
    pub wait: Option<Duration>,
    /// Explicit lease; the store force-releases after it. `None` enables the
    /// watchdog.
    pub lease: Option<Duration>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock '{name}'")]
    Timeout { name: String, waited: Duration },
    #[error("lock '{name}' is not held by {holder}")]
    NotHeld { name: String, holder: HolderId },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of a successful release call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Reentrant holds remain; nothing was sent to the store.
    StillHeld { hold_count: u32 },
    /// The hold count reached zero and the store released the lease.
    Released,
    /// The hold count reached zero but the lease had already expired.
    LeaseLost,
}

#[derive(Debug)]
enum LeaseMode {
    Explicit {
        expires_at: Instant,
    },
    Watchdog {
        handle: AbortHandle,
        /// Set by the watchdog once the store refuses a renewal.
        lost: Rc<Cell<bool>>,
    },
}

impl LeaseMode {
    /// The store no longer grants this lease.
    fn is_stale(&self, now: Instant) -> bool {
        match self {
            LeaseMode::Explicit { expires_at } => now >= *expires_at,
            LeaseMode::Watchdog { lost, .. } => lost.get(),
        }
    }

    fn stop(&self) {
        if let LeaseMode::Watchdog { handle, .. } = self {
            handle.abort();
        }
    }
}

#[derive(Debug)]
struct HeldLock {
    hold_count: u32,
    lease: LeaseMode,
}

type LockKey = (String, HolderId);

struct Inner<L, E> {
    store: L,
    env: Rc<E>,
    config: LockConfig,
    client_id: String,
    next_holder: Cell<u64>,
    held: RefCell<HashMap<LockKey, HeldLock>>,
}

/// Lock client. Cheap to clone; clones share hold counts.
pub struct LockClient<L, E> {
    inner: Rc<Inner<L, E>>,
}

impl<L, E> Clone for LockClient<L, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<L, E> LockClient<L, E>
where
    L: LeaseStore + Clone + 'static,
    E: Environment + 'static,
{
    pub fn new(store: L, env: Rc<E>, config: LockConfig) -> Self {
        let client_id = env.with_rng(|rng| format!("{:016x}", rng.r#gen::<u64>()));
        Self {
            inner: Rc::new(Inner {
                store,
                env,
                config,
                client_id,
                next_holder: Cell::new(0),
                held: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// A fresh logical holder. Acquisitions under the same holder are
    /// reentrant; different holders exclude each other.
    pub fn new_holder(&self) -> HolderId {
        let n = self.inner.next_holder.get() + 1;
        self.inner.next_holder.set(n);
        HolderId::new(format!("{}:{}", self.inner.client_id, n))
    }

    /// Local hold count of `holder` on `name`.
    pub fn hold_count(&self, name: &str, holder: &HolderId) -> u32 {
        self.inner
            .held
            .borrow()
            .get(&(name.to_string(), holder.clone()))
            .map_or(0, |held| held.hold_count)
    }

    /// Acquire `name` for `holder`, waiting as allowed by `options`.
    pub async fn acquire(
        &self,
        name: &str,
        holder: &HolderId,
        options: AcquireOptions,
    ) -> Result<LockGuard<L, E>, LockError> {
        if self.reenter(name, holder) {
            return Ok(self.guard(name, holder));
        }

        let env = &self.inner.env;
        let started = env.now();
        let deadline = options.wait.map(|wait| started + wait);
        let lease = options.lease.unwrap_or(self.inner.config.default_lease);
        let mut backoff = self.inner.config.initial_backoff;

        loop {
            let grant = match deadline {
                None => self.inner.store.try_acquire(name, holder, lease).await?,
                Some(deadline) => match self.try_acquire_until(name, holder, lease, deadline).await? {
                    Some(grant) => grant,
                    None => {
                        debug!(lock = name, holder = %holder, "Lock wait expired before the store replied");
                        return Err(LockError::Timeout {
                            name: name.to_string(),
                            waited: env.now() - started,
                        });
                    }
                },
            };
            match grant {
                LeaseGrant::Acquired => {
                    let now = env.now();
                    if deadline.is_some_and(|deadline| now > deadline) {
                        // Granted too late: give it back without touching the counter.
                        release_late_grant(&self.inner.store, name, holder).await;
                        return Err(LockError::Timeout {
                            name: name.to_string(),
                            waited: now - started,
                        });
                    }
                    self.install(name, holder, options.lease, now);
                    debug!(lock = name, holder = %holder, lease = ?options.lease, "Lock acquired");
                    return Ok(self.guard(name, holder));
                }
                LeaseGrant::Held {
                    holder: current,
                    remaining,
                } => {
                    let now = env.now();
                    let mut sleep = backoff + self.jitter(backoff);
                    sleep = sleep.min(remaining.max(Duration::from_millis(1)));
                    if let Some(deadline) = deadline {
                        if now >= deadline {
                            debug!(lock = name, holder = %holder, current = %current, "Lock wait timed out");
                            return Err(LockError::Timeout {
                                name: name.to_string(),
                                waited: now - started,
                            });
                        }
                        sleep = sleep.min(deadline - now);
                    }
                    debug!(
                        lock = name,
                        holder = %holder,
                        current = %current,
                        remaining = ?remaining,
                        backoff = ?sleep,
                        "Lock held, backing off"
                    );
                    env.sleep(sleep).await;
                    backoff = (backoff * 2).min(self.inner.config.max_backoff);
                }
            }
        }
    }

    /// Release one hold of `name` by `holder`.
    pub async fn release(&self, name: &str, holder: &HolderId) -> Result<ReleaseOutcome, LockError> {
        match self.release_local(name, holder)? {
            Some(hold_count) => Ok(ReleaseOutcome::StillHeld { hold_count }),
            None => release_remote(&self.inner.store, name, holder).await,
        }
    }

    /// One store attempt that gives up at `deadline`. `None` means the
    /// deadline won; a grant that still arrives is released in the background.
    async fn try_acquire_until(
        &self,
        name: &str,
        holder: &HolderId,
        lease: Duration,
        deadline: Instant,
    ) -> Result<Option<LeaseGrant>, LockError> {
        let env = &self.inner.env;
        let store = self.inner.store.clone();
        let (owned_name, owned_holder) = (name.to_string(), holder.clone());
        let request = Box::pin(async move {
            store.try_acquire(&owned_name, &owned_holder, lease).await
        });
        let expiry = pin!(env.sleep(deadline.saturating_duration_since(env.now())));

        match select(request, expiry).await {
            Either::Left((grant, _)) => Ok(Some(grant?)),
            Either::Right(((), request)) => {
                self.release_when_granted(name, holder, request);
                Ok(None)
            }
        }
    }

    fn release_when_granted<F>(&self, name: &str, holder: &HolderId, request: F)
    where
        F: Future<Output = Result<LeaseGrant, StoreError>> + 'static,
    {
        let store = self.inner.store.clone();
        let (name, holder) = (name.to_string(), holder.clone());
        self.inner.env.spawn_background(async move {
            match request.await {
                Ok(LeaseGrant::Acquired) => release_late_grant(&store, &name, &holder).await,
                Ok(LeaseGrant::Held { .. }) => {}
                Err(e) => debug!(lock = name, holder = %holder, error = %e, "Abandoned acquire failed"),
            }
        });
    }

    /// Takes another hold if `holder` already owns a live lease on `name`.
    /// A stale entry is left in place for `install` to refresh.
    fn reenter(&self, name: &str, holder: &HolderId) -> bool {
        let key = (name.to_string(), holder.clone());
        let mut held = self.inner.held.borrow_mut();
        let Some(state) = held.get_mut(&key) else {
            return false;
        };
        if state.lease.is_stale(self.inner.env.now()) {
            warn!(lock = name, holder = %holder, "Lease lost while held, reacquiring");
            return false;
        }
        state.hold_count += 1;
        debug!(lock = name, holder = %holder, hold_count = state.hold_count, "Lock reentered");
        true
    }

    /// Records a store grant. An existing entry for the same holder keeps its
    /// count and gains a hold; its lease is replaced only if it went stale.
    fn install(&self, name: &str, holder: &HolderId, explicit: Option<Duration>, now: Instant) {
        let mut held = self.inner.held.borrow_mut();
        match held.entry((name.to_string(), holder.clone())) {
            hash_map::Entry::Occupied(mut entry) => {
                let state = entry.get_mut();
                state.hold_count += 1;
                if state.lease.is_stale(now) {
                    state.lease.stop();
                    state.lease = self.new_lease(name, holder, explicit, now);
                }
            }
            hash_map::Entry::Vacant(entry) => {
                entry.insert(HeldLock {
                    hold_count: 1,
                    lease: self.new_lease(name, holder, explicit, now),
                });
            }
        }
    }

    fn new_lease(
        &self,
        name: &str,
        holder: &HolderId,
        explicit: Option<Duration>,
        now: Instant,
    ) -> LeaseMode {
        match explicit {
            Some(lease) => LeaseMode::Explicit {
                expires_at: now + lease,
            },
            None => {
                let lost = Rc::new(Cell::new(false));
                LeaseMode::Watchdog {
                    handle: self.start_watchdog(name, holder, lost.clone()),
                    lost,
                }
            }
        }
    }

    /// Decrements the local hold count. Returns the remaining count, or
    /// `None` when the store lease must be released now.
    fn release_local(&self, name: &str, holder: &HolderId) -> Result<Option<u32>, LockError> {
        let key = (name.to_string(), holder.clone());
        let mut held = self.inner.held.borrow_mut();
        let Some(state) = held.get_mut(&key) else {
            return Err(LockError::NotHeld {
                name: name.to_string(),
                holder: holder.clone(),
            });
        };
        state.hold_count -= 1;
        if state.hold_count > 0 {
            return Ok(Some(state.hold_count));
        }
        if let Some(state) = held.remove(&key) {
            state.lease.stop();
        }
        Ok(None)
    }

    fn jitter(&self, backoff: Duration) -> Duration {
        let max_ms = backoff.as_millis() as u64 / 2;
        Duration::from_millis(self.inner.env.with_rng(|rng| rng.gen_range(0..=max_ms)))
    }

    fn start_watchdog(&self, name: &str, holder: &HolderId, lost: Rc<Cell<bool>>) -> AbortHandle {
        let store = self.inner.store.clone();
        let env = self.inner.env.clone();
        let lease = self.inner.config.default_lease;
        let interval = self.inner.config.renewal_interval();
        let (name, holder) = (name.to_string(), holder.clone());

        let (task, handle) = abortable(async move {
            loop {
                env.sleep(interval).await;
                match store.renew(&name, &holder, lease).await {
                    Ok(true) => debug!(lock = name, holder = %holder, "Lease renewed"),
                    Ok(false) => {
                        warn!(lock = name, holder = %holder, "Lease lost, stopping watchdog");
                        lost.set(true);
                        return;
                    }
                    // Transient; the lease still has two renewal periods left.
                    Err(e) => warn!(lock = name, holder = %holder, error = %e, "Lease renewal failed"),
                }
            }
        });
        self.inner.env.spawn_background(async move {
            let _ = task.await;
        });
        handle
    }

    fn guard(&self, name: &str, holder: &HolderId) -> LockGuard<L, E> {
        LockGuard {
            client: self.clone(),
            name: name.to_string(),
            holder: holder.clone(),
            released: false,
        }
    }
}

async fn release_late_grant<L: LeaseStore>(store: &L, name: &str, holder: &HolderId) {
    match store.release(name, holder).await {
        Ok(_) => debug!(lock = name, holder = %holder, "Released a grant that arrived after the wait"),
        Err(e) => warn!(lock = name, holder = %holder, error = %e, "Failed to release a late grant"),
    }
}

async fn release_remote<L: LeaseStore>(
    store: &L,
    name: &str,
    holder: &HolderId,
) -> Result<ReleaseOutcome, LockError> {
    if store.release(name, holder).await? {
        debug!(lock = name, holder = %holder, "Lock released");
        Ok(ReleaseOutcome::Released)
    } else {
        warn!(lock = name, holder = %holder, "Lease expired before release");
        Ok(ReleaseOutcome::LeaseLost)
    }
}

/// One hold on a lock. Release it with [`LockGuard::release`]; a guard that
/// is dropped instead releases its hold in the background.
#[must_use = "dropping the guard releases the lock"]
pub struct LockGuard<L, E>
where
    L: LeaseStore + Clone + 'static,
    E: Environment + 'static,
{
    client: LockClient<L, E>,
    name: String,
    holder: HolderId,
    released: bool,
}

impl<L, E> LockGuard<L, E>
where
    L: LeaseStore + Clone + 'static,
    E: Environment + 'static,
{
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn holder(&self) -> &HolderId {
        &self.holder
    }

    pub async fn release(mut self) -> Result<ReleaseOutcome, LockError> {
        self.released = true;
        self.client.release(&self.name, &self.holder).await
    }
}

impl<L, E> Drop for LockGuard<L, E>
where
    L: LeaseStore + Clone + 'static,
    E: Environment + 'static,
{
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match self.client.release_local(&self.name, &self.holder) {
            Ok(Some(_)) => {}
            Ok(None) => {
                let store = self.client.inner.store.clone();
                let (name, holder) = (self.name.clone(), self.holder.clone());
                debug!(lock = name, holder = %holder, "Guard dropped, releasing in background");
                self.client.inner.env.spawn_background(async move {
                    if let Err(e) = release_remote(&store, &name, &holder).await {
                        warn!(lock = name, holder = %holder, error = %e, "Background release failed");
                    }
                });
            }
            Err(e) => warn!(error = %e, "Dropped guard was not held"),
        }
    }
}
