// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

use std::future::Future;
use std::time::Duration;
use std::time::Instant;

use rand::SeedableRng;
use rand::rngs::StdRng;

/// Minimal clock abstraction for time sampling
pub trait Clock {
    /// Get the current time as an Instant
    fn current_time(&self) -> Instant;
}

/// Real-time clock that uses system time
pub struct RealClock;

impl RealClock {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RealClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for RealClock {
    fn current_time(&self) -> Instant {
        Instant::now()
    }
}

/// Environment trait that allows the same code to run in production or simulation tests.
///
/// Provides access to clock, RNG, timers and background tasks. Lease deadlines,
/// backoff jitter and the lock watchdog all go through this trait so the
/// simulator can drive them deterministically.
pub trait Environment {
    type Clock: Clock;

    fn with_rng<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut StdRng) -> R;

    fn with_clock<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Self::Clock) -> R;

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + 'static;

    /// Run `fut` as a detached background task on the current executor.
    fn spawn_background<F>(&self, fut: F)
    where
        F: Future<Output = ()> + 'static;

    /// Shorthand for sampling the clock.
    fn now(&self) -> Instant {
        self.with_clock(|clock| clock.current_time())
    }
}

/// Production environment using real clock and entropy-seeded RNG.
///
/// Background tasks are spawned with `tokio::task::spawn_local`, so this
/// environment must be used from within a `LocalSet`.
pub struct RealEnvironment {
    rng: std::cell::RefCell<StdRng>,
    clock: RealClock,
}

impl RealEnvironment {
    pub fn new() -> Self {
        Self {
            rng: std::cell::RefCell::new(StdRng::from_entropy()),
            clock: RealClock::new(),
        }
    }
}

impl Default for RealEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for RealEnvironment {
    type Clock = RealClock;

    fn with_rng<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut StdRng) -> R,
    {
        f(&mut self.rng.borrow_mut())
    }

    fn with_clock<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Self::Clock) -> R,
    {
        f(&self.clock)
    }

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + 'static {
        tokio::time::sleep(duration)
    }

    fn spawn_background<F>(&self, fut: F)
    where
        F: Future<Output = ()> + 'static,
    {
        tokio::task::spawn_local(fut);
    }
}
