// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

//! Deterministic single-threaded executor for store, lock and strategy
//! scenarios.
//!
//! Store round-trips, lock backoffs, watchdog ticks and round-trip timeouts
//! all become tasks or timers here. Time is logical: it only moves when the
//! next runnable thing is a timer, so a 30s lease expires instantly in wall
//! time and a failing interleaving replays from its seed.

use std::cell::Cell;
use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::task::Wake;
use std::task::Waker;
use std::time::Duration;
use std::time::Instant;

use futures::channel::oneshot;
use rand::Rng;
use rand::SeedableRng;
use rand::distributions::Distribution;
use rand::distributions::Uniform;
use rand::rngs::StdRng;
use spike_api::Clock;
use spike_api::Environment;

/// Polls allowed per run before the scenario is declared stuck.
pub const DEFAULT_MAX_ITERATIONS: usize = 1_000_000;

/// What a `Simulator::run` did.
#[derive(Debug, Clone)]
pub struct RunStats {
    pub iterations: usize,
    /// Tasks still parked when nothing was left to run, e.g. a waiter on a
    /// lock whose holder was dropped without releasing.
    pub final_blocked_tasks: usize,
    /// Logical time covered by the run.
    pub elapsed: Duration,
}

/// Resolves to the spawned future's output once the simulator ran it.
pub struct SimulatorHandle<T> {
    receiver: oneshot::Receiver<T>,
}

impl<T> Future for SimulatorHandle<T> {
    type Output = Result<T, oneshot::Canceled>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(cx)
    }
}

/// Environment backed by the deterministic executor, a logical clock and a
/// seeded RNG. Spawn the scenario, call `run`, then read the handle.
pub struct Simulator {
    scheduler: Scheduler,
    pub rng: RefCell<StdRng>,
    pub clock: LogicalClock,
}

impl Simulator {
    pub fn new(seed: u64) -> Self {
        // Ready tasks are stamped 100-500us after the current time
        Self::with_jitter(seed, Uniform::new(100, 501))
    }

    /// `jitter_us` spaces ready tasks out in logical time. A distribution
    /// that can only yield 0 never lets a timer fire while tasks are ready.
    pub fn with_jitter(seed: u64, jitter_us: Uniform<u64>) -> Self {
        eprintln!("Simulator seed: {}", seed);
        Self {
            scheduler: Scheduler::new(jitter_us),
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
            clock: LogicalClock::new(),
        }
    }

    /// Cap the number of polls of the next `run`.
    pub fn with_max_iterations(self, max_iterations: usize) -> Self {
        self.scheduler.max_iterations.set(max_iterations);
        self
    }

    pub fn spawn<F, T>(&self, fut: F) -> SimulatorHandle<T>
    where
        F: Future<Output = T> + 'static,
        T: 'static,
    {
        let (sender, receiver) = oneshot::channel();
        self.scheduler.push_ready(async move {
            let _ = sender.send(fut.await);
        });
        SimulatorHandle { receiver }
    }

    /// Run until no task is ready and no timer is pending.
    pub fn run(&self) -> RunStats {
        // Scheduling draws from its own stream so scenario RNG use does not
        // shift the interleaving.
        let seed = self.rng.borrow_mut().r#gen();
        self.scheduler
            .run(&mut StdRng::seed_from_u64(seed), &self.clock)
    }
}

impl Environment for Simulator {
    type Clock = LogicalClock;

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

    /// The timer is registered now, not on first poll. Dropping the returned
    /// future leaves a harmless timer behind that fires into a closed channel.
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + 'static {
        let (sender, receiver) = oneshot::channel();
        self.scheduler.push_timer(
            async move {
                let _ = sender.send(());
            },
            self.clock.current_time() + duration,
        );
        async move {
            let _ = receiver.await;
        }
    }

    fn spawn_background<F>(&self, fut: F)
    where
        F: Future<Output = ()> + 'static,
    {
        self.scheduler.push_ready(fut);
    }
}

type LocalFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

struct Job {
    id: u64,
    /// Set for timers; ready jobs get a jittered time when picked.
    due: Option<Instant>,
    future: LocalFuture,
}

// Timers are ordered by due time, ties broken by registration order.
impl Ord for Job {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.due, self.id).cmp(&(other.due, other.id))
    }
}

impl PartialOrd for Job {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        (self.due, self.id) == (other.due, other.id)
    }
}

impl Eq for Job {}

/// Wakes a parked job by queueing its id.
struct JobWaker {
    id: u64,
    woken: Rc<RefCell<Vec<u64>>>,
    thread: std::thread::ThreadId,
}

// Safety: `Waker` demands Send + Sync, but a JobWaker only ever runs on the
// simulator's thread; `wake_by_ref` panics otherwise.
unsafe impl Send for JobWaker {}
unsafe impl Sync for JobWaker {}

impl Wake for JobWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref()
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let current = std::thread::current().id();
        assert_eq!(
            current, self.thread,
            "simulator waker used off the simulator thread"
        );
        self.woken.borrow_mut().push(self.id);
    }
}

/// Ready jobs, pending timers and parked jobs waiting for a wake.
struct Scheduler {
    ready: RefCell<Vec<Job>>,
    timers: RefCell<BinaryHeap<Reverse<Job>>>,
    parked: RefCell<HashMap<u64, Job>>,
    woken: Rc<RefCell<Vec<u64>>>,
    jitter_us: Uniform<u64>,
    next_id: Cell<u64>,
    max_iterations: Cell<usize>,
}

impl Scheduler {
    fn new(jitter_us: Uniform<u64>) -> Self {
        Self {
            ready: RefCell::new(Vec::new()),
            timers: RefCell::new(BinaryHeap::new()),
            parked: RefCell::new(HashMap::new()),
            woken: Rc::new(RefCell::new(Vec::new())),
            jitter_us,
            next_id: Cell::new(0),
            max_iterations: Cell::new(DEFAULT_MAX_ITERATIONS),
        }
    }

    fn job(&self, due: Option<Instant>, fut: impl Future<Output = ()> + 'static) -> Job {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        Job {
            id,
            due,
            future: Box::pin(fut),
        }
    }

    fn push_ready(&self, fut: impl Future<Output = ()> + 'static) {
        let job = self.job(None, fut);
        self.ready.borrow_mut().push(job);
    }

    fn push_timer(&self, fut: impl Future<Output = ()> + 'static, due: Instant) {
        let job = self.job(Some(due), fut);
        self.timers.borrow_mut().push(Reverse(job));
    }

    /// Moves woken jobs back to the ready list. A wake for a job that is not
    /// parked means it is already ready and will be polled anyway.
    fn unpark_woken(&self) {
        let woken: Vec<u64> = self.woken.borrow_mut().drain(..).collect();
        let mut parked = self.parked.borrow_mut();
        for id in woken {
            if let Some(job) = parked.remove(&id) {
                self.ready.borrow_mut().push(job);
            }
        }
    }

    /// The next job and the logical time it runs at. A random ready job runs
    /// unless a timer is due strictly before its jittered time.
    fn pick_next(&self, rng: &mut StdRng, now: Instant) -> Option<(Job, Instant)> {
        let ready_len = self.ready.borrow().len();
        let ready_at = (ready_len > 0)
            .then(|| now + Duration::from_micros(self.jitter_us.sample(rng)));
        let timer_due = self
            .timers
            .borrow()
            .peek()
            .and_then(|Reverse(job)| job.due);

        match (ready_at, timer_due) {
            (None, None) => None,
            (Some(at), Some(due)) if due < at => self.pop_timer(due),
            (Some(at), _) => {
                let index = rng.gen_range(0..ready_len);
                Some((self.ready.borrow_mut().swap_remove(index), at))
            }
            (None, Some(due)) => self.pop_timer(due),
        }
    }

    fn pop_timer(&self, due: Instant) -> Option<(Job, Instant)> {
        self.timers
            .borrow_mut()
            .pop()
            .map(|Reverse(job)| (job, due))
    }

    fn run(&self, rng: &mut StdRng, clock: &LogicalClock) -> RunStats {
        let max_iterations = self.max_iterations.get();
        let started_at = clock.current_time();
        let mut iterations = 0;

        loop {
            if iterations >= max_iterations {
                panic!(
                    "Simulator exceeded {} iterations, likely a lock that is never released \
                     or an endless retry loop!",
                    max_iterations
                );
            }
            self.unpark_woken();

            let Some((mut job, at)) = self.pick_next(rng, clock.current_time()) else {
                break;
            };
            clock.advance_to(at);

            let waker = Waker::from(Arc::new(JobWaker {
                id: job.id,
                woken: self.woken.clone(),
                thread: std::thread::current().id(),
            }));
            if job
                .future
                .as_mut()
                .poll(&mut Context::from_waker(&waker))
                .is_pending()
            {
                self.parked.borrow_mut().insert(job.id, job);
            }
            iterations += 1;
        }

        RunStats {
            iterations,
            final_blocked_tasks: self.parked.borrow().len(),
            elapsed: clock.current_time() - started_at,
        }
    }
}

/// Logical clock; only the scheduler moves it, and never backwards.
pub struct LogicalClock {
    now: Cell<Instant>,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self {
            now: Cell::new(Instant::now()),
        }
    }

    pub fn advance_to(&self, target: Instant) {
        if target > self.now.get() {
            self.now.set(target);
        }
    }
}

impl Clock for LogicalClock {
    fn current_time(&self) -> Instant {
        self.now.get()
    }
}
