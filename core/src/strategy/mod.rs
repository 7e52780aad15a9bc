// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

//! Interchangeable "decrement by one if positive" algorithms.

mod direct;
mod locked;
mod unsynchronized;
mod watched;

use std::fmt;
use std::str::FromStr;

pub use direct::DirectTransactionStrategy;
pub use locked::LockedSettings;
pub use locked::LockedStrategy;
pub use unsynchronized::UnsynchronizedStrategy;
pub use watched::WatchedTransactionStrategy;

use crate::error::SpikeResult;

/// Selects a decrement algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyId {
    /// Read then write, no coordination. Loses updates under contention.
    Unsynchronized,
    /// Read-check-write inside the distributed lock.
    DistributedLock,
    /// WATCH/MULTI/EXEC through the shared client template.
    WatchedTransaction,
    /// WATCH/MULTI/EXEC driven by hand on a dedicated connection.
    DirectTransaction,
}

impl StrategyId {
    pub const ALL: [StrategyId; 4] = [
        StrategyId::Unsynchronized,
        StrategyId::DistributedLock,
        StrategyId::WatchedTransaction,
        StrategyId::DirectTransaction,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StrategyId::Unsynchronized => "unsynchronized",
            StrategyId::DistributedLock => "distributed-lock",
            StrategyId::WatchedTransaction => "watched-transaction",
            StrategyId::DirectTransaction => "direct-transaction",
        }
    }

    /// The HTTP endpoint this strategy was historically served on.
    pub fn endpoint(&self) -> &'static str {
        match self {
            StrategyId::Unsynchronized => "reduceSku",
            StrategyId::DistributedLock => "reduceSku4",
            StrategyId::WatchedTransaction => "reduceSku2",
            StrategyId::DirectTransaction => "reduceSku3",
        }
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StrategyId {
    type Err = anyhow::Error;

    /// Accepts the strategy name, the endpoint name, or the proto enum name,
    /// case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        StrategyId::ALL
            .into_iter()
            .find(|id| wanted == id.name() || wanted == id.endpoint().to_ascii_lowercase())
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Invalid strategy: {}. Valid options: unsynchronized (reduceSku), distributed-lock (reduceSku4), watched-transaction (reduceSku2), direct-transaction (reduceSku3)",
                    s
                )
            })
    }
}

/// Result of one decrement attempt that did not fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecrementOutcome {
    Success { remaining: u64 },
    /// Stock was zero when the attempt decided; nothing was written.
    InsufficientStock,
    /// An optimistic commit aborted; the caller may retry.
    ConcurrentModification,
    /// The lock could not be obtained within the wait timeout.
    LockTimeout,
}

impl DecrementOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DecrementOutcome::Success { .. })
    }
}

/// A decrement algorithm bound to one counter.
pub trait DecrementStrategy {
    fn id(&self) -> StrategyId;

    /// One attempt. No internal retry.
    fn apply(&self) -> impl std::future::Future<Output = SpikeResult<DecrementOutcome>>;
}

/// Shared read-check-write step. Returns the new value, or `None` if there
/// is nothing left to take.
pub(crate) fn decremented(stock: u64) -> Option<u64> {
    stock.checked_sub(1)
}
