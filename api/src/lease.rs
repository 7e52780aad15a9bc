// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

//! Lease-based lock primitive exposed by the remote store.
//!
//! This is the non-reentrant, non-blocking building block. Reentrancy,
//! blocking waits and automatic renewal are implemented client-side on top of it.

use std::fmt;
use std::time::Duration;

use crate::store::StoreResult;

/// Identity of a logical lock holder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HolderId(String);

impl HolderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HolderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Answer to a single acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseGrant {
    /// The caller now holds the lease for the requested duration.
    Acquired,
    /// Someone else holds an unexpired lease.
    Held {
        holder: HolderId,
        remaining: Duration,
    },
}

/// Remote lease store.
///
/// - `try_acquire` grants when the name is free, expired, or already leased
///   to the same holder (in which case the lease is refreshed)
/// - `renew` and `release` only succeed for the current, unexpired holder and
///   return `false` otherwise
pub trait LeaseStore {
    fn try_acquire(
        &self,
        name: &str,
        holder: &HolderId,
        lease: Duration,
    ) -> impl std::future::Future<Output = StoreResult<LeaseGrant>>;

    fn renew(
        &self,
        name: &str,
        holder: &HolderId,
        lease: Duration,
    ) -> impl std::future::Future<Output = StoreResult<bool>>;

    fn release(
        &self,
        name: &str,
        holder: &HolderId,
    ) -> impl std::future::Future<Output = StoreResult<bool>>;
}
