// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

//! The stock counter and the process-local success counter.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use spike_api::KeyValueStore;

use crate::error::SpikeError;
use crate::error::SpikeResult;

/// Shared stock counter stored remotely as a decimal string.
///
/// No value is cached: every read goes to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counter {
    key: String,
}

impl Counter {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Interpret a raw store value. Absent and malformed values are faults,
    /// never zero.
    pub fn parse(&self, raw: Option<&str>) -> SpikeResult<u64> {
        let raw = raw.ok_or_else(|| SpikeError::CounterMissing(self.key.clone()))?;
        raw.parse::<u64>().map_err(|_| SpikeError::CorruptCounter {
            key: self.key.clone(),
            value: raw.to_string(),
        })
    }

    pub async fn read<S: KeyValueStore>(&self, store: &S) -> SpikeResult<u64> {
        let raw = store.get(&self.key).await?;
        self.parse(raw.as_deref())
    }

    /// Like `read`, but an uninitialized counter is `None`.
    pub async fn try_read<S: KeyValueStore>(&self, store: &S) -> SpikeResult<Option<u64>> {
        match store.get(&self.key).await? {
            Some(raw) => self.parse(Some(&raw)).map(Some),
            None => Ok(None),
        }
    }

    pub async fn write<S: KeyValueStore>(&self, store: &S, value: u64) -> SpikeResult<()> {
        store.set(&self.key, value.to_string()).await?;
        Ok(())
    }
}

/// Successful decrements since the last `initialize`.
#[derive(Debug, Default)]
pub struct SuccessCounter(AtomicU64);

impl SuccessCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the count after the increment.
    pub fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(0, Ordering::SeqCst);
    }
}
