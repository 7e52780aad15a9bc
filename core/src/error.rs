// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

use spike_api::StoreError;
use thiserror::Error;

use crate::lock::LockError;

/// Faults of a single spike operation.
///
/// Business outcomes (insufficient stock, aborted commit, lock timeout) are
/// not errors; they are reported through `DecrementOutcome`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpikeError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("counter '{0}' has not been initialized")]
    CounterMissing(String),
    #[error("counter '{key}' holds '{value}', expected a non-negative integer")]
    CorruptCounter { key: String, value: String },
}

pub type SpikeResult<T> = std::result::Result<T, SpikeError>;

impl From<StoreError> for SpikeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => SpikeError::StoreUnavailable(reason),
            StoreError::ConnectionClosed => {
                SpikeError::StoreUnavailable("connection closed".to_string())
            }
            StoreError::Protocol(reason) => SpikeError::ProtocolViolation(reason),
        }
    }
}

impl From<LockError> for SpikeError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Store(err) => err.into(),
            other => SpikeError::ProtocolViolation(other.to_string()),
        }
    }
}
