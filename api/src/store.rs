// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

//! Remote key-value store API
//!
//! Models the subset of a Redis-style store the decrement strategies rely on:
//! plain `GET`/`SET` through a shared client, and per-connection optimistic
//! transactions (`WATCH` / `MULTI` / queued ops / `EXEC` / `DISCARD` / `UNWATCH`).
//!
//! Watch state is scoped to a [`Connection`]; two connections never observe
//! each other's watched keys or queued operations.

use thiserror::Error;

/// Error type for remote store operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("connection closed")]
    ConnectionClosed,
}

/// Result type alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// An operation queued between `MULTI` and `EXEC`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueuedOp {
    Get { key: String },
    Set { key: String, value: String },
}

impl QueuedOp {
    pub fn get(key: impl Into<String>) -> Self {
        Self::Get { key: key.into() }
    }

    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Reply to a single queued operation, in queue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Nil,
    Value(String),
    Ok,
}

/// Result of `EXEC`.
///
/// `Aborted` means a watched key was written after it was watched; nothing in
/// the queue was applied. It is the store telling the client, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    Committed(Vec<Reply>),
    Aborted,
}

impl ExecOutcome {
    /// An empty reply list is treated like an abort.
    pub fn is_committed(&self) -> bool {
        matches!(self, ExecOutcome::Committed(replies) if !replies.is_empty())
    }
}

/// Shared client for a remote key-value store.
///
/// Implementations are cheap handles; clones talk to the same store.
pub trait KeyValueStore {
    type Connection: Connection + 'static;

    /// Read the string value at `key`, or `None` if absent.
    fn get(&self, key: &str) -> impl std::future::Future<Output = StoreResult<Option<String>>>;

    /// Unconditionally write `value` at `key`.
    fn set(&self, key: &str, value: String) -> impl std::future::Future<Output = StoreResult<()>>;

    /// Open a dedicated connection carrying its own watch/transaction state.
    fn connect(&self) -> impl std::future::Future<Output = StoreResult<Self::Connection>>;
}

/// A dedicated store connection.
///
/// Mirrors Redis connection semantics:
/// - `watch` is rejected inside `MULTI`
/// - `queue`, `exec` and `discard` require an open `MULTI`
/// - `exec` and `discard` always clear the watch set
pub trait Connection {
    fn watch(&mut self, key: &str) -> impl std::future::Future<Output = StoreResult<()>>;

    fn unwatch(&mut self) -> impl std::future::Future<Output = StoreResult<()>>;

    /// Immediate read outside of a transaction.
    fn get(&mut self, key: &str) -> impl std::future::Future<Output = StoreResult<Option<String>>>;

    fn multi(&mut self) -> impl std::future::Future<Output = StoreResult<()>>;

    /// Queue an operation inside `MULTI`. Nothing is applied until `exec`.
    fn queue(&mut self, op: QueuedOp) -> impl std::future::Future<Output = StoreResult<()>>;

    fn exec(&mut self) -> impl std::future::Future<Output = StoreResult<ExecOutcome>>;

    fn discard(&mut self) -> impl std::future::Future<Output = StoreResult<()>>;
}
