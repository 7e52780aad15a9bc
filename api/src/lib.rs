// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

//! Spike API - Core traits and interfaces
//!
//! This crate defines the interfaces every store backend and the decrement core
//! agree on:
//! - `KeyValueStore` / `Connection`: GET/SET plus WATCH/MULTI/EXEC transactions
//! - `LeaseStore`: the remote lease primitive underneath the distributed lock
//! - `Environment` trait: Clock, randomness and task abstraction for testing

pub mod environment;
pub mod lease;
pub mod store;
pub mod validation;

// Re-export commonly used items
pub use environment::Clock;
pub use environment::Environment;
pub use environment::RealEnvironment;
pub use lease::HolderId;
pub use lease::LeaseGrant;
pub use lease::LeaseStore;
pub use store::Connection;
pub use store::ExecOutcome;
pub use store::KeyValueStore;
pub use store::QueuedOp;
pub use store::Reply;
pub use store::StoreError;
pub use store::StoreResult;
pub use validation::validate_key;
