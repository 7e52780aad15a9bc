// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

//! Simple in-memory model of the remote store.
//!
//! This is meant for testing and demo purposes.
//! It models the store's command semantics (GET/SET, per-connection
//! WATCH/MULTI/EXEC, lease locks) on a shared in-memory object.
//! It is not meant for distributed / production use.

mod channeled_store;
mod in_memory_store;
mod in_memory_store_state;

pub use channeled_store::ChanneledStore;
pub use channeled_store::ChanneledStoreBackend;
pub use channeled_store::ChanneledConnection;
pub use in_memory_store::InMemoryConnection;
pub use in_memory_store::InMemoryStore;
pub use in_memory_store_state::InMemoryStoreState;
pub use in_memory_store_state::SessionId;
pub use in_memory_store_state::StoreStats;
