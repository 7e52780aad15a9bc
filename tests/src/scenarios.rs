// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

pub mod strategy_scenarios;

// Re-export run_test_* functions for use by the gen_test! macro
pub use lock_scenarios::*;
pub use service_scenarios::*;
pub use sim_only_scenarios::*;
pub use store_scenarios::*;
pub use strategy_scenarios::*;
