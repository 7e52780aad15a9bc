// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

//! OSS integration tests (eg. DynamoDB integration tests)

mod dynamo;

use dynamo::fixtures::DynamoStoreFixture;
use spike_tests::integration_tests;
use spike_tests::store_integration_tests;

#[rustfmt::skip]
mod tests {
use super::*;

// =============================================================================
// Store, lock and strategy tests
// =============================================================================

store_integration_tests!(DynamoStoreFixture, dynamo);

// =============================================================================
// Spike service tests
// =============================================================================

integration_tests!(DynamoStoreFixture, dynamo, local_integration_test);
}
