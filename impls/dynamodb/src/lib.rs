// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

//! DynamoDB-backed remote store.

mod dynamo_store;

pub use dynamo_store::DynamoConnection;
pub use dynamo_store::DynamoStore;
