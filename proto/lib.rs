// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

//! Generated gRPC types for the spike service.

pub mod spike {
    tonic::include_proto!("spike");
}
