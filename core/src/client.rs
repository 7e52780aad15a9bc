// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

//! Spike client wrapper that implements the Spike trait
//!
//! Lets the CLI and the integration tests drive a remote server through the
//! same interface as an in-process `SpikeService`.

use anyhow::Result;
use spike_proto_rust::spike::InitSkuRequest;
use spike_proto_rust::spike::InitSkuResponse;
use spike_proto_rust::spike::ReduceSkuRequest;
use spike_proto_rust::spike::ReduceSkuResponse;
use spike_proto_rust::spike::SuccessNumRequest;
use spike_proto_rust::spike::SuccessNumResponse;
use spike_proto_rust::spike::spike_service_client::SpikeServiceClient;
use tonic::transport::Channel;
use tracing::warn;

use crate::service::Spike;

/// Wrapper around a gRPC SpikeService client that implements the Spike trait
///
/// # Example
/// ```ignore
/// let client = SpikeClient::connect("http://[::1]:9999").await?;
/// client.init_sku(InitSkuRequest { stock: 5 }).await?;
/// ```
#[derive(Clone)]
pub struct SpikeClient {
    /// The gRPC client that talks to the remote spike service
    client: SpikeServiceClient<Channel>,
}

impl SpikeClient {
    /// Create a new SpikeClient wrapping a gRPC channel
    pub fn new(channel: Channel) -> Self {
        Self {
            client: SpikeServiceClient::new(channel),
        }
    }

    /// Create a new SpikeClient by connecting to a host:port
    pub async fn connect(addr: impl Into<String>) -> Result<Self> {
        let channel = Channel::from_shared(addr.into())?.connect().await?;
        Ok(Self::new(channel))
    }
}

impl Spike for SpikeClient {
    async fn init_sku(&self, request: InitSkuRequest) -> Result<InitSkuResponse> {
        // Clone the client to get a mutable reference
        let mut client = self.client.clone();
        let stock = request.stock;

        let response = client.init_sku(request).await.map_err(|e| {
            warn!(error = ?e, stock = stock, "gRPC client init_sku failed");
            anyhow::anyhow!("gRPC client init_sku error: {}", e)
        })?;

        Ok(response.into_inner())
    }

    async fn success_num(&self, request: SuccessNumRequest) -> Result<SuccessNumResponse> {
        let mut client = self.client.clone();

        let response = client.success_num(request).await.map_err(|e| {
            warn!(error = ?e, "gRPC client success_num failed");
            anyhow::anyhow!("gRPC client success_num error: {}", e)
        })?;

        Ok(response.into_inner())
    }

    async fn reduce_sku(&self, request: ReduceSkuRequest) -> Result<ReduceSkuResponse> {
        let mut client = self.client.clone();
        let strategy = request.strategy;

        let response = client.reduce_sku(request).await.map_err(|e| {
            warn!(error = ?e, strategy = strategy, "gRPC client reduce_sku failed");
            anyhow::anyhow!("gRPC client reduce_sku error: {}", e)
        })?;

        Ok(response.into_inner())
    }
}
