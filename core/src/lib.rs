// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

// Module declarations
pub mod client;
pub mod counter;
pub mod error;
pub mod lock;
pub mod server_lib;
pub mod service;
pub mod strategy;
pub mod timed_store;
pub mod transaction;

// Re-exports from spike_api
// Re-exports from proto
use anyhow::Result as AnyhowResult;
use async_trait::async_trait;
pub use error::SpikeError;
pub use error::SpikeResult;
use fbinit::FacebookInit;
pub use service::Spike;
pub use service::SpikeConfig;
pub use service::SpikeService;
pub use service::strategy_from_wire;
pub use spike_api::Environment;
pub use spike_api::RealEnvironment;
pub use spike_proto_rust::spike::spike_service_server::SpikeService as SpikeServiceTrait;
pub use spike_proto_rust::spike::spike_service_server::SpikeServiceServer;
pub use spike_proto_rust::spike::*;
pub use strategy::DecrementOutcome;
pub use strategy::StrategyId;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::oneshot;
use tonic::Request;
use tonic::Response;
use tonic::Status;

type Call<Req, Resp> = (Req, oneshot::Sender<AnyhowResult<Resp>>);

//This is a thread-safe gRPC handler;
//Internally, it uses channels to communicate with a single-threaded Spike implementation.

#[derive(Clone)]
pub struct SpikeHandler {
    _fb: FacebookInit,
    init_tx: UnboundedSender<Call<InitSkuRequest, InitSkuResponse>>,
    status_tx: UnboundedSender<Call<SuccessNumRequest, SuccessNumResponse>>,
    reduce_tx: UnboundedSender<Call<ReduceSkuRequest, ReduceSkuResponse>>,
}

impl SpikeHandler {
    /// Create a handler with a custom factory function
    /// The factory function will be called on a dedicated thread to create the Spike implementation;
    /// its future runs on that thread's LocalSet, so it may spawn local tasks (e.g. a store backend)
    pub fn new<F, Fut, T>(fb: FacebookInit, factory: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = AnyhowResult<T>> + 'static,
        T: Spike + 'static,
    {
        let (init_tx, init_rx) = unbounded_channel();
        let (status_tx, status_rx) = unbounded_channel();
        let (reduce_tx, reduce_rx) = unbounded_channel();

        // The implementation is not Send, so it lives on a dedicated thread with a
        // single-threaded runtime. If the thread dies, client RPCs fail with
        // "worker thread terminated".
        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::error!(error = ?e, "Failed to create tokio runtime for worker");
                    return;
                }
            };

            // LocalSet lets every request, the lock watchdogs and background
            // releases run as local tasks.
            let local = tokio::task::LocalSet::new();
            local.block_on(&rt, async move {
                match factory().await {
                    Ok(spike) => Self::run_worker(spike, init_rx, status_rx, reduce_rx).await,
                    Err(e) => tracing::error!(error = ?e, "Failed to create spike service"),
                }
            });
        });

        Self {
            _fb: fb,
            init_tx,
            status_tx,
            reduce_tx,
        }
    }

    /// Worker task that processes messages from all channels.
    ///
    /// Each request runs as its own local task so concurrent requests
    /// interleave at store round-trips.
    async fn run_worker<T: Spike + 'static>(
        spike: T,
        mut init_rx: UnboundedReceiver<Call<InitSkuRequest, InitSkuResponse>>,
        mut status_rx: UnboundedReceiver<Call<SuccessNumRequest, SuccessNumResponse>>,
        mut reduce_rx: UnboundedReceiver<Call<ReduceSkuRequest, ReduceSkuResponse>>,
    ) {
        let spike = std::rc::Rc::new(spike);
        loop {
            let spike = spike.clone();
            tokio::select! {
                Some((request, response_tx)) = init_rx.recv() => {
                    tokio::task::spawn_local(async move {
                        // Ignore send errors - client may have disconnected/timed out
                        let _ = response_tx.send(spike.init_sku(request).await);
                    });
                }
                Some((request, response_tx)) = status_rx.recv() => {
                    tokio::task::spawn_local(async move {
                        let _ = response_tx.send(spike.success_num(request).await);
                    });
                }
                Some((request, response_tx)) = reduce_rx.recv() => {
                    tokio::task::spawn_local(async move {
                        let _ = response_tx.send(spike.reduce_sku(request).await);
                    });
                }
                else => break,
            }
        }
    }

    /// Helper to handle channel-based RPC call
    async fn channel_call<Req, Resp>(
        tx: &UnboundedSender<Call<Req, Resp>>,
        request: Req,
        method_name: &'static str,
    ) -> Result<Resp, Status> {
        let (response_tx, response_rx) = oneshot::channel();

        tx.send((request, response_tx))
            .map_err(|_| Status::internal(format!("{}: worker thread terminated", method_name)))?;

        response_rx
            .await
            .map_err(|_| Status::internal(format!("{}: worker thread terminated", method_name)))?
            .map_err(|e| error_to_status(method_name, e))
    }
}

/// Map service faults to gRPC codes.
pub fn error_to_status(method_name: &str, err: anyhow::Error) -> Status {
    let message = format!("{}: {:#}", method_name, err);
    match err.downcast_ref::<SpikeError>() {
        Some(SpikeError::StoreUnavailable(_)) => Status::unavailable(message),
        Some(SpikeError::CounterMissing(_)) | Some(SpikeError::CorruptCounter { .. }) => {
            Status::failed_precondition(message)
        }
        Some(SpikeError::ProtocolViolation(_)) | None => Status::internal(message),
    }
}

#[async_trait]
impl SpikeServiceTrait for SpikeHandler {
    async fn init_sku(
        &self,
        request: Request<InitSkuRequest>,
    ) -> Result<Response<InitSkuResponse>, Status> {
        let response = Self::channel_call(&self.init_tx, request.into_inner(), "init_sku").await?;
        Ok(Response::new(response))
    }

    async fn success_num(
        &self,
        request: Request<SuccessNumRequest>,
    ) -> Result<Response<SuccessNumResponse>, Status> {
        let response =
            Self::channel_call(&self.status_tx, request.into_inner(), "success_num").await?;
        Ok(Response::new(response))
    }

    async fn reduce_sku(
        &self,
        request: Request<ReduceSkuRequest>,
    ) -> Result<Response<ReduceSkuResponse>, Status> {
        let request = request.into_inner();
        strategy_from_wire(request.strategy)
            .map_err(|e| Status::invalid_argument(format!("reduce_sku: {}", e)))?;
        let response = Self::channel_call(&self.reduce_tx, request, "reduce_sku").await?;
        Ok(Response::new(response))
    }
}
