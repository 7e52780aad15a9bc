// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

//! Spike server shared library
//!
//! Argument parsing, logging and the gRPC service loop shared by the server
//! binary and the end-to-end tests.

use std::io::IsTerminal;
use std::io::stderr;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use fbinit::FacebookInit;
use futures::StreamExt;
use rand::distributions::Uniform;
use signal_hook::consts::signal::SIGINT;
use signal_hook::consts::signal::SIGTERM;
use signal_hook_tokio::Signals;
use spike_dynamodb::DynamoStore;
use spike_memory::ChanneledStore;
use spike_memory::InMemoryStore;
use tonic::Request;
use tracing::info;
use tracing_glog::Glog;
use tracing_glog::GlogFields;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Registry;
use tracing_subscriber::layer::SubscriberExt;

use crate::InitSkuRequest;
use crate::RealEnvironment;
use crate::SpikeConfig;
use crate::SpikeHandler;
use crate::SpikeService;
use crate::SpikeServiceServer;
use crate::SpikeServiceTrait;
use crate::lock::AcquireOptions;
use crate::lock::LockConfig;
use crate::strategy::LockedSettings;

/// Parsed store URL scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedStore {
    /// In-memory store (`memory://`)
    Memory,
    /// DynamoDB table (`dynamodb://TABLE`)
    Dynamo(String),
}

/// Parse a store URL into a known scheme.
pub fn parse_store_url(url: &str) -> Result<ParsedStore> {
    let (scheme, rest) = url
        .split_once("://")
        .ok_or_else(|| anyhow::anyhow!("Invalid URL '{}': expected <scheme>://...", url))?;
    match scheme {
        "memory" => Ok(ParsedStore::Memory),
        "dynamodb" if !rest.is_empty() => Ok(ParsedStore::Dynamo(rest.to_string())),
        "dynamodb" => Err(anyhow::anyhow!(
            "Invalid URL '{}': expected dynamodb://TABLE",
            url
        )),
        _ => Err(anyhow::anyhow!(
            "Unsupported URL '{}'. Supported schemes: memory://, dynamodb://",
            url
        )),
    }
}

/// Common server arguments shared by all spike server variants.
/// Use `#[clap(flatten)]` to embed these in your binary's `Args` struct.
#[derive(clap::Args, Debug, Clone)]
pub struct CommonServerArgs {
    /// Port to listen on for gRPC connections
    #[clap(short, long, env = "SPIKE_PORT", default_value = "9999")]
    pub port: u16,

    /// Store URL (memory:// or dynamodb://TABLE)
    #[clap(long, env = "SPIKE_STORE", default_value = "memory://")]
    pub store: String,

    /// Upper bound of the per-request latency injected into the memory store, in milliseconds
    #[clap(long, env = "SPIKE_STORE_LATENCY_MS", default_value = "0")]
    pub store_latency_ms: u64,

    /// Override the DynamoDB endpoint (e.g. http://localhost:8000 for DynamoDB Local)
    #[clap(long, env = "DYNAMODB_ENDPOINT")]
    pub dynamodb_endpoint: Option<String>,

    /// DynamoDB region
    #[clap(long, env = "AWS_REGION", default_value = "us-east-1")]
    pub dynamodb_region: String,

    /// Access key for DynamoDB
    #[clap(long, env = "AWS_ACCESS_KEY_ID", default_value = "dummy")]
    pub aws_access_key_id: String,

    /// Secret key for DynamoDB
    #[clap(long, env = "AWS_SECRET_ACCESS_KEY", default_value = "dummy", hide_env_values = true)]
    pub aws_secret_access_key: String,

    /// Store key of the stock counter
    #[clap(long, env = "SPIKE_SKU_KEY", default_value = "product_sku")]
    pub sku_key: String,

    /// Seed the counter with this stock at startup
    #[clap(long, env = "SPIKE_INITIAL_STOCK")]
    pub initial_stock: Option<u64>,

    /// Name of the distributed lock
    #[clap(long, env = "SPIKE_LOCK_NAME", default_value = "cauto")]
    pub lock_name: String,

    /// Give up waiting for the lock after this many milliseconds (default: wait forever)
    #[clap(long, env = "SPIKE_LOCK_WAIT_MS")]
    pub lock_wait_ms: Option<u64>,

    /// Explicit lock lease in milliseconds (default: watchdog-renewed lease)
    #[clap(long, env = "SPIKE_LOCK_LEASE_MS")]
    pub lock_lease_ms: Option<u64>,

    /// Watchdog lease window in milliseconds; renewed every third of it
    #[clap(long, env = "SPIKE_WATCHDOG_LEASE_MS", default_value = "30000")]
    pub watchdog_lease_ms: u64,

    /// Lock acquisitions per request by the same holder
    #[clap(long, env = "SPIKE_REENTRANT_DEPTH", default_value = "1")]
    pub reentrant_depth: u32,

    /// Time to stay in the critical section after the write, in milliseconds
    #[clap(long, env = "SPIKE_HOLD_DELAY_MS", default_value = "0")]
    pub hold_delay_ms: u64,

    /// Fail a store command after this many milliseconds; 0 waits forever
    #[clap(long, env = "SPIKE_STORE_TIMEOUT_MS", default_value = "5000")]
    pub store_timeout_ms: u64,
}

impl CommonServerArgs {
    /// Build and validate the service configuration.
    pub fn spike_config(&self) -> Result<SpikeConfig> {
        let config = SpikeConfig {
            sku_key: self.sku_key.clone(),
            locked: LockedSettings {
                lock_name: self.lock_name.clone(),
                options: AcquireOptions {
                    wait: self.lock_wait_ms.map(Duration::from_millis),
                    lease: self.lock_lease_ms.map(Duration::from_millis),
                },
                reentrant_depth: self.reentrant_depth,
                hold_delay: Duration::from_millis(self.hold_delay_ms),
            },
            lock_client: LockConfig {
                default_lease: Duration::from_millis(self.watchdog_lease_ms),
                ..LockConfig::default()
            },
            round_trip_timeout: (self.store_timeout_ms > 0)
                .then(|| Duration::from_millis(self.store_timeout_ms)),
        };
        config.validate().context("Invalid spike configuration")?;
        Ok(config)
    }

    fn dynamodb_client(&self) -> aws_sdk_dynamodb::Client {
        let mut builder = aws_sdk_dynamodb::config::Builder::new()
            .region(aws_sdk_dynamodb::config::Region::new(
                self.dynamodb_region.clone(),
            ))
            .credentials_provider(aws_sdk_dynamodb::config::Credentials::new(
                self.aws_access_key_id.clone(),
                self.aws_secret_access_key.clone(),
                None,
                None,
                "spike",
            ))
            .behavior_version_latest();
        if let Some(endpoint) = &self.dynamodb_endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        aws_sdk_dynamodb::Client::from_conf(builder.build())
    }
}

pub fn init_logging() -> Result<()> {
    let fmt = tracing_subscriber::fmt::Layer::default()
        .with_ansi(stderr().is_terminal())
        .with_writer(std::io::stderr)
        .event_format(Glog::default().with_timer(tracing_glog::LocalTime::default()))
        .fmt_fields(GlogFields::default());

    let filter = EnvFilter::from_default_env();

    let subscriber = Registry::default().with(filter).with(fmt);
    tracing::subscriber::set_global_default(subscriber).context("Failed to set global subscriber")
}

pub async fn run_grpc_service(handler: SpikeHandler, port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    let service = SpikeServiceServer::new(handler);

    let mut signals = Signals::new([SIGTERM, SIGINT])?;

    let server = tonic::transport::Server::builder()
        .add_service(service)
        .serve_with_shutdown(addr, async move {
            signals.next().await;
            info!("Shutting down...");
            signals.handle().close();
        });

    server.await?;
    Ok(())
}

/// Create the handler for the store selected by `args.store`.
///
/// The store is built on the handler's worker thread. The direct-transaction
/// strategy gets its own store handle.
pub fn create_handler(fb: FacebookInit, args: &CommonServerArgs) -> Result<SpikeHandler> {
    let config = args.spike_config()?;
    let handler = match parse_store_url(&args.store)? {
        ParsedStore::Memory if args.store_latency_ms > 0 => {
            let latency_ms = args.store_latency_ms;
            SpikeHandler::new(fb, move || async move {
                let env = Rc::new(RealEnvironment::new());
                let (store, backend) = ChanneledStore::new(
                    InMemoryStore::new(env.clone()),
                    Uniform::new_inclusive(0, latency_ms),
                    env.clone(),
                );
                tokio::task::spawn_local(backend.run());
                SpikeService::new(store.clone(), store, env, config)
            })
        }
        ParsedStore::Memory => SpikeHandler::new(fb, move || async move {
            let env = Rc::new(RealEnvironment::new());
            let store = InMemoryStore::new(env.clone());
            SpikeService::new(store.clone(), store, env, config)
        }),
        ParsedStore::Dynamo(table) => {
            let client = args.dynamodb_client();
            SpikeHandler::new(fb, move || async move {
                let env = Rc::new(RealEnvironment::new());
                let store = DynamoStore::new(client.clone(), table.clone()).await?;
                let direct = DynamoStore::new(client, table).await?;
                SpikeService::new(store, direct, env, config)
            })
        }
    };
    Ok(handler)
}

/// Run the spike server.
///
/// Seeds the counter when `--initial-stock` is given, then serves until
/// SIGINT/SIGTERM.
pub fn run_server(fb: FacebookInit, args: &CommonServerArgs) -> Result<()> {
    let handler = create_handler(fb, args)?;
    let runtime = tokio::runtime::Runtime::new()?;

    if let Some(stock) = args.initial_stock {
        let response = runtime
            .block_on(handler.init_sku(Request::new(InitSkuRequest { stock })))
            .map_err(|status| anyhow::anyhow!("Failed to seed stock: {}", status))?;
        info!(stock = response.get_ref().stock, "Seeded stock");
    }

    info!(
        port = args.port,
        store = %args.store,
        sku_key = %args.sku_key,
        lock_name = %args.lock_name,
        "Starting SpikeService gRPC service"
    );
    runtime.block_on(run_grpc_service(handler, args.port))
}
