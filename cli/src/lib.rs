// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

//! Spike CLI shared library
//!
//! Provides the commands and helpers for driving a spike server over gRPC.

use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::io::stderr;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;
use futures::future::join_all;
use spike_core::Spike;
use spike_core::StrategyId;
use spike_core::client::SpikeClient;
use spike_proto_rust::spike::*;
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::info;
use tracing::warn;
use tracing_glog::Glog;
use tracing_glog::GlogFields;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Registry;
use tracing_subscriber::layer::SubscriberExt;

/// Common CLI arguments shared by all spike CLI variants.
/// Use `#[clap(flatten)]` to embed these in your binary's `Args` struct.
#[derive(clap::Args, Debug)]
pub struct CommonArgs {
    /// host:port of the spike server (e.g., "localhost:9999")
    #[clap(long, env = "SPIKE_HOST", default_value = "localhost:9999")]
    pub host: String,

    /// Connection attempts before giving up
    #[clap(long, default_value = "3")]
    pub connect_attempts: usize,

    #[clap(subcommand)]
    pub command: Commands,
}

impl CommonArgs {
    /// Connect to the spike server, retrying with exponential backoff.
    pub async fn connect_grpc(&self) -> Result<SpikeClient> {
        let endpoint = format!("http://{}", self.host);
        info!(host = %self.host, "Connecting to spike server at {}", self.host);

        let retry_strategy = ExponentialBackoff::from_millis(100)
            .max_delay(Duration::from_secs(2))
            .take(self.connect_attempts.saturating_sub(1));

        Retry::spawn(retry_strategy, || async {
            SpikeClient::connect(endpoint.clone()).await.inspect_err(|e| {
                warn!(error = %e, host = %self.host, "Connection attempt failed");
            })
        })
        .await
        .context("Failed to create spike gRPC client")
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Set the stock and reset the success count
    Init {
        #[clap(value_name = "STOCK")]
        stock: u64,
    },
    /// Show the current stock and success count
    Status,
    /// Attempt one decrement
    Reduce {
        /// unsynchronized, distributed-lock, watched-transaction or direct-transaction
        #[clap(value_name = "STRATEGY")]
        strategy: StrategyId,
    },
    /// Fire concurrent decrements and summarize the outcomes
    Burst {
        #[clap(value_name = "STRATEGY")]
        strategy: StrategyId,

        /// Number of concurrent requests
        #[clap(short = 'n', long, default_value = "50")]
        requests: usize,
    },
}

/// Run the CLI command against any `Spike` implementation.
pub async fn run(spike: &impl Spike, command: Commands) -> Result<()> {
    match command {
        Commands::Init { stock } => init_stock(spike, stock).await,
        Commands::Status => show_status(spike).await,
        Commands::Reduce { strategy } => reduce_once(spike, strategy).await,
        Commands::Burst { strategy, requests } => burst(spike, strategy, requests).await,
    }
}

async fn init_stock(spike: &impl Spike, stock: u64) -> Result<()> {
    info!(stock = stock, "Initializing stock");
    let response = spike
        .init_sku(InitSkuRequest { stock })
        .await
        .context("Failed to initialize stock")?;

    println!("{} {}", "✓".bright_green(), response.message);
    Ok(())
}

async fn show_status(spike: &impl Spike) -> Result<()> {
    let response = spike
        .success_num(SuccessNumRequest {})
        .await
        .context("Failed to fetch status")?;

    match response.stock {
        Some(stock) => println!("Stock:     {}", stock.to_string().bright_cyan()),
        None => println!("Stock:     {}", "uninitialized".yellow()),
    }
    println!("Successes: {}", response.success_count);
    Ok(())
}

async fn reduce_once(spike: &impl Spike, strategy: StrategyId) -> Result<()> {
    let response = spike
        .reduce_sku(reduce_request(strategy))
        .await
        .with_context(|| format!("Failed to reduce stock via {}", strategy))?;

    println!(
        "{} {} (successes: {})",
        outcome_tag(response.outcome()),
        response.message,
        response.success_count
    );
    Ok(())
}

async fn burst(spike: &impl Spike, strategy: StrategyId, requests: usize) -> Result<()> {
    info!(strategy = %strategy, requests = requests, "Starting burst");
    let results = join_all((0..requests).map(|_| spike.reduce_sku(reduce_request(strategy)))).await;
    let summary = BurstSummary::from_results(&results);

    println!("Strategy: {} ({} requests)", strategy, requests);
    for (outcome, count) in &summary.outcomes {
        println!("  {:<26} {}", outcome_tag(*outcome), count);
    }
    if summary.errors > 0 {
        println!("  {:<26} {}", "ERROR".red(), summary.errors);
    }

    let status = spike
        .success_num(SuccessNumRequest {})
        .await
        .context("Failed to fetch status after burst")?;
    let stock = status
        .stock
        .map_or_else(|| "uninitialized".to_string(), |stock| stock.to_string());
    println!("Stock after burst: {}, successes: {}", stock, status.success_count);
    Ok(())
}

fn reduce_request(strategy: StrategyId) -> ReduceSkuRequest {
    ReduceSkuRequest {
        strategy: Strategy::from(strategy) as i32,
    }
}

fn outcome_tag(outcome: Outcome) -> colored::ColoredString {
    match outcome {
        Outcome::Success => "SUCCESS".bright_green(),
        Outcome::InsufficientStock => "INSUFFICIENT_STOCK".yellow(),
        Outcome::ConcurrentModification => "CONCURRENT_MODIFICATION".magenta(),
        Outcome::LockTimeout => "LOCK_TIMEOUT".red(),
        Outcome::Unspecified => "UNSPECIFIED".white(),
    }
}

/// Per-outcome counts of a burst.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BurstSummary {
    pub outcomes: BTreeMap<Outcome, usize>,
    pub errors: usize,
}

impl BurstSummary {
    pub fn from_results(results: &[Result<ReduceSkuResponse>]) -> Self {
        let mut summary = Self::default();
        for result in results {
            match result {
                Ok(response) => *summary.outcomes.entry(response.outcome()).or_default() += 1,
                Err(_) => summary.errors += 1,
            }
        }
        summary
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }
}

/// Initialize logging with glog format
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
