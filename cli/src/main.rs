// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

//! Spike CLI - Command-line tool for driving a spike server via gRPC

use anyhow::Result;
use clap::Parser;
use fbinit::FacebookInit;
use spike_cli_lib::CommonArgs;

/// Spike CLI - initialize stock, inspect it, and fire decrements
#[derive(Parser, Debug)]
#[clap(name = "spike", about = "Spike command-line interface")]
struct Args {
    #[clap(flatten)]
    common: CommonArgs,
}

#[fbinit::main]
async fn main(_fb: FacebookInit) -> Result<()> {
    spike_cli_lib::init_logging()?;

    let args = Args::parse();
    let client = args.common.connect_grpc().await?;

    spike_cli_lib::run(&client, args.common.command).await
}
