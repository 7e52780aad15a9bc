// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

use anyhow::Result;
use clap::Parser;
use fbinit::FacebookInit;
use spike_core::server_lib::CommonServerArgs;

#[derive(Parser, Debug)]
#[clap(name = "spike_server", about = "Flash-sale stock decrement gRPC service")]
struct Args {
    #[clap(flatten)]
    common: CommonServerArgs,
}

#[fbinit::main]
fn main(fb: FacebookInit) -> Result<()> {
    spike_core::server_lib::init_logging()?;

    let args = Args::parse();
    spike_core::server_lib::run_server(fb, &args.common)
}
