use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use sndrcv::cli::{self, CommonArgs};
use sndrcv::{Deadline, TcpTransport, run_servers};

/// Serve one RPC method per instance until every expected call is answered.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Params {
    /// Number of server instances.
    instances: usize,

    /// Listen address template with one %d, e.g. tcp://10.0.0.2:%d
    local: String,

    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> Result<()> {
    cli::init_tracing();
    let params = Params::parse();

    let config = params
        .common
        .resolve(params.instances, params.local, None)
        .context("invalid server configuration")?;
    info!(
        "main: {} instances, expecting {} rpcs each",
        config.instances, config.count
    );

    let deadline = Deadline::after(config.timeout());
    let reports = run_servers::<TcpTransport>(&config, deadline)?;
    for report in &reports {
        info!(
            "main: instance {}: served {} rpcs in {:?}",
            report.instance, report.served, report.elapsed
        );
    }
    info!("main: exiting");
    Ok(())
}
