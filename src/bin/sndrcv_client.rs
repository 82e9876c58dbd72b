use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use sndrcv::cli::{self, CommonArgs};
use sndrcv::{Deadline, TcpTransport, run_clients};

/// Launch one RPC client per instance against a matching sndrcv_server.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Params {
    /// Number of client instances.
    instances: usize,

    /// Local address template with one %d, e.g. tcp://10.0.0.1:%d
    local: String,

    /// Server address template with one %d.
    remote: String,

    #[command(flatten)]
    common: CommonArgs,
}

fn main() -> Result<()> {
    cli::init_tracing();
    let params = Params::parse();

    let config = params
        .common
        .resolve(params.instances, params.local, Some(params.remote))
        .context("invalid client configuration")?;
    info!(
        "main: {} instances, {} rpcs each, {:?} sends",
        config.instances, config.count, config.send_mode
    );

    let deadline = Deadline::after(config.timeout());
    let reports = run_clients::<TcpTransport>(&config, deadline)?;

    for report in &reports {
        anyhow::ensure!(
            report.round_trips_hold(),
            "instance {} got mismatched replies",
            report.instance
        );
        info!(
            "main: instance {}: {} rpcs in {:?} ({} nsec/rpc, peak {} in flight)",
            report.instance,
            report.calls,
            report.elapsed,
            report.mean_per_call().as_nanos(),
            report.peak_in_flight
        );
    }
    info!("main: exiting");
    Ok(())
}
