//! Multi-instance RPC send/receive benchmark.
//!
//! Each instance pairs one client thread with one server thread over its own
//! transport context; see [`client::run_clients`] and [`server::run_servers`].

/// Per-call log line: `info` normally, `debug` when the run is quiet.
macro_rules! per_call {
    ($quiet:expr, $($arg:tt)+) => {
        if $quiet {
            tracing::debug!($($arg)+)
        } else {
            tracing::info!($($arg)+)
        }
    };
}

pub mod cli;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod instance_set;
pub mod server;
pub mod transport;

pub use client::{ClientInstance, ClientReport, Exchange, run_clients};
pub use config::{BenchConfig, Deadline, InstanceConfig, Role, SendMode};
pub use error::{BenchError, TransportError};
pub use server::{ServerInstance, ServerReport, answer, run_servers};
pub use transport::{Context, TcpTransport, Transport};
