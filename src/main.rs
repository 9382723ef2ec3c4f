//! chatbench: a chat-server benchmarking harness.
//!
//! Serves simulated chat clients over TCP under three interchangeable
//! concurrency strategies and compares their throughput, loss rate, and
//! resource usage:
//! - `iterative`: single control loop, one connection at a time
//! - `threading`: one worker task per connection under a concurrency cap
//! - `forking`: one OS process per connection
//!
//! Configuration via CLI arguments or TOML file; results land in a JSON
//! artifact plus a periodically refreshed live-throughput file.

mod archive;
mod config;
mod dispatch;
mod harness;
mod metrics;
mod pool;
mod protocol;
mod queue;
mod report;
mod server;
mod session;

use clap::Parser;
use config::{CliArgs, Config};
use harness::SimulationHarness;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = CliArgs::parse();

    // Forked-strategy child: stdout carries the session report, so logging
    // must go to stderr.
    if let Some(fd) = cli.child_fd {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();

        let server = cli.child_server.as_deref().unwrap_or("Server_?");
        let client = cli.child_client.as_deref().unwrap_or("Client_?");
        let read_timeout = Duration::from_secs(cli.child_read_timeout.unwrap_or(5));
        return dispatch::run_child(fd, server, client, read_timeout);
    }

    let config = Config::from_cli(cli)?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        strategy = config.strategy.label(),
        servers = config.num_servers,
        clients = config.num_clients,
        host = %config.host,
        base_port = config.base_port,
        max_concurrency = config.max_concurrency,
        duration_secs = config.duration_seconds,
        "Starting chatbench"
    );

    let runtime = tokio::runtime::Runtime::new()?;
    let report = runtime.block_on(SimulationHarness::new(config).run())?;
    info!(status = ?report.status, "Benchmark finished");
    Ok(())
}
