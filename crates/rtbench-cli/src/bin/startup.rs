//! # rtbench-startup
//!
//! Measures the time from a create request to the first HTTP request made
//! by code running inside the container.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Context;

use rtbench_cli::output::{Metric, write_result};
use rtbench_cli::server::CallbackServer;
use rtbench_cli::startup::{MeasurementState, StartupBenchmark};
use rtbench_cli::{fatal, flags, init_tracing};
use rtbench_common::config::Config;
use rtbench_common::constants::{CALLBACK_PORT, SUPERVISOR_NAMESPACE};
use rtbench_runtime::lifecycle::Lifecycle;

#[tokio::main]
async fn main() {
    init_tracing();
    let config = flags::parse_flags();

    if let Err(e) = run(&config).await {
        fatal(&e);
    }
}

async fn run(config: &Config) -> anyhow::Result<()> {
    let state = Arc::new(MeasurementState::default());
    let server = CallbackServer::bind(
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, CALLBACK_PORT)),
        Arc::clone(&state),
    )
    .await
    .context("failed to start callback server")?;

    let lifecycle = Lifecycle::connect(&config.address, SUPERVISOR_NAMESPACE)
        .await
        .context("failed to connect to containerd")?;
    let image = lifecycle
        .pull_image(&config.image, &config.snapshotter)
        .await
        .with_context(|| format!("failed to pull {}", config.image))?;

    let samples = StartupBenchmark::new(&lifecycle, config, state)
        .run(&image)
        .await
        .context("startup benchmark failed")?;

    let path = write_result(&config.results_dir, Metric::Startup, config, &samples)
        .context("failed to write results")?;
    tracing::info!(path = %path.display(), "results written");

    server
        .shutdown()
        .await
        .context("could not shut down callback server")?;
    Ok(())
}
