//! # rtbench-memory
//!
//! Measures the steady-state host memory footprint of one container, in
//! batches of 50 idle containers per iteration.

use anyhow::Context;

use rtbench_cli::memory::MemoryBenchmark;
use rtbench_cli::output::{Metric, write_result};
use rtbench_cli::{fatal, flags, init_tracing};
use rtbench_common::config::Config;
use rtbench_common::constants::SUPERVISOR_NAMESPACE;
use rtbench_core::meminfo::ProcMeminfo;
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
    let lifecycle = Lifecycle::connect(&config.address, SUPERVISOR_NAMESPACE)
        .await
        .context("failed to connect to containerd")?;
    let image = lifecycle
        .pull_image(&config.image, &config.snapshotter)
        .await
        .with_context(|| format!("failed to pull {}", config.image))?;

    let samples = MemoryBenchmark::new(&lifecycle, config, ProcMeminfo::default())
        .run(&image)
        .await
        .context("memory benchmark failed")?;

    let path = write_result(&config.results_dir, Metric::Memory, config, &samples)
        .context("failed to write results")?;
    tracing::info!(path = %path.display(), "results written");
    Ok(())
}
