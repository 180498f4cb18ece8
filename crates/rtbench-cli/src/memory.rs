//! Per-container memory footprint driver.
//!
//! Each iteration samples host memory, starts a batch of idle containers,
//! lets the runtime settle, samples again, and tears the batch down. The
//! iteration's sample is the memory delta divided by the batch size.

use std::time::Duration;

use rand::Rng;

use rtbench_common::config::Config;
use rtbench_common::constants::{MEMORY_BATCH_SIZE, MEMORY_SETTLE_DELAY, MEMORY_STABILISE_DELAY};
use rtbench_common::error::Result;
use rtbench_common::types::ContainerId;
use rtbench_core::meminfo::MemorySource;
use rtbench_runtime::lifecycle::Lifecycle;
use rtbench_runtime::supervisor::Image;

/// Measures steady-state memory per container.
pub struct MemoryBenchmark<'a, M> {
    lifecycle: &'a Lifecycle,
    config: &'a Config,
    memory: M,
    settle_delay: Duration,
    stabilise_delay: Duration,
}

impl<'a, M: MemorySource> MemoryBenchmark<'a, M> {
    /// Creates a driver sampling host memory from `memory`.
    #[must_use]
    pub const fn new(lifecycle: &'a Lifecycle, config: &'a Config, memory: M) -> Self {
        Self {
            lifecycle,
            config,
            memory,
            settle_delay: MEMORY_SETTLE_DELAY,
            stabilise_delay: MEMORY_STABILISE_DELAY,
        }
    }

    /// Overrides the pause before the first sample and the pause between
    /// creating the batch and the second sample.
    #[must_use]
    pub const fn with_delays(mut self, settle: Duration, stabilise: Duration) -> Self {
        self.settle_delay = settle;
        self.stabilise_delay = stabilise;
        self
    }

    /// Runs every iteration and returns one kB-per-container sample each.
    ///
    /// # Errors
    ///
    /// Returns the first lifecycle or memory sampling error.
    pub async fn run(&self, image: &Image) -> Result<Vec<f64>> {
        let iterations = self.config.iterations;
        let args = idle_args();
        let mut samples = Vec::with_capacity(iterations as usize);

        for i in 1..=iterations {
            tokio::time::sleep(self.settle_delay).await;
            let start_kb = self.memory.used_kb()?;
            tracing::info!(iteration = i, iterations, start_kb, "start memory usage");

            let mut containers = Vec::with_capacity(MEMORY_BATCH_SIZE);
            for j in 0..MEMORY_BATCH_SIZE {
                let container = self
                    .lifecycle
                    .create_and_start(self.config, batch_id(j), image, &args)
                    .await?;
                tracing::trace!(id = %container.id(), pid = container.pid(), "batch container started");
                containers.push(container);
            }

            tokio::time::sleep(self.stabilise_delay).await;
            let end_kb = self.memory.used_kb()?;
            tracing::info!(iteration = i, iterations, end_kb, "end memory usage");

            for container in containers {
                self.lifecycle.teardown(container, true).await?;
            }

            let sample = per_container_kb(start_kb, end_kb);
            tracing::info!(
                iteration = i,
                iterations,
                batch_kb = %(i128::from(end_kb) - i128::from(start_kb)),
                per_container_kb = sample,
                "memory usage of batch"
            );
            samples.push(sample);
        }

        if let Some(average) = mean(&samples) {
            tracing::info!(iterations, average_kb = average, "average memory usage per container");
        }
        Ok(samples)
    }
}

/// `container-<j>-<R>` with `R` drawn from `0..100000`.
fn batch_id(j: usize) -> ContainerId {
    let r: u32 = rand::thread_rng().gen_range(0..100_000);
    ContainerId::new(format!("container-{j}-{r}"))
}

fn idle_args() -> Vec<String> {
    vec![
        "/bin/sh".to_owned(),
        "-c".to_owned(),
        "sleep infinity".to_owned(),
    ]
}

/// Memory delta of one batch divided by the batch size, in kB.
///
/// Negative when the host used less memory after the batch started.
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn per_container_kb(start_kb: u64, end_kb: u64) -> f64 {
    (i128::from(end_kb) - i128::from(start_kb)) as f64 / MEMORY_BATCH_SIZE as f64
}

/// Arithmetic mean, or `None` for no samples.
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}
