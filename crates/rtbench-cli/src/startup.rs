//! Startup latency driver.
//!
//! Each iteration marks a start time, creates a container whose only job
//! is an HTTP request back to the harness, and tears it down once the
//! request has been made. The callback handler records the elapsed time.
//!
//! The driver does not wait for the callback itself. The start mark of
//! iteration `i + 1` is only written after iteration `i` has been torn
//! down, and the task only exits after its request completed, so every
//! received callback is attributed to its own iteration. A callback that
//! never arrives is logged and leaves no sample.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use rtbench_common::config::Config;
use rtbench_common::constants::{CALLBACK_PORT, CALLBACK_ROUTE};
use rtbench_common::error::Result;
use rtbench_common::types::ContainerId;
use rtbench_runtime::lifecycle::Lifecycle;
use rtbench_runtime::supervisor::Image;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Start mark and recorded samples, shared with the callback handler.
#[derive(Debug, Default)]
pub struct MeasurementState {
    start: Mutex<Option<Instant>>,
    samples: Mutex<Vec<Duration>>,
}

impl MeasurementState {
    /// Sets the start mark to now.
    pub fn mark_start(&self) {
        *lock(&self.start) = Some(Instant::now());
    }

    /// Records the time elapsed since the start mark.
    ///
    /// Returns `None`, recording nothing, if no start was marked yet.
    pub fn record(&self) -> Option<Duration> {
        let elapsed = (*lock(&self.start))?.elapsed();
        lock(&self.samples).push(elapsed);
        Some(elapsed)
    }

    /// Samples recorded so far, in arrival order.
    #[must_use]
    pub fn samples(&self) -> Vec<Duration> {
        lock(&self.samples).clone()
    }

    /// Number of samples recorded so far.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.samples).len()
    }

    /// Whether no sample was recorded yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Measures create-to-callback latency, one container per iteration.
pub struct StartupBenchmark<'a> {
    lifecycle: &'a Lifecycle,
    config: &'a Config,
    state: Arc<MeasurementState>,
    callback_port: u16,
}

impl<'a> StartupBenchmark<'a> {
    /// Creates a driver recording into `state`, which must be shared with
    /// a running [`CallbackServer`](crate::server::CallbackServer).
    #[must_use]
    pub const fn new(lifecycle: &'a Lifecycle, config: &'a Config, state: Arc<MeasurementState>) -> Self {
        Self {
            lifecycle,
            config,
            state,
            callback_port: CALLBACK_PORT,
        }
    }

    /// Overrides the port containers call back on.
    #[must_use]
    pub const fn with_callback_port(mut self, port: u16) -> Self {
        self.callback_port = port;
        self
    }

    /// Argv of a container that reports its startup to the harness.
    #[must_use]
    pub fn callback_args(&self) -> Vec<String> {
        vec![
            "/bin/sh".to_owned(),
            "-c".to_owned(),
            format!(
                "wget -q http://{}:{}{CALLBACK_ROUTE}",
                self.config.network_gateway, self.callback_port
            ),
        ]
    }

    /// Runs every iteration and returns the recorded samples.
    ///
    /// # Errors
    ///
    /// Returns the first lifecycle error.
    pub async fn run(&self, image: &Image) -> Result<Vec<Duration>> {
        let args = self.callback_args();

        for i in 0..self.config.iterations {
            let id = ContainerId::new(format!("container-{i}"));
            let before = self.state.len();

            self.state.mark_start();
            tracing::info!(%id, "container start");

            let container = self
                .lifecycle
                .create_and_start(self.config, id.clone(), image, &args)
                .await?;
            tracing::debug!(%id, pid = container.pid(), "container task started");
            self.lifecycle.teardown(container, false).await?;

            if self.state.len() == before {
                tracing::warn!(%id, "no startup callback received");
            }
        }

        Ok(self.state.samples())
    }
}
