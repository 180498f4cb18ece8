//! # rtbench-cli
//!
//! Measurement drivers for the rtbench harness and the pieces they share:
//! flag parsing, the startup callback server, and result files.
//!
//! The two binaries, `rtbench-memory` and `rtbench-startup`, are thin
//! wrappers that wire these together and turn any error into a fatal exit.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod flags;
pub mod memory;
pub mod output;
pub mod server;
pub mod startup;

use tracing_subscriber::EnvFilter;

/// Installs the fmt subscriber, reading `RUST_LOG` and defaulting to `info`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Logs `err` with its cause chain and terminates the process with status 1.
pub fn fatal(err: &anyhow::Error) -> ! {
    tracing::error!("{err:#}");
    std::process::exit(1)
}
