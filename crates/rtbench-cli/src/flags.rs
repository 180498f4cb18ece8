//! Command-line flags shared by both measurement drivers.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;

use rtbench_common::config::Config;
use rtbench_common::constants;

/// Benchmark a container runtime through containerd.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Flags {
    /// Amount of benchmark iterations.
    #[arg(long, default_value_t = constants::DEFAULT_ITERATIONS,
          value_parser = clap::value_parser!(u32).range(1..))]
    pub iterations: u32,

    /// The runtime to run the benchmark for.
    #[arg(long, default_value = constants::DEFAULT_RUNTIME)]
    pub runtime: String,

    /// Additional metadata, e.g. '-firecracker' to indicate the VMM.
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub meta: String,

    /// The snapshotter to use. Firecracker usually needs 'devmapper'.
    #[arg(long, default_value = constants::DEFAULT_SNAPSHOTTER)]
    pub snapshotter: String,

    /// Gateway of the CNI network as seen from inside a container.
    #[arg(long, default_value_t = constants::DEFAULT_NETWORK_GATEWAY)]
    pub network_gateway: Ipv4Addr,

    /// containerd control socket.
    #[arg(long, default_value = constants::SUPERVISOR_SOCKET)]
    pub address: PathBuf,

    /// Image pulled and run in every container.
    #[arg(long, default_value = constants::BENCH_IMAGE)]
    pub image: String,

    /// Base directory for result files.
    #[arg(long, default_value = constants::RESULTS_DIR)]
    pub results_dir: PathBuf,
}

impl From<Flags> for Config {
    fn from(flags: Flags) -> Self {
        Self {
            iterations: flags.iterations,
            runtime: flags.runtime,
            runtime_meta: flags.meta,
            snapshotter: flags.snapshotter,
            network_gateway: flags.network_gateway,
            address: flags.address,
            image: flags.image,
            results_dir: flags.results_dir,
        }
    }
}

/// Parses the process arguments into a [`Config`].
///
/// Exits with a usage message on unknown flags or invalid values.
#[must_use]
pub fn parse_flags() -> Config {
    Flags::parse().into()
}
