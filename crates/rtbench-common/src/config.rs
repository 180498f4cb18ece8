//! Immutable benchmark configuration shared by every measurement run.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::constants;

/// Parameters of one benchmark invocation.
///
/// Built once from the command line and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Number of outer-loop repetitions.
    pub iterations: u32,
    /// Runtime shim identifier understood by the supervisor.
    pub runtime: String,
    /// Free-form tag appended to the runtime in result naming.
    pub runtime_meta: String,
    /// Snapshot backend used for container root filesystems.
    pub snapshotter: String,
    /// Gateway of the CNI bridge as seen from inside a container.
    pub network_gateway: Ipv4Addr,
    /// Path of the supervisor control socket.
    pub address: PathBuf,
    /// Image reference pulled and run by the drivers.
    pub image: String,
    /// Base directory under which result files are written.
    pub results_dir: PathBuf,
}

impl Config {
    /// Returns `<runtime><meta>`, the label used in result headers and file names.
    #[must_use]
    pub fn runtime_label(&self) -> String {
        format!("{}{}", self.runtime, self.runtime_meta)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            iterations: constants::DEFAULT_ITERATIONS,
            runtime: constants::DEFAULT_RUNTIME.to_string(),
            runtime_meta: String::new(),
            snapshotter: constants::DEFAULT_SNAPSHOTTER.to_string(),
            network_gateway: constants::DEFAULT_NETWORK_GATEWAY,
            address: PathBuf::from(constants::SUPERVISOR_SOCKET),
            image: constants::BENCH_IMAGE.to_string(),
            results_dir: PathBuf::from(constants::RESULTS_DIR),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_values() {
        let config = Config::default();
        assert_eq!(config.iterations, 10);
        assert_eq!(config.runtime, "io.containerd.runc.v2");
        assert_eq!(config.snapshotter, "overlayfs");
        assert_eq!(config.network_gateway, Ipv4Addr::new(10, 4, 0, 1));
        assert!(config.runtime_meta.is_empty());
    }

    #[test]
    fn runtime_label_appends_meta() {
        let config = Config {
            runtime: "io.containerd.kata.v2".into(),
            runtime_meta: "-firecracker".into(),
            ..Config::default()
        };
        assert_eq!(config.runtime_label(), "io.containerd.kata.v2-firecracker");
    }
}
