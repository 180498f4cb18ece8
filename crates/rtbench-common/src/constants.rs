//! System-wide constants and default paths.

use std::net::Ipv4Addr;
use std::time::Duration;

/// Default number of measurement iterations.
pub const DEFAULT_ITERATIONS: u32 = 10;

/// Standard OCI runtime shim (runc).
pub const DEFAULT_RUNTIME: &str = "io.containerd.runc.v2";

/// User-space kernel sandbox shim (gVisor).
pub const GVISOR_RUNTIME: &str = "io.containerd.runsc.v1";

/// Default snapshot backend.
pub const DEFAULT_SNAPSHOTTER: &str = "overlayfs";

/// Default gateway of the CNI bridge network.
pub const DEFAULT_NETWORK_GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 4, 0, 1);

/// Supervisor control socket.
pub const SUPERVISOR_SOCKET: &str = "/run/containerd/containerd.sock";

/// Supervisor namespace every request is scoped to.
pub const SUPERVISOR_NAMESPACE: &str = "default";

/// Image pulled and run by both drivers.
pub const BENCH_IMAGE: &str = "docker.io/library/alpine:latest";

/// CNI network configuration directory.
pub const CNI_CONF_DIR: &str = "/etc/cni/net.d";

/// CNI plugin binary directory.
pub const CNI_BIN_DIR: &str = "/opt/cni/bin";

/// Minimum number of loaded CNI networks (loopback + default).
pub const CNI_MIN_NETWORKS: usize = 2;

/// Interface name prefix for non-loopback CNI networks.
pub const CNI_IF_PREFIX: &str = "eth";

/// Directory holding named network namespaces.
pub const NETNS_DIR: &str = "/var/run/netns";

/// Kernel memory accounting file.
pub const MEMINFO_PATH: &str = "/proc/meminfo";

/// Annotation key read by the gVisor shim to classify a container.
pub const CONTAINER_TYPE_ANNOTATION: &str = "io.kubernetes.cri.container-type";

/// Annotation value marking a container as its own sandbox.
pub const CONTAINER_TYPE_SANDBOX: &str = "sandbox";

/// Port of the startup callback server.
pub const CALLBACK_PORT: u16 = 5000;

/// Route hit by a freshly started container.
pub const CALLBACK_ROUTE: &str = "/started";

/// Base directory for result files.
pub const RESULTS_DIR: &str = "results";

/// Containers created per memory iteration.
pub const MEMORY_BATCH_SIZE: usize = 50;

/// Pause before sampling the starting memory footprint.
pub const MEMORY_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Pause after creating a batch before sampling again.
pub const MEMORY_STABILISE_DELAY: Duration = Duration::from_secs(3);
