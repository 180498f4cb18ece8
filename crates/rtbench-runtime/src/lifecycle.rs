//! Container lifecycle: create-and-start and teardown of benchmark
//! containers, including their network namespace and CNI attachment.
//!
//! The supervisor protocol is order sensitive. In particular the task's
//! exit channel is always obtained before the task is started, and
//! teardown releases resources strictly in reverse order of acquisition:
//! task, container record and snapshot, CNI attachment, network namespace.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

use nix::sys::signal::Signal;

use rtbench_common::config::Config;
use rtbench_common::error::{BenchError, Result};
use rtbench_common::types::{ContainerId, ContainerState, TaskStatus};
use rtbench_core::namespace::NetNs;

use crate::network::{CniHandle, HostNetworking, Networking};
use crate::spec::{SpecInputs, build_spec, runtime_annotations};
use crate::supervisor::containerd::ContainerdClient;
use crate::supervisor::{ContainerRequest, ExitChannel, Image, Supervisor};

/// A started container and every resource that must be released with it.
///
/// Consumed by [`Lifecycle::teardown`], so each container is torn down
/// exactly once.
pub struct ManagedContainer {
    id: ContainerId,
    netns: NetNs,
    cni: Box<dyn CniHandle>,
    exit: ExitChannel,
    pid: u32,
    state: ContainerState,
}

impl ManagedContainer {
    /// Container identifier.
    #[must_use]
    pub const fn id(&self) -> &ContainerId {
        &self.id
    }

    /// Path of the container's network namespace.
    #[must_use]
    pub fn netns_path(&self) -> &Path {
        self.netns.path()
    }

    /// PID of the task's init process.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Lifecycle phase as last observed by the harness.
    #[must_use]
    pub const fn state(&self) -> ContainerState {
        self.state
    }
}

impl std::fmt::Debug for ManagedContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedContainer")
            .field("id", &self.id)
            .field("netns", &self.netns)
            .field("pid", &self.pid)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Stateful wrapper over the supervisor and host networking.
pub struct Lifecycle {
    supervisor: Arc<dyn Supervisor>,
    network: Arc<dyn Networking>,
    namespace: String,
    live: Mutex<HashSet<ContainerId>>,
}

impl Lifecycle {
    /// Connects to the supervisor socket at `address` and scopes every
    /// request to `namespace`, using host networking.
    ///
    /// # Errors
    ///
    /// Returns an error if the supervisor cannot be reached.
    pub async fn connect(address: &Path, namespace: &str) -> Result<Self> {
        let client = ContainerdClient::connect(address, namespace).await?;
        tracing::info!(address = %address.display(), namespace, "connected to containerd");
        Ok(Self::new(
            Arc::new(client),
            Arc::new(HostNetworking::default()),
            namespace,
        ))
    }

    /// Builds a lifecycle over explicit backends.
    #[must_use]
    pub fn new(
        supervisor: Arc<dyn Supervisor>,
        network: Arc<dyn Networking>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            supervisor,
            network,
            namespace: namespace.into(),
            live: Mutex::new(HashSet::new()),
        }
    }

    fn live(&self) -> std::sync::MutexGuard<'_, HashSet<ContainerId>> {
        self.live
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Number of containers created and not yet torn down.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live().len()
    }

    /// Pulls and unpacks `reference` into `snapshotter`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pull or unpack fails.
    pub async fn pull_image(&self, reference: &str, snapshotter: &str) -> Result<Image> {
        let image = self.supervisor.pull_image(reference, snapshotter).await?;
        tracing::info!(image = %image.name, snapshotter, "successfully pulled image");
        Ok(image)
    }

    /// Creates a container running `args` and starts its task.
    ///
    /// # Errors
    ///
    /// Returns [`BenchError::AlreadyExists`] if a live container already
    /// uses `id`, or the first error of any setup step. Resources acquired
    /// before a failing step are not rolled back.
    pub async fn create_and_start(
        &self,
        config: &Config,
        id: ContainerId,
        image: &Image,
        args: &[String],
    ) -> Result<ManagedContainer> {
        if !self.live().insert(id.clone()) {
            return Err(BenchError::AlreadyExists {
                kind: "container",
                id: id.to_string(),
            });
        }

        let result = self.create_and_start_inner(config, &id, image, args).await;
        if result.is_err() {
            let _ = self.live().remove(&id);
        }
        result
    }

    async fn create_and_start_inner(
        &self,
        config: &Config,
        id: &ContainerId,
        image: &Image,
        args: &[String],
    ) -> Result<ManagedContainer> {
        let mut cni = self.network.cni()?;
        let netns = self.network.create_netns().await?;
        cni.load()?;
        cni.setup(&id.attachment_id(), netns.path()).await?;
        tracing::debug!(%id, netns = %netns.path().display(), "network attached");

        let annotations = runtime_annotations(&config.runtime);
        let spec = build_spec(&SpecInputs {
            id,
            namespace: &self.namespace,
            image: &image.config,
            args,
            annotations: &annotations,
            netns: netns.path(),
        })?;

        self.supervisor
            .create_container(ContainerRequest {
                id: id.clone(),
                image: image.clone(),
                snapshotter: config.snapshotter.clone(),
                snapshot_key: id.snapshot_key(),
                runtime: config.runtime.clone(),
                spec,
            })
            .await?;

        let _ = self.supervisor.create_task(id).await?;
        let exit = self.supervisor.wait_task(id).await?;
        let pid = self.supervisor.start_task(id).await?;
        tracing::debug!(%id, pid, "task started");

        Ok(ManagedContainer {
            id: id.clone(),
            netns,
            cni,
            exit,
            pid,
            state: ContainerState::Started,
        })
    }

    /// Stops the container if asked, waits for its exit, and releases all
    /// of its resources.
    ///
    /// Kill, exit status, task delete, and container delete failures are
    /// logged and tolerated.
    ///
    /// # Errors
    ///
    /// Returns an error if a status query, the CNI detach, or the
    /// namespace removal fails.
    pub async fn teardown(&self, container: ManagedContainer, kill_first: bool) -> Result<()> {
        let ManagedContainer {
            id,
            netns,
            cni,
            exit,
            mut state,
            ..
        } = container;

        if kill_first {
            self.escalate(&id, Signal::SIGTERM).await?;
            self.escalate(&id, Signal::SIGKILL).await?;
        }

        match exit.wait().await {
            Ok(status) => {
                state = ContainerState::Exited;
                tracing::info!(
                    %id,
                    code = status.code,
                    exited_at = ?status.exited_at,
                    "container exited"
                );
            }
            Err(e) => tracing::warn!(%id, error = %e, "failed to read exit status"),
        }

        if let Err(e) = self.supervisor.delete_task(&id).await {
            tracing::warn!(%id, error = %e, "failed to delete task");
        }
        if let Err(e) = self.supervisor.delete_container(&id).await {
            tracing::warn!(%id, error = %e, "failed to delete container");
        }

        cni.remove(&id.attachment_id(), netns.path()).await?;
        self.network.remove_netns(&netns).await?;

        let _ = self.live().remove(&id);
        tracing::debug!(%id, %state, "container torn down");
        Ok(())
    }

    /// Sends `signal` unless the task has already stopped.
    async fn escalate(&self, id: &ContainerId, signal: Signal) -> Result<()> {
        if self.supervisor.task_status(id).await? == TaskStatus::Stopped {
            return Ok(());
        }
        if let Err(e) = self.supervisor.kill_task(id, signal).await {
            tracing::warn!(%id, ?signal, error = %e, "failed to signal task");
        }
        Ok(())
    }
}
