//! Container supervisor abstraction.
//!
//! The lifecycle layer talks to the supervisor daemon only through the
//! [`Supervisor`] trait so that it can be driven by a recording fake in
//! tests. [`containerd::ContainerdClient`] is the production implementation.

pub mod containerd;
pub mod image;
pub mod proto;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use oci_spec::runtime::Spec;
use tokio::sync::oneshot;

use rtbench_common::error::{BenchError, Result};
use rtbench_common::types::{ContainerId, ExitStatus, TaskStatus};

pub use self::image::ImageRuntimeConfig;

/// An image that has been pulled and unpacked into a snapshotter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    /// Image reference as stored by the supervisor.
    pub name: String,
    /// Process defaults from the image configuration.
    pub config: ImageRuntimeConfig,
    /// Snapshot the container root filesystem is prepared from (layer chain ID).
    pub snapshot_parent: String,
}

/// Everything the supervisor needs to record a new container.
#[derive(Debug, Clone)]
pub struct ContainerRequest {
    /// Container identifier.
    pub id: ContainerId,
    /// Image the root filesystem is built from.
    pub image: Image,
    /// Snapshotter holding the image layers.
    pub snapshotter: String,
    /// Name of the writable snapshot prepared for this container.
    pub snapshot_key: String,
    /// Runtime shim name.
    pub runtime: String,
    /// OCI runtime spec handed to the shim.
    pub spec: Spec,
}

/// Single-shot delivery of a task's termination.
///
/// Obtained before the task is started so that an early exit cannot be
/// missed; consumed exactly once by [`ExitChannel::wait`].
#[derive(Debug)]
pub struct ExitChannel {
    rx: oneshot::Receiver<Result<ExitStatus>>,
}

/// Sending half of an [`ExitChannel`].
pub type ExitSender = oneshot::Sender<Result<ExitStatus>>;

impl ExitChannel {
    /// Creates a connected sender and channel.
    #[must_use]
    pub fn pair() -> (ExitSender, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Waits for the task to terminate.
    ///
    /// # Errors
    ///
    /// Returns the error reported by the supervisor's wait, or an error if
    /// the sender was dropped without reporting.
    pub async fn wait(self) -> Result<ExitStatus> {
        self.rx
            .await
            .map_err(|_| BenchError::supervisor("wait task", "exit channel closed without status"))?
    }
}

/// Operations the harness performs against the container supervisor.
///
/// All calls are scoped to the supervisor namespace the implementation was
/// created with.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Pulls `reference` and unpacks it into `snapshotter`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pull, unpack, or image resolution fails.
    async fn pull_image(&self, reference: &str, snapshotter: &str) -> Result<Image>;

    /// Prepares the container snapshot and records the container.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot or the container record cannot be
    /// created.
    async fn create_container(&self, request: ContainerRequest) -> Result<()>;

    /// Creates the task of a container with null stdio, returning its PID.
    ///
    /// # Errors
    ///
    /// Returns an error if the shim fails to create the task.
    async fn create_task(&self, id: &ContainerId) -> Result<u32>;

    /// Subscribes to the task's termination.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscription cannot be set up.
    async fn wait_task(&self, id: &ContainerId) -> Result<ExitChannel>;

    /// Starts the task's init process, returning its PID.
    ///
    /// # Errors
    ///
    /// Returns an error if the task cannot be started.
    async fn start_task(&self, id: &ContainerId) -> Result<u32>;

    /// Reads the task's current status.
    ///
    /// # Errors
    ///
    /// Returns an error if the task cannot be queried.
    async fn task_status(&self, id: &ContainerId) -> Result<TaskStatus>;

    /// Delivers `signal` to the task's init process.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be delivered.
    async fn kill_task(&self, id: &ContainerId, signal: Signal) -> Result<()>;

    /// Kills any remaining processes and deletes the task.
    ///
    /// # Errors
    ///
    /// Returns an error if the task cannot be deleted.
    async fn delete_task(&self, id: &ContainerId) -> Result<ExitStatus>;

    /// Deletes the container record and its snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the record or the snapshot cannot be removed.
    async fn delete_container(&self, id: &ContainerId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exit_channel_delivers_once() {
        let (tx, channel) = ExitChannel::pair();
        tx.send(Ok(ExitStatus {
            code: 0,
            exited_at: None,
        }))
        .unwrap();
        assert_eq!(channel.wait().await.unwrap().code, 0);
    }

    #[tokio::test]
    async fn dropped_sender_is_an_error() {
        let (tx, channel) = ExitChannel::pair();
        drop(tx);
        let err = channel.wait().await.unwrap_err();
        assert!(err.to_string().contains("exit channel closed"));
    }
}
