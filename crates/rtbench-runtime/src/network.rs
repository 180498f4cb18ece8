//! Per-container networking: named network namespaces and CNI attachment.
//!
//! [`Networking`] is the seam the lifecycle uses so that namespace and
//! plugin side effects can be replaced in tests.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use rtbench_common::constants::NETNS_DIR;
use rtbench_common::error::{BenchError, Result};
use rtbench_core::cni::{Cni, CniOptions};
use rtbench_core::namespace::NetNs;

/// A CNI library handle bound to plugin and configuration directories.
#[async_trait]
pub trait CniHandle: Send + Sync {
    /// Loads the loopback and default networks.
    ///
    /// # Errors
    ///
    /// Returns an error if fewer than the minimum networks are configured.
    fn load(&mut self) -> Result<()>;

    /// Attaches the loaded networks to `netns` under `attachment_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if any plugin fails.
    async fn setup(&self, attachment_id: &str, netns: &Path) -> Result<()>;

    /// Detaches the loaded networks from `netns`.
    ///
    /// # Errors
    ///
    /// Returns an error if any plugin fails.
    async fn remove(&self, attachment_id: &str, netns: &Path) -> Result<()>;
}

#[async_trait]
impl CniHandle for Cni {
    fn load(&mut self) -> Result<()> {
        Self::load(self)
    }

    async fn setup(&self, attachment_id: &str, netns: &Path) -> Result<()> {
        Self::setup(self, attachment_id, netns).await
    }

    async fn remove(&self, attachment_id: &str, netns: &Path) -> Result<()> {
        Self::remove(self, attachment_id, netns).await
    }
}

/// Factory for the network resources of one container.
#[async_trait]
pub trait Networking: Send + Sync {
    /// Creates an unloaded CNI handle.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle cannot be constructed.
    fn cni(&self) -> Result<Box<dyn CniHandle>>;

    /// Creates a fresh named network namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace cannot be created or pinned.
    async fn create_netns(&self) -> Result<NetNs>;

    /// Unpins and deletes a network namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace cannot be removed.
    async fn remove_netns(&self, netns: &NetNs) -> Result<()>;
}

/// Networking on the local host: real namespaces and CNI plugin binaries.
#[derive(Debug, Clone)]
pub struct HostNetworking {
    cni: CniOptions,
    netns_dir: PathBuf,
}

impl HostNetworking {
    /// Uses custom CNI options and namespace directory.
    #[must_use]
    pub const fn new(cni: CniOptions, netns_dir: PathBuf) -> Self {
        Self { cni, netns_dir }
    }
}

impl Default for HostNetworking {
    fn default() -> Self {
        Self::new(CniOptions::default(), PathBuf::from(NETNS_DIR))
    }
}

fn join_error(e: &tokio::task::JoinError) -> BenchError {
    BenchError::Syscall {
        call: "network namespace worker",
        source: std::io::Error::other(e.to_string()),
    }
}

#[async_trait]
impl Networking for HostNetworking {
    fn cni(&self) -> Result<Box<dyn CniHandle>> {
        Ok(Box::new(Cni::new(self.cni.clone())))
    }

    async fn create_netns(&self) -> Result<NetNs> {
        let dir = self.netns_dir.clone();
        tokio::task::spawn_blocking(move || NetNs::create(&dir))
            .await
            .map_err(|e| join_error(&e))?
    }

    async fn remove_netns(&self, netns: &NetNs) -> Result<()> {
        let netns = netns.clone();
        tokio::task::spawn_blocking(move || netns.remove())
            .await
            .map_err(|e| join_error(&e))?
    }
}
