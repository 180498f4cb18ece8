//! Container Network Interface attachment.
//!
//! A [`Cni`] handle loads the loopback network plus the first network found
//! in the configuration directory, then attaches or detaches both to a
//! network namespace by executing their plugin chains.

pub mod config;
pub mod plugin;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;

use rtbench_common::constants::{CNI_BIN_DIR, CNI_CONF_DIR, CNI_IF_PREFIX, CNI_MIN_NETWORKS};
use rtbench_common::error::{BenchError, Result};

use self::config::{NetworkConfigList, conf_files, plugin_type};
use self::plugin::{Command, PluginExec, RuntimeArgs};

/// Where and how networks are loaded.
#[derive(Debug, Clone)]
pub struct CniOptions {
    /// Directory scanned for network configuration files.
    pub conf_dir: PathBuf,
    /// Directories searched for plugin binaries.
    pub plugin_dirs: Vec<PathBuf>,
    /// Minimum number of networks, loopback included.
    pub min_networks: usize,
    /// Interface name prefix for non-loopback networks.
    pub if_prefix: String,
}

impl Default for CniOptions {
    fn default() -> Self {
        Self {
            conf_dir: PathBuf::from(CNI_CONF_DIR),
            plugin_dirs: vec![PathBuf::from(CNI_BIN_DIR)],
            min_networks: CNI_MIN_NETWORKS,
            if_prefix: CNI_IF_PREFIX.into(),
        }
    }
}

/// A loaded network bound to an interface name.
#[derive(Debug, Clone)]
pub struct Network {
    /// Interface created inside the namespace.
    pub ifname: String,
    /// Plugin chain of the network.
    pub config: NetworkConfigList,
}

/// Handle over the configured networks.
#[derive(Debug)]
pub struct Cni {
    options: CniOptions,
    exec: PluginExec,
    networks: Vec<Network>,
    /// Final `ADD` result per (attachment id, interface), replayed on `DEL`.
    results: Mutex<HashMap<(String, String), Value>>,
}

impl Cni {
    /// Creates an empty handle; call [`Cni::load`] before attaching.
    #[must_use]
    pub fn new(options: CniOptions) -> Self {
        let exec = PluginExec::new(options.plugin_dirs.clone());
        Self {
            options,
            exec,
            networks: Vec::new(),
            results: Mutex::new(HashMap::new()),
        }
    }

    /// Loads the loopback network and the default network.
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration file is malformed or fewer than
    /// the minimum number of networks are available.
    pub fn load(&mut self) -> Result<()> {
        let mut networks = vec![Network {
            ifname: "lo".into(),
            config: NetworkConfigList::loopback(),
        }];

        if let Some(first) = conf_files(&self.options.conf_dir)?.first() {
            let config = NetworkConfigList::from_file(first)?;
            tracing::debug!(network = %config.name, file = %first.display(), "loaded CNI network");
            networks.push(Network {
                ifname: format!("{}0", self.options.if_prefix),
                config,
            });
        }

        if networks.len() < self.options.min_networks {
            return Err(BenchError::Cni {
                network: self.options.conf_dir.display().to_string(),
                message: format!(
                    "{} networks loaded, at least {} required",
                    networks.len(),
                    self.options.min_networks
                ),
            });
        }

        self.networks = networks;
        Ok(())
    }

    /// Networks in attachment order.
    #[must_use]
    pub fn networks(&self) -> &[Network] {
        &self.networks
    }

    /// Attaches every loaded network to `netns`.
    ///
    /// # Errors
    ///
    /// Returns an error if no networks are loaded or any plugin fails.
    pub async fn setup(&self, id: &str, netns: &Path) -> Result<()> {
        self.ensure_loaded()?;
        for network in &self.networks {
            let args = RuntimeArgs {
                container_id: id,
                netns,
                ifname: &network.ifname,
            };
            let mut prev: Option<Value> = None;
            for plugin in &network.config.plugins {
                let conf = network.config.plugin_config(plugin, prev.as_ref())?;
                let kind = plugin_type(&network.config.name, plugin)?;
                let result = self
                    .exec
                    .exec(&network.config.name, kind, Command::Add, args, &conf)
                    .await?;
                if result.is_some() {
                    prev = result;
                }
            }
            if let Some(result) = prev {
                let _ = self.cache().insert((id.to_owned(), network.ifname.clone()), result);
            }
        }
        tracing::debug!(id, netns = %netns.display(), "CNI networks attached");
        Ok(())
    }

    /// Detaches every loaded network from `netns`, in reverse order.
    ///
    /// # Errors
    ///
    /// Returns an error if no networks are loaded or any plugin fails.
    pub async fn remove(&self, id: &str, netns: &Path) -> Result<()> {
        self.ensure_loaded()?;
        for network in self.networks.iter().rev() {
            let args = RuntimeArgs {
                container_id: id,
                netns,
                ifname: &network.ifname,
            };
            let cached = self.cache().remove(&(id.to_owned(), network.ifname.clone()));
            for plugin in network.config.plugins.iter().rev() {
                let conf = network.config.plugin_config(plugin, cached.as_ref())?;
                let kind = plugin_type(&network.config.name, plugin)?;
                let _ = self
                    .exec
                    .exec(&network.config.name, kind, Command::Del, args, &conf)
                    .await?;
            }
        }
        tracing::debug!(id, netns = %netns.display(), "CNI networks detached");
        Ok(())
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.networks.len() < self.options.min_networks {
            return Err(BenchError::Cni {
                network: self.options.conf_dir.display().to_string(),
                message: "networks not loaded".into(),
            });
        }
        Ok(())
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), Value>> {
        self.results
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
