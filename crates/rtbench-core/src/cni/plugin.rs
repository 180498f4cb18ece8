//! CNI plugin execution.
//!
//! Plugins are executables located by their `type` in the plugin
//! directories. Parameters travel in `CNI_*` environment variables, the
//! network configuration on stdin, and the result or error on stdout.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use rtbench_common::error::{BenchError, Result};

/// CNI operation passed in `CNI_COMMAND`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Attach the container to the network.
    Add,
    /// Detach the container from the network.
    Del,
}

impl Command {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Del => "DEL",
        }
    }
}

/// Runtime parameters shared by every plugin in one attachment.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeArgs<'a> {
    /// Attachment identifier (`CNI_CONTAINERID`).
    pub container_id: &'a str,
    /// Network namespace path (`CNI_NETNS`).
    pub netns: &'a Path,
    /// Interface name inside the namespace (`CNI_IFNAME`).
    pub ifname: &'a str,
}

/// Error document written by a failing plugin.
#[derive(Debug, Deserialize)]
struct PluginError {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    details: String,
}

/// Locates and runs plugin binaries.
#[derive(Debug, Clone)]
pub struct PluginExec {
    plugin_dirs: Vec<PathBuf>,
}

impl PluginExec {
    /// Creates an executor searching `plugin_dirs` in order.
    #[must_use]
    pub const fn new(plugin_dirs: Vec<PathBuf>) -> Self {
        Self { plugin_dirs }
    }

    fn search_path(&self, network: &str) -> Result<OsString> {
        std::env::join_paths(&self.plugin_dirs).map_err(|e| BenchError::Cni {
            network: network.to_owned(),
            message: format!("invalid plugin directory: {e}"),
        })
    }

    /// Resolves a plugin type to its executable.
    ///
    /// # Errors
    ///
    /// Returns an error if no plugin directory contains the binary.
    pub fn find(&self, network: &str, plugin_type: &str) -> Result<PathBuf> {
        let paths = self.search_path(network)?;
        which::which_in(plugin_type, Some(paths), "/").map_err(|e| BenchError::Cni {
            network: network.to_owned(),
            message: format!("plugin {plugin_type} not found in {:?}: {e}", self.plugin_dirs),
        })
    }

    /// Runs one plugin and returns its parsed result, if it printed one.
    ///
    /// # Errors
    ///
    /// Returns an error if the plugin cannot be found or started, exits
    /// unsuccessfully, or prints malformed JSON.
    pub async fn exec(
        &self,
        network: &str,
        plugin_type: &str,
        command: Command,
        args: RuntimeArgs<'_>,
        config: &Value,
    ) -> Result<Option<Value>> {
        let binary = self.find(network, plugin_type)?;
        let stdin_bytes = serde_json::to_vec(config)?;

        tracing::debug!(
            network,
            plugin = plugin_type,
            command = command.as_str(),
            ifname = args.ifname,
            "executing CNI plugin"
        );

        let mut child = tokio::process::Command::new(&binary)
            .env("CNI_COMMAND", command.as_str())
            .env("CNI_CONTAINERID", args.container_id)
            .env("CNI_NETNS", args.netns)
            .env("CNI_IFNAME", args.ifname)
            .env("CNI_PATH", self.search_path(network)?)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BenchError::io(&binary, e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&stdin_bytes)
                .await
                .map_err(|e| BenchError::io(&binary, e))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BenchError::io(&binary, e))?;

        if !output.status.success() {
            return Err(plugin_failure(network, plugin_type, &output.stdout, &output.stderr));
        }

        let stdout = output.stdout.trim_ascii();
        if stdout.is_empty() {
            return Ok(None);
        }
        let result = serde_json::from_slice(stdout).map_err(|e| BenchError::Cni {
            network: network.to_owned(),
            message: format!("plugin {plugin_type} printed invalid result: {e}"),
        })?;
        Ok(Some(result))
    }
}

fn plugin_failure(network: &str, plugin_type: &str, stdout: &[u8], stderr: &[u8]) -> BenchError {
    let message = match serde_json::from_slice::<PluginError>(stdout.trim_ascii()) {
        Ok(err) if err.details.is_empty() => {
            format!("plugin {plugin_type} failed (code {}): {}", err.code, err.msg)
        }
        Ok(err) => format!(
            "plugin {plugin_type} failed (code {}): {}; {}",
            err.code, err.msg, err.details
        ),
        Err(_) => format!(
            "plugin {plugin_type} failed: {}",
            String::from_utf8_lossy(stderr.trim_ascii())
        ),
    };
    BenchError::Cni {
        network: network.to_owned(),
        message,
    }
}
