//! CNI network configuration files.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use rtbench_common::error::{BenchError, Result};

/// CNI spec version used for the built-in loopback network.
pub const LOOPBACK_CNI_VERSION: &str = "0.3.1";

/// Name of the built-in loopback network.
pub const LOOPBACK_NETWORK: &str = "cni-loopback";

/// File extensions recognised in the configuration directory.
const CONF_EXTENSIONS: [&str; 3] = ["conf", "conflist", "json"];

/// A network configuration list: a named chain of plugins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfigList {
    /// CNI spec version the plugins are invoked with.
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    /// Network name.
    pub name: String,
    /// Plugin configurations in chain order.
    pub plugins: Vec<Value>,
}

impl NetworkConfigList {
    /// The loopback network that brings up `lo` in every namespace.
    #[must_use]
    pub fn loopback() -> Self {
        let mut plugin = Map::new();
        let _ = plugin.insert("type".into(), Value::from("loopback"));
        Self {
            cni_version: LOOPBACK_CNI_VERSION.into(),
            name: LOOPBACK_NETWORK.into(),
            plugins: vec![Value::Object(plugin)],
        }
    }

    /// Parses a configuration document.
    ///
    /// A single-plugin document (no `plugins` key) is wrapped into a list of
    /// one, inheriting its `name` and `cniVersion`.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not JSON or lacks a name.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        if value.get("plugins").is_some() {
            return Ok(serde_json::from_value(value)?);
        }

        let name = value
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| BenchError::Parse {
                what: "CNI network configuration",
                message: "missing network name".into(),
            })?
            .to_owned();
        let cni_version = value
            .get("cniVersion")
            .and_then(Value::as_str)
            .unwrap_or(LOOPBACK_CNI_VERSION)
            .to_owned();
        Ok(Self {
            cni_version,
            name,
            plugins: vec![value],
        })
    }

    /// Reads and parses a configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or malformed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| BenchError::io(path, e))?;
        Self::parse(&bytes)
    }

    /// Builds the stdin document for one plugin of this list.
    ///
    /// # Errors
    ///
    /// Returns an error if the plugin entry is not a JSON object.
    pub fn plugin_config(&self, plugin: &Value, prev_result: Option<&Value>) -> Result<Value> {
        let mut conf = plugin.as_object().cloned().ok_or_else(|| BenchError::Cni {
            network: self.name.clone(),
            message: "plugin configuration is not an object".into(),
        })?;
        let _ = conf.insert("name".into(), Value::from(self.name.as_str()));
        let _ = conf.insert("cniVersion".into(), Value::from(self.cni_version.as_str()));
        if let Some(prev) = prev_result {
            let _ = conf.insert("prevResult".into(), prev.clone());
        }
        Ok(Value::Object(conf))
    }
}

/// Returns the plugin `type` of a plugin configuration.
///
/// # Errors
///
/// Returns an error if the entry has no string `type`.
pub fn plugin_type<'a>(network: &str, plugin: &'a Value) -> Result<&'a str> {
    plugin
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| BenchError::Cni {
            network: network.to_owned(),
            message: "plugin configuration has no type".into(),
        })
}

/// Lists configuration files in `dir` in lexical order.
///
/// A missing directory yields an empty list.
///
/// # Errors
///
/// Returns an error if the directory exists but cannot be read.
pub fn conf_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BenchError::io(dir, e)),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| BenchError::io(dir, e))?.path();
        let recognised = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| CONF_EXTENSIONS.contains(&ext));
        if recognised && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
