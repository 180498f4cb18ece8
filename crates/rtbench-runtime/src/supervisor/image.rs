//! Image resolution: from a stored image's target descriptor to the
//! runtime configuration and root filesystem snapshot parent.

use oci_spec::image::{Arch, Descriptor, ImageIndex, Os};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use rtbench_common::error::{BenchError, Result};

/// OCI image index media type.
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Docker manifest list media type.
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";

/// Process defaults carried by the image configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageRuntimeConfig {
    /// `KEY=value` environment entries.
    pub env: Vec<String>,
    /// Working directory, if set.
    pub working_dir: Option<String>,
    /// User specification (`uid`, `uid:gid`, or a name).
    pub user: Option<String>,
}

/// The parts of an image configuration blob the harness reads.
///
/// Everything else in the blob (`history`, `created`, `author`, ...) is
/// ignored, and the process defaults may be absent altogether.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfigBlob {
    #[serde(default)]
    config: Option<ProcessDefaults>,
    rootfs: RootFs,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProcessDefaults {
    env: Option<Vec<String>>,
    working_dir: Option<String>,
    user: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RootFs {
    #[serde(default)]
    diff_ids: Vec<String>,
}

impl ImageConfigBlob {
    /// Parses a configuration blob read from the content store.
    ///
    /// # Errors
    ///
    /// Returns [`BenchError::Parse`] if the blob is not valid JSON or has
    /// no `rootfs`.
    pub fn from_slice(blob: &[u8]) -> Result<Self> {
        serde_json::from_slice(blob).map_err(|e| BenchError::Parse {
            what: "image configuration",
            message: e.to_string(),
        })
    }

    /// Process defaults, with empty strings treated as unset.
    #[must_use]
    pub fn runtime_config(&self) -> ImageRuntimeConfig {
        let Some(config) = &self.config else {
            return ImageRuntimeConfig::default();
        };
        ImageRuntimeConfig {
            env: config.env.clone().unwrap_or_default(),
            working_dir: config.working_dir.clone().filter(|dir| !dir.is_empty()),
            user: config.user.clone().filter(|user| !user.is_empty()),
        }
    }

    /// Uncompressed layer digests, bottom layer first.
    #[must_use]
    pub fn diff_ids(&self) -> &[String] {
        &self.rootfs.diff_ids
    }
}

/// Whether a blob with this media type is a multi-platform index.
#[must_use]
pub fn is_index(media_type: &str) -> bool {
    media_type == OCI_INDEX || media_type == DOCKER_MANIFEST_LIST
}

/// Picks the manifest for `os`/`arch` from an index.
///
/// # Errors
///
/// Returns [`BenchError::NotFound`] if the index has no matching manifest.
pub fn select_manifest<'a>(index: &'a ImageIndex, os: &Os, arch: &Arch) -> Result<&'a Descriptor> {
    index
        .manifests()
        .iter()
        .find(|descriptor| {
            descriptor
                .platform()
                .as_ref()
                .is_some_and(|p| p.os() == os && p.architecture() == arch)
        })
        .ok_or_else(|| BenchError::NotFound {
            kind: "manifest for platform",
            id: format!("{os}/{arch}"),
        })
}

/// Picks the manifest for the host platform.
///
/// # Errors
///
/// Returns [`BenchError::NotFound`] if the index has no matching manifest.
pub fn select_host_manifest(index: &ImageIndex) -> Result<&Descriptor> {
    select_manifest(index, &Os::Linux, &Arch::default())
}

/// Computes the chain ID of a layer stack from its uncompressed diff IDs.
///
/// The chain ID names the committed snapshot of the topmost layer.
///
/// # Errors
///
/// Returns an error if `diff_ids` is empty.
pub fn chain_id(diff_ids: &[String]) -> Result<String> {
    let (first, rest) = diff_ids.split_first().ok_or_else(|| BenchError::Parse {
        what: "image configuration",
        message: "rootfs has no layers".into(),
    })?;
    Ok(rest.iter().fold(first.clone(), |parent, diff_id| {
        let digest = Sha256::digest(format!("{parent} {diff_id}").as_bytes());
        format!("sha256:{digest:x}")
    }))
}
