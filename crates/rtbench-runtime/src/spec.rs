//! OCI runtime spec composition for benchmark containers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use oci_spec::runtime::{LinuxNamespaceBuilder, LinuxNamespaceType, Spec};

use rtbench_common::constants::{
    CONTAINER_TYPE_ANNOTATION, CONTAINER_TYPE_SANDBOX, GVISOR_RUNTIME,
};
use rtbench_common::error::{BenchError, Result};
use rtbench_common::types::ContainerId;

use crate::supervisor::ImageRuntimeConfig;

/// `PATH` every container starts with before the image env is applied.
pub const DEFAULT_PATH_ENV: &str =
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Inputs of [`build_spec`].
#[derive(Debug, Clone, Copy)]
pub struct SpecInputs<'a> {
    /// Container identifier.
    pub id: &'a ContainerId,
    /// Supervisor namespace, used in the cgroups path.
    pub namespace: &'a str,
    /// Process defaults of the image.
    pub image: &'a ImageRuntimeConfig,
    /// Process argv.
    pub args: &'a [String],
    /// OCI annotations.
    pub annotations: &'a HashMap<String, String>,
    /// Network namespace the container joins.
    pub netns: &'a Path,
}

/// Annotations a runtime shim needs on every container.
///
/// The gVisor shim reads the CRI container-type annotation and would
/// otherwise try to join a pod sandbox that does not exist.
#[must_use]
pub fn runtime_annotations(runtime: &str) -> HashMap<String, String> {
    let mut annotations = HashMap::new();
    if runtime == GVISOR_RUNTIME {
        let _ = annotations.insert(
            CONTAINER_TYPE_ANNOTATION.to_owned(),
            CONTAINER_TYPE_SANDBOX.to_owned(),
        );
    }
    annotations
}

/// Builds the runtime spec of a benchmark container.
///
/// # Errors
///
/// Returns an error if the network namespace entry cannot be built.
pub fn build_spec(inputs: &SpecInputs<'_>) -> Result<Spec> {
    let mut spec = Spec::default();
    let _ = spec
        .set_hostname(None)
        .set_annotations(Some(inputs.annotations.clone()));

    if let Some(root) = spec.root_mut() {
        let _ = root.set_path(PathBuf::from("rootfs")).set_readonly(Some(false));
    }

    if let Some(process) = spec.process_mut() {
        let _ = process
            .set_args(Some(inputs.args.to_vec()))
            .set_env(Some(merge_env(
                &[DEFAULT_PATH_ENV.to_owned()],
                &inputs.image.env,
            )))
            .set_cwd(PathBuf::from(
                inputs.image.working_dir.as_deref().unwrap_or("/"),
            ));

        let (uid, gid) = match inputs.image.user.as_deref() {
            None => (0, 0),
            Some(user) => parse_numeric_user(user).unwrap_or_else(|| {
                tracing::warn!(user, "non-numeric image user ignored, running as root");
                (0, 0)
            }),
        };
        let _ = process.user_mut().set_uid(uid).set_gid(gid);
    }

    if let Some(linux) = spec.linux_mut() {
        let _ = linux.set_cgroups_path(Some(PathBuf::from(format!(
            "/{}/{}",
            inputs.namespace, inputs.id
        ))));

        let namespaces = linux.namespaces_mut().get_or_insert_with(Vec::new);
        if let Some(network) = namespaces
            .iter_mut()
            .find(|ns| ns.typ() == LinuxNamespaceType::Network)
        {
            let _ = network.set_path(Some(inputs.netns.to_path_buf()));
        } else {
            namespaces.push(
                LinuxNamespaceBuilder::default()
                    .typ(LinuxNamespaceType::Network)
                    .path(inputs.netns.to_path_buf())
                    .build()
                    .map_err(|e| BenchError::Parse {
                        what: "network namespace entry",
                        message: e.to_string(),
                    })?,
            );
        }
    }

    Ok(spec)
}

/// Applies `overrides` on top of `base`, replacing entries with the same key.
#[must_use]
pub fn merge_env(base: &[String], overrides: &[String]) -> Vec<String> {
    let mut env = base.to_vec();
    for entry in overrides {
        let key = entry.split_once('=').map_or(entry.as_str(), |(key, _)| key);
        match env
            .iter_mut()
            .find(|existing| existing.split_once('=').is_some_and(|(k, _)| k == key))
        {
            Some(existing) => existing.clone_from(entry),
            None => env.push(entry.clone()),
        }
    }
    env
}

/// Parses `uid` or `uid:gid`; a bare uid runs with gid 0.
fn parse_numeric_user(user: &str) -> Option<(u32, u32)> {
    match user.split_once(':') {
        Some((uid, gid)) => Some((uid.parse().ok()?, gid.parse().ok()?)),
        None => Some((user.parse().ok()?, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtbench_common::constants::DEFAULT_RUNTIME;

    fn build(image: &ImageRuntimeConfig, runtime: &str) -> Spec {
        let id = ContainerId::new("container-7");
        let args = vec!["/bin/sh".to_owned(), "-c".to_owned(), "sleep infinity".to_owned()];
        let annotations = runtime_annotations(runtime);
        build_spec(&SpecInputs {
            id: &id,
            namespace: "default",
            image,
            args: &args,
            annotations: &annotations,
            netns: Path::new("/var/run/netns/cni-1234"),
        })
        .unwrap()
    }

    #[test]
    fn gvisor_gets_sandbox_annotation() {
        let annotations = runtime_annotations(GVISOR_RUNTIME);
        assert_eq!(
            annotations.get("io.kubernetes.cri.container-type").map(String::as_str),
            Some("sandbox")
        );
    }

    #[test]
    fn runc_gets_no_annotations() {
        assert!(runtime_annotations(DEFAULT_RUNTIME).is_empty());
    }

    #[test]
    fn network_namespace_points_at_netns() {
        let spec = build(&ImageRuntimeConfig::default(), DEFAULT_RUNTIME);
        let namespaces = spec.linux().as_ref().unwrap().namespaces().as_ref().unwrap();
        let network: Vec<_> = namespaces
            .iter()
            .filter(|ns| ns.typ() == LinuxNamespaceType::Network)
            .collect();
        assert_eq!(network.len(), 1);
        assert_eq!(
            network[0].path().as_deref(),
            Some(Path::new("/var/run/netns/cni-1234"))
        );
    }

    #[test]
    fn process_uses_args_and_image_config() {
        let image = ImageRuntimeConfig {
            env: vec!["PATH=/opt/bin".to_owned(), "LANG=C.UTF-8".to_owned()],
            working_dir: Some("/srv".to_owned()),
            user: Some("1000:1001".to_owned()),
        };
        let spec = build(&image, DEFAULT_RUNTIME);
        let process = spec.process().as_ref().unwrap();
        assert_eq!(
            process.args().as_deref(),
            Some(["/bin/sh".to_owned(), "-c".to_owned(), "sleep infinity".to_owned()].as_slice())
        );
        assert_eq!(
            process.env().as_deref(),
            Some(["PATH=/opt/bin".to_owned(), "LANG=C.UTF-8".to_owned()].as_slice())
        );
        assert_eq!(process.cwd(), Path::new("/srv"));
        assert_eq!(process.user().uid(), 1000);
        assert_eq!(process.user().gid(), 1001);
    }

    #[test]
    fn root_is_writable_and_cgroup_is_namespaced() {
        let spec = build(&ImageRuntimeConfig::default(), DEFAULT_RUNTIME);
        let root = spec.root().as_ref().unwrap();
        assert_eq!(root.readonly(), Some(false));
        assert_eq!(spec.hostname(), &None);
        assert_eq!(
            spec.linux().as_ref().unwrap().cgroups_path().as_deref(),
            Some(Path::new("/default/container-7"))
        );
    }

    #[test]
    fn default_env_is_path_only() {
        let spec = build(&ImageRuntimeConfig::default(), DEFAULT_RUNTIME);
        let env = spec.process().as_ref().unwrap().env().clone().unwrap();
        assert_eq!(env, [DEFAULT_PATH_ENV.to_owned()]);
    }

    #[test]
    fn merge_env_replaces_and_appends() {
        let merged = merge_env(
            &["PATH=/bin".to_owned(), "HOME=/root".to_owned()],
            &["HOME=/home/bench".to_owned(), "TZ=UTC".to_owned()],
        );
        assert_eq!(merged, ["PATH=/bin", "HOME=/home/bench", "TZ=UTC"]);
    }

    #[test]
    fn numeric_users() {
        assert_eq!(parse_numeric_user("65534"), Some((65534, 0)));
        assert_eq!(parse_numeric_user("1:2"), Some((1, 2)));
        assert_eq!(parse_numeric_user("nobody"), None);
    }
}
