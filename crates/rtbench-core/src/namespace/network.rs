//! Named network namespaces.
//!
//! A namespace is pinned by bind-mounting `/proc/thread-self/ns/net` of a
//! short-lived thread onto an empty file under `/var/run/netns`, so the
//! supervisor can join it by path after the thread has exited.

use std::path::{Path, PathBuf};

use rtbench_common::error::{BenchError, Result};

/// A network namespace persisted as a file under a base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetNs {
    path: PathBuf,
}

impl NetNs {
    /// Creates a fresh network namespace under `base_dir` with a random name.
    ///
    /// # Errors
    ///
    /// Returns an error if the base directory or the pin file cannot be
    /// created, or if `unshare(2)` or the bind mount fails.
    pub fn create(base_dir: &Path) -> Result<Self> {
        create_base_dir(base_dir)?;
        let path = base_dir.join(random_name());

        let _ = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| BenchError::io(&path, e))?;

        if let Err(e) = pin_new_namespace(&path) {
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }

        tracing::debug!(path = %path.display(), "network namespace created");
        Ok(Self { path })
    }

    /// Wraps an already pinned namespace path.
    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path the supervisor uses to join the namespace.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unmounts and deletes the namespace file.
    ///
    /// An already unmounted or already deleted namespace is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the unmount or the file removal fails otherwise.
    pub fn remove(&self) -> Result<()> {
        unpin_namespace(&self.path)?;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(BenchError::io(&self.path, e)),
        }
        tracing::debug!(path = %self.path.display(), "network namespace removed");
        Ok(())
    }
}

/// Returns a collision-resistant namespace file name.
fn random_name() -> String {
    format!("cni-{}", uuid::Uuid::new_v4())
}

fn create_base_dir(base_dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(base_dir)
        .map_err(|e| BenchError::io(base_dir, e))
}

/// Unshares a network namespace on a dedicated thread and bind-mounts it
/// onto `target`.
///
/// The thread must not be reused afterwards, so it is never taken from a pool.
#[cfg(target_os = "linux")]
fn pin_new_namespace(target: &Path) -> Result<()> {
    use nix::mount::{MsFlags, mount};
    use nix::sched::{CloneFlags, unshare};

    let target = target.to_path_buf();
    let handle = std::thread::Builder::new()
        .name("netns-pin".into())
        .spawn(move || -> Result<()> {
            unshare(CloneFlags::CLONE_NEWNET).map_err(|e| BenchError::Syscall {
                call: "unshare(CLONE_NEWNET)",
                source: e.into(),
            })?;
            mount(
                Some("/proc/thread-self/ns/net"),
                &target,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(|e| BenchError::Syscall {
                call: "mount(MS_BIND)",
                source: e.into(),
            })
        })
        .map_err(|e| BenchError::Syscall {
            call: "spawn netns thread",
            source: e,
        })?;

    handle.join().map_err(|_| BenchError::Syscall {
        call: "join netns thread",
        source: std::io::Error::other("namespace thread panicked"),
    })?
}

#[cfg(target_os = "linux")]
fn unpin_namespace(path: &Path) -> Result<()> {
    use nix::errno::Errno;
    use nix::mount::{MntFlags, umount2};

    match umount2(path, MntFlags::MNT_DETACH) {
        Ok(()) | Err(Errno::EINVAL | Errno::ENOENT) => Ok(()),
        Err(e) => Err(BenchError::Syscall {
            call: "umount2(MNT_DETACH)",
            source: e.into(),
        }),
    }
}

/// Stub for non-Linux platforms.
#[cfg(not(target_os = "linux"))]
fn pin_new_namespace(_target: &Path) -> Result<()> {
    Err(BenchError::Config {
        message: "network namespaces require Linux".into(),
    })
}

/// Stub for non-Linux platforms.
#[cfg(not(target_os = "linux"))]
fn unpin_namespace(_path: &Path) -> Result<()> {
    Ok(())
}
