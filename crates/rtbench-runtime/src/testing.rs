//! Recording fakes of the supervisor and host networking.
//!
//! Both fakes append to a shared [`CallLog`], so tests can assert the exact
//! cross-backend order of a create or teardown. Tasks behave according to
//! a [`TaskBehavior`] chosen when the fake is built.

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use rtbench_common::error::{BenchError, Result};
use rtbench_common::types::{ContainerId, ExitStatus, TaskStatus};
use rtbench_core::meminfo::MemorySource;
use rtbench_core::namespace::NetNs;

use crate::network::{CniHandle, Networking};
use crate::supervisor::{
    ContainerRequest, ExitChannel, ExitSender, Image, ImageRuntimeConfig, Supervisor,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One observed backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// `Supervisor::pull_image`.
    PullImage {
        /// Image reference.
        reference: String,
        /// Snapshotter.
        snapshotter: String,
    },
    /// `Supervisor::create_container`.
    CreateContainer {
        /// Container id.
        id: ContainerId,
        /// Snapshot key.
        snapshot_key: String,
        /// Runtime shim.
        runtime: String,
        /// Snapshotter.
        snapshotter: String,
        /// Spec annotations.
        annotations: Vec<(String, String)>,
        /// Process argv.
        args: Vec<String>,
        /// Network namespace path in the OCI runtime spec.
        netns: Option<PathBuf>,
    },
    /// `Supervisor::create_task`.
    CreateTask(ContainerId),
    /// `Supervisor::wait_task`.
    WaitTask(ContainerId),
    /// `Supervisor::start_task`.
    StartTask(ContainerId),
    /// `Supervisor::task_status`.
    TaskStatus(ContainerId),
    /// `Supervisor::kill_task`.
    Kill(ContainerId, Signal),
    /// `Supervisor::delete_task`.
    DeleteTask(ContainerId),
    /// `Supervisor::delete_container`.
    DeleteContainer(ContainerId),
    /// `Networking::create_netns`.
    CreateNetns(PathBuf),
    /// `CniHandle::load`.
    LoadCni,
    /// `CniHandle::setup`.
    CniSetup(String, PathBuf),
    /// `CniHandle::remove`.
    CniRemove(String, PathBuf),
    /// `Networking::remove_netns`.
    RemoveNetns(PathBuf),
}

impl Call {
    /// Container id the call concerns, if any.
    #[must_use]
    pub fn container(&self) -> Option<&ContainerId> {
        match self {
            Self::CreateContainer { id, .. }
            | Self::CreateTask(id)
            | Self::WaitTask(id)
            | Self::StartTask(id)
            | Self::TaskStatus(id)
            | Self::Kill(id, _)
            | Self::DeleteTask(id)
            | Self::DeleteContainer(id) => Some(id),
            _ => None,
        }
    }
}

/// Shared, ordered record of backend calls.
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    fn push(&self, call: Call) {
        lock(&self.0).push(call);
    }

    /// All calls so far.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        lock(&self.0).clone()
    }

    /// Supervisor calls concerning `id`.
    #[must_use]
    pub fn calls_for(&self, id: &ContainerId) -> Vec<Call> {
        lock(&self.0)
            .iter()
            .filter(|call| call.container() == Some(id))
            .cloned()
            .collect()
    }

    /// Number of calls matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        lock(&self.0).iter().filter(|call| predicate(call)).count()
    }

    /// Forgets every recorded call.
    pub fn clear(&self) {
        lock(&self.0).clear();
    }
}

/// How fake tasks behave once started.
#[derive(Debug)]
pub enum TaskBehavior {
    /// Run until signalled. `SIGTERM` stops the task unless `ignore_term`;
    /// `SIGKILL` always does.
    RunUntilSignal {
        /// Whether `SIGTERM` is ignored.
        ignore_term: bool,
    },
    /// Exit with `code` as soon as the task starts.
    ExitImmediately {
        /// Exit code.
        code: u32,
    },
    /// Perform an HTTP GET of the URL found in the argv, then exit 0.
    ///
    /// Each start pops the next delay; `None` exits without calling back.
    /// Once the queue is empty the callback is sent immediately.
    HttpCallback {
        /// Per-start delays before the request.
        delays: Mutex<VecDeque<Option<Duration>>>,
    },
}

impl TaskBehavior {
    /// HTTP callback behaviour with the given per-start delays.
    #[must_use]
    pub fn http_callback(delays: impl IntoIterator<Item = Option<Duration>>) -> Self {
        Self::HttpCallback {
            delays: Mutex::new(delays.into_iter().collect()),
        }
    }
}

#[derive(Debug)]
struct FakeTask {
    status: TaskStatus,
    args: Vec<String>,
    exit_tx: Option<ExitSender>,
    exit: Option<ExitStatus>,
}

impl FakeTask {
    /// Marks the task stopped and delivers the exit if someone is waiting.
    fn stop(&mut self, code: u32) {
        if self.status == TaskStatus::Stopped {
            return;
        }
        self.status = TaskStatus::Stopped;
        let status = ExitStatus {
            code,
            exited_at: Some(chrono::Utc::now()),
        };
        self.exit = Some(status);
        if let Some(tx) = self.exit_tx.take() {
            let _ = tx.send(Ok(status));
        }
    }
}

type Tasks = Arc<Mutex<HashMap<ContainerId, FakeTask>>>;

/// In-memory supervisor recording every call.
#[derive(Debug)]
pub struct FakeSupervisor {
    log: CallLog,
    behavior: TaskBehavior,
    tasks: Tasks,
    fail_wait: bool,
}

impl FakeSupervisor {
    /// Creates a fake whose tasks follow `behavior`.
    #[must_use]
    pub fn new(log: CallLog, behavior: TaskBehavior) -> Self {
        Self {
            log,
            behavior,
            tasks: Arc::default(),
            fail_wait: false,
        }
    }

    /// Makes every exit channel report an error instead of a status.
    #[must_use]
    pub const fn failing_exit_status(mut self) -> Self {
        self.fail_wait = true;
        self
    }

    /// Number of containers with a task record.
    #[must_use]
    pub fn task_count(&self) -> usize {
        lock(&self.tasks).len()
    }

    fn with_task<T>(&self, id: &ContainerId, f: impl FnOnce(&mut FakeTask) -> T) -> Result<T> {
        let mut tasks = lock(&self.tasks);
        let task = tasks.get_mut(id).ok_or_else(|| BenchError::NotFound {
            kind: "task",
            id: id.to_string(),
        })?;
        Ok(f(task))
    }

    fn spawn_callback(&self, id: &ContainerId, args: &[String], delay: Option<Duration>) {
        let tasks = Arc::clone(&self.tasks);
        let id = id.clone();
        let url = args
            .iter()
            .flat_map(|arg| arg.split_whitespace())
            .find(|word| word.starts_with("http://"))
            .map(str::to_owned);
        let _ = tokio::spawn(async move {
            if let (Some(delay), Some(url)) = (delay, url) {
                tokio::time::sleep(delay).await;
                if let Err(e) = http_get(&url).await {
                    tracing::warn!(%id, error = %e, "fake callback failed");
                }
            }
            if let Some(task) = lock(&tasks).get_mut(&id) {
                task.stop(0);
            }
        });
    }
}

/// Sends a bare HTTP/1.1 GET and reads the response to completion.
async fn http_get(url: &str) -> std::io::Result<()> {
    let rest = url.trim_start_matches("http://");
    let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
    let mut stream = tokio::net::TcpStream::connect(authority).await?;
    let request = format!("GET /{path} HTTP/1.1\r\nHost: {authority}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;
    let mut response = Vec::new();
    let _ = stream.read_to_end(&mut response).await?;
    Ok(())
}

/// A pulled image with neutral defaults.
#[must_use]
pub fn fake_image(reference: &str) -> Image {
    Image {
        name: reference.to_owned(),
        config: ImageRuntimeConfig::default(),
        snapshot_parent: "sha256:0000000000000000000000000000000000000000000000000000000000000000"
            .to_owned(),
    }
}

#[async_trait]
impl Supervisor for FakeSupervisor {
    async fn pull_image(&self, reference: &str, snapshotter: &str) -> Result<Image> {
        self.log.push(Call::PullImage {
            reference: reference.to_owned(),
            snapshotter: snapshotter.to_owned(),
        });
        Ok(fake_image(reference))
    }

    async fn create_container(&self, request: ContainerRequest) -> Result<()> {
        let mut annotations: Vec<_> = request
            .spec
            .annotations()
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect();
        annotations.sort();
        let process = request.spec.process().as_ref();
        let args = process
            .and_then(|p| p.args().clone())
            .unwrap_or_default();
        let netns = request.spec.linux().as_ref().and_then(|linux| {
            linux.namespaces().as_ref().and_then(|namespaces| {
                namespaces
                    .iter()
                    .find(|ns| ns.typ() == oci_spec::runtime::LinuxNamespaceType::Network)
                    .and_then(|ns| ns.path().clone())
            })
        });

        self.log.push(Call::CreateContainer {
            id: request.id.clone(),
            snapshot_key: request.snapshot_key,
            runtime: request.runtime,
            snapshotter: request.snapshotter,
            annotations,
            args: args.clone(),
            netns,
        });

        let _ = lock(&self.tasks).insert(
            request.id,
            FakeTask {
                status: TaskStatus::Unknown,
                args,
                exit_tx: None,
                exit: None,
            },
        );
        Ok(())
    }

    async fn create_task(&self, id: &ContainerId) -> Result<u32> {
        self.log.push(Call::CreateTask(id.clone()));
        self.with_task(id, |task| task.status = TaskStatus::Created)?;
        Ok(4242)
    }

    async fn wait_task(&self, id: &ContainerId) -> Result<ExitChannel> {
        self.log.push(Call::WaitTask(id.clone()));
        let (tx, channel) = ExitChannel::pair();
        if self.fail_wait {
            let _ = tx.send(Err(BenchError::supervisor("wait task", "fake wait failure")));
            return Ok(channel);
        }
        self.with_task(id, |task| match task.exit {
            Some(status) => {
                let _ = tx.send(Ok(status));
            }
            None => task.exit_tx = Some(tx),
        })?;
        Ok(channel)
    }

    async fn start_task(&self, id: &ContainerId) -> Result<u32> {
        self.log.push(Call::StartTask(id.clone()));
        let args = self.with_task(id, |task| {
            task.status = TaskStatus::Running;
            task.args.clone()
        })?;

        match &self.behavior {
            TaskBehavior::RunUntilSignal { .. } => {}
            TaskBehavior::ExitImmediately { code } => {
                self.with_task(id, |task| task.stop(*code))?;
            }
            TaskBehavior::HttpCallback { delays } => {
                let delay = lock(delays).pop_front().unwrap_or(Some(Duration::ZERO));
                self.spawn_callback(id, &args, delay);
            }
        }
        Ok(4242)
    }

    async fn task_status(&self, id: &ContainerId) -> Result<TaskStatus> {
        self.log.push(Call::TaskStatus(id.clone()));
        self.with_task(id, |task| task.status)
    }

    async fn kill_task(&self, id: &ContainerId, signal: Signal) -> Result<()> {
        self.log.push(Call::Kill(id.clone(), signal));
        let ignore_term = matches!(
            self.behavior,
            TaskBehavior::RunUntilSignal { ignore_term: true }
        );
        self.with_task(id, |task| match signal {
            Signal::SIGKILL => task.stop(137),
            Signal::SIGTERM if !ignore_term => task.stop(143),
            _ => {}
        })
    }

    async fn delete_task(&self, id: &ContainerId) -> Result<ExitStatus> {
        self.log.push(Call::DeleteTask(id.clone()));
        self.with_task(id, |task| {
            task.stop(137);
            task.exit.unwrap_or(ExitStatus {
                code: 137,
                exited_at: None,
            })
        })
    }

    async fn delete_container(&self, id: &ContainerId) -> Result<()> {
        self.log.push(Call::DeleteContainer(id.clone()));
        lock(&self.tasks)
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| BenchError::NotFound {
                kind: "container",
                id: id.to_string(),
            })
    }
}

/// Host networking fake recording namespace and CNI calls.
#[derive(Debug, Default)]
pub struct FakeNetwork {
    log: CallLog,
    next: AtomicUsize,
    fail_load: bool,
}

impl FakeNetwork {
    /// Creates a fake sharing `log` with the supervisor fake.
    #[must_use]
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            next: AtomicUsize::new(0),
            fail_load: false,
        }
    }

    /// Makes every CNI load fail as if no default network were configured.
    #[must_use]
    pub const fn failing_cni_load(mut self) -> Self {
        self.fail_load = true;
        self
    }
}

#[derive(Debug)]
struct FakeCni {
    log: CallLog,
    fail_load: bool,
}

#[async_trait]
impl CniHandle for FakeCni {
    fn load(&mut self) -> Result<()> {
        self.log.push(Call::LoadCni);
        if self.fail_load {
            return Err(BenchError::Cni {
                network: "/etc/cni/net.d".into(),
                message: "1 networks loaded, at least 2 required".into(),
            });
        }
        Ok(())
    }

    async fn setup(&self, attachment_id: &str, netns: &Path) -> Result<()> {
        self.log
            .push(Call::CniSetup(attachment_id.to_owned(), netns.to_path_buf()));
        Ok(())
    }

    async fn remove(&self, attachment_id: &str, netns: &Path) -> Result<()> {
        self.log
            .push(Call::CniRemove(attachment_id.to_owned(), netns.to_path_buf()));
        Ok(())
    }
}

#[async_trait]
impl Networking for FakeNetwork {
    fn cni(&self) -> Result<Box<dyn CniHandle>> {
        Ok(Box::new(FakeCni {
            log: self.log.clone(),
            fail_load: self.fail_load,
        }))
    }

    async fn create_netns(&self) -> Result<NetNs> {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let path = PathBuf::from(format!("/fake/netns/cni-{n}"));
        self.log.push(Call::CreateNetns(path.clone()));
        Ok(NetNs::from_path(path))
    }

    async fn remove_netns(&self, netns: &NetNs) -> Result<()> {
        self.log.push(Call::RemoveNetns(netns.path().to_path_buf()));
        Ok(())
    }
}

/// Memory source replaying a fixed series of used-memory samples.
#[derive(Debug, Default)]
pub struct ScriptedMemory {
    samples: Mutex<VecDeque<u64>>,
}

impl ScriptedMemory {
    /// Replays `samples` in order; sampling past the end is an error.
    #[must_use]
    pub fn new(samples: impl IntoIterator<Item = u64>) -> Self {
        Self {
            samples: Mutex::new(samples.into_iter().collect()),
        }
    }
}

impl MemorySource for ScriptedMemory {
    fn used_kb(&self) -> Result<u64> {
        lock(&self.samples).pop_front().ok_or_else(|| BenchError::Parse {
            what: "/proc/meminfo",
            message: "scripted samples exhausted".into(),
        })
    }
}
