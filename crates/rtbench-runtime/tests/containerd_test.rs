//! containerd client tests against an in-process gRPC daemon.
//!
//! The daemon listens on a Unix socket in a temporary directory, records
//! every request's method path, namespace and lease metadata, and answers
//! from a small in-memory store.
//!
//! These tests verify:
//! 1. Every request carries the namespace header
//! 2. Snapshot preparation and the container record run under one lease
//! 3. A failed container record removes the snapshot and the lease
//! 4. Task creation mounts the prepared snapshot with empty stdio
//! 5. Exit delivery through the spawned wait call
//! 6. Container deletion removes its snapshot
//! 7. Image resolution: index, manifest, config blob, chain ID

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http2;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use nix::sys::signal::Signal;
use oci_spec::image::Arch;
use oci_spec::runtime::Spec;
use prost::Message;
use prost_types::Timestamp;
use tokio::net::UnixListener;
use tokio::task::JoinHandle;

use rtbench_common::error::BenchError;
use rtbench_common::types::ContainerId;
use rtbench_runtime::supervisor::containerd::ContainerdClient;
use rtbench_runtime::supervisor::image::chain_id;
use rtbench_runtime::supervisor::proto::{self, path, type_url};
use rtbench_runtime::supervisor::{ContainerRequest, Supervisor};
use rtbench_runtime::testing::fake_image;

const NAMESPACE: &str = "rtbench-test";
const TASK_PID: u32 = 4242;
const EXIT_CODE: u32 = 137;

// ── In-process daemon ────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Recorded {
    path: String,
    namespace: Option<String>,
    lease: Option<String>,
    payload: Vec<u8>,
}

#[derive(Default)]
struct Store {
    calls: Mutex<Vec<Recorded>>,
    failing: Mutex<HashSet<&'static str>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    image_target: Mutex<Option<proto::Descriptor>>,
}

type Reply = std::result::Result<Vec<Vec<u8>>, (u8, &'static str)>;

impl Store {
    fn fail(&self, path: &'static str) {
        let _ = self.failing.lock().unwrap().insert(path);
    }

    fn calls(&self) -> Vec<Recorded> {
        self.calls.lock().unwrap().clone()
    }

    fn paths(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.path).collect()
    }

    fn requests<M: Message + Default>(&self, path: &str) -> Vec<M> {
        self.calls()
            .into_iter()
            .filter(|c| c.path == path)
            .map(|c| M::decode(c.payload.as_slice()).unwrap())
            .collect()
    }

    fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    async fn handle(&self, request: Request<Incoming>) -> Response<Full<Bytes>> {
        let path = request.uri().path().to_owned();
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        let namespace = header("containerd-namespace");
        let lease = header("containerd-lease");
        let body = request.into_body().collect().await.unwrap().to_bytes();
        let payload = body.get(5..).unwrap_or_default().to_vec();

        let reply = if self.failing.lock().unwrap().contains(path.as_str()) {
            Err((13, "injected failure"))
        } else {
            self.reply(&path, &payload)
        };
        self.calls.lock().unwrap().push(Recorded {
            path,
            namespace,
            lease,
            payload,
        });

        let builder = Response::builder().header("content-type", "application/grpc");
        match reply {
            Ok(messages) => {
                let body: Vec<u8> = messages.iter().flat_map(|m| frame(m)).collect();
                builder.body(Full::new(Bytes::from(body))).unwrap()
            }
            Err((code, message)) => builder
                .header("grpc-status", code.to_string())
                .header("grpc-message", message)
                .body(Full::new(Bytes::new()))
                .unwrap(),
        }
    }

    fn reply(&self, method: &str, payload: &[u8]) -> Reply {
        match method {
            path::LEASES_CREATE => {
                let request = proto::CreateLeaseRequest::decode(payload).unwrap();
                one(&proto::CreateLeaseResponse {
                    lease: Some(proto::Lease {
                        id: request.id,
                        labels: request.labels,
                        ..proto::Lease::default()
                    }),
                })
            }
            path::SNAPSHOTS_PREPARE => one(&proto::PrepareSnapshotResponse {
                mounts: vec![overlay_mount()],
            }),
            path::SNAPSHOTS_MOUNTS => one(&proto::MountsResponse {
                mounts: vec![overlay_mount()],
            }),
            path::CONTAINERS_CREATE => {
                let request = proto::CreateContainerRequest::decode(payload).unwrap();
                one(&proto::CreateContainerResponse {
                    container: request.container,
                })
            }
            path::TASKS_CREATE => one(&proto::CreateTaskResponse {
                pid: TASK_PID,
                ..proto::CreateTaskResponse::default()
            }),
            path::TASKS_START => one(&proto::StartResponse { pid: TASK_PID }),
            path::TASKS_WAIT => one(&proto::WaitResponse {
                exit_status: EXIT_CODE,
                exited_at: Some(exited_at()),
            }),
            path::TASKS_DELETE => one(&proto::DeleteResponse {
                pid: TASK_PID,
                exit_status: EXIT_CODE,
                exited_at: Some(exited_at()),
                ..proto::DeleteResponse::default()
            }),
            path::TASKS_GET => one(&proto::GetResponse {
                process: Some(proto::Process {
                    pid: TASK_PID,
                    status: proto::Status::Running as i32,
                    ..proto::Process::default()
                }),
            }),
            path::IMAGES_GET => {
                let request = proto::GetImageRequest::decode(payload).unwrap();
                let target = self.image_target.lock().unwrap().clone();
                one(&proto::GetImageResponse {
                    image: target.map(|target| proto::Image {
                        name: request.name,
                        target: Some(target),
                        ..proto::Image::default()
                    }),
                })
            }
            path::CONTENT_READ => {
                let request = proto::ReadContentRequest::decode(payload).unwrap();
                let blobs = self.blobs.lock().unwrap();
                let blob = blobs.get(&request.digest).ok_or((5, "blob not found"))?;
                // Two chunks, so the client has to reassemble the blob.
                let (head, tail) = blob.split_at(blob.len() / 2);
                Ok([head, tail]
                    .into_iter()
                    .map(|chunk| {
                        proto::ReadContentResponse {
                            offset: 0,
                            data: chunk.to_vec(),
                        }
                        .encode_to_vec()
                    })
                    .collect())
            }
            path::TRANSFER
            | path::LEASES_DELETE
            | path::SNAPSHOTS_REMOVE
            | path::CONTAINERS_DELETE
            | path::TASKS_KILL => Ok(vec![Vec::new()]),
            _ => Err((12, "unknown method")),
        }
    }
}

fn one<M: Message>(message: &M) -> Reply {
    Ok(vec![message.encode_to_vec()])
}

fn frame(message: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(5 + message.len());
    framed.push(0);
    framed.extend_from_slice(&u32::try_from(message.len()).unwrap().to_be_bytes());
    framed.extend_from_slice(message);
    framed
}

fn overlay_mount() -> proto::Mount {
    proto::Mount {
        r#type: "overlay".into(),
        source: "overlay".into(),
        target: String::new(),
        options: vec!["lowerdir=/l".into(), "upperdir=/u".into(), "workdir=/w".into()],
    }
}

const fn exited_at() -> Timestamp {
    Timestamp {
        seconds: 1_700_000_000,
        nanos: 0,
    }
}

struct Daemon {
    _dir: tempfile::TempDir,
    socket: PathBuf,
    store: Arc<Store>,
    accept_loop: JoinHandle<()>,
}

impl Daemon {
    fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("containerd.sock");
        let listener = UnixListener::bind(&socket).expect("should bind daemon socket");
        let store = Arc::new(Store::default());

        let shared = Arc::clone(&store);
        let accept_loop = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let store = Arc::clone(&shared);
                let _ = tokio::spawn(async move {
                    let service = service_fn(move |request| {
                        let store = Arc::clone(&store);
                        async move { Ok::<_, Infallible>(store.handle(request).await) }
                    });
                    let _ = http2::Builder::new(TokioExecutor::new())
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self {
            _dir: dir,
            socket,
            store,
            accept_loop,
        }
    }

    async fn client(&self) -> ContainerdClient {
        ContainerdClient::connect(&self.socket, NAMESPACE)
            .await
            .expect("should connect to daemon")
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

fn container_request(id: &str) -> ContainerRequest {
    let id = ContainerId::new(id);
    ContainerRequest {
        snapshot_key: id.snapshot_key(),
        id,
        image: fake_image("docker.io/library/alpine:latest"),
        snapshotter: "overlayfs".into(),
        runtime: "io.containerd.runc.v2".into(),
        spec: Spec::default(),
    }
}

// ── Containers ───────────────────────────────────────────────────────

#[tokio::test]
async fn create_container_runs_under_one_lease() {
    let daemon = Daemon::start();
    let client = daemon.client().await;
    let request = container_request("container-0");

    client
        .create_container(request.clone())
        .await
        .expect("should create container");

    assert_eq!(
        daemon.store.paths(),
        [
            path::LEASES_CREATE,
            path::SNAPSHOTS_PREPARE,
            path::CONTAINERS_CREATE,
            path::LEASES_DELETE,
        ]
    );

    let lease = &daemon.store.requests::<proto::CreateLeaseRequest>(path::LEASES_CREATE)[0];
    assert!(lease.labels.contains_key("containerd.io/gc.expire"));
    let calls = daemon.store.calls();
    assert_eq!(calls[0].lease, None);
    assert_eq!(calls[1].lease.as_deref(), Some(lease.id.as_str()));
    assert_eq!(calls[2].lease.as_deref(), Some(lease.id.as_str()));
    let deleted = &daemon.store.requests::<proto::DeleteLeaseRequest>(path::LEASES_DELETE)[0];
    assert_eq!(deleted.id, lease.id);

    let prepare = &daemon.store.requests::<proto::PrepareSnapshotRequest>(path::SNAPSHOTS_PREPARE)[0];
    assert_eq!(prepare.snapshotter, "overlayfs");
    assert_eq!(prepare.key, request.snapshot_key);
    assert_eq!(prepare.parent, request.image.snapshot_parent);

    let created = daemon.store.requests::<proto::CreateContainerRequest>(path::CONTAINERS_CREATE)[0]
        .container
        .clone()
        .unwrap();
    assert_eq!(created.id, "container-0");
    assert_eq!(created.snapshot_key, request.snapshot_key);
    assert_eq!(created.runtime.unwrap().name, "io.containerd.runc.v2");
    let spec = created.spec.unwrap();
    assert_eq!(spec.type_url, type_url::RUNTIME_SPEC);
    let _: Spec = serde_json::from_slice(&spec.value).expect("spec should be JSON");
}

#[tokio::test]
async fn failed_container_record_removes_snapshot_and_lease() {
    let daemon = Daemon::start();
    daemon.store.fail(path::CONTAINERS_CREATE);
    let client = daemon.client().await;
    let request = container_request("container-1");

    let err = client.create_container(request.clone()).await.unwrap_err();
    assert!(
        matches!(err, BenchError::Supervisor { operation: "create container", ref message } if message.contains("injected failure")),
        "{err}"
    );
    assert_eq!(
        daemon.store.paths(),
        [
            path::LEASES_CREATE,
            path::SNAPSHOTS_PREPARE,
            path::CONTAINERS_CREATE,
            path::SNAPSHOTS_REMOVE,
            path::LEASES_DELETE,
        ]
    );
    let removed = &daemon.store.requests::<proto::RemoveSnapshotRequest>(path::SNAPSHOTS_REMOVE)[0];
    assert_eq!(removed.key, request.snapshot_key);

    // Nothing was recorded, so there is no snapshot to mount.
    daemon.store.clear();
    let err = client.create_task(&request.id).await.unwrap_err();
    assert!(matches!(err, BenchError::NotFound { .. }));
    assert!(daemon.store.paths().is_empty());
}

#[tokio::test]
async fn failed_prepare_still_deletes_lease() {
    let daemon = Daemon::start();
    daemon.store.fail(path::SNAPSHOTS_PREPARE);
    let client = daemon.client().await;

    let err = client
        .create_container(container_request("container-2"))
        .await
        .unwrap_err();
    assert!(matches!(err, BenchError::Supervisor { operation: "prepare snapshot", .. }));
    assert_eq!(
        daemon.store.paths(),
        [path::LEASES_CREATE, path::SNAPSHOTS_PREPARE, path::LEASES_DELETE]
    );
}

#[tokio::test]
async fn delete_container_removes_its_snapshot() {
    let daemon = Daemon::start();
    let client = daemon.client().await;
    let request = container_request("container-3");
    client.create_container(request.clone()).await.unwrap();
    daemon.store.clear();

    client.delete_container(&request.id).await.unwrap();
    assert_eq!(
        daemon.store.paths(),
        [path::CONTAINERS_DELETE, path::SNAPSHOTS_REMOVE]
    );
    let deleted = &daemon.store.requests::<proto::DeleteContainerRequest>(path::CONTAINERS_DELETE)[0];
    assert_eq!(deleted.id, "container-3");
    let removed = &daemon.store.requests::<proto::RemoveSnapshotRequest>(path::SNAPSHOTS_REMOVE)[0];
    assert_eq!(removed.snapshotter, "overlayfs");
    assert_eq!(removed.key, request.snapshot_key);

    // The snapshot is forgotten once removed.
    daemon.store.clear();
    client.delete_container(&request.id).await.unwrap();
    assert_eq!(daemon.store.paths(), [path::CONTAINERS_DELETE]);
}

// ── Tasks ────────────────────────────────────────────────────────────

#[tokio::test]
async fn create_task_mounts_snapshot_with_empty_stdio() {
    let daemon = Daemon::start();
    let client = daemon.client().await;
    let request = container_request("container-4");
    client.create_container(request.clone()).await.unwrap();
    daemon.store.clear();

    let pid = client.create_task(&request.id).await.expect("should create task");
    assert_eq!(pid, TASK_PID);
    assert_eq!(daemon.store.paths(), [path::SNAPSHOTS_MOUNTS, path::TASKS_CREATE]);

    let mounts = &daemon.store.requests::<proto::MountsRequest>(path::SNAPSHOTS_MOUNTS)[0];
    assert_eq!(mounts.key, request.snapshot_key);
    let task = &daemon.store.requests::<proto::CreateTaskRequest>(path::TASKS_CREATE)[0];
    assert_eq!(task.container_id, "container-4");
    assert_eq!(task.rootfs, [overlay_mount()]);
    assert!(task.stdin.is_empty());
    assert!(task.stdout.is_empty());
    assert!(task.stderr.is_empty());
    assert!(!task.terminal);
}

#[tokio::test]
async fn wait_task_delivers_exit_from_wait_call() {
    let daemon = Daemon::start();
    let client = daemon.client().await;
    let id = ContainerId::new("container-5");

    let exit = client.wait_task(&id).await.unwrap();
    let status = exit.wait().await.expect("should receive exit status");
    assert_eq!(status.code, EXIT_CODE);
    assert_eq!(status.exited_at.unwrap().timestamp(), 1_700_000_000);

    let wait = &daemon.store.requests::<proto::WaitRequest>(path::TASKS_WAIT)[0];
    assert_eq!(wait.container_id, "container-5");
    assert!(wait.exec_id.is_empty());
}

#[tokio::test]
async fn wait_failure_is_delivered_through_channel() {
    let daemon = Daemon::start();
    daemon.store.fail(path::TASKS_WAIT);
    let client = daemon.client().await;

    let exit = client.wait_task(&ContainerId::new("container-6")).await.unwrap();
    let err = exit.wait().await.unwrap_err();
    assert!(matches!(err, BenchError::Supervisor { operation: "wait task", .. }));
}

#[tokio::test]
async fn start_kill_and_status_address_the_init_process() {
    let daemon = Daemon::start();
    let client = daemon.client().await;
    let id = ContainerId::new("container-7");

    assert_eq!(client.start_task(&id).await.unwrap(), TASK_PID);
    client.kill_task(&id, Signal::SIGTERM).await.unwrap();
    assert_eq!(
        client.task_status(&id).await.unwrap(),
        rtbench_common::types::TaskStatus::Running
    );

    let kill = &daemon.store.requests::<proto::KillRequest>(path::TASKS_KILL)[0];
    assert_eq!(kill.signal, 15);
    assert!(!kill.all);
    assert_eq!(
        daemon.store.paths(),
        [path::TASKS_START, path::TASKS_KILL, path::TASKS_GET]
    );
}

#[tokio::test]
async fn delete_task_kills_all_then_waits_then_deletes() {
    let daemon = Daemon::start();
    let client = daemon.client().await;

    let status = client
        .delete_task(&ContainerId::new("container-8"))
        .await
        .expect("should delete task");
    assert_eq!(status.code, EXIT_CODE);
    assert_eq!(
        daemon.store.paths(),
        [path::TASKS_KILL, path::TASKS_WAIT, path::TASKS_DELETE]
    );
    let kill = &daemon.store.requests::<proto::KillRequest>(path::TASKS_KILL)[0];
    assert_eq!(kill.signal, 9);
    assert!(kill.all);
}

// ── Images ───────────────────────────────────────────────────────────

const INDEX_DIGEST: &str = "sha256:1111111111111111111111111111111111111111111111111111111111111111";
const MANIFEST_DIGEST: &str = "sha256:2222222222222222222222222222222222222222222222222222222222222222";
const OTHER_MANIFEST_DIGEST: &str =
    "sha256:3333333333333333333333333333333333333333333333333333333333333333";
const CONFIG_DIGEST: &str = "sha256:4444444444444444444444444444444444444444444444444444444444444444";
const LAYER_A: &str = "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
const LAYER_B: &str = "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

fn index_blob() -> String {
    let other = if Arch::default() == Arch::s390x { "ppc64le" } else { "s390x" };
    format!(
        r#"{{
  "schemaVersion": 2,
  "mediaType": "application/vnd.oci.image.index.v1+json",
  "manifests": [
    {{
      "mediaType": "application/vnd.oci.image.manifest.v1+json",
      "digest": "{OTHER_MANIFEST_DIGEST}",
      "size": 400,
      "platform": {{"architecture": "{other}", "os": "linux"}}
    }},
    {{
      "mediaType": "application/vnd.oci.image.manifest.v1+json",
      "digest": "{MANIFEST_DIGEST}",
      "size": 400,
      "platform": {{"architecture": "{}", "os": "linux"}}
    }}
  ]
}}"#,
        Arch::default()
    )
}

fn manifest_blob() -> String {
    format!(
        r#"{{
  "schemaVersion": 2,
  "mediaType": "application/vnd.oci.image.manifest.v1+json",
  "config": {{
    "mediaType": "application/vnd.oci.image.config.v1+json",
    "digest": "{CONFIG_DIGEST}",
    "size": 300
  }},
  "layers": [
    {{
      "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
      "digest": "sha256:5555555555555555555555555555555555555555555555555555555555555555",
      "size": 1000
    }},
    {{
      "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
      "digest": "sha256:6666666666666666666666666666666666666666666666666666666666666666",
      "size": 1000
    }}
  ]
}}"#
    )
}

/// A config blob as minimal images ship it: no `history`, no `created`.
fn config_blob() -> String {
    format!(
        r#"{{
  "architecture": "{}",
  "os": "linux",
  "config": {{"Env": ["PATH=/usr/bin:/bin"], "WorkingDir": "/srv"}},
  "rootfs": {{"type": "layers", "diff_ids": ["{LAYER_A}", "{LAYER_B}"]}}
}}"#,
        Arch::default()
    )
}

fn seed_image(store: &Store) {
    let mut blobs = store.blobs.lock().unwrap();
    let _ = blobs.insert(INDEX_DIGEST.into(), index_blob().into_bytes());
    let _ = blobs.insert(MANIFEST_DIGEST.into(), manifest_blob().into_bytes());
    let _ = blobs.insert(CONFIG_DIGEST.into(), config_blob().into_bytes());
    *store.image_target.lock().unwrap() = Some(proto::Descriptor {
        media_type: "application/vnd.oci.image.index.v1+json".into(),
        digest: INDEX_DIGEST.into(),
        size: 800,
        ..proto::Descriptor::default()
    });
}

#[tokio::test]
async fn pull_resolves_index_to_snapshot_parent() {
    let daemon = Daemon::start();
    seed_image(&daemon.store);
    let client = daemon.client().await;

    let image = client
        .pull_image("docker.io/library/alpine:latest", "overlayfs")
        .await
        .expect("should pull image");

    assert_eq!(image.name, "docker.io/library/alpine:latest");
    assert_eq!(
        image.snapshot_parent,
        chain_id(&[LAYER_A.to_owned(), LAYER_B.to_owned()]).unwrap()
    );
    assert_eq!(image.config.env, ["PATH=/usr/bin:/bin"]);
    assert_eq!(image.config.working_dir.as_deref(), Some("/srv"));
    assert_eq!(image.config.user, None);

    assert_eq!(
        daemon.store.paths(),
        [
            path::TRANSFER,
            path::IMAGES_GET,
            path::CONTENT_READ,
            path::CONTENT_READ,
            path::CONTENT_READ,
        ]
    );
    let reads: Vec<String> = daemon
        .store
        .requests::<proto::ReadContentRequest>(path::CONTENT_READ)
        .into_iter()
        .map(|r| r.digest)
        .collect();
    assert_eq!(reads, [INDEX_DIGEST, MANIFEST_DIGEST, CONFIG_DIGEST]);

    let transfer = &daemon.store.requests::<proto::TransferRequest>(path::TRANSFER)[0];
    let destination = transfer.destination.clone().unwrap();
    assert_eq!(destination.type_url, type_url::IMAGE_STORE);
    let store = proto::ImageStore::decode(destination.value.as_slice()).unwrap();
    assert_eq!(store.unpacks[0].snapshotter, "overlayfs");
}

#[tokio::test]
async fn pull_of_unknown_image_is_not_found() {
    let daemon = Daemon::start();
    let client = daemon.client().await;

    let err = client
        .pull_image("docker.io/library/missing:latest", "overlayfs")
        .await
        .unwrap_err();
    assert!(matches!(err, BenchError::NotFound { kind: "image", .. }), "{err}");
}

// ── Metadata ─────────────────────────────────────────────────────────

#[tokio::test]
async fn every_request_carries_the_namespace() {
    let daemon = Daemon::start();
    seed_image(&daemon.store);
    let client = daemon.client().await;
    let request = container_request("container-9");

    let _ = client
        .pull_image("docker.io/library/alpine:latest", "overlayfs")
        .await
        .unwrap();
    client.create_container(request.clone()).await.unwrap();
    let _ = client.create_task(&request.id).await.unwrap();
    let exit = client.wait_task(&request.id).await.unwrap();
    let _ = client.start_task(&request.id).await.unwrap();
    let _ = exit.wait().await.unwrap();
    let _ = client.delete_task(&request.id).await.unwrap();
    client.delete_container(&request.id).await.unwrap();

    let calls = daemon.store.calls();
    assert!(calls.len() > 10, "{:?}", daemon.store.paths());
    for call in calls {
        assert_eq!(call.namespace.as_deref(), Some(NAMESPACE), "{}", call.path);
    }
}
