//! containerd implementation of [`Supervisor`] over its gRPC API.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use oci_spec::image::{Arch, ImageIndex, ImageManifest};
use prost::Message;
use prost_types::{Any, Timestamp};
use tonic::codec::ProstCodec;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::Channel;
use tonic::{Request, Status};

use rtbench_common::error::{BenchError, Result};
use rtbench_common::types::{ContainerId, ExitStatus, TaskStatus};

use super::image::{ImageConfigBlob, chain_id, is_index, select_host_manifest};
use super::proto::{self, path, type_url};
use super::{ContainerRequest, ExitChannel, Image, Supervisor};
use crate::connection::connect_unix;

/// Metadata key containerd reads the namespace from.
const NAMESPACE_HEADER: &str = "containerd-namespace";

/// Metadata key binding a request's resources to a lease.
const LEASE_HEADER: &str = "containerd-lease";

/// Lease label holding the time after which the collector may drop it.
const LEASE_EXPIRE_LABEL: &str = "containerd.io/gc.expire";

/// Lifetime of a lease left behind by a crashed harness.
const LEASE_EXPIRY_HOURS: i64 = 24;

/// Client of a containerd daemon, scoped to one namespace.
#[derive(Debug)]
pub struct ContainerdClient {
    rpc: Rpc,
    /// Snapshot backing each container created through this client.
    snapshots: Mutex<HashMap<ContainerId, SnapshotRef>>,
}

#[derive(Debug, Clone)]
struct SnapshotRef {
    snapshotter: String,
    key: String,
}

/// A lease protecting freshly prepared resources from garbage collection.
#[derive(Debug)]
struct Lease {
    id: String,
    header: MetadataValue<Ascii>,
}

/// Namespaced unary and streaming calls over a shared channel.
#[derive(Debug, Clone)]
struct Rpc {
    channel: Channel,
    namespace: MetadataValue<Ascii>,
    address: PathBuf,
}

impl Rpc {
    fn request<T>(&self, message: T) -> Request<T> {
        let mut request = Request::new(message);
        let _ = request
            .metadata_mut()
            .insert(NAMESPACE_HEADER, self.namespace.clone());
        request
    }

    async fn client(&self) -> Result<tonic::client::Grpc<Channel>> {
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready().await.map_err(|e| BenchError::Transport {
            address: self.address.clone(),
            message: e.to_string(),
        })?;
        Ok(grpc)
    }

    async fn unary<Req, Resp>(
        &self,
        operation: &'static str,
        path: &'static str,
        message: Req,
    ) -> Result<Resp>
    where
        Req: Message + Send + Sync + 'static,
        Resp: Message + Default + Send + Sync + 'static,
    {
        self.call(operation, path, self.request(message)).await
    }

    /// Like [`Rpc::unary`], with the request bound to `lease`.
    async fn leased<Req, Resp>(
        &self,
        operation: &'static str,
        path: &'static str,
        message: Req,
        lease: &Lease,
    ) -> Result<Resp>
    where
        Req: Message + Send + Sync + 'static,
        Resp: Message + Default + Send + Sync + 'static,
    {
        let mut request = self.request(message);
        let _ = request
            .metadata_mut()
            .insert(LEASE_HEADER, lease.header.clone());
        self.call(operation, path, request).await
    }

    async fn call<Req, Resp>(
        &self,
        operation: &'static str,
        path: &'static str,
        request: Request<Req>,
    ) -> Result<Resp>
    where
        Req: Message + Send + Sync + 'static,
        Resp: Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.client().await?;
        let response = grpc
            .unary(
                request,
                PathAndQuery::from_static(path),
                ProstCodec::<Req, Resp>::default(),
            )
            .await
            .map_err(|status| status_error(operation, &status))?;
        Ok(response.into_inner())
    }
}

fn status_error(operation: &'static str, status: &Status) -> BenchError {
    BenchError::supervisor(operation, format!("{:?}: {}", status.code(), status.message()))
}

fn any<M: Message>(type_url: &str, message: &M) -> Any {
    Any {
        type_url: type_url.to_owned(),
        value: message.encode_to_vec(),
    }
}

/// Converts a protobuf timestamp, treating the zero time as unset.
fn timestamp(ts: Option<Timestamp>) -> Option<DateTime<Utc>> {
    let ts = ts.filter(|ts| ts.seconds > 0)?;
    DateTime::from_timestamp(ts.seconds, u32::try_from(ts.nanos).ok()?)
}

fn host_platform() -> proto::Platform {
    proto::Platform {
        os: "linux".into(),
        architecture: Arch::default().to_string(),
        ..proto::Platform::default()
    }
}

const fn task_status(status: proto::Status) -> TaskStatus {
    match status {
        proto::Status::Unknown => TaskStatus::Unknown,
        proto::Status::Created => TaskStatus::Created,
        proto::Status::Running => TaskStatus::Running,
        proto::Status::Stopped => TaskStatus::Stopped,
        proto::Status::Paused => TaskStatus::Paused,
        proto::Status::Pausing => TaskStatus::Pausing,
    }
}

fn oci_parse_error(what: &'static str) -> impl Fn(oci_spec::OciSpecError) -> BenchError {
    move |e| BenchError::Parse {
        what,
        message: e.to_string(),
    }
}

impl ContainerdClient {
    /// Connects to the daemon socket at `address`; every request is scoped
    /// to `namespace`.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace is not a valid header value or the
    /// socket cannot be reached.
    pub async fn connect(address: &Path, namespace: &str) -> Result<Self> {
        let namespace = namespace
            .parse::<MetadataValue<Ascii>>()
            .map_err(|e| BenchError::Config {
                message: format!("invalid supervisor namespace {namespace:?}: {e}"),
            })?;
        let channel = connect_unix(address).await?;
        Ok(Self {
            rpc: Rpc {
                channel,
                namespace,
                address: address.to_path_buf(),
            },
            snapshots: Mutex::new(HashMap::new()),
        })
    }

    fn snapshots(&self) -> std::sync::MutexGuard<'_, HashMap<ContainerId, SnapshotRef>> {
        self.snapshots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn snapshot_of(&self, id: &ContainerId) -> Result<SnapshotRef> {
        self.snapshots()
            .get(id)
            .cloned()
            .ok_or_else(|| BenchError::NotFound {
                kind: "container",
                id: id.to_string(),
            })
    }

    /// Reads a whole blob from the content store.
    async fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let mut grpc = self.rpc.client().await?;
        let request = self.rpc.request(proto::ReadContentRequest {
            digest: digest.to_owned(),
            offset: 0,
            size: 0,
        });
        let mut stream = grpc
            .server_streaming(
                request,
                PathAndQuery::from_static(path::CONTENT_READ),
                ProstCodec::<proto::ReadContentRequest, proto::ReadContentResponse>::default(),
            )
            .await
            .map_err(|status| status_error("read content", &status))?
            .into_inner();

        let mut data = Vec::new();
        while let Some(chunk) = stream
            .message()
            .await
            .map_err(|status| status_error("read content", &status))?
        {
            data.extend_from_slice(&chunk.data);
        }
        tracing::trace!(digest, bytes = data.len(), "read blob");
        Ok(data)
    }

    /// Resolves a stored image to its runtime config and snapshot parent.
    async fn resolve_image(&self, name: &str) -> Result<Image> {
        let response: proto::GetImageResponse = self
            .rpc
            .unary(
                "get image",
                path::IMAGES_GET,
                proto::GetImageRequest {
                    name: name.to_owned(),
                },
            )
            .await?;
        let not_found = || BenchError::NotFound {
            kind: "image",
            id: name.to_owned(),
        };
        let image = response.image.ok_or_else(not_found)?;
        let target = image.target.ok_or_else(not_found)?;

        let manifest_digest = if is_index(&target.media_type) {
            let blob = self.read_blob(&target.digest).await?;
            let index =
                ImageIndex::from_reader(blob.as_slice()).map_err(oci_parse_error("image index"))?;
            select_host_manifest(&index)?.digest().clone()
        } else {
            target.digest
        };

        let blob = self.read_blob(&manifest_digest).await?;
        let manifest =
            ImageManifest::from_reader(blob.as_slice()).map_err(oci_parse_error("image manifest"))?;
        let blob = self.read_blob(manifest.config().digest()).await?;
        let configuration = ImageConfigBlob::from_slice(&blob)?;

        Ok(Image {
            name: image.name,
            config: configuration.runtime_config(),
            snapshot_parent: chain_id(configuration.diff_ids())?,
        })
    }

    /// Creates a lease that expires on its own if it is never deleted.
    async fn create_lease(&self, id: &ContainerId) -> Result<Lease> {
        let now = Utc::now();
        let lease_id = format!("rtbench-{id}-{}", now.timestamp_micros());
        let header = lease_id
            .parse::<MetadataValue<Ascii>>()
            .map_err(|e| BenchError::supervisor("create lease", format!("{lease_id:?}: {e}")))?;
        let expires = now + chrono::Duration::hours(LEASE_EXPIRY_HOURS);
        let labels = HashMap::from([(
            LEASE_EXPIRE_LABEL.to_owned(),
            expires.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        )]);

        let _: proto::CreateLeaseResponse = self
            .rpc
            .unary(
                "create lease",
                path::LEASES_CREATE,
                proto::CreateLeaseRequest {
                    id: lease_id.clone(),
                    labels,
                },
            )
            .await?;
        tracing::trace!(lease = %lease_id, "lease created");
        Ok(Lease {
            id: lease_id,
            header,
        })
    }

    async fn delete_lease(&self, lease: Lease) -> Result<()> {
        self.rpc
            .unary::<_, ()>(
                "delete lease",
                path::LEASES_DELETE,
                proto::DeleteLeaseRequest {
                    id: lease.id,
                    sync: false,
                },
            )
            .await
    }

    /// Prepares the writable snapshot and records the container, both
    /// under `lease`. The snapshot is removed again if the record fails.
    async fn prepare_and_record(
        &self,
        request: &ContainerRequest,
        snapshot: &SnapshotRef,
        lease: &Lease,
    ) -> Result<()> {
        let _: proto::PrepareSnapshotResponse = self
            .rpc
            .leased(
                "prepare snapshot",
                path::SNAPSHOTS_PREPARE,
                proto::PrepareSnapshotRequest {
                    snapshotter: snapshot.snapshotter.clone(),
                    key: snapshot.key.clone(),
                    parent: request.image.snapshot_parent.clone(),
                    labels: HashMap::new(),
                },
                lease,
            )
            .await?;

        let container = proto::Container {
            id: request.id.to_string(),
            labels: HashMap::new(),
            image: request.image.name.clone(),
            runtime: Some(proto::Runtime {
                name: request.runtime.clone(),
                options: None,
            }),
            spec: Some(Any {
                type_url: type_url::RUNTIME_SPEC.to_owned(),
                value: serde_json::to_vec(&request.spec)?,
            }),
            snapshotter: snapshot.snapshotter.clone(),
            snapshot_key: snapshot.key.clone(),
        };

        let created: Result<proto::CreateContainerResponse> = self
            .rpc
            .leased(
                "create container",
                path::CONTAINERS_CREATE,
                proto::CreateContainerRequest {
                    container: Some(container),
                },
                lease,
            )
            .await;
        if let Err(e) = created {
            if let Err(cleanup) = self.remove_snapshot(snapshot).await {
                tracing::warn!(id = %request.id, error = %cleanup, "failed to remove orphaned snapshot");
            }
            return Err(e);
        }
        Ok(())
    }

    async fn remove_snapshot(&self, snapshot: &SnapshotRef) -> Result<()> {
        self.rpc
            .unary::<_, ()>(
                "remove snapshot",
                path::SNAPSHOTS_REMOVE,
                proto::RemoveSnapshotRequest {
                    snapshotter: snapshot.snapshotter.clone(),
                    key: snapshot.key.clone(),
                },
            )
            .await
    }

    async fn wait_exit(rpc: &Rpc, id: &ContainerId) -> Result<ExitStatus> {
        let response: proto::WaitResponse = rpc
            .unary(
                "wait task",
                path::TASKS_WAIT,
                proto::WaitRequest {
                    container_id: id.to_string(),
                    exec_id: String::new(),
                },
            )
            .await?;
        Ok(ExitStatus {
            code: response.exit_status,
            exited_at: timestamp(response.exited_at),
        })
    }

    async fn signal(&self, id: &ContainerId, signal: Signal, all: bool) -> Result<()> {
        self.rpc
            .unary::<_, ()>(
                "kill task",
                path::TASKS_KILL,
                proto::KillRequest {
                    container_id: id.to_string(),
                    exec_id: String::new(),
                    signal: (signal as i32).unsigned_abs(),
                    all,
                },
            )
            .await
    }
}

#[async_trait]
impl Supervisor for ContainerdClient {
    async fn pull_image(&self, reference: &str, snapshotter: &str) -> Result<Image> {
        let platform = host_platform();
        let source = proto::OciRegistry {
            reference: reference.to_owned(),
        };
        let destination = proto::ImageStore {
            name: reference.to_owned(),
            platforms: vec![platform.clone()],
            unpacks: vec![proto::UnpackConfiguration {
                platform: Some(platform),
                snapshotter: snapshotter.to_owned(),
            }],
            ..proto::ImageStore::default()
        };

        tracing::debug!(reference, snapshotter, "transferring image");
        self.rpc
            .unary::<_, ()>(
                "pull image",
                path::TRANSFER,
                proto::TransferRequest {
                    source: Some(any(type_url::OCI_REGISTRY, &source)),
                    destination: Some(any(type_url::IMAGE_STORE, &destination)),
                },
            )
            .await?;

        self.resolve_image(reference).await
    }

    async fn create_container(&self, request: ContainerRequest) -> Result<()> {
        let snapshot = SnapshotRef {
            snapshotter: request.snapshotter.clone(),
            key: request.snapshot_key.clone(),
        };

        // The container record references the snapshot once it exists,
        // so the lease only has to cover the gap in between.
        let lease = self.create_lease(&request.id).await?;
        let recorded = self.prepare_and_record(&request, &snapshot, &lease).await;
        if let Err(e) = self.delete_lease(lease).await {
            tracing::warn!(id = %request.id, error = %e, "failed to delete lease");
        }
        recorded?;

        let _ = self.snapshots().insert(request.id, snapshot);
        Ok(())
    }

    async fn create_task(&self, id: &ContainerId) -> Result<u32> {
        let snapshot = self.snapshot_of(id)?;
        let mounts: proto::MountsResponse = self
            .rpc
            .unary(
                "read snapshot mounts",
                path::SNAPSHOTS_MOUNTS,
                proto::MountsRequest {
                    snapshotter: snapshot.snapshotter,
                    key: snapshot.key,
                },
            )
            .await?;

        let response: proto::CreateTaskResponse = self
            .rpc
            .unary(
                "create task",
                path::TASKS_CREATE,
                proto::CreateTaskRequest {
                    container_id: id.to_string(),
                    rootfs: mounts.mounts,
                    ..proto::CreateTaskRequest::default()
                },
            )
            .await?;
        Ok(response.pid)
    }

    async fn wait_task(&self, id: &ContainerId) -> Result<ExitChannel> {
        let (tx, channel) = ExitChannel::pair();
        let rpc = self.rpc.clone();
        let id = id.clone();
        let _ = tokio::spawn(async move {
            let _ = tx.send(Self::wait_exit(&rpc, &id).await);
        });
        Ok(channel)
    }

    async fn start_task(&self, id: &ContainerId) -> Result<u32> {
        let response: proto::StartResponse = self
            .rpc
            .unary(
                "start task",
                path::TASKS_START,
                proto::StartRequest {
                    container_id: id.to_string(),
                    exec_id: String::new(),
                },
            )
            .await?;
        Ok(response.pid)
    }

    async fn task_status(&self, id: &ContainerId) -> Result<TaskStatus> {
        let response: proto::GetResponse = self
            .rpc
            .unary(
                "get task",
                path::TASKS_GET,
                proto::GetRequest {
                    container_id: id.to_string(),
                    exec_id: String::new(),
                },
            )
            .await?;
        let process = response.process.ok_or_else(|| BenchError::NotFound {
            kind: "task",
            id: id.to_string(),
        })?;
        Ok(task_status(process.status()))
    }

    async fn kill_task(&self, id: &ContainerId, signal: Signal) -> Result<()> {
        self.signal(id, signal, false).await
    }

    async fn delete_task(&self, id: &ContainerId) -> Result<ExitStatus> {
        if let Err(e) = self.signal(id, Signal::SIGKILL, true).await {
            tracing::debug!(%id, error = %e, "kill before delete ignored");
        }
        if let Err(e) = Self::wait_exit(&self.rpc, id).await {
            tracing::debug!(%id, error = %e, "wait before delete ignored");
        }

        let response: proto::DeleteResponse = self
            .rpc
            .unary(
                "delete task",
                path::TASKS_DELETE,
                proto::DeleteTaskRequest {
                    container_id: id.to_string(),
                },
            )
            .await?;
        Ok(ExitStatus {
            code: response.exit_status,
            exited_at: timestamp(response.exited_at),
        })
    }

    async fn delete_container(&self, id: &ContainerId) -> Result<()> {
        self.rpc
            .unary::<_, ()>(
                "delete container",
                path::CONTAINERS_DELETE,
                proto::DeleteContainerRequest { id: id.to_string() },
            )
            .await?;

        let snapshot = self.snapshots().remove(id);
        if let Some(snapshot) = snapshot {
            self.remove_snapshot(&snapshot).await?;
        }
        Ok(())
    }
}
