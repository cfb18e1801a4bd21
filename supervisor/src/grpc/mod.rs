//! [`SupervisorClient`] backed by the containerd gRPC services on a unix
//! socket.

pub(crate) mod api;
mod pull;
mod task;

use crate::client::{EventStream, SupervisorClient, SupervisorContainer};
use crate::error::SupervisorError;
use crate::types::*;
use async_trait::async_trait;
use berth_core::Context;
use hyper_util::rt::TokioIo;
use prost_types::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tonic::Request;
use tonic::client::Grpc;
use tonic::codec::{ProstCodec, Streaming};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint, Uri};
use tracing::{debug, warn};

pub use pull::{chain_ids, render_hosts_toml};
pub use task::{GrpcContainer, GrpcTask};

pub const NAMESPACE_HEADER: &str = "containerd-namespace";
pub const LEASE_HEADER: &str = "containerd-lease";

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Envelopes buffered per subscription before the reader waits.
const EVENT_BUFFER: usize = 128;

struct Inner {
    grpc: Grpc<Channel>,
    hosts_dir: PathBuf,
    closed: AtomicBool,
}

/// Client of a containerd daemon.
#[derive(Clone)]
pub struct GrpcSupervisor {
    inner: Arc<Inner>,
}

impl GrpcSupervisor {
    /// Connects to the daemon listening on `socket`. Registry host
    /// configuration for pulls is written below `hosts_dir`.
    pub async fn connect(
        socket: impl AsRef<Path>,
        hosts_dir: impl Into<PathBuf>,
    ) -> Result<Self, SupervisorError> {
        let socket = socket.as_ref().to_path_buf();
        debug!("Connecting to supervisor at {}", socket.display());
        // The URI is only a placeholder; every connection goes to the socket.
        let channel = Endpoint::from_static("http://[::]:50051")
            .connect_timeout(DIAL_TIMEOUT)
            .connect_with_connector(tower::service_fn(move |_: Uri| {
                let socket = socket.clone();
                async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(socket).await?)) }
            }))
            .await?;
        Ok(Self {
            inner: Arc::new(Inner {
                grpc: Grpc::new(channel),
                hosts_dir: hosts_dir.into(),
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn check_open(&self) -> Result<(), SupervisorError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(tonic::Status::unavailable("supervisor client is closed").into());
        }
        Ok(())
    }

    async fn unary<Req, Res>(
        &self,
        ctx: &Context,
        service: &str,
        method: &str,
        message: Req,
    ) -> Result<Res, SupervisorError>
    where
        Req: prost::Message + Send + Sync + 'static,
        Res: prost::Message + Default + Send + Sync + 'static,
    {
        self.check_open()?;
        let request = scoped_request(ctx, message)?;
        let path = method_path(service, method)?;
        let mut grpc = self.inner.grpc.clone();
        ctx.run(async {
            grpc.ready().await?;
            let response = grpc
                .unary(request, path, ProstCodec::<Req, Res>::default())
                .await?;
            Ok(response.into_inner())
        })
        .await
    }

    async fn server_streaming<Req, Res>(
        &self,
        ctx: &Context,
        service: &str,
        method: &str,
        message: Req,
    ) -> Result<Streaming<Res>, SupervisorError>
    where
        Req: prost::Message + Send + Sync + 'static,
        Res: prost::Message + Default + Send + Sync + 'static,
    {
        self.check_open()?;
        let request = scoped_request(ctx, message)?;
        let path = method_path(service, method)?;
        let mut grpc = self.inner.grpc.clone();
        ctx.run(async {
            grpc.ready().await?;
            let response = grpc
                .server_streaming(request, path, ProstCodec::<Req, Res>::default())
                .await?;
            Ok(response.into_inner())
        })
        .await
    }

    /// Drains a server stream, giving up when `ctx` is cancelled.
    async fn collect<Res>(
        ctx: &Context,
        mut stream: Streaming<Res>,
    ) -> Result<Vec<Res>, SupervisorError>
    where
        Res: prost::Message + Default + Send + 'static,
    {
        ctx.run(async {
            let mut items = Vec::new();
            while let Some(item) = stream.message().await? {
                items.push(item);
            }
            Ok(items)
        })
        .await
    }

    async fn get_container(&self, ctx: &Context, id: &str) -> Result<api::Container, SupervisorError> {
        let res: api::ContainerResponse = self
            .unary(
                ctx,
                api::CONTAINERS,
                "Get",
                api::ContainerIdRequest { id: id.to_string() },
            )
            .await?;
        res.container
            .ok_or_else(|| SupervisorError::NotFound(format!("container \"{}\"", id)))
    }

    async fn prepare_with_labels(
        &self,
        ctx: &Context,
        snapshotter: &str,
        key: &str,
        parent: &str,
        labels: HashMap<String, String>,
    ) -> Result<Vec<Mount>, SupervisorError> {
        let res: api::MountsResponse = self
            .unary(
                ctx,
                api::SNAPSHOTS,
                "Prepare",
                api::PrepareSnapshotRequest {
                    snapshotter: snapshotter.to_string(),
                    key: key.to_string(),
                    parent: parent.to_string(),
                    labels,
                },
            )
            .await?;
        Ok(res.mounts.into_iter().map(from_api_mount).collect())
    }
}

fn method_path(service: &str, method: &str) -> Result<PathAndQuery, SupervisorError> {
    PathAndQuery::try_from(format!("{}{}", service, method))
        .map_err(|e| SupervisorError::Internal(format!("bad method path: {}", e)))
}

/// Wraps `message` with the namespace and lease carried by `ctx`.
fn scoped_request<T>(ctx: &Context, message: T) -> Result<Request<T>, SupervisorError> {
    let mut request = Request::new(message);
    for (header, value) in [(NAMESPACE_HEADER, ctx.namespace()), (LEASE_HEADER, ctx.lease())] {
        if let Some(value) = value {
            let value = value.parse().map_err(|_| {
                SupervisorError::InvalidArgument(format!("invalid {} {:?}", header, value))
            })?;
            request.metadata_mut().insert(header, value);
        }
    }
    Ok(request)
}

fn timestamp_or_epoch(ts: Option<prost_types::Timestamp>) -> std::time::SystemTime {
    ts.as_ref()
        .map(from_timestamp)
        .unwrap_or(std::time::UNIX_EPOCH)
}

fn from_api_lease(lease: api::Lease) -> Lease {
    Lease {
        id: lease.id,
        labels: lease.labels,
        created_at: timestamp_or_epoch(lease.created_at),
    }
}

fn from_api_descriptor(desc: api::Descriptor) -> berth_remote::Descriptor {
    berth_remote::Descriptor {
        media_type: desc.media_type,
        digest: desc.digest,
        size: desc.size,
        annotations: desc.annotations,
        ..Default::default()
    }
}

fn to_api_descriptor(desc: &berth_remote::Descriptor) -> api::Descriptor {
    api::Descriptor {
        media_type: desc.media_type.clone(),
        digest: desc.digest.clone(),
        size: desc.size,
        annotations: desc.annotations.clone(),
    }
}

fn from_api_image(image: api::Image) -> Image {
    Image {
        name: image.name,
        target: image.target.map(from_api_descriptor).unwrap_or_default(),
        labels: image.labels,
        created_at: timestamp_or_epoch(image.created_at),
    }
}

fn from_api_mount(mount: api::Mount) -> Mount {
    Mount {
        mount_type: mount.r#type,
        source: mount.source,
        options: mount.options,
    }
}

fn to_api_mount(mount: &Mount) -> api::Mount {
    api::Mount {
        r#type: mount.mount_type.clone(),
        source: mount.source.clone(),
        target: String::new(),
        options: mount.options.clone(),
    }
}

fn from_api_snapshot(info: api::SnapshotInfo) -> SnapshotInfo {
    let kind = match info.kind() {
        api::SnapshotKind::View => SnapshotKind::View,
        api::SnapshotKind::Committed => SnapshotKind::Committed,
        api::SnapshotKind::Active | api::SnapshotKind::Unknown => SnapshotKind::Active,
    };
    SnapshotInfo {
        key: info.name,
        parent: Some(info.parent).filter(|p| !p.is_empty()),
        kind,
        labels: info.labels,
    }
}

fn from_api_envelope(env: api::Envelope) -> Envelope {
    Envelope {
        timestamp: env.timestamp.unwrap_or_default(),
        namespace: env.namespace,
        topic: env.topic,
        event: env.event,
    }
}

fn json_any<T: serde::Serialize>(type_url: &str, value: &T) -> Result<Any, SupervisorError> {
    Ok(Any {
        type_url: type_url.to_string(),
        value: serde_json::to_vec(value)
            .map_err(|e| SupervisorError::OciSpec(e.to_string()))?,
    })
}

#[async_trait]
impl SupervisorClient for GrpcSupervisor {
    async fn create_lease(
        &self,
        ctx: &Context,
        id: &str,
        labels: HashMap<String, String>,
    ) -> Result<Lease, SupervisorError> {
        let res: api::CreateLeaseResponse = self
            .unary(
                ctx,
                api::LEASES,
                "Create",
                api::CreateLeaseRequest {
                    id: id.to_string(),
                    labels,
                },
            )
            .await?;
        res.lease
            .map(from_api_lease)
            .ok_or_else(|| SupervisorError::Internal(format!("lease {} missing from reply", id)))
    }

    async fn list_leases(&self, ctx: &Context) -> Result<Vec<Lease>, SupervisorError> {
        let res: api::ListLeasesResponse = self
            .unary(ctx, api::LEASES, "List", api::ListLeasesRequest::default())
            .await?;
        Ok(res.leases.into_iter().map(from_api_lease).collect())
    }

    async fn delete_lease(&self, ctx: &Context, id: &str, sync: bool) -> Result<(), SupervisorError> {
        self.unary::<_, ()>(
            ctx,
            api::LEASES,
            "Delete",
            api::DeleteLeaseRequest {
                id: id.to_string(),
                sync,
            },
        )
        .await
    }

    async fn list_lease_resources(
        &self,
        ctx: &Context,
        id: &str,
    ) -> Result<Vec<LeaseResource>, SupervisorError> {
        let res: api::ListResourcesResponse = self
            .unary(
                ctx,
                api::LEASES,
                "ListResources",
                api::ListResourcesRequest { id: id.to_string() },
            )
            .await?;
        Ok(res
            .resources
            .into_iter()
            .map(|r| LeaseResource {
                id: r.id,
                resource_type: r.r#type,
            })
            .collect())
    }

    async fn delete_lease_resource(
        &self,
        ctx: &Context,
        id: &str,
        resource: LeaseResource,
    ) -> Result<(), SupervisorError> {
        self.unary::<_, ()>(
            ctx,
            api::LEASES,
            "DeleteResource",
            api::DeleteResourceRequest {
                id: id.to_string(),
                resource: Some(api::Resource {
                    id: resource.id,
                    r#type: resource.resource_type,
                }),
            },
        )
        .await
    }

    async fn get_image(&self, ctx: &Context, name: &str) -> Result<Image, SupervisorError> {
        let res: api::GetImageResponse = self
            .unary(
                ctx,
                api::IMAGES,
                "Get",
                api::GetImageRequest {
                    name: name.to_string(),
                },
            )
            .await?;
        res.image
            .map(from_api_image)
            .ok_or_else(|| SupervisorError::NotFound(format!("image \"{}\"", name)))
    }

    async fn pull_image(
        &self,
        ctx: &Context,
        name: &str,
        opts: PullOptions,
    ) -> Result<Image, SupervisorError> {
        pull::pull(self, ctx, name, opts).await
    }

    async fn unpack_image(
        &self,
        ctx: &Context,
        image: &Image,
        opts: UnpackOptions,
    ) -> Result<(), SupervisorError> {
        pull::unpack(self, ctx, image, &opts.snapshotter, opts.decrypt.as_ref()).await
    }

    async fn is_unpacked(
        &self,
        ctx: &Context,
        image: &Image,
        snapshotter: &str,
    ) -> Result<bool, SupervisorError> {
        let chain_id = self.image_chain_id(ctx, image).await?;
        match self.stat_snapshot(ctx, snapshotter, &chain_id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn list_images(&self, ctx: &Context) -> Result<Vec<Image>, SupervisorError> {
        let res: api::ListImagesResponse = self
            .unary(ctx, api::IMAGES, "List", api::ListImagesRequest::default())
            .await?;
        Ok(res.images.into_iter().map(from_api_image).collect())
    }

    async fn delete_image(&self, ctx: &Context, name: &str) -> Result<(), SupervisorError> {
        self.unary::<_, ()>(
            ctx,
            api::IMAGES,
            "Delete",
            api::DeleteImageRequest {
                name: name.to_string(),
                sync: false,
            },
        )
        .await
    }

    async fn image_chain_id(&self, ctx: &Context, image: &Image) -> Result<String, SupervisorError> {
        let layers = pull::image_layers(self, ctx, image).await?;
        chain_ids(&layers.diff_ids)
            .pop()
            .ok_or_else(|| SupervisorError::InvalidArgument(format!("image {} has no layers", image.name)))
    }

    async fn read_blob(
        &self,
        ctx: &Context,
        desc: &berth_remote::Descriptor,
    ) -> Result<Vec<u8>, SupervisorError> {
        let stream: Streaming<api::ReadContentResponse> = self
            .server_streaming(
                ctx,
                api::CONTENT,
                "Read",
                api::ReadContentRequest {
                    digest: desc.digest.clone(),
                    ..Default::default()
                },
            )
            .await?;
        let mut blob = Vec::with_capacity(desc.size.max(0) as usize);
        for chunk in Self::collect(ctx, stream).await? {
            blob.extend_from_slice(&chunk.data);
        }
        Ok(blob)
    }

    async fn stat_snapshot(
        &self,
        ctx: &Context,
        snapshotter: &str,
        key: &str,
    ) -> Result<SnapshotInfo, SupervisorError> {
        let res: api::StatSnapshotResponse = self
            .unary(
                ctx,
                api::SNAPSHOTS,
                "Stat",
                api::SnapshotKeyRequest {
                    snapshotter: snapshotter.to_string(),
                    key: key.to_string(),
                },
            )
            .await?;
        res.info
            .map(from_api_snapshot)
            .ok_or_else(|| SupervisorError::NotFound(format!("snapshot {}", key)))
    }

    async fn prepare_snapshot(
        &self,
        ctx: &Context,
        snapshotter: &str,
        key: &str,
        parent: &str,
    ) -> Result<Vec<Mount>, SupervisorError> {
        self.prepare_with_labels(ctx, snapshotter, key, parent, HashMap::new())
            .await
    }

    async fn snapshot_mounts(
        &self,
        ctx: &Context,
        snapshotter: &str,
        key: &str,
    ) -> Result<Vec<Mount>, SupervisorError> {
        let res: api::MountsResponse = self
            .unary(
                ctx,
                api::SNAPSHOTS,
                "Mounts",
                api::SnapshotKeyRequest {
                    snapshotter: snapshotter.to_string(),
                    key: key.to_string(),
                },
            )
            .await?;
        Ok(res.mounts.into_iter().map(from_api_mount).collect())
    }

    async fn list_snapshots(
        &self,
        ctx: &Context,
        snapshotter: &str,
    ) -> Result<Vec<SnapshotInfo>, SupervisorError> {
        let stream: Streaming<api::ListSnapshotsResponse> = self
            .server_streaming(
                ctx,
                api::SNAPSHOTS,
                "List",
                api::ListSnapshotsRequest {
                    snapshotter: snapshotter.to_string(),
                    filters: Vec::new(),
                },
            )
            .await?;
        Ok(Self::collect(ctx, stream)
            .await?
            .into_iter()
            .flat_map(|batch| batch.info)
            .map(from_api_snapshot)
            .collect())
    }

    async fn remove_snapshot(
        &self,
        ctx: &Context,
        snapshotter: &str,
        key: &str,
    ) -> Result<(), SupervisorError> {
        self.unary::<_, ()>(
            ctx,
            api::SNAPSHOTS,
            "Remove",
            api::SnapshotKeyRequest {
                snapshotter: snapshotter.to_string(),
                key: key.to_string(),
            },
        )
        .await
    }

    async fn new_container(
        &self,
        ctx: &Context,
        container: NewContainer,
    ) -> Result<Arc<dyn SupervisorContainer>, SupervisorError> {
        let id = container.id.clone();
        let record = api::Container {
            id: container.id,
            labels: container.labels,
            image: container.image,
            runtime: Some(api::Runtime {
                name: container.runtime.name,
                options: container.runtime.options,
            }),
            spec: Some(json_any(api::SPEC_TYPE_URL, &container.spec)?),
            snapshotter: container.snapshotter,
            snapshot_key: container.snapshot_key,
            ..Default::default()
        };
        let _: api::ContainerResponse = self
            .unary(
                ctx,
                api::CONTAINERS,
                "Create",
                api::CreateContainerRequest {
                    container: Some(record),
                },
            )
            .await?;
        Ok(Arc::new(GrpcContainer::new(self.clone(), id)))
    }

    async fn load_container(
        &self,
        ctx: &Context,
        id: &str,
    ) -> Result<Arc<dyn SupervisorContainer>, SupervisorError> {
        self.get_container(ctx, id).await?;
        Ok(Arc::new(GrpcContainer::new(self.clone(), id.to_string())))
    }

    async fn subscribe(
        &self,
        ctx: &Context,
        filters: Vec<String>,
    ) -> Result<EventStream, SupervisorError> {
        let mut stream: Streaming<api::Envelope> = self
            .server_streaming(ctx, api::EVENTS, "Subscribe", api::SubscribeRequest { filters })
            .await?;
        let (env_tx, envelopes) = mpsc::channel(EVENT_BUFFER);
        let (err_tx, errors) = mpsc::channel(1);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = ctx.cancelled() => break,
                    next = stream.message() => next,
                };
                match next {
                    Ok(Some(env)) => {
                        if env_tx.send(from_api_envelope(env)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = err_tx
                            .send(tonic::Status::unavailable("event stream ended").into())
                            .await;
                        break;
                    }
                    Err(status) => {
                        warn!("Event stream failed: {}", status);
                        let _ = err_tx.send(status.into()).await;
                        break;
                    }
                }
            }
        });
        Ok(EventStream { envelopes, errors })
    }

    async fn close(&self) -> Result<(), SupervisorError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests;
