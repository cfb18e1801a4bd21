use crate::client::{
    EventStream, IoAttach, IoCreator, SupervisorClient, SupervisorContainer, SupervisorTask,
};
use crate::error::SupervisorError;
use crate::lease::bootstrap_lease;
use crate::mounter::Mounter;
use crate::types::*;
use berth_core::Context;
use berth_remote::{Descriptor, HostsResolver, Platform};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const ROOTFS_NAME: &str = "rootfs";

const LOAD_TASK_ATTEMPTS: u32 = 3;
const LOAD_TASK_TIMEOUT: Duration = Duration::from_secs(3);

/// Snapshot key of a container's root filesystem.
pub fn snapshot_id(container_id: &str) -> String {
    format!("{}-snapshot", container_id)
}

#[derive(Debug, Clone)]
pub struct SpiConfig {
    pub namespace: String,
    pub snapshotter: String,
    pub meta_path: PathBuf,
    pub lease_id: String,
}

/// Facade over the native supervisor client.
///
/// Every call runs in the configured namespace. Container, task and snapshot
/// mutations additionally run under the process-wide lease; image pulls,
/// unpacks and deletions never do.
pub struct SupervisorSpi {
    client: Arc<dyn SupervisorClient>,
    mounter: Arc<dyn Mounter>,
    namespace: String,
    snapshotter: String,
    meta_path: PathBuf,
    lease: Lease,
}

impl SupervisorSpi {
    pub async fn new(
        ctx: &Context,
        client: Arc<dyn SupervisorClient>,
        mounter: Arc<dyn Mounter>,
        config: SpiConfig,
    ) -> Result<Self, SupervisorError> {
        let scoped = ctx.without_lease().with_namespace(&config.namespace);
        let lease = scoped
            .run(bootstrap_lease(client.as_ref(), &scoped, &config.lease_id))
            .await?;

        Ok(Self {
            client,
            mounter,
            namespace: config.namespace,
            snapshotter: config.snapshotter,
            meta_path: config.meta_path,
            lease,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn snapshotter(&self) -> &str {
        &self.snapshotter
    }

    pub fn lease_id(&self) -> &str {
        &self.lease.id
    }

    /// `ctx` scoped to the namespace, without a lease.
    pub fn scoped(&self, ctx: &Context) -> Context {
        ctx.without_lease().with_namespace(&self.namespace)
    }

    /// `ctx` scoped to the namespace and the lease.
    pub fn leased(&self, ctx: &Context) -> Context {
        ctx.with_namespace(&self.namespace).with_lease(&self.lease.id)
    }

    pub fn container_fs_dir(&self, container_id: &str) -> PathBuf {
        self.meta_path.join(&self.snapshotter).join(container_id)
    }

    pub fn rootfs_path(&self, container_id: &str, rootfs_name: &str) -> PathBuf {
        self.container_fs_dir(container_id).join(rootfs_name)
    }

    pub async fn get_image(&self, ctx: &Context, name: &str) -> Result<Image, SupervisorError> {
        let ctx = self.scoped(ctx);
        ctx.run(self.client.get_image(&ctx, name)).await
    }

    /// Pulls and unpacks `name` into the configured snapshotter.
    pub async fn pull_image(
        &self,
        ctx: &Context,
        name: &str,
        resolver: Option<HostsResolver>,
        decrypt: Option<DecryptPayload>,
    ) -> Result<Image, SupervisorError> {
        let ctx = self.scoped(ctx);
        let opts = PullOptions {
            resolver,
            platform: Platform::current(),
            unpack: true,
            snapshotter: self.snapshotter.clone(),
            decrypt,
        };
        info!("Pulling image {}", name);
        ctx.run(self.client.pull_image(&ctx, name, opts)).await
    }

    /// Pulls `name` without unpacking it, for content that is only read
    /// through the content store.
    pub async fn fetch_image(
        &self,
        ctx: &Context,
        name: &str,
        resolver: Option<HostsResolver>,
    ) -> Result<Image, SupervisorError> {
        let ctx = self.scoped(ctx);
        let opts = PullOptions {
            resolver,
            platform: Platform::current(),
            unpack: false,
            snapshotter: self.snapshotter.clone(),
            decrypt: None,
        };
        debug!("Fetching {}", name);
        ctx.run(self.client.pull_image(&ctx, name, opts)).await
    }

    pub async fn unpack_image(
        &self,
        ctx: &Context,
        image: &Image,
        decrypt: Option<DecryptPayload>,
    ) -> Result<(), SupervisorError> {
        let ctx = self.scoped(ctx);
        let opts = UnpackOptions {
            snapshotter: self.snapshotter.clone(),
            decrypt,
        };
        info!("Unpacking image {}", image.name);
        ctx.run(self.client.unpack_image(&ctx, image, opts)).await
    }

    pub async fn list_images(&self, ctx: &Context) -> Result<Vec<Image>, SupervisorError> {
        let ctx = self.scoped(ctx);
        ctx.run(self.client.list_images(&ctx)).await
    }

    pub async fn delete_image(&self, ctx: &Context, name: &str) -> Result<(), SupervisorError> {
        let ctx = self.scoped(ctx);
        ctx.run(self.client.delete_image(&ctx, name)).await
    }

    pub async fn read_blob(
        &self,
        ctx: &Context,
        desc: &Descriptor,
    ) -> Result<Vec<u8>, SupervisorError> {
        let ctx = self.scoped(ctx);
        ctx.run(self.client.read_blob(&ctx, desc)).await
    }

    pub async fn get_snapshot(
        &self,
        ctx: &Context,
        container_id: &str,
    ) -> Result<SnapshotInfo, SupervisorError> {
        let ctx = self.scoped(ctx);
        let key = snapshot_id(container_id);
        ctx.run(self.client.stat_snapshot(&ctx, &self.snapshotter, &key))
            .await
    }

    pub async fn list_snapshots(&self, ctx: &Context) -> Result<Vec<SnapshotInfo>, SupervisorError> {
        let ctx = self.scoped(ctx);
        ctx.run(self.client.list_snapshots(&ctx, &self.snapshotter))
            .await
    }

    /// Prepares the container's snapshot on top of the image's root
    /// filesystem. An image pulled without unpacking is unpacked and the
    /// prepare retried once.
    pub async fn prepare_snapshot(
        &self,
        ctx: &Context,
        container_id: &str,
        image: &Image,
        decrypt: Option<DecryptPayload>,
    ) -> Result<(), SupervisorError> {
        let scoped = self.scoped(ctx);
        let leased = self.leased(ctx);
        let key = snapshot_id(container_id);
        let parent = scoped
            .run(self.client.image_chain_id(&scoped, image))
            .await?;

        let err = match leased
            .run(
                self.client
                    .prepare_snapshot(&leased, &self.snapshotter, &key, &parent),
            )
            .await
        {
            Ok(_) => return Ok(()),
            Err(e) if e.is_not_found() => e,
            Err(e) => return Err(e),
        };

        let unpacked = scoped
            .run(self.client.is_unpacked(&scoped, image, &self.snapshotter))
            .await?;
        if unpacked {
            return Err(err);
        }

        warn!(
            container_id = %container_id,
            "Image {} is not unpacked, unpacking before preparing the snapshot",
            image.name
        );
        self.unpack_image(ctx, image, decrypt).await?;
        leased
            .run(
                self.client
                    .prepare_snapshot(&leased, &self.snapshotter, &key, &parent),
            )
            .await?;
        Ok(())
    }

    /// Mounts the container's snapshot at
    /// `<meta>/<snapshotter>/<id>/<rootfs_name>`.
    pub async fn mount_snapshot(
        &self,
        ctx: &Context,
        container_id: &str,
        rootfs_name: &str,
    ) -> Result<PathBuf, SupervisorError> {
        let ctx = self.scoped(ctx);
        let key = snapshot_id(container_id);
        let mounts = ctx
            .run(self.client.snapshot_mounts(&ctx, &self.snapshotter, &key))
            .await?;
        if mounts.len() != 1 {
            return Err(SupervisorError::MountShape {
                container_id: container_id.to_string(),
                count: mounts.len(),
            });
        }

        let fs_dir = self.container_fs_dir(container_id);
        let target = fs_dir.join(rootfs_name);
        let res = match tokio::fs::create_dir_all(&target).await {
            Ok(()) => self
                .mounter
                .mount(&mounts[0], &target)
                .map_err(SupervisorError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = res {
            remove_dir(&fs_dir).await;
            return Err(e);
        }

        debug!(container_id = %container_id, "Mounted rootfs at {}", target.display());
        Ok(target)
    }

    pub async fn unmount_snapshot(
        &self,
        container_id: &str,
        rootfs_name: &str,
    ) -> Result<(), SupervisorError> {
        let fs_dir = self.container_fs_dir(container_id);
        self.mounter.unmount(&fs_dir.join(rootfs_name))?;
        tokio::fs::remove_dir_all(&fs_dir).await.or_else(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Ok(())
            } else {
                Err(e)
            }
        })?;
        Ok(())
    }

    pub async fn remove_snapshot(
        &self,
        ctx: &Context,
        container_id: &str,
    ) -> Result<(), SupervisorError> {
        let ctx = self.leased(ctx);
        let key = snapshot_id(container_id);
        ctx.run(self.client.remove_snapshot(&ctx, &self.snapshotter, &key))
            .await
    }

    pub async fn load_container(
        &self,
        ctx: &Context,
        id: &str,
    ) -> Result<Arc<dyn SupervisorContainer>, SupervisorError> {
        let ctx = self.scoped(ctx);
        ctx.run(self.client.load_container(&ctx, id)).await
    }

    pub async fn create_container(
        &self,
        ctx: &Context,
        container: NewContainer,
    ) -> Result<Arc<dyn SupervisorContainer>, SupervisorError> {
        let ctx = self.leased(ctx);
        ctx.run(self.client.new_container(&ctx, container)).await
    }

    pub async fn delete_container(
        &self,
        ctx: &Context,
        container: &dyn SupervisorContainer,
    ) -> Result<(), SupervisorError> {
        let ctx = self.leased(ctx);
        ctx.run(container.delete(&ctx)).await
    }

    pub async fn create_task(
        &self,
        ctx: &Context,
        container: &dyn SupervisorContainer,
        io: IoCreator,
    ) -> Result<Arc<dyn SupervisorTask>, SupervisorError> {
        let ctx = self.leased(ctx);
        ctx.run(container.new_task(&ctx, io)).await
    }

    pub async fn delete_task(
        &self,
        ctx: &Context,
        task: &dyn SupervisorTask,
    ) -> Result<ExitStatus, SupervisorError> {
        let ctx = self.leased(ctx);
        ctx.run(task.delete(&ctx)).await
    }

    /// Re-attaches to the task of an existing container, giving the shim
    /// three attempts of three seconds each to answer.
    pub async fn load_task(
        &self,
        ctx: &Context,
        container: &dyn SupervisorContainer,
        io: IoAttach,
    ) -> Result<Arc<dyn SupervisorTask>, SupervisorError> {
        let ctx = self.scoped(ctx);
        for attempt in 1..=LOAD_TASK_ATTEMPTS {
            let load = container.task(&ctx, Some(io.clone()));
            match ctx
                .run(async {
                    Ok::<_, SupervisorError>(tokio::time::timeout(LOAD_TASK_TIMEOUT, load).await)
                })
                .await?
            {
                Ok(res) => return res,
                Err(_) => warn!(
                    container_id = %container.id(),
                    "Timed out loading task, attempt {} of {}",
                    attempt,
                    LOAD_TASK_ATTEMPTS
                ),
            }
        }
        Err(SupervisorError::ShimUnreachable(container.id().to_string()))
    }

    pub async fn subscribe(
        &self,
        ctx: &Context,
        filters: Vec<String>,
    ) -> Result<EventStream, SupervisorError> {
        let ctx = self.scoped(ctx);
        ctx.run(self.client.subscribe(&ctx, filters)).await
    }

    pub async fn close(&self) -> Result<(), SupervisorError> {
        self.client.close().await
    }
}

async fn remove_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove {}: {}", dir.display(), e);
        }
    }
}
