use crate::error::SupervisorError;
use crate::types::*;
use async_trait::async_trait;
use berth_core::Context;
use futures::future::BoxFuture;
use oci_spec::runtime::{LinuxResources, Spec};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// The IO endpoints a task was created or re-attached with.
#[async_trait]
pub trait TaskIo: Send + Sync {
    fn config(&self) -> IoConfig;

    /// Stops copying without waiting for the copy loops to drain.
    fn cancel(&self);

    async fn wait(&self);

    async fn close(&self) -> Result<(), SupervisorError>;
}

/// Builds the IO for a new task, given the container ID.
pub type IoCreator =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<Arc<dyn TaskIo>, SupervisorError>> + Send + Sync>;

/// Re-attaches to the FIFOs of an existing task.
pub type IoAttach = Arc<
    dyn Fn(IoConfig) -> BoxFuture<'static, Result<Arc<dyn TaskIo>, SupervisorError>> + Send + Sync,
>;

/// Boxes a factory future into the shape [`IoCreator`] and [`IoAttach`]
/// return.
pub fn io_future<F>(fut: F) -> BoxFuture<'static, Result<Arc<dyn TaskIo>, SupervisorError>>
where
    F: Future<Output = Result<Arc<dyn TaskIo>, SupervisorError>> + Send + 'static,
{
    Box::pin(fut)
}

/// Envelopes and stream errors from a subscription. Both channels close when
/// the subscribing context is cancelled.
pub struct EventStream {
    pub envelopes: mpsc::Receiver<Envelope>,
    pub errors: mpsc::Receiver<SupervisorError>,
}

#[async_trait]
pub trait SupervisorTask: Send + Sync {
    fn id(&self) -> &str;

    fn pid(&self) -> u32;

    fn io(&self) -> Option<Arc<dyn TaskIo>>;

    async fn start(&self, ctx: &Context) -> Result<(), SupervisorError>;

    /// Registers for the task's exit. Must be called before the task can exit
    /// to be sure to observe it.
    async fn wait(&self, ctx: &Context) -> Result<oneshot::Receiver<ExitStatus>, SupervisorError>;

    async fn kill(&self, ctx: &Context, signal: i32, all: bool) -> Result<(), SupervisorError>;

    async fn delete(&self, ctx: &Context) -> Result<ExitStatus, SupervisorError>;

    async fn pause(&self, ctx: &Context) -> Result<(), SupervisorError>;

    async fn resume(&self, ctx: &Context) -> Result<(), SupervisorError>;

    async fn status(&self, ctx: &Context) -> Result<ProcessStatus, SupervisorError>;

    async fn update(&self, ctx: &Context, resources: LinuxResources)
    -> Result<(), SupervisorError>;

    async fn metrics(&self, ctx: &Context) -> Result<TaskMetrics, SupervisorError>;

    async fn close_stdin(&self, ctx: &Context) -> Result<(), SupervisorError>;
}

#[async_trait]
pub trait SupervisorContainer: Send + Sync {
    fn id(&self) -> &str;

    async fn spec(&self, ctx: &Context) -> Result<Spec, SupervisorError>;

    async fn image(&self, ctx: &Context) -> Result<Image, SupervisorError>;

    async fn new_task(
        &self,
        ctx: &Context,
        io: IoCreator,
    ) -> Result<Arc<dyn SupervisorTask>, SupervisorError>;

    async fn task(
        &self,
        ctx: &Context,
        io: Option<IoAttach>,
    ) -> Result<Arc<dyn SupervisorTask>, SupervisorError>;

    async fn delete(&self, ctx: &Context) -> Result<(), SupervisorError>;
}

/// Native client of the supervisor daemon. Namespace and lease travel in the
/// [`Context`] of each call.
#[async_trait]
pub trait SupervisorClient: Send + Sync {
    async fn create_lease(
        &self,
        ctx: &Context,
        id: &str,
        labels: HashMap<String, String>,
    ) -> Result<Lease, SupervisorError>;

    async fn list_leases(&self, ctx: &Context) -> Result<Vec<Lease>, SupervisorError>;

    async fn delete_lease(&self, ctx: &Context, id: &str, sync: bool)
    -> Result<(), SupervisorError>;

    async fn list_lease_resources(
        &self,
        ctx: &Context,
        id: &str,
    ) -> Result<Vec<LeaseResource>, SupervisorError>;

    async fn delete_lease_resource(
        &self,
        ctx: &Context,
        id: &str,
        resource: LeaseResource,
    ) -> Result<(), SupervisorError>;

    async fn get_image(&self, ctx: &Context, name: &str) -> Result<Image, SupervisorError>;

    async fn pull_image(
        &self,
        ctx: &Context,
        name: &str,
        opts: PullOptions,
    ) -> Result<Image, SupervisorError>;

    async fn unpack_image(
        &self,
        ctx: &Context,
        image: &Image,
        opts: UnpackOptions,
    ) -> Result<(), SupervisorError>;

    async fn is_unpacked(
        &self,
        ctx: &Context,
        image: &Image,
        snapshotter: &str,
    ) -> Result<bool, SupervisorError>;

    async fn list_images(&self, ctx: &Context) -> Result<Vec<Image>, SupervisorError>;

    async fn delete_image(&self, ctx: &Context, name: &str) -> Result<(), SupervisorError>;

    /// Chain ID of the image's unpacked root filesystem, the parent of any
    /// snapshot prepared from it.
    async fn image_chain_id(&self, ctx: &Context, image: &Image)
    -> Result<String, SupervisorError>;

    async fn read_blob(
        &self,
        ctx: &Context,
        desc: &berth_remote::Descriptor,
    ) -> Result<Vec<u8>, SupervisorError>;

    async fn stat_snapshot(
        &self,
        ctx: &Context,
        snapshotter: &str,
        key: &str,
    ) -> Result<SnapshotInfo, SupervisorError>;

    async fn prepare_snapshot(
        &self,
        ctx: &Context,
        snapshotter: &str,
        key: &str,
        parent: &str,
    ) -> Result<Vec<Mount>, SupervisorError>;

    async fn snapshot_mounts(
        &self,
        ctx: &Context,
        snapshotter: &str,
        key: &str,
    ) -> Result<Vec<Mount>, SupervisorError>;

    async fn list_snapshots(
        &self,
        ctx: &Context,
        snapshotter: &str,
    ) -> Result<Vec<SnapshotInfo>, SupervisorError>;

    async fn remove_snapshot(
        &self,
        ctx: &Context,
        snapshotter: &str,
        key: &str,
    ) -> Result<(), SupervisorError>;

    async fn new_container(
        &self,
        ctx: &Context,
        container: NewContainer,
    ) -> Result<Arc<dyn SupervisorContainer>, SupervisorError>;

    async fn load_container(
        &self,
        ctx: &Context,
        id: &str,
    ) -> Result<Arc<dyn SupervisorContainer>, SupervisorError>;

    async fn subscribe(
        &self,
        ctx: &Context,
        filters: Vec<String>,
    ) -> Result<EventStream, SupervisorError>;

    async fn close(&self) -> Result<(), SupervisorError>;
}
