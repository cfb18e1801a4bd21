//! In-memory supervisor for tests.
//!
//! Records the namespace and lease of every call so tests can assert how
//! callers scope their requests, and lets tests drive task exits, OOM events
//! and shim outages by hand.

use crate::client::{
    EventStream, IoAttach, IoCreator, SupervisorClient, SupervisorContainer, SupervisorTask,
    TaskIo,
};
use crate::error::SupervisorError;
use crate::mounter::Mounter;
use crate::types::*;
use async_trait::async_trait;
use berth_core::Context;
use berth_mount::MountError;
use berth_remote::Descriptor;
use oci_spec::runtime::{LinuxResources, Spec};
use prost_types::Any;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tokio::sync::{Notify, mpsc, oneshot};

const SIGKILL: i32 = 9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: String,
    pub namespace: Option<String>,
    pub lease: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PullRecord {
    pub name: String,
    pub hosts: Vec<String>,
    pub unpack: bool,
    pub decrypt: bool,
}

#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub image: String,
    pub snapshot_key: String,
    pub runtime: RuntimeInfo,
    pub spec: Spec,
    pub labels: HashMap<String, String>,
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    leases: HashMap<String, Lease>,
    lease_resources: HashMap<String, Vec<LeaseResource>>,
    images: HashMap<String, Image>,
    remote_images: HashMap<String, Image>,
    unpacked: HashSet<String>,
    skip_unpack: bool,
    blobs: HashMap<String, Vec<u8>>,
    snapshots: HashMap<String, (SnapshotInfo, Vec<Mount>)>,
    containers: HashMap<String, Arc<FakeContainer>>,
    records: HashMap<String, ContainerRecord>,
    pulls: Vec<PullRecord>,
    subscribers: Vec<(mpsc::Sender<Envelope>, mpsc::Sender<SupervisorError>)>,
    filters: Vec<String>,
    shim_unreachable: bool,
    next_pid: u32,
    closed: bool,
}

struct Shared {
    state: Mutex<State>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, op: &str, ctx: &Context) {
        self.state().calls.push(Call {
            op: op.to_string(),
            namespace: ctx.namespace().map(str::to_string),
            lease: ctx.lease().map(str::to_string),
        });
    }
}

fn chain_id(image: &Image) -> String {
    format!("chain-{}", image.target.digest)
}

fn not_found(what: impl Into<String>) -> SupervisorError {
    SupervisorError::Rpc(tonic::Status::not_found(what.into()))
}

fn already_exists(what: impl Into<String>) -> SupervisorError {
    SupervisorError::Rpc(tonic::Status::already_exists(what.into()))
}

pub struct FakeSupervisor {
    shared: Arc<Shared>,
}

impl Default for FakeSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSupervisor {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    next_pid: 1000,
                    ..State::default()
                }),
            }),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.shared.state().calls.clone()
    }

    pub fn operations(&self) -> Vec<String> {
        self.shared
            .state()
            .calls
            .iter()
            .map(|c| c.op.clone())
            .collect()
    }

    pub fn seed_lease(&self, id: &str, labels: HashMap<String, String>) {
        self.shared.state().leases.insert(
            id.to_string(),
            Lease {
                id: id.to_string(),
                labels,
                created_at: SystemTime::now(),
            },
        );
    }

    pub fn lease_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.state().leases.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Stores `image` locally, optionally with its root filesystem unpacked.
    pub fn add_image(&self, image: Image, unpacked: bool) {
        let mut state = self.shared.state();
        if unpacked {
            state.unpacked.insert(chain_id(&image));
        }
        state.images.insert(image.name.clone(), image);
    }

    /// Makes `image` available to pulls.
    pub fn add_remote_image(&self, image: Image) {
        self.shared
            .state()
            .remote_images
            .insert(image.name.clone(), image);
    }

    pub fn has_image(&self, name: &str) -> bool {
        self.shared.state().images.contains_key(name)
    }

    pub fn add_blob(&self, digest: &str, data: Vec<u8>) {
        self.shared.state().blobs.insert(digest.to_string(), data);
    }

    /// Unpacks report success without producing a root filesystem.
    pub fn fail_unpack_silently(&self) {
        self.shared.state().skip_unpack = true;
    }

    pub fn seed_snapshot_mounts(&self, container_id: &str, mounts: Vec<Mount>) {
        let key = crate::spi::snapshot_id(container_id);
        let info = SnapshotInfo {
            key: key.clone(),
            parent: None,
            kind: SnapshotKind::Active,
            labels: HashMap::new(),
        };
        self.shared.state().snapshots.insert(key, (info, mounts));
    }

    pub fn has_snapshot(&self, key: &str) -> bool {
        self.shared.state().snapshots.contains_key(key)
    }

    pub fn pulls(&self) -> Vec<PullRecord> {
        self.shared.state().pulls.clone()
    }

    /// Registers a container with a running task, as left behind by a
    /// previous client process.
    pub fn seed_container(&self, id: &str, image: Image) -> Arc<FakeTask> {
        let container = Arc::new(FakeContainer {
            id: id.to_string(),
            image,
            spec: Spec::default(),
            shared: self.shared.clone(),
            task: Mutex::new(None),
        });
        let task = {
            let mut state = self.shared.state();
            state.next_pid += 1;
            state.containers.insert(id.to_string(), container.clone());
            Arc::new(FakeTask::new(id, state.next_pid, self.shared.clone(), None))
        };
        task.state().status = ProcessStatus::Running;
        *lock(&container.task) = Some(task.clone());
        task
    }

    pub fn has_container(&self, id: &str) -> bool {
        self.shared.state().containers.contains_key(id)
    }

    pub fn container_record(&self, id: &str) -> Option<ContainerRecord> {
        self.shared.state().records.get(id).cloned()
    }

    pub fn task(&self, id: &str) -> Option<Arc<FakeTask>> {
        let container = self.shared.state().containers.get(id).cloned()?;
        lock(&container.task).clone()
    }

    /// Task loads hang until the caller gives up.
    pub fn set_shim_unreachable(&self, unreachable: bool) {
        self.shared.state().shim_unreachable = unreachable;
    }

    pub fn subscription_filters(&self) -> Vec<String> {
        self.shared.state().filters.clone()
    }

    pub fn publish(&self, envelope: Envelope) {
        let state = self.shared.state();
        for (tx, _) in &state.subscribers {
            let _ = tx.try_send(envelope.clone());
        }
    }

    pub fn fail_subscriptions(&self, message: &str) {
        let state = self.shared.state();
        for (_, errors) in &state.subscribers {
            let _ = errors.try_send(SupervisorError::Rpc(tonic::Status::unavailable(message)));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state().closed
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl SupervisorClient for FakeSupervisor {
    async fn create_lease(
        &self,
        ctx: &Context,
        id: &str,
        labels: HashMap<String, String>,
    ) -> Result<Lease, SupervisorError> {
        self.shared.record("create_lease", ctx);
        let mut state = self.shared.state();
        if state.leases.contains_key(id) {
            return Err(already_exists(format!("lease {}", id)));
        }
        let lease = Lease {
            id: id.to_string(),
            labels,
            created_at: SystemTime::now(),
        };
        state.leases.insert(id.to_string(), lease.clone());
        Ok(lease)
    }

    async fn list_leases(&self, ctx: &Context) -> Result<Vec<Lease>, SupervisorError> {
        self.shared.record("list_leases", ctx);
        Ok(self.shared.state().leases.values().cloned().collect())
    }

    async fn delete_lease(
        &self,
        ctx: &Context,
        id: &str,
        _sync: bool,
    ) -> Result<(), SupervisorError> {
        self.shared.record("delete_lease", ctx);
        let mut state = self.shared.state();
        state.lease_resources.remove(id);
        state
            .leases
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found(format!("lease {}", id)))
    }

    async fn list_lease_resources(
        &self,
        ctx: &Context,
        id: &str,
    ) -> Result<Vec<LeaseResource>, SupervisorError> {
        self.shared.record("list_lease_resources", ctx);
        Ok(self
            .shared
            .state()
            .lease_resources
            .get(id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_lease_resource(
        &self,
        ctx: &Context,
        id: &str,
        resource: LeaseResource,
    ) -> Result<(), SupervisorError> {
        self.shared.record("delete_lease_resource", ctx);
        if let Some(resources) = self.shared.state().lease_resources.get_mut(id) {
            resources.retain(|r| r != &resource);
        }
        Ok(())
    }

    async fn get_image(&self, ctx: &Context, name: &str) -> Result<Image, SupervisorError> {
        self.shared.record("get_image", ctx);
        self.shared
            .state()
            .images
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(format!("image \"{}\"", name)))
    }

    async fn pull_image(
        &self,
        ctx: &Context,
        name: &str,
        opts: PullOptions,
    ) -> Result<Image, SupervisorError> {
        self.shared.record("pull_image", ctx);
        let mut state = self.shared.state();
        state.pulls.push(PullRecord {
            name: name.to_string(),
            hosts: opts
                .resolver
                .as_ref()
                .map(|r| r.hosts().iter().map(|h| h.base_url()).collect())
                .unwrap_or_default(),
            unpack: opts.unpack,
            decrypt: opts.decrypt.is_some(),
        });
        let image = state
            .remote_images
            .get(name)
            .cloned()
            .ok_or_else(|| not_found(format!("{}: not found", name)))?;
        if opts.unpack && !state.skip_unpack {
            state.unpacked.insert(chain_id(&image));
        }
        state.images.insert(name.to_string(), image.clone());
        Ok(image)
    }

    async fn unpack_image(
        &self,
        ctx: &Context,
        image: &Image,
        _opts: UnpackOptions,
    ) -> Result<(), SupervisorError> {
        self.shared.record("unpack_image", ctx);
        let mut state = self.shared.state();
        if !state.skip_unpack {
            state.unpacked.insert(chain_id(image));
        }
        Ok(())
    }

    async fn is_unpacked(
        &self,
        ctx: &Context,
        image: &Image,
        _snapshotter: &str,
    ) -> Result<bool, SupervisorError> {
        self.shared.record("is_unpacked", ctx);
        Ok(self.shared.state().unpacked.contains(&chain_id(image)))
    }

    async fn list_images(&self, ctx: &Context) -> Result<Vec<Image>, SupervisorError> {
        self.shared.record("list_images", ctx);
        Ok(self.shared.state().images.values().cloned().collect())
    }

    async fn delete_image(&self, ctx: &Context, name: &str) -> Result<(), SupervisorError> {
        self.shared.record("delete_image", ctx);
        self.shared
            .state()
            .images
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found(format!("image \"{}\"", name)))
    }

    async fn image_chain_id(
        &self,
        ctx: &Context,
        image: &Image,
    ) -> Result<String, SupervisorError> {
        self.shared.record("image_chain_id", ctx);
        Ok(chain_id(image))
    }

    async fn read_blob(&self, ctx: &Context, desc: &Descriptor) -> Result<Vec<u8>, SupervisorError> {
        self.shared.record("read_blob", ctx);
        self.shared
            .state()
            .blobs
            .get(&desc.digest)
            .cloned()
            .ok_or_else(|| not_found(format!("content digest {}", desc.digest)))
    }

    async fn stat_snapshot(
        &self,
        ctx: &Context,
        _snapshotter: &str,
        key: &str,
    ) -> Result<SnapshotInfo, SupervisorError> {
        self.shared.record("stat_snapshot", ctx);
        self.shared
            .state()
            .snapshots
            .get(key)
            .map(|(info, _)| info.clone())
            .ok_or_else(|| not_found(format!("snapshot {}", key)))
    }

    async fn prepare_snapshot(
        &self,
        ctx: &Context,
        snapshotter: &str,
        key: &str,
        parent: &str,
    ) -> Result<Vec<Mount>, SupervisorError> {
        self.shared.record("prepare_snapshot", ctx);
        let mut state = self.shared.state();
        if !state.unpacked.contains(parent) {
            return Err(not_found(format!("parent snapshot {}", parent)));
        }
        if state.snapshots.contains_key(key) {
            return Err(already_exists(format!("snapshot {}", key)));
        }
        let mounts = vec![Mount {
            mount_type: "overlay".to_string(),
            source: "overlay".to_string(),
            options: vec![
                format!("lowerdir=/var/lib/{}/{}", snapshotter, parent),
                format!("upperdir=/var/lib/{}/{}/fs", snapshotter, key),
            ],
        }];
        let info = SnapshotInfo {
            key: key.to_string(),
            parent: Some(parent.to_string()),
            kind: SnapshotKind::Active,
            labels: HashMap::new(),
        };
        state
            .snapshots
            .insert(key.to_string(), (info, mounts.clone()));
        Ok(mounts)
    }

    async fn snapshot_mounts(
        &self,
        ctx: &Context,
        _snapshotter: &str,
        key: &str,
    ) -> Result<Vec<Mount>, SupervisorError> {
        self.shared.record("snapshot_mounts", ctx);
        self.shared
            .state()
            .snapshots
            .get(key)
            .map(|(_, mounts)| mounts.clone())
            .ok_or_else(|| not_found(format!("snapshot {}", key)))
    }

    async fn list_snapshots(
        &self,
        ctx: &Context,
        _snapshotter: &str,
    ) -> Result<Vec<SnapshotInfo>, SupervisorError> {
        self.shared.record("list_snapshots", ctx);
        Ok(self
            .shared
            .state()
            .snapshots
            .values()
            .map(|(info, _)| info.clone())
            .collect())
    }

    async fn remove_snapshot(
        &self,
        ctx: &Context,
        _snapshotter: &str,
        key: &str,
    ) -> Result<(), SupervisorError> {
        self.shared.record("remove_snapshot", ctx);
        self.shared
            .state()
            .snapshots
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| not_found(format!("snapshot {}", key)))
    }

    async fn new_container(
        &self,
        ctx: &Context,
        container: NewContainer,
    ) -> Result<Arc<dyn SupervisorContainer>, SupervisorError> {
        self.shared.record("new_container", ctx);
        let mut state = self.shared.state();
        if state.containers.contains_key(&container.id) {
            return Err(already_exists(format!("container \"{}\"", container.id)));
        }
        let image = state
            .images
            .get(&container.image)
            .cloned()
            .ok_or_else(|| not_found(format!("image \"{}\"", container.image)))?;
        let handle = Arc::new(FakeContainer {
            id: container.id.clone(),
            image,
            spec: container.spec.clone(),
            shared: self.shared.clone(),
            task: Mutex::new(None),
        });
        state.records.insert(
            container.id.clone(),
            ContainerRecord {
                image: container.image,
                snapshot_key: container.snapshot_key,
                runtime: container.runtime,
                spec: container.spec,
                labels: container.labels,
            },
        );
        state.containers.insert(container.id, handle.clone());
        Ok(handle)
    }

    async fn load_container(
        &self,
        ctx: &Context,
        id: &str,
    ) -> Result<Arc<dyn SupervisorContainer>, SupervisorError> {
        self.shared.record("load_container", ctx);
        let container = self
            .shared
            .state()
            .containers
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(format!("container \"{}\"", id)))?;
        Ok(container)
    }

    async fn subscribe(
        &self,
        ctx: &Context,
        filters: Vec<String>,
    ) -> Result<EventStream, SupervisorError> {
        self.shared.record("subscribe", ctx);
        let (env_tx, envelopes) = mpsc::channel(64);
        let (err_tx, errors) = mpsc::channel(4);
        let mut state = self.shared.state();
        state.filters = filters;
        state.subscribers.push((env_tx, err_tx));
        Ok(EventStream { envelopes, errors })
    }

    async fn close(&self) -> Result<(), SupervisorError> {
        let mut state = self.shared.state();
        state.closed = true;
        state.subscribers.clear();
        Ok(())
    }
}

pub struct FakeContainer {
    id: String,
    image: Image,
    spec: Spec,
    shared: Arc<Shared>,
    task: Mutex<Option<Arc<FakeTask>>>,
}

#[async_trait]
impl SupervisorContainer for FakeContainer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn spec(&self, ctx: &Context) -> Result<Spec, SupervisorError> {
        self.shared.record("container_spec", ctx);
        Ok(self.spec.clone())
    }

    async fn image(&self, ctx: &Context) -> Result<Image, SupervisorError> {
        self.shared.record("container_image", ctx);
        Ok(self.image.clone())
    }

    async fn new_task(
        &self,
        ctx: &Context,
        io: IoCreator,
    ) -> Result<Arc<dyn SupervisorTask>, SupervisorError> {
        self.shared.record("new_task", ctx);
        if lock(&self.task).is_some() {
            return Err(already_exists(format!("task {}", self.id)));
        }
        let task_io = io(self.id.clone()).await?;
        let pid = {
            let mut state = self.shared.state();
            state.next_pid += 1;
            state.next_pid
        };
        let task = Arc::new(FakeTask::new(
            &self.id,
            pid,
            self.shared.clone(),
            Some(task_io),
        ));
        *lock(&self.task) = Some(task.clone());
        Ok(task)
    }

    async fn task(
        &self,
        ctx: &Context,
        io: Option<IoAttach>,
    ) -> Result<Arc<dyn SupervisorTask>, SupervisorError> {
        self.shared.record("load_task", ctx);
        if self.shared.state().shim_unreachable {
            futures::future::pending::<()>().await;
        }
        let task = lock(&self.task)
            .clone()
            .ok_or_else(|| not_found(format!("no running task found: task {}", self.id)))?;
        if let Some(attach) = io {
            let config = task
                .io()
                .map(|existing| existing.config())
                .unwrap_or_default();
            let attached = attach(config).await?;
            *lock(&task.io) = Some(attached);
        }
        Ok(task)
    }

    async fn delete(&self, ctx: &Context) -> Result<(), SupervisorError> {
        self.shared.record("delete_container", ctx);
        let mut state = self.shared.state();
        state.records.remove(&self.id);
        state
            .containers
            .remove(&self.id)
            .map(|_| ())
            .ok_or_else(|| not_found(format!("container \"{}\"", self.id)))
    }
}

#[derive(Debug)]
pub struct FakeTaskState {
    pub status: ProcessStatus,
    pub exit: Option<ExitStatus>,
    pub signals: Vec<(i32, bool)>,
    pub ignored_signals: HashSet<i32>,
    pub updates: Vec<LinuxResources>,
    pub metrics: Option<Any>,
    pub deleted: bool,
    pub stdin_closed: bool,
    waiters: Vec<oneshot::Sender<ExitStatus>>,
}

pub struct FakeTask {
    id: String,
    pid: u32,
    shared: Arc<Shared>,
    io: Mutex<Option<Arc<dyn TaskIo>>>,
    state: Mutex<FakeTaskState>,
    wait_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeTask {
    fn new(id: &str, pid: u32, shared: Arc<Shared>, io: Option<Arc<dyn TaskIo>>) -> Self {
        Self {
            id: id.to_string(),
            pid,
            shared,
            io: Mutex::new(io),
            state: Mutex::new(FakeTaskState {
                status: ProcessStatus::Created,
                exit: None,
                signals: Vec::new(),
                ignored_signals: HashSet::new(),
                updates: Vec::new(),
                metrics: None,
                deleted: false,
                stdin_closed: false,
                waiters: Vec::new(),
            }),
            wait_gate: Mutex::new(None),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeTaskState> {
        lock(&self.state)
    }

    /// Holds the next `wait` call until the returned gate is notified.
    pub fn gate_wait(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.wait_gate) = Some(gate.clone());
        gate
    }

    /// The task keeps running when it receives `signal`.
    pub fn ignore_signal(&self, signal: i32) {
        self.state().ignored_signals.insert(signal);
    }

    pub fn set_metrics(&self, data: Any) {
        self.state().metrics = Some(data);
    }

    /// Terminates the task with `code` and notifies every waiter.
    pub fn exit(&self, code: u32) {
        self.finish(ExitStatus::exited_now(code));
    }

    /// Breaks the waiters' channel the way a dying supervisor does.
    pub fn lose_connection(&self) {
        let status =
            ExitStatus::failed(tonic::Status::unavailable("error reading from server: transport is closing"));
        let mut state = self.state();
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(status.clone());
        }
    }

    fn finish(&self, status: ExitStatus) {
        let mut state = self.state();
        state.status = ProcessStatus::Stopped;
        state.exit = Some(status.clone());
        for waiter in state.waiters.drain(..) {
            let _ = waiter.send(status.clone());
        }
    }
}

#[async_trait]
impl SupervisorTask for FakeTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn io(&self) -> Option<Arc<dyn TaskIo>> {
        lock(&self.io).clone()
    }

    async fn start(&self, ctx: &Context) -> Result<(), SupervisorError> {
        self.shared.record("start_task", ctx);
        self.state().status = ProcessStatus::Running;
        Ok(())
    }

    async fn wait(&self, ctx: &Context) -> Result<oneshot::Receiver<ExitStatus>, SupervisorError> {
        self.shared.record("wait_task", ctx);
        let gate = lock(&self.wait_gate).take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let (tx, rx) = oneshot::channel();
        let mut state = self.state();
        if let Some(status) = state.exit.clone() {
            let _ = tx.send(status);
        } else {
            state.waiters.push(tx);
        }
        Ok(rx)
    }

    async fn kill(&self, ctx: &Context, signal: i32, all: bool) -> Result<(), SupervisorError> {
        self.shared.record("kill_task", ctx);
        let ignored = {
            let mut state = self.state();
            if state.exit.is_some() {
                return Err(not_found(format!("process already finished: task {}", self.id)));
            }
            state.signals.push((signal, all));
            state.ignored_signals.contains(&signal)
        };
        if !ignored {
            self.exit(if signal == SIGKILL { 137 } else { 0 });
        }
        Ok(())
    }

    async fn delete(&self, ctx: &Context) -> Result<ExitStatus, SupervisorError> {
        self.shared.record("delete_task", ctx);
        let mut state = self.state();
        state.deleted = true;
        Ok(state
            .exit
            .clone()
            .unwrap_or_else(|| ExitStatus::new(0, prost_types::Timestamp::default())))
    }

    async fn pause(&self, ctx: &Context) -> Result<(), SupervisorError> {
        self.shared.record("pause_task", ctx);
        self.state().status = ProcessStatus::Paused;
        Ok(())
    }

    async fn resume(&self, ctx: &Context) -> Result<(), SupervisorError> {
        self.shared.record("resume_task", ctx);
        self.state().status = ProcessStatus::Running;
        Ok(())
    }

    async fn status(&self, ctx: &Context) -> Result<ProcessStatus, SupervisorError> {
        self.shared.record("task_status", ctx);
        Ok(self.state().status)
    }

    async fn update(
        &self,
        ctx: &Context,
        resources: LinuxResources,
    ) -> Result<(), SupervisorError> {
        self.shared.record("update_task", ctx);
        self.state().updates.push(resources);
        Ok(())
    }

    async fn metrics(&self, ctx: &Context) -> Result<TaskMetrics, SupervisorError> {
        self.shared.record("task_metrics", ctx);
        Ok(TaskMetrics {
            timestamp: now_timestamp(),
            id: self.id.clone(),
            data: self.state().metrics.clone(),
        })
    }

    async fn close_stdin(&self, ctx: &Context) -> Result<(), SupervisorError> {
        self.shared.record("close_io", ctx);
        self.state().stdin_closed = true;
        Ok(())
    }
}

/// [`Mounter`] that only records targets.
#[derive(Default)]
pub struct RecordingMounter {
    mounted: Mutex<HashSet<PathBuf>>,
    fail: AtomicBool,
}

impl RecordingMounter {
    pub fn fail_mounts(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn is_mounted(&self, target: &Path) -> bool {
        lock(&self.mounted).contains(target)
    }

    pub fn mounted(&self) -> Vec<PathBuf> {
        lock(&self.mounted).iter().cloned().collect()
    }
}

impl Mounter for RecordingMounter {
    fn mount(&self, _mount: &Mount, target: &Path) -> Result<(), MountError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MountError::MountFailed {
                target: target.display().to_string(),
                reason: "mount refused".to_string(),
            });
        }
        lock(&self.mounted).insert(target.to_path_buf());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), MountError> {
        lock(&self.mounted).remove(target);
        Ok(())
    }
}
