//! Lifecycle client: turns daemon container records into supervisor
//! containers, tasks, snapshots and IO.

use crate::cache::{ContainerCache, ContainerInfo, ExitHook};
use crate::config::ClientConfig;
use crate::error::ContainerError;
use crate::events::spawn_event_processor;
use crate::expiry::{ExpiryHandler, ResourcesWatcher, remaining};
use crate::metrics::{decode, system_cpu_usage};
use crate::resources::update_resources;
use crate::runtime::{RuntimeKind, host_uses_systemd};
use crate::spec::{SpecContext, generate_spec, new_container};
use crate::types::{Container, ContainerMetrics, ExitResult, Resources, StopOptions};
use berth_core::Context;
use berth_image::{
    DecryptConfig, VerificationKey, Verifier, check_authorization, image_config,
    parse_verification_keys,
};
use berth_io::{AttachConfig, IoError, IoManager, IoRecord, JsonFileDriver, attach};
use berth_remote::RegistryResolver;
use berth_supervisor::{
    GrpcSupervisor, Image, Mounter, ROOTFS_NAME, SpiConfig, SupervisorClient, SupervisorSpi,
    SupervisorTask, SystemMounter,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const LOG_DRIVER_NONE: &str = "none";

/// Drives container lifecycles against one supervisor namespace.
pub struct ContainerdClient {
    ctx: Context,
    config: ClientConfig,
    runtime: RuntimeKind,
    spi: Arc<SupervisorSpi>,
    cache: ContainerCache,
    io: IoManager,
    registry: Arc<RegistryResolver>,
    verifier: Verifier,
    verification_keys: Vec<VerificationKey>,
    decrypt: Option<DecryptConfig>,
    expiry: Option<Arc<ResourcesWatcher>>,
    events: parking_lot::Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl ContainerdClient {
    /// Connects to the daemon at `config.connection_path` and builds a
    /// client on top of it.
    pub async fn connect(ctx: &Context, config: ClientConfig) -> Result<Self, ContainerError> {
        config.validate()?;
        let supervisor =
            GrpcSupervisor::connect(&config.connection_path, config.hosts_root()).await?;
        Self::new(ctx, config, Arc::new(supervisor), Arc::new(SystemMounter)).await
    }

    /// Validates `config`, bootstraps the lease and starts the OOM event
    /// processor.
    pub async fn new(
        ctx: &Context,
        config: ClientConfig,
        client: Arc<dyn SupervisorClient>,
        mounter: Arc<dyn Mounter>,
    ) -> Result<Self, ContainerError> {
        let validated = config.validate()?;
        let registry = Arc::new(RegistryResolver::new(config.registry_configs.clone()));
        let verifier = Verifier::configured(
            validated.verifier_kind,
            &config.verifier_config,
            registry.clone(),
        )?;

        let root = ctx.child();
        let spi = Arc::new(
            SupervisorSpi::new(
                &root,
                client,
                mounter,
                SpiConfig {
                    namespace: config.namespace.clone(),
                    snapshotter: config.snapshotter.clone(),
                    meta_path: config.meta_path.clone(),
                    lease_id: config.lease_id.clone(),
                },
            )
            .await?,
        );

        let cache = ContainerCache::new(&root, spi.clone());
        let io = IoManager::new(config.fifo_root());
        let expiry = if config.image_expiry_disable {
            None
        } else {
            Some(Arc::new(ResourcesWatcher::new()))
        };
        let events = spawn_event_processor(root.child(), spi.clone(), cache.clone());

        info!(
            namespace = %config.namespace,
            runtime = %validated.runtime,
            verifier = %validated.verifier_kind,
            "Container client ready"
        );

        Ok(Self {
            ctx: root,
            runtime: validated.runtime,
            config,
            spi,
            cache,
            io,
            registry,
            verifier,
            verification_keys: validated.verification_keys,
            decrypt: validated.decrypt,
            expiry,
            events: parking_lot::Mutex::new(Some(events)),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn spi(&self) -> &Arc<SupervisorSpi> {
        &self.spi
    }

    pub fn io(&self) -> &IoManager {
        &self.io
    }

    fn check_disposed(&self) -> Result<(), ContainerError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(ContainerError::Disposed);
        }
        Ok(())
    }

    /// Prepares IO, the image and the mounted root filesystem of
    /// `container`. Everything set up here is torn down again on failure.
    pub async fn create(&self, ctx: &Context, container: &Container) -> Result<(), ContainerError> {
        self.check_disposed()?;
        let id = &container.id;
        info!(container_id = %id, "Creating container from {}", container.image.reference);

        self.io.init(id, container.io_config.open_stdin)?;
        let mut prepared = false;
        let res = self.create_resources(ctx, container, &mut prepared).await;
        if let Err(e) = &res {
            warn!(container_id = %id, "Create failed, rolling back: {}", e);
            self.io.clear(id).await;
            if prepared {
                self.clear_snapshot(ctx, id).await;
            }
        }
        res
    }

    async fn create_resources(
        &self,
        ctx: &Context,
        container: &Container,
        prepared: &mut bool,
    ) -> Result<(), ContainerError> {
        let id = &container.id;
        self.bind_log_driver(container).await?;

        let decrypt = self.decrypt_config(container)?;
        let image = self.ensure_image(ctx, container, decrypt.as_ref()).await?;
        if let Some(expiry) = &self.expiry {
            expiry.unwatch(&image.name);
        }

        self.spi
            .prepare_snapshot(ctx, id, &image, decrypt.as_ref().map(|d| d.to_payload()))
            .await?;
        *prepared = true;
        let rootfs = self.spi.mount_snapshot(ctx, id, ROOTFS_NAME).await?;
        debug!(container_id = %id, "Root filesystem ready at {}", rootfs.display());
        Ok(())
    }

    /// Registers `container` with the supervisor and starts its task.
    /// Returns the task's pid.
    pub async fn start(&self, ctx: &Context, container: &Container) -> Result<u32, ContainerError> {
        self.check_disposed()?;
        let id = &container.id;

        if self.cache.get(id).await.is_some() {
            return Err(ContainerError::AlreadyExists(id.clone()));
        }
        match self.spi.load_container(ctx, id).await {
            Ok(_) => return Err(ContainerError::AlreadyExists(id.clone())),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
        self.require_snapshot(ctx, id).await?;

        let decrypt = self.decrypt_config(container)?;
        let image = self.ensure_image(ctx, container, decrypt.as_ref()).await?;
        self.verify_image(ctx, container, &image).await?;
        if let Some(cfg) = &decrypt {
            check_authorization(&self.spi, ctx, &image, cfg).await?;
        }

        let image_cfg = image_config(&self.spi, ctx, &image).await?;
        let rootfs = self.spi.rootfs_path(id, ROOTFS_NAME);
        let spec = generate_spec(
            container,
            &SpecContext {
                image: image_cfg.config.as_ref(),
                rootfs: &rootfs,
                root_exec: &self.config.root_exec,
            },
        )?;
        let runtime = self.runtime_for(container)?;
        let request = new_container(
            container,
            &image.name,
            self.spi.snapshotter(),
            runtime.runtime_info(host_uses_systemd()),
            spec,
        );

        let supervisor_container = self.spi.create_container(ctx, request).await?;
        info!(container_id = %id, runtime = %runtime, "Created supervisor container");

        if !self.io.exists(id) {
            self.io.init(id, container.io_config.open_stdin)?;
        }
        if let Err(e) = self.bind_log_driver(container).await {
            self.abort_start(ctx, container, supervisor_container.as_ref(), None)
                .await;
            return Err(e);
        }

        let task = match self
            .spi
            .create_task(
                ctx,
                supervisor_container.as_ref(),
                self.io.new_cio_creator(container.io_config.tty),
            )
            .await
        {
            Ok(task) => task,
            Err(e) => {
                self.abort_start(ctx, container, supervisor_container.as_ref(), None)
                    .await;
                return Err(e.into());
            }
        };

        let record = Arc::new(ContainerInfo::new(
            container.clone(),
            supervisor_container.clone(),
            task.clone(),
        ));
        if let Err(e) = self.cache.add(record).await {
            self.abort_start(ctx, container, supervisor_container.as_ref(), Some(task))
                .await;
            return Err(e);
        }

        let leased = self.spi.leased(ctx);
        if let Err(e) = leased.run(task.start(&leased)).await {
            self.cache.remove(id).await;
            self.abort_start(ctx, container, supervisor_container.as_ref(), Some(task))
                .await;
            return Err(e.into());
        }

        let pid = task.pid();
        info!(container_id = %id, pid, "Started container");
        Ok(pid)
    }

    /// Undoes a partially started container: task, IO, then the supervisor
    /// container.
    async fn abort_start(
        &self,
        ctx: &Context,
        container: &Container,
        supervisor_container: &dyn berth_supervisor::SupervisorContainer,
        task: Option<Arc<dyn SupervisorTask>>,
    ) {
        let id = &container.id;
        if let Some(task) = task {
            if let Err(e) = self.spi.delete_task(ctx, task.as_ref()).await {
                warn!(container_id = %id, "Failed to delete task: {}", e);
            }
        }
        if let Err(e) = self.io.reset(id).await {
            warn!(container_id = %id, "Failed to reset IO: {}", e);
        }
        if let Err(e) = self.spi.delete_container(ctx, supervisor_container).await {
            warn!(container_id = %id, "Failed to delete container: {}", e);
        }
    }

    /// Stops the task of `container` and releases its supervisor resources.
    /// With `clear_resources` the IO record and snapshot are removed too.
    ///
    /// Returns the exit of the stopped task, or `None` when nothing was
    /// running.
    pub async fn destroy(
        &self,
        ctx: &Context,
        container: &Container,
        opts: StopOptions,
        clear_resources: bool,
    ) -> Result<Option<ExitResult>, ContainerError> {
        self.check_disposed()?;
        let id = &container.id;
        let mut exit = None;

        match self.cache.get(id).await {
            Some(record) => {
                record.set_skip_exit_hooks(true).await;
                if record.is_watched() {
                    match self.cache.stop(ctx, &record, opts).await {
                        Ok(result) => {
                            info!(container_id = %id, code = result.code, "Container stopped");
                            exit = Some(result);
                        }
                        Err(ContainerError::NotRunning(_)) => {
                            debug!(container_id = %id, "Task already gone");
                        }
                        Err(e) => {
                            record.set_skip_exit_hooks(false).await;
                            return Err(e);
                        }
                    }
                }
                record.release(ctx, &self.spi).await;
                self.cache.remove(id).await;
            }
            None => match self.spi.load_container(ctx, id).await {
                Ok(leftover) => {
                    if let Err(e) = self.spi.delete_container(ctx, leftover.as_ref()).await {
                        warn!(container_id = %id, "Failed to delete container: {}", e);
                    }
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(container_id = %id, "Failed to load container: {}", e),
            },
        }

        if clear_resources {
            self.io.clear(id).await;
            self.clear_snapshot(ctx, id).await;
        }

        if self.expiry.is_some() && !container.image.reference.is_empty() {
            match self.release_image(ctx, &container.image.reference).await {
                Ok(()) | Err(ContainerError::AlreadyWatched(_)) => {}
                Err(e) => warn!(
                    container_id = %id,
                    "Failed to schedule expiry of {}: {}",
                    container.image.reference,
                    e
                ),
            }
        }

        info!(container_id = %id, "Destroyed container");
        Ok(exit)
    }

    /// Connects the caller's streams to the container's IO until the
    /// outputs end or `ctx` is cancelled.
    pub async fn attach(
        &self,
        ctx: &Context,
        container: &Container,
        mut config: AttachConfig,
    ) -> Result<(), ContainerError> {
        self.check_disposed()?;
        let record = self.io_record(container)?;

        config.terminal = container.io_config.tty;
        if !(container.io_config.open_stdin && config.use_stdin) {
            config.use_stdin = false;
            config.stdin = None;
        }
        attach(ctx, record.stream(), config).await?;
        Ok(())
    }

    fn io_record(&self, container: &Container) -> Result<Arc<IoRecord>, ContainerError> {
        if let Some(record) = self.io.get(&container.id) {
            return Ok(record);
        }
        match self.io.init(&container.id, container.io_config.open_stdin) {
            Ok(record) => Ok(record),
            Err(IoError::AlreadyExists(_)) => self
                .io
                .get(&container.id)
                .ok_or_else(|| ContainerError::NotFound(container.id.clone())),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn pause(&self, ctx: &Context, id: &str) -> Result<(), ContainerError> {
        self.check_disposed()?;
        let task = self.running_task(id).await?;
        let ctx = self.spi.scoped(ctx);
        ctx.run(task.pause(&ctx)).await?;
        info!(container_id = %id, "Paused container");
        Ok(())
    }

    pub async fn unpause(&self, ctx: &Context, id: &str) -> Result<(), ContainerError> {
        self.check_disposed()?;
        let task = self.running_task(id).await?;
        let ctx = self.spi.scoped(ctx);
        ctx.run(task.resume(&ctx)).await?;
        info!(container_id = %id, "Resumed container");
        Ok(())
    }

    /// Applies new memory limits to the running task. Device rules of the
    /// current spec are kept.
    pub async fn update(
        &self,
        ctx: &Context,
        id: &str,
        resources: Resources,
    ) -> Result<(), ContainerError> {
        self.check_disposed()?;
        let record = self
            .cache
            .get(id)
            .await
            .ok_or_else(|| ContainerError::NotFound(id.to_string()))?;
        let task = record
            .task()
            .await
            .ok_or_else(|| ContainerError::NotRunning(id.to_string()))?;
        let supervisor_container = record
            .supervisor_container()
            .await
            .ok_or_else(|| ContainerError::NotFound(id.to_string()))?;

        let scoped = self.spi.scoped(ctx);
        let spec = scoped.run(supervisor_container.spec(&scoped)).await?;
        let devices = spec
            .linux()
            .as_ref()
            .and_then(|l| l.resources().as_ref())
            .and_then(|r| r.devices().clone())
            .unwrap_or_default();

        let mut container = record.container().await;
        let block = update_resources(container.host_config.resources.as_ref(), &resources, devices)?;
        scoped.run(task.update(&scoped, block)).await?;

        container.host_config.resources = Some(resources);
        record.set_container(container).await;
        info!(container_id = %id, "Updated container resources");
        Ok(())
    }

    /// Re-attaches to a container whose task survived a restart of this
    /// process. Returns the task's pid.
    pub async fn restore(&self, ctx: &Context, container: &Container) -> Result<u32, ContainerError> {
        self.check_disposed()?;
        let id = &container.id;
        self.require_snapshot(ctx, id).await?;

        if self.cache.remove(id).await.is_some() {
            debug!(container_id = %id, "Replacing stale record");
        }
        let supervisor_container = self.spi.load_container(ctx, id).await?;

        let created_io = !self.io.exists(id);
        if created_io {
            self.io.init(id, container.io_config.open_stdin)?;
        }
        let res = async {
            self.bind_log_driver(container).await?;
            let task = self
                .spi
                .load_task(ctx, supervisor_container.as_ref(), self.io.new_cio_attach(id))
                .await?;
            let pid = task.pid();
            let record = Arc::new(ContainerInfo::new(
                container.clone(),
                supervisor_container.clone(),
                task,
            ));
            self.cache.add(record).await?;
            Ok::<_, ContainerError>(pid)
        }
        .await;

        match res {
            Ok(pid) => {
                if let Some(expiry) = &self.expiry {
                    expiry.unwatch(&container.image.reference);
                }
                info!(container_id = %id, pid, "Restored container");
                Ok(pid)
            }
            Err(e) => {
                warn!(container_id = %id, "Restore failed: {}", e);
                if created_io {
                    self.io.clear(id).await;
                }
                Err(e)
            }
        }
    }

    pub async fn metrics(&self, ctx: &Context, id: &str) -> Result<ContainerMetrics, ContainerError> {
        self.check_disposed()?;
        let task = self.running_task(id).await?;
        let ctx = self.spi.scoped(ctx);
        let metrics = ctx.run(task.metrics(&ctx)).await?;
        decode(&metrics, system_cpu_usage().await)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<ContainerInfo>> {
        self.cache.get(id).await
    }

    /// Containers currently tracked.
    pub async fn list(&self) -> Vec<Container> {
        let mut containers = Vec::new();
        for record in self.cache.get_all().await {
            containers.push(record.container().await);
        }
        containers
    }

    pub async fn set_container_exited_hooks(&self, hooks: Vec<ExitHook>) {
        self.cache.set_exit_hooks(hooks).await;
    }

    /// Schedules `name` for deletion once it is older than the configured
    /// expiry. Does nothing when expiry is disabled or the image is gone.
    pub async fn release_image(&self, ctx: &Context, name: &str) -> Result<(), ContainerError> {
        self.check_disposed()?;
        let Some(expiry) = &self.expiry else {
            return Ok(());
        };
        let image = match self.spi.get_image(ctx, name).await {
            Ok(image) => image,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let delay = remaining(self.config.image_expiry(), image.created_at);
        debug!("Image {} expires in {:?}", name, delay);
        expiry.watch(name, delay, self.expiry_handler())
    }

    fn expiry_handler(&self) -> ExpiryHandler {
        let spi = self.spi.clone();
        let cache = self.cache.clone();
        let ctx = self.ctx.clone();
        Arc::new(move |name: String| {
            let spi = spi.clone();
            let cache = cache.clone();
            let ctx = ctx.clone();
            Box::pin(async move {
                for record in cache.get_all().await {
                    if record.container().await.image.reference == name {
                        info!("Image {} is still in use, keeping it", name);
                        return;
                    }
                }
                match spi.delete_image(&ctx, &name).await {
                    Ok(()) => info!("Deleted expired image {}", name),
                    Err(e) if e.is_not_found() => debug!("Expired image {} already gone", name),
                    Err(e) => warn!("Failed to delete expired image {}: {}", name, e),
                }
            })
        })
    }

    /// Stops event processing and expiry timers and closes the supervisor
    /// connection. Watchers stop cleaning up; later operations fail with
    /// [`ContainerError::Disposed`].
    pub async fn dispose(&self) -> Result<(), ContainerError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cache.set_supervisor_dead(true).await;
        self.ctx.cancel();

        let events = self.events.lock().take();
        if let Some(events) = events {
            if let Err(e) = events.await {
                warn!("Event processor ended abnormally: {}", e);
            }
        }
        if let Some(expiry) = &self.expiry {
            expiry.dispose().await;
        }
        self.spi.close().await?;
        info!("Container client disposed");
        Ok(())
    }

    async fn running_task(&self, id: &str) -> Result<Arc<dyn SupervisorTask>, ContainerError> {
        let record = self
            .cache
            .get(id)
            .await
            .ok_or_else(|| ContainerError::NotFound(id.to_string()))?;
        record
            .task()
            .await
            .ok_or_else(|| ContainerError::NotRunning(id.to_string()))
    }

    async fn require_snapshot(&self, ctx: &Context, id: &str) -> Result<(), ContainerError> {
        match self.spi.get_snapshot(ctx, id).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Err(ContainerError::SnapshotMissing(id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Unmounts and removes the snapshot of `id`, logging failures.
    async fn clear_snapshot(&self, ctx: &Context, id: &str) {
        if let Err(e) = self.spi.unmount_snapshot(id, ROOTFS_NAME).await {
            warn!(container_id = %id, "Failed to unmount rootfs: {}", e);
        }
        match self.spi.remove_snapshot(ctx, id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(container_id = %id, "Failed to remove snapshot: {}", e),
        }
    }

    async fn bind_log_driver(&self, container: &Container) -> Result<(), ContainerError> {
        let log = &container.host_config.log_config;
        match log.driver.as_str() {
            LOG_DRIVER_NONE => Ok(()),
            "" | JsonFileDriver::NAME => {
                let root = log
                    .log_root
                    .clone()
                    .unwrap_or_else(|| self.config.log_root());
                let driver = JsonFileDriver::open(&root, &container.id).await?;
                self.io
                    .configure(&container.id, Arc::new(driver), &log.mode)
                    .await?;
                Ok(())
            }
            other => Err(ContainerError::InvalidConfig(format!(
                "unsupported log driver {:?}",
                other
            ))),
        }
    }

    fn runtime_for(&self, container: &Container) -> Result<RuntimeKind, ContainerError> {
        if container.host_config.runtime.is_empty() {
            Ok(self.runtime)
        } else {
            container.host_config.runtime.parse()
        }
    }

    fn decrypt_config(&self, container: &Container) -> Result<Option<DecryptConfig>, ContainerError> {
        let overrides = DecryptConfig::new(
            &container.image.dec_keys,
            &container.image.dec_recipients,
        )?;
        Ok(DecryptConfig::resolve(overrides.as_ref(), self.decrypt.as_ref()))
    }

    /// Returns the local image, pulling it when missing. Pulled images are
    /// checked against the decryption material before use.
    async fn ensure_image(
        &self,
        ctx: &Context,
        container: &Container,
        decrypt: Option<&DecryptConfig>,
    ) -> Result<Image, ContainerError> {
        let name = &container.image.reference;
        match self.spi.get_image(ctx, name).await {
            Ok(image) => return Ok(image),
            Err(e) if e.is_not_found() => {
                debug!(container_id = %container.id, "Image {} not present locally", name);
            }
            Err(e) => return Err(e.into()),
        }

        let resolver = self.registry.resolver_for(name)?;
        let image = self
            .spi
            .pull_image(ctx, name, resolver, decrypt.map(|d| d.to_payload()))
            .await?;
        if let Some(cfg) = decrypt {
            check_authorization(&self.spi, ctx, &image, cfg).await?;
        }
        Ok(image)
    }

    async fn verify_image(
        &self,
        ctx: &Context,
        container: &Container,
        image: &Image,
    ) -> Result<(), ContainerError> {
        let keys = parse_verification_keys(&container.image.verification_keys)?;
        let keys = if keys.is_empty() {
            &self.verification_keys
        } else {
            &keys
        };
        let verifier = Verifier::for_keys(keys, &self.verifier);
        let resolver = self.registry.resolver_for(&image.name)?;
        verifier.verify(ctx, &self.spi, image, resolver).await?;
        Ok(())
    }
}
