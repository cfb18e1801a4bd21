//! In-process registry of live containers and the watchers that react to
//! their task exits.

use crate::error::ContainerError;
use crate::types::{Container, ExitResult, StopOptions, signal_name, signals};
use berth_core::Context;
use berth_supervisor::{
    ExitStatus, SupervisorContainer, SupervisorSpi, SupervisorTask, is_connection_lost,
};
use futures::future::BoxFuture;
use prost_types::Timestamp;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell, RwLock, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Wait for SIGKILL to take effect when the caller gave no budget.
const KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// What an exit hook is told about a task exit.
pub struct ExitEvent {
    pub container: Container,
    pub code: u32,
    pub exited_at: Timestamp,
    pub error: Option<tonic::Status>,
    pub oom_killed: bool,
    pub cleanup: Cleanup,
}

/// Called, in registration order, for every task exit not caused by an
/// explicit stop.
pub type ExitHook = Arc<dyn Fn(ExitEvent) -> BoxFuture<'static, ()> + Send + Sync>;

struct RuntimeState {
    container: Option<Arc<dyn SupervisorContainer>>,
    task: Option<Arc<dyn SupervisorTask>>,
    skip_exit_hooks: bool,
    oom_killed: bool,
}

/// Runtime record of one container known to the supervisor.
pub struct ContainerInfo {
    container: RwLock<Container>,
    state: RwLock<RuntimeState>,
    result: std::sync::Mutex<Option<oneshot::Sender<ExitResult>>>,
    watching: AtomicBool,
    stop_watch: CancellationToken,
}

impl ContainerInfo {
    pub fn new(
        container: Container,
        supervisor_container: Arc<dyn SupervisorContainer>,
        task: Arc<dyn SupervisorTask>,
    ) -> Self {
        Self {
            container: RwLock::new(container),
            state: RwLock::new(RuntimeState {
                container: Some(supervisor_container),
                task: Some(task),
                skip_exit_hooks: false,
                oom_killed: false,
            }),
            result: std::sync::Mutex::new(None),
            watching: AtomicBool::new(false),
            stop_watch: CancellationToken::new(),
        }
    }

    pub async fn container(&self) -> Container {
        self.container.read().await.clone()
    }

    pub async fn id(&self) -> String {
        self.container.read().await.id.clone()
    }

    pub async fn set_container(&self, container: Container) {
        *self.container.write().await = container;
    }

    pub async fn supervisor_container(&self) -> Option<Arc<dyn SupervisorContainer>> {
        self.state.read().await.container.clone()
    }

    pub async fn task(&self) -> Option<Arc<dyn SupervisorTask>> {
        self.state.read().await.task.clone()
    }

    pub async fn set_task(&self, task: Option<Arc<dyn SupervisorTask>>) {
        self.state.write().await.task = task;
    }

    pub async fn skip_exit_hooks(&self) -> bool {
        self.state.read().await.skip_exit_hooks
    }

    pub async fn set_skip_exit_hooks(&self, skip: bool) {
        self.state.write().await.skip_exit_hooks = skip;
    }

    pub async fn oom_killed(&self) -> bool {
        self.state.read().await.oom_killed
    }

    pub async fn set_oom_killed(&self, killed: bool) {
        self.state.write().await.oom_killed = killed;
    }

    /// Whether a watcher is currently waiting on this record's task.
    pub fn is_watched(&self) -> bool {
        self.watching.load(Ordering::SeqCst)
    }

    fn expect_result(&self) -> oneshot::Receiver<ExitResult> {
        let (tx, rx) = oneshot::channel();
        *self.result.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        rx
    }

    fn clear_result(&self) {
        self.result.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Hands `result` to a pending stop, if any.
    fn deliver(&self, result: ExitResult) {
        let waiter = self.result.lock().unwrap_or_else(|e| e.into_inner()).take();
        match waiter {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!("No stop waiting for the exit result, dropping it"),
        }
    }

    /// Closes the task's IO, deletes the task and the supervisor container.
    /// Each handle is forgotten once its deletion succeeded, so repeating
    /// the call only retries what failed.
    pub async fn release(&self, ctx: &Context, spi: &SupervisorSpi) {
        let id = self.id().await;
        let (container, task) = {
            let state = self.state.read().await;
            (state.container.clone(), state.task.clone())
        };

        if let Some(task) = task {
            if let Some(io) = task.io() {
                if let Err(e) = io.close().await {
                    warn!(container_id = %id, "Failed to close task IO: {}", e);
                }
            }
            match spi.delete_task(ctx, task.as_ref()).await {
                Ok(_) => self.state.write().await.task = None,
                Err(e) if e.is_not_found() => self.state.write().await.task = None,
                Err(e) => warn!(container_id = %id, "Failed to delete task: {}", e),
            }
        }

        if let Some(container) = container {
            match spi.delete_container(ctx, container.as_ref()).await {
                Ok(()) => self.state.write().await.container = None,
                Err(e) if e.is_not_found() => self.state.write().await.container = None,
                Err(e) => warn!(container_id = %id, "Failed to delete container: {}", e),
            }
        }
    }
}

struct CleanupInner {
    once: OnceCell<()>,
    info: Arc<ContainerInfo>,
    spi: Arc<SupervisorSpi>,
    ctx: Context,
}

/// Releases the supervisor resources of an exited task at most once.
#[derive(Clone)]
pub struct Cleanup {
    inner: Arc<CleanupInner>,
}

impl Cleanup {
    fn new(info: Arc<ContainerInfo>, spi: Arc<SupervisorSpi>, ctx: Context) -> Self {
        Self {
            inner: Arc::new(CleanupInner {
                once: OnceCell::new(),
                info,
                spi,
                ctx,
            }),
        }
    }

    pub async fn run(&self) {
        let inner = &self.inner;
        inner
            .once
            .get_or_init(|| async {
                inner.info.release(&inner.ctx, &inner.spi).await;
            })
            .await;
    }

    pub fn is_done(&self) -> bool {
        self.inner.once.initialized()
    }
}

struct CacheState {
    containers: HashMap<String, Arc<ContainerInfo>>,
    // Ids whose exit channel is being opened.
    adding: HashSet<String>,
    hooks: Vec<ExitHook>,
    supervisor_dead: bool,
}

/// Map of live containers. Adding a record starts its watcher; removing it
/// stops the watcher.
#[derive(Clone)]
pub struct ContainerCache {
    state: Arc<Mutex<CacheState>>,
    spi: Arc<SupervisorSpi>,
    ctx: Context,
}

impl ContainerCache {
    pub fn new(ctx: &Context, spi: Arc<SupervisorSpi>) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState {
                containers: HashMap::new(),
                adding: HashSet::new(),
                hooks: Vec::new(),
                supervisor_dead: false,
            })),
            spi,
            ctx: ctx.child(),
        }
    }

    /// Registers `info` and spawns its watcher. The task's exit channel is
    /// opened before returning, so starting the task afterwards cannot
    /// miss the exit.
    pub async fn add(&self, info: Arc<ContainerInfo>) -> Result<(), ContainerError> {
        let id = info.id().await;
        let task = info
            .task()
            .await
            .ok_or_else(|| ContainerError::NotRunning(id.clone()))?;

        {
            let mut state = self.state.lock().await;
            if state.containers.contains_key(&id) || !state.adding.insert(id.clone()) {
                return Err(ContainerError::AlreadyExists(id));
            }
        }
        let ctx = self.spi.scoped(&self.ctx);
        let exit = ctx.run(task.wait(&ctx)).await;

        let mut state = self.state.lock().await;
        state.adding.remove(&id);
        let exit = exit?;
        state.containers.insert(id.clone(), info.clone());
        drop(state);

        info.watching.store(true, Ordering::SeqCst);
        tokio::spawn(watch(self.clone(), Arc::downgrade(&info), exit));
        debug!(container_id = %id, "Watching task");
        Ok(())
    }

    /// Forgets `id` and stops its watcher.
    pub async fn remove(&self, id: &str) -> Option<Arc<ContainerInfo>> {
        let removed = self.state.lock().await.containers.remove(id);
        if let Some(info) = &removed {
            info.stop_watch.cancel();
        }
        removed
    }

    pub async fn get(&self, id: &str) -> Option<Arc<ContainerInfo>> {
        self.state.lock().await.containers.get(id).cloned()
    }

    pub async fn get_all(&self) -> Vec<Arc<ContainerInfo>> {
        self.state.lock().await.containers.values().cloned().collect()
    }

    pub async fn set_exit_hooks(&self, hooks: Vec<ExitHook>) {
        self.state.lock().await.hooks = hooks;
    }

    async fn exit_hooks(&self) -> Vec<ExitHook> {
        self.state.lock().await.hooks.clone()
    }

    /// Once set, watchers stop cleaning up after exits.
    pub async fn set_supervisor_dead(&self, dead: bool) {
        self.state.lock().await.supervisor_dead = dead;
    }

    pub async fn is_supervisor_dead(&self) -> bool {
        self.state.lock().await.supervisor_dead
    }

    /// Signals the task of `info` and waits for the watcher to report its
    /// exit. Exit hooks are suppressed for the duration.
    ///
    /// With SIGKILL, or when the first signal times out and `opts.force` is
    /// set, every process of the task is killed and waited for again.
    pub async fn stop(
        &self,
        ctx: &Context,
        info: &ContainerInfo,
        opts: StopOptions,
    ) -> Result<ExitResult, ContainerError> {
        let id = info.id().await;
        let task = info
            .task()
            .await
            .ok_or_else(|| ContainerError::NotRunning(id.clone()))?;

        let skip = info.skip_exit_hooks().await;
        info.set_skip_exit_hooks(true).await;
        let mut exit = info.expect_result();
        let res = self.stop_task(ctx, &id, task.as_ref(), &mut exit, opts).await;
        info.clear_result();
        info.set_skip_exit_hooks(skip).await;
        res
    }

    async fn stop_task(
        &self,
        ctx: &Context,
        id: &str,
        task: &dyn SupervisorTask,
        exit: &mut oneshot::Receiver<ExitResult>,
        opts: StopOptions,
    ) -> Result<ExitResult, ContainerError> {
        let scoped = self.spi.scoped(ctx);

        if opts.signal != signals::SIGKILL && !opts.timeout.is_zero() {
            info!(container_id = %id, "Stopping with {}", signal_name(opts.signal));
            send_signal(&scoped, task, opts.signal, false).await?;
            match scoped
                .run(async {
                    Ok::<_, ContainerError>(tokio::time::timeout(opts.timeout, &mut *exit).await)
                })
                .await?
            {
                Ok(Ok(result)) => return Ok(result),
                Ok(Err(_)) => return Err(ContainerError::NotRunning(id.to_string())),
                Err(_) if !opts.force => {
                    return Err(ContainerError::StopTimeout {
                        container_id: id.to_string(),
                        signal: signal_name(opts.signal),
                    });
                }
                Err(_) => warn!(
                    container_id = %id,
                    "Container did not stop after {}, killing it",
                    signal_name(opts.signal)
                ),
            }
        }

        let timeout = if opts.timeout.is_zero() {
            KILL_TIMEOUT
        } else {
            opts.timeout
        };
        send_signal(&scoped, task, signals::SIGKILL, true).await?;
        match scoped
            .run(async { Ok::<_, ContainerError>(tokio::time::timeout(timeout, &mut *exit).await) })
            .await?
        {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(ContainerError::NotRunning(id.to_string())),
            Err(_) => Err(ContainerError::StopTimeout {
                container_id: id.to_string(),
                signal: signal_name(signals::SIGKILL),
            }),
        }
    }
}

async fn send_signal(
    ctx: &Context,
    task: &dyn SupervisorTask,
    signal: i32,
    all: bool,
) -> Result<(), ContainerError> {
    match ctx.run(task.kill(ctx, signal, all)).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => {
            debug!(container_id = %task.id(), "Process already exited: {}", e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn lost_connection(status: &ExitStatus) -> bool {
    !status.has_exit_time() && status.error.as_ref().is_some_and(is_connection_lost)
}

async fn watch(
    cache: ContainerCache,
    info: Weak<ContainerInfo>,
    exit: oneshot::Receiver<ExitStatus>,
) {
    let stop = match info.upgrade() {
        Some(info) => info.stop_watch.clone(),
        None => return,
    };

    let status = tokio::select! {
        _ = stop.cancelled() => {
            mark_unwatched(&info);
            return;
        }
        res = exit => match res {
            Ok(status) => status,
            Err(_) => {
                debug!("Exit channel closed without a status");
                mark_unwatched(&info);
                return;
            }
        },
    };

    let Some(info) = info.upgrade() else {
        return;
    };
    info.watching.store(false, Ordering::SeqCst);
    let id = info.id().await;

    if cache.is_supervisor_dead().await {
        debug!(container_id = %id, "Supervisor is gone, leaving cleanup to recovery");
        return;
    }
    if lost_connection(&status) {
        warn!(
            container_id = %id,
            "Lost connection to the supervisor while waiting for the task: {}",
            status.error.as_ref().map(|e| e.message()).unwrap_or_default()
        );
        return;
    }

    let cleanup = Cleanup::new(info.clone(), cache.spi.clone(), cache.ctx.clone());
    if !info.skip_exit_hooks().await {
        let container = info.container().await;
        let oom_killed = info.oom_killed().await;
        for hook in cache.exit_hooks().await {
            hook(ExitEvent {
                container: container.clone(),
                code: status.code,
                exited_at: status.exited_at,
                error: status.error.clone(),
                oom_killed,
                cleanup: cleanup.clone(),
            })
            .await;
        }
    }
    cleanup.run().await;

    info.deliver(ExitResult {
        code: status.code,
        exited_at: status.exited_at,
        error: status.error,
    });
    debug!(container_id = %id, "Task exit handled");
}

fn mark_unwatched(info: &Weak<ContainerInfo>) {
    if let Some(info) = info.upgrade() {
        info.watching.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_remote::{Descriptor, MEDIA_TYPE_OCI_MANIFEST};
    use berth_supervisor::fake::{FakeSupervisor, FakeTask, RecordingMounter};
    use berth_supervisor::{Image, SpiConfig, SupervisorClient};
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        fake: Arc<FakeSupervisor>,
        cache: ContainerCache,
        _dir: tempfile::TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeSupervisor::new());
        let spi = SupervisorSpi::new(
            &Context::background(),
            fake.clone(),
            Arc::new(RecordingMounter::default()),
            SpiConfig {
                namespace: "test".to_string(),
                snapshotter: "overlayfs".to_string(),
                meta_path: dir.path().to_path_buf(),
                lease_id: "test.lease".to_string(),
            },
        )
        .await
        .unwrap();
        Fixture {
            cache: ContainerCache::new(&Context::background(), Arc::new(spi)),
            fake,
            _dir: dir,
        }
    }

    async fn running(f: &Fixture, id: &str) -> (Arc<ContainerInfo>, Arc<FakeTask>) {
        let image = Image::new(
            "reg.test/app:1",
            Descriptor::new(MEDIA_TYPE_OCI_MANIFEST, "sha256:m", 10),
        );
        let fake_task = f.fake.seed_container(id, image);
        let ctx = Context::background().with_namespace("test");
        let container = f.fake.load_container(&ctx, id).await.unwrap();
        let task = container.task(&ctx, None).await.unwrap();
        let record = Container {
            id: id.to_string(),
            ..Default::default()
        };
        let info = Arc::new(ContainerInfo::new(record, container, task));
        f.cache.add(info.clone()).await.unwrap();
        (info, fake_task)
    }

    async fn eventually(mut check: impl AsyncFnMut() -> bool) {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn counting_hook(counter: Arc<AtomicUsize>, seen_oom: Arc<AtomicBool>) -> ExitHook {
        Arc::new(move |event: ExitEvent| {
            let counter = counter.clone();
            let seen_oom = seen_oom.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                seen_oom.store(event.oom_killed, Ordering::SeqCst);
                event.cleanup.run().await;
            })
        })
    }

    #[tokio::test]
    async fn test_add_twice_rejected() {
        let f = fixture().await;
        let (info, _) = running(&f, "c1").await;
        assert!(info.is_watched());
        let err = f.cache.add(info).await.unwrap_err();
        assert!(matches!(err, ContainerError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_exit_runs_hooks_then_cleanup_once() {
        let f = fixture().await;
        let calls = Arc::new(AtomicUsize::new(0));
        let oom = Arc::new(AtomicBool::new(false));
        f.cache
            .set_exit_hooks(vec![
                counting_hook(calls.clone(), oom.clone()),
                counting_hook(calls.clone(), oom.clone()),
            ])
            .await;
        let (info, task) = running(&f, "c1").await;
        info.set_oom_killed(true).await;

        task.exit(1);
        eventually(async || info.supervisor_container().await.is_none()).await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(oom.load(Ordering::SeqCst));
        assert!(task.state().deleted);
        assert!(!f.fake.has_container("c1"));
        let deletes = f
            .fake
            .operations()
            .iter()
            .filter(|op| *op == "delete_container")
            .count();
        assert_eq!(deletes, 1);
        assert!(!info.is_watched());
        assert!(f.cache.get("c1").await.is_some());
    }

    #[tokio::test]
    async fn test_supervisor_dead_skips_cleanup() {
        let f = fixture().await;
        let (info, task) = running(&f, "c1").await;
        f.cache.set_supervisor_dead(true).await;

        task.exit(0);
        eventually(async || !info.is_watched()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(f.fake.has_container("c1"));
        assert!(info.task().await.is_some());
    }

    #[tokio::test]
    async fn test_lost_connection_skips_hooks_and_cleanup() {
        let f = fixture().await;
        let calls = Arc::new(AtomicUsize::new(0));
        f.cache
            .set_exit_hooks(vec![counting_hook(
                calls.clone(),
                Arc::new(AtomicBool::new(false)),
            )])
            .await;
        let (info, task) = running(&f, "c1").await;

        task.lose_connection();
        eventually(async || !info.is_watched()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(f.fake.has_container("c1"));
        assert!(f.cache.get("c1").await.is_some());
    }

    #[tokio::test]
    async fn test_remove_stops_watcher() {
        let f = fixture().await;
        let (info, task) = running(&f, "c1").await;
        let removed = f.cache.remove("c1").await.unwrap();
        assert!(Arc::ptr_eq(&removed, &info));
        drop(removed);

        task.exit(0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.fake.has_container("c1"));
        assert!(f.cache.get_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_with_sigterm() {
        let f = fixture().await;
        let calls = Arc::new(AtomicUsize::new(0));
        f.cache
            .set_exit_hooks(vec![counting_hook(
                calls.clone(),
                Arc::new(AtomicBool::new(false)),
            )])
            .await;
        let (info, task) = running(&f, "c1").await;

        let res = f
            .cache
            .stop(&Context::background(), &info, StopOptions::default())
            .await
            .unwrap();
        assert_eq!(res.code, 0);
        assert!(res.error.is_none());
        assert!(!berth_supervisor::is_zero_time(&res.exited_at));
        assert_eq!(task.state().signals, vec![(signals::SIGTERM, false)]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!info.skip_exit_hooks().await);
    }

    #[tokio::test]
    async fn test_stop_escalates_to_sigkill() {
        let f = fixture().await;
        let (info, task) = running(&f, "c1").await;
        task.ignore_signal(signals::SIGTERM);

        let res = f
            .cache
            .stop(
                &Context::background(),
                &info,
                StopOptions {
                    timeout: Duration::from_millis(50),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(res.code, 137);
        assert_eq!(
            task.state().signals,
            vec![(signals::SIGTERM, false), (signals::SIGKILL, true)]
        );
    }

    #[tokio::test]
    async fn test_stop_without_force_times_out() {
        let f = fixture().await;
        let (info, task) = running(&f, "c1").await;
        task.ignore_signal(signals::SIGTERM);

        let err = f
            .cache
            .stop(
                &Context::background(),
                &info,
                StopOptions {
                    timeout: Duration::from_millis(30),
                    force: false,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "container c1 did not stop after SIGTERM");
        assert!(!info.skip_exit_hooks().await);
    }

    #[tokio::test]
    async fn test_sigkill_goes_straight_to_force_path() {
        let f = fixture().await;
        let (info, task) = running(&f, "c1").await;

        f.cache
            .stop(
                &Context::background(),
                &info,
                StopOptions {
                    signal: signals::SIGKILL,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(task.state().signals, vec![(signals::SIGKILL, true)]);
    }

    #[tokio::test]
    async fn test_zero_timeout_forces_immediately() {
        let f = fixture().await;
        let (info, task) = running(&f, "c1").await;

        f.cache
            .stop(
                &Context::background(),
                &info,
                StopOptions {
                    timeout: Duration::ZERO,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(task.state().signals, vec![(signals::SIGKILL, true)]);
    }

    #[tokio::test]
    async fn test_sigkill_ignored_times_out() {
        let f = fixture().await;
        let (info, task) = running(&f, "c1").await;
        task.ignore_signal(signals::SIGKILL);

        let err = f
            .cache
            .stop(
                &Context::background(),
                &info,
                StopOptions {
                    signal: signals::SIGKILL,
                    timeout: Duration::from_millis(30),
                    force: true,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ContainerError::StopTimeout { ref signal, .. } if signal == "SIGKILL"
        ));
    }

    #[tokio::test]
    async fn test_cleanup_is_idempotent() {
        let f = fixture().await;
        let (info, _task) = running(&f, "c1").await;
        f.cache.remove("c1").await;

        let cleanup = Cleanup::new(info.clone(), f.cache.spi.clone(), Context::background());
        assert!(!cleanup.is_done());
        cleanup.run().await;
        cleanup.run().await;
        assert!(cleanup.is_done());
        let deletes = f
            .fake
            .operations()
            .iter()
            .filter(|op| *op == "delete_task")
            .count();
        assert_eq!(deletes, 1);
    }

    #[tokio::test]
    async fn test_lookups_proceed_while_add_waits() {
        let f = fixture().await;
        running(&f, "c1").await;

        let image = Image::new(
            "reg.test/app:1",
            Descriptor::new(MEDIA_TYPE_OCI_MANIFEST, "sha256:m", 10),
        );
        let fake_task = f.fake.seed_container("c2", image);
        let gate = fake_task.gate_wait();
        let ctx = Context::background().with_namespace("test");
        let container = f.fake.load_container(&ctx, "c2").await.unwrap();
        let task = container.task(&ctx, None).await.unwrap();
        let record = Container {
            id: "c2".to_string(),
            ..Default::default()
        };
        let info = Arc::new(ContainerInfo::new(record, container, task));

        let cache = f.cache.clone();
        let pending = info.clone();
        let adding = tokio::spawn(async move { cache.add(pending).await });
        eventually(async || {
            let ops = f.fake.operations();
            ops.iter().filter(|op| op.as_str() == "wait_task").count() == 2
        })
        .await;

        let found = tokio::time::timeout(Duration::from_secs(1), f.cache.get("c1"))
            .await
            .unwrap();
        assert!(found.is_some());
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(1), f.cache.get_all())
                .await
                .unwrap()
                .len(),
            1
        );
        assert!(matches!(
            f.cache.add(info.clone()).await,
            Err(ContainerError::AlreadyExists(_))
        ));

        gate.notify_one();
        adding.await.unwrap().unwrap();
        assert!(f.cache.get("c2").await.is_some());
        assert!(info.is_watched());
    }
}
