use crate::direct::ContainerIo;
use crate::error::IoError;
use crate::fifo::FifoSet;
use crate::logger::{BoundedBuffer, LogDriver, LogHandler, LogMode, LogModeConfig};
use crate::multiwriter::WriterId;
use crate::stream::Stream;
use crate::{CLOSE_WAIT_TIMEOUT, wait_bounded};
use berth_supervisor::{IoAttach, IoConfig, IoCreator, SupervisorError, TaskIo, io_future};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tracing::{debug, warn};

struct Logging {
    driver: Arc<dyn LogDriver>,
    handler: LogHandler,
    stream: Arc<Stream>,
    stdout: WriterId,
    stderr: WriterId,
}

/// Per-container IO state: the stream plus the log driver fed from it.
pub struct IoRecord {
    id: String,
    use_stdin: bool,
    stream: RwLock<Arc<Stream>>,
    logging: tokio::sync::Mutex<Option<Logging>>,
    non_block: AtomicBool,
    max_buffer_bytes: AtomicI64,
}

impl IoRecord {
    fn new(id: &str, use_stdin: bool) -> Self {
        Self {
            id: id.to_string(),
            use_stdin,
            stream: RwLock::new(Arc::new(Stream::new(use_stdin))),
            logging: tokio::sync::Mutex::new(None),
            non_block: AtomicBool::new(false),
            max_buffer_bytes: AtomicI64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn use_stdin(&self) -> bool {
        self.use_stdin
    }

    pub fn stream(&self) -> Arc<Stream> {
        self.stream.read().clone()
    }

    pub fn is_non_block(&self) -> bool {
        self.non_block.load(Ordering::SeqCst)
    }

    pub fn max_buffer_bytes(&self) -> i64 {
        self.max_buffer_bytes.load(Ordering::SeqCst)
    }

    pub async fn log_driver(&self) -> Option<Arc<dyn LogDriver>> {
        self.logging.lock().await.as_ref().map(|l| l.driver.clone())
    }

    async fn set_logging(&self, driver: Arc<dyn LogDriver>, non_block: bool, max_bytes: i64) {
        self.close_logging().await;

        let stream = self.stream();
        let (stdout_id, stdout) = stream.new_stdout_pipe().await;
        let (stderr_id, stderr) = stream.new_stderr_pipe().await;
        let handler = LogHandler::start(stdout, Some(stderr), driver.clone());

        self.non_block.store(non_block, Ordering::SeqCst);
        self.max_buffer_bytes.store(max_bytes, Ordering::SeqCst);
        *self.logging.lock().await = Some(Logging {
            driver,
            handler,
            stream,
            stdout: stdout_id,
            stderr: stderr_id,
        });
    }

    async fn close_logging(&self) {
        let logging = self.logging.lock().await.take();
        if let Some(logging) = logging {
            // Detaching the pipes ends the handler even while the stream lives on.
            logging.stream.stdout().remove_writer(logging.stdout).await;
            logging.stream.stderr().remove_writer(logging.stderr).await;
            wait_bounded("log handler", CLOSE_WAIT_TIMEOUT, logging.handler.wait()).await;
            if let Err(e) = logging.driver.close().await {
                warn!(container_id = %self.id, "Failed to close log driver: {}", e);
            }
        }
    }

    /// Closes the stream and the log driver; the record stays usable only
    /// after [`IoRecord::reset`].
    pub async fn close(&self) {
        let stream = self.stream();
        stream.close().await;
        wait_bounded("stream", CLOSE_WAIT_TIMEOUT, stream.wait()).await;
        self.close_logging().await;
    }

    /// Drops the current stream and logging and prepares a fresh stream.
    pub async fn reset(&self) {
        self.close().await;
        *self.stream.write() = Arc::new(Stream::new(self.use_stdin));
        self.non_block.store(false, Ordering::SeqCst);
        self.max_buffer_bytes.store(0, Ordering::SeqCst);
    }
}

/// Cache of IO records keyed by container ID.
#[derive(Clone)]
pub struct IoManager {
    ios: Arc<DashMap<String, Arc<IoRecord>>>,
    fifo_root: PathBuf,
}

impl IoManager {
    pub fn new(fifo_root: impl Into<PathBuf>) -> Self {
        Self {
            ios: Arc::new(DashMap::new()),
            fifo_root: fifo_root.into(),
        }
    }

    pub fn fifo_root(&self) -> &Path {
        &self.fifo_root
    }

    pub fn exists(&self, id: &str) -> bool {
        self.ios.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Arc<IoRecord>> {
        self.ios.get(id).map(|r| r.value().clone())
    }

    pub fn init(&self, id: &str, open_stdin: bool) -> Result<Arc<IoRecord>, IoError> {
        match self.ios.entry(id.to_string()) {
            Entry::Occupied(_) => Err(IoError::AlreadyExists(id.to_string())),
            Entry::Vacant(v) => {
                let record = Arc::new(IoRecord::new(id, open_stdin));
                v.insert(record.clone());
                debug!(container_id = %id, "Initialized IO");
                Ok(record)
            }
        }
    }

    /// Binds `driver` to the record of `id`. In non-blocking mode with a
    /// positive buffer size the driver is fronted by a [`BoundedBuffer`].
    pub async fn configure(
        &self,
        id: &str,
        driver: Arc<dyn LogDriver>,
        mode: &LogModeConfig,
    ) -> Result<(), IoError> {
        let record = self
            .get(id)
            .ok_or_else(|| IoError::NoResources(id.to_string()))?;
        let max_bytes = mode.buffer_bytes()?;

        if mode.mode == LogMode::NonBlocking && max_bytes > 0 {
            let buffered: Arc<dyn LogDriver> =
                Arc::new(BoundedBuffer::new(driver, max_bytes as usize));
            record.set_logging(buffered, true, max_bytes).await;
        } else {
            record.set_logging(driver, false, 0).await;
        }
        Ok(())
    }

    pub async fn reset(&self, id: &str) -> Result<(), IoError> {
        let record = self
            .get(id)
            .ok_or_else(|| IoError::NoResources(id.to_string()))?;
        record.reset().await;
        Ok(())
    }

    pub async fn close(&self, id: &str) -> Result<(), IoError> {
        let record = self
            .get(id)
            .ok_or_else(|| IoError::NoResources(id.to_string()))?;
        record.close().await;
        Ok(())
    }

    /// Closes and forgets the record of `id`. A missing record is not an
    /// error.
    pub async fn clear(&self, id: &str) {
        if let Some((_, record)) = self.ios.remove(id) {
            record.close().await;
        }
    }

    /// Factory the supervisor calls with the container ID when creating a
    /// task: builds a FIFO set and wires it to the container's stream.
    pub fn new_cio_creator(&self, tty: bool) -> IoCreator {
        let manager = self.clone();
        Arc::new(move |id: String| {
            let manager = manager.clone();
            io_future(async move {
                let record = manager
                    .get(&id)
                    .ok_or_else(|| IoError::NoResources(id.clone()))?;
                let fifos = FifoSet::new(&manager.fifo_root, &id, record.use_stdin(), tty)?;
                let io = ContainerIo::new(fifos, record.stream()).await?;
                Ok::<_, SupervisorError>(Arc::new(io) as Arc<dyn TaskIo>)
            })
        })
    }

    /// Factory re-attaching the stream of `id` to a running task's FIFOs.
    pub fn new_cio_attach(&self, id: &str) -> IoAttach {
        let manager = self.clone();
        let id = id.to_string();
        Arc::new(move |config: IoConfig| {
            let manager = manager.clone();
            let id = id.clone();
            io_future(async move {
                let record = manager
                    .get(&id)
                    .ok_or_else(|| IoError::NoResources(id.clone()))?;
                let io = ContainerIo::new(FifoSet::from_config(config), record.stream()).await?;
                Ok::<_, SupervisorError>(Arc::new(io) as Arc<dyn TaskIo>)
            })
        })
    }
}
