use crate::error::IoError;
use async_trait::async_trait;
use berth_core::units::ram_in_bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub source: LogSource,
    pub line: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(source: LogSource, line: Vec<u8>) -> Self {
        Self {
            source,
            line,
            timestamp: Utc::now(),
        }
    }
}

/// Destination of container output.
#[async_trait]
pub trait LogDriver: Send + Sync {
    fn name(&self) -> &str;

    async fn write_log_entry(&self, entry: LogEntry) -> Result<(), IoError>;

    async fn close(&self) -> Result<(), IoError>;
}

#[derive(Serialize)]
struct JsonLine<'a> {
    log: std::borrow::Cow<'a, str>,
    stream: LogSource,
    time: String,
}

/// Appends one JSON object per line to `<root>/<id>/<id>-json.log`.
pub struct JsonFileDriver {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl JsonFileDriver {
    pub const NAME: &'static str = "json-file";

    pub async fn open(log_root: &Path, id: &str) -> Result<Self, IoError> {
        let dir = log_root.join(id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}-json.log", id));
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LogDriver for JsonFileDriver {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn write_log_entry(&self, entry: LogEntry) -> Result<(), IoError> {
        let mut line = serde_json::to_vec(&JsonLine {
            log: String::from_utf8_lossy(&entry.line),
            stream: entry.source,
            time: entry
                .timestamp
                .to_rfc3339_opts(SecondsFormat::Nanos, true),
        })?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        let file = file.as_mut().ok_or(IoError::DriverClosed)?;
        file.write_all(&line).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), IoError> {
        if let Some(mut file) = self.file.lock().await.take() {
            file.flush().await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogMode {
    #[default]
    Blocking,
    NonBlocking,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogModeConfig {
    #[serde(default)]
    pub mode: LogMode,
    #[serde(default)]
    pub max_buffer_size: String,
}

impl LogModeConfig {
    /// Size of the in-memory buffer for non-blocking mode; zero when unset.
    pub fn buffer_bytes(&self) -> Result<i64, IoError> {
        if self.max_buffer_size.trim().is_empty() {
            return Ok(0);
        }
        Ok(ram_in_bytes(&self.max_buffer_size)?)
    }
}

#[derive(Default)]
struct BufferState {
    queue: VecDeque<LogEntry>,
    bytes: usize,
    dropped: u64,
    closed: bool,
}

enum Step {
    Entry(LogEntry),
    Wait,
    Done,
}

/// Non-blocking front for a slow driver: holds up to `max_bytes` of pending
/// output and drops new entries while full.
pub struct BoundedBuffer {
    inner: Arc<dyn LogDriver>,
    state: Arc<parking_lot::Mutex<BufferState>>,
    notify: Arc<Notify>,
    max_bytes: usize,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl BoundedBuffer {
    pub fn new(inner: Arc<dyn LogDriver>, max_bytes: usize) -> Self {
        let state = Arc::new(parking_lot::Mutex::new(BufferState::default()));
        let notify = Arc::new(Notify::new());
        let drain = tokio::spawn(drain(inner.clone(), state.clone(), notify.clone()));
        Self {
            inner,
            state,
            notify,
            max_bytes,
            drain: Mutex::new(Some(drain)),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}

async fn drain(
    inner: Arc<dyn LogDriver>,
    state: Arc<parking_lot::Mutex<BufferState>>,
    notify: Arc<Notify>,
) {
    loop {
        let step = {
            let mut st = state.lock();
            match st.queue.pop_front() {
                Some(entry) => {
                    st.bytes -= entry.line.len();
                    Step::Entry(entry)
                }
                None if st.closed => Step::Done,
                None => Step::Wait,
            }
        };
        match step {
            Step::Entry(entry) => {
                if let Err(e) = inner.write_log_entry(entry).await {
                    warn!("{} driver failed to write entry: {}", inner.name(), e);
                }
            }
            Step::Wait => notify.notified().await,
            Step::Done => break,
        }
    }
}

#[async_trait]
impl LogDriver for BoundedBuffer {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn write_log_entry(&self, entry: LogEntry) -> Result<(), IoError> {
        {
            let mut st = self.state.lock();
            if st.closed {
                return Err(IoError::DriverClosed);
            }
            if st.bytes + entry.line.len() > self.max_bytes {
                st.dropped += 1;
                if st.dropped == 1 {
                    warn!(
                        "Log buffer of {} bytes is full, dropping entries",
                        self.max_bytes
                    );
                }
                return Ok(());
            }
            st.bytes += entry.line.len();
            st.queue.push_back(entry);
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn close(&self) -> Result<(), IoError> {
        self.state.lock().closed = true;
        self.notify.notify_one();
        if let Some(drain) = self.drain.lock().await.take() {
            let _ = drain.await;
        }
        self.inner.close().await
    }
}

/// Reads the output pipes of a stream line by line into a driver.
pub struct LogHandler {
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl LogHandler {
    pub fn start<O, E>(stdout: O, stderr: Option<E>, driver: Arc<dyn LogDriver>) -> Self
    where
        O: AsyncRead + Send + Unpin + 'static,
        E: AsyncRead + Send + Unpin + 'static,
    {
        let mut forwarders = vec![tokio::spawn(forward(
            stdout,
            LogSource::Stdout,
            driver.clone(),
        ))];
        if let Some(stderr) = stderr {
            forwarders.push(tokio::spawn(forward(stderr, LogSource::Stderr, driver)));
        }
        Self {
            forwarders: Mutex::new(forwarders),
        }
    }

    /// Completes once every pipe reached EOF.
    pub async fn wait(&self) {
        let forwarders: Vec<_> = self.forwarders.lock().await.drain(..).collect();
        for f in forwarders {
            let _ = f.await;
        }
    }
}

/// Longest entry handed to a driver; longer lines are split.
pub const MAX_LOG_LINE: usize = 16 * 1024;

async fn forward(src: impl AsyncRead + Unpin, source: LogSource, driver: Arc<dyn LogDriver>) {
    let mut reader = BufReader::new(src);
    let mut line = Vec::new();
    loop {
        line.clear();
        let mut limited = (&mut reader).take(MAX_LOG_LINE as u64);
        match limited.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("log pipe closed: {}", e);
                break;
            }
        }
        match driver
            .write_log_entry(LogEntry::new(source, line.clone()))
            .await
        {
            Ok(()) => {}
            Err(IoError::DriverClosed) => break,
            Err(e) => warn!("{} driver failed to write entry: {}", driver.name(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Holds writes until released.
    #[derive(Default)]
    struct GatedDriver {
        gate: Notify,
        lines: parking_lot::Mutex<Vec<String>>,
        closed: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl LogDriver for GatedDriver {
        fn name(&self) -> &str {
            "gated"
        }

        async fn write_log_entry(&self, entry: LogEntry) -> Result<(), IoError> {
            self.gate.notified().await;
            self.lines
                .lock()
                .push(String::from_utf8_lossy(&entry.line).into_owned());
            Ok(())
        }

        async fn close(&self) -> Result<(), IoError> {
            self.closed
                .store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_json_file_driver_format() {
        let root = tempfile::tempdir().unwrap();
        let driver = JsonFileDriver::open(root.path(), "c1").await.unwrap();
        assert_eq!(driver.path(), root.path().join("c1/c1-json.log"));

        driver
            .write_log_entry(LogEntry::new(LogSource::Stdout, b"hello\n".to_vec()))
            .await
            .unwrap();
        driver
            .write_log_entry(LogEntry::new(LogSource::Stderr, b"oops\n".to_vec()))
            .await
            .unwrap();
        driver.close().await.unwrap();
        assert!(matches!(
            driver
                .write_log_entry(LogEntry::new(LogSource::Stdout, b"late".to_vec()))
                .await,
            Err(IoError::DriverClosed)
        ));

        let content = std::fs::read_to_string(driver.path()).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["log"], "hello\n");
        assert_eq!(lines[0]["stream"], "stdout");
        assert_eq!(lines[1]["stream"], "stderr");
        assert!(
            DateTime::parse_from_rfc3339(lines[1]["time"].as_str().unwrap()).is_ok()
        );
    }

    #[tokio::test]
    async fn test_bounded_buffer_drops_when_full() {
        let inner = Arc::new(GatedDriver::default());
        let buffer = BoundedBuffer::new(inner.clone(), 8);

        // The drain task takes the first entry and blocks on the gate.
        buffer
            .write_log_entry(LogEntry::new(LogSource::Stdout, b"1234".to_vec()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        for line in [b"abcd", b"efgh", b"ijkl"] {
            buffer
                .write_log_entry(LogEntry::new(LogSource::Stdout, line.to_vec()))
                .await
                .unwrap();
        }
        assert_eq!(buffer.dropped(), 1);

        for _ in 0..3 {
            inner.gate.notify_one();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        buffer.close().await.unwrap();

        assert_eq!(*inner.lines.lock(), vec!["1234", "abcd", "efgh"]);
        assert!(inner.closed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_handler_forwards_lines_until_eof() {
        let root = tempfile::tempdir().unwrap();
        let driver: Arc<dyn LogDriver> =
            Arc::new(JsonFileDriver::open(root.path(), "c1").await.unwrap());
        let (mut out_w, out_r) = tokio::io::duplex(1024);
        let (mut err_w, err_r) = tokio::io::duplex(1024);

        let handler = LogHandler::start(out_r, Some(err_r), driver.clone());
        out_w.write_all(b"line one\nline two\n").await.unwrap();
        err_w.write_all(b"bad\n").await.unwrap();
        drop(out_w);
        drop(err_w);

        tokio::time::timeout(Duration::from_secs(5), handler.wait())
            .await
            .unwrap();
        driver.close().await.unwrap();

        let content =
            std::fs::read_to_string(root.path().join("c1/c1-json.log")).unwrap();
        assert_eq!(content.lines().count(), 3);
        assert!(content.contains("\"log\":\"bad\\n\",\"stream\":\"stderr\""));
    }

    #[test]
    fn test_buffer_bytes() {
        let mut cfg = LogModeConfig::default();
        assert_eq!(cfg.buffer_bytes().unwrap(), 0);
        cfg.max_buffer_size = "1m".to_string();
        assert_eq!(cfg.buffer_bytes().unwrap(), 1024 * 1024);
        cfg.max_buffer_size = "lots".to_string();
        assert!(cfg.buffer_bytes().is_err());
    }

    #[derive(Default)]
    struct Collecting {
        entries: parking_lot::Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl LogDriver for Collecting {
        fn name(&self) -> &str {
            "collecting"
        }

        async fn write_log_entry(&self, entry: LogEntry) -> Result<(), IoError> {
            self.entries.lock().push(entry.line);
            Ok(())
        }

        async fn close(&self) -> Result<(), IoError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_forward_splits_unterminated_output() {
        let driver = Arc::new(Collecting::default());
        let (mut tx, rx) = tokio::io::duplex(4096);
        let copier = tokio::spawn(forward(rx, LogSource::Stdout, driver.clone()));

        tx.write_all(&vec![b'x'; MAX_LOG_LINE * 2 + 10]).await.unwrap();
        tx.write_all(b"\nshort\n").await.unwrap();
        drop(tx);
        copier.await.unwrap();

        let entries = driver.entries.lock();
        let sizes: Vec<usize> = entries.iter().map(|e| e.len()).collect();
        assert_eq!(sizes, vec![MAX_LOG_LINE, MAX_LOG_LINE, 11, 6]);
        assert_eq!(entries[3], b"short\n");
    }
}
