//! Container stdio: stream multiplexing, FIFO wiring, log drivers and attach
//! sessions.

mod attach;
mod direct;
mod error;
mod fifo;
mod logger;
mod manager;
mod multiwriter;
mod stream;

pub use attach::{AttachConfig, attach};
pub use direct::{ContainerIo, DirectIo};
pub use error::IoError;
pub use fifo::FifoSet;
pub use logger::{
    BoundedBuffer, JsonFileDriver, LogDriver, LogEntry, LogHandler, LogMode, LogModeConfig,
    LogSource, MAX_LOG_LINE,
};
pub use manager::{IoManager, IoRecord};
pub use multiwriter::{BoxedReader, BoxedWriter, MultiWriter, WriterId};
pub use stream::Stream;

use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Bound on every wait performed while closing IO.
pub const CLOSE_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Awaits `fut` for at most `timeout`, logging when it does not finish.
pub async fn wait_bounded(what: &str, timeout: Duration, fut: impl Future<Output = ()>) {
    if tokio::time::timeout(timeout, fut).await.is_err() {
        warn!("Timed out after {:?} waiting for {}", timeout, what);
    }
}
