use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

pub type WriterId = u64;

/// Chunks a writer may have pending before it counts as stalled.
pub const WRITER_QUEUE: usize = 128;

/// Longest a single chunk may take to reach a writer.
pub const WRITER_STALL_TIMEOUT: Duration = Duration::from_secs(10);

type Chunk = Arc<[u8]>;

struct Sink {
    id: WriterId,
    queue: mpsc::Sender<Chunk>,
    stop: CancellationToken,
    drain: JoinHandle<()>,
}

/// Fans every write out to a set of writers.
///
/// Each writer is fed from its own bounded queue by a drain task, so a slow
/// writer never holds up the producer or the other writers. A writer that
/// fails, stalls past [`WRITER_STALL_TIMEOUT`] or lets its queue fill up is
/// closed and evicted; the producer always sees its write succeed.
#[derive(Default)]
pub struct MultiWriter {
    sinks: Arc<Mutex<Vec<Sink>>>,
    next_id: AtomicU64,
}

impl MultiWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_writer(&self, writer: BoxedWriter) -> WriterId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (queue, rx) = mpsc::channel(WRITER_QUEUE);
        let stop = CancellationToken::new();
        let drain = tokio::spawn(drain(
            id,
            writer,
            rx,
            stop.clone(),
            Arc::downgrade(&self.sinks),
        ));
        self.sinks.lock().push(Sink {
            id,
            queue,
            stop,
            drain,
        });
        id
    }

    /// Detaches writer `id`. Chunks already queued for it are still
    /// delivered before it is closed.
    pub async fn remove_writer(&self, id: WriterId) {
        self.sinks.lock().retain(|sink| sink.id != id);
    }

    pub async fn write(&self, buf: &[u8]) -> usize {
        if buf.is_empty() {
            return 0;
        }
        let chunk: Chunk = Arc::from(buf);
        self.sinks
            .lock()
            .retain(|sink| match sink.queue.try_send(chunk.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    debug!("Evicting writer {}: {} chunks pending", sink.id, WRITER_QUEUE);
                    sink.stop.cancel();
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            });
        buf.len()
    }

    /// Detaches every writer and waits, within [`WRITER_STALL_TIMEOUT`], for
    /// their pending chunks to be flushed and the writers closed.
    pub async fn close(&self) {
        let sinks: Vec<Sink> = self.sinks.lock().drain(..).collect();
        let deadline = tokio::time::Instant::now() + WRITER_STALL_TIMEOUT;
        for Sink {
            id,
            queue,
            stop,
            drain,
        } in sinks
        {
            drop(queue);
            if tokio::time::timeout_at(deadline, drain).await.is_err() {
                debug!("Writer {} did not drain in time, dropping its pending output", id);
                stop.cancel();
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.sinks.lock().len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

async fn drain(
    id: WriterId,
    mut writer: BoxedWriter,
    mut queue: mpsc::Receiver<Chunk>,
    stop: CancellationToken,
    sinks: Weak<Mutex<Vec<Sink>>>,
) {
    let failed = loop {
        let chunk = tokio::select! {
            biased;
            _ = stop.cancelled() => break false,
            chunk = queue.recv() => match chunk {
                Some(chunk) => chunk,
                None => break false,
            },
        };
        let delivered = tokio::select! {
            biased;
            _ = stop.cancelled() => break false,
            res = tokio::time::timeout(WRITER_STALL_TIMEOUT, async {
                writer.write_all(&chunk).await?;
                writer.flush().await
            }) => res,
        };
        match delivered {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Evicting writer {} after write error: {}", id, e);
                break true;
            }
            Err(_) => {
                debug!("Evicting writer {} stalled for {:?}", id, WRITER_STALL_TIMEOUT);
                break true;
            }
        }
    };

    if failed {
        if let Some(sinks) = sinks.upgrade() {
            sinks.lock().retain(|sink| sink.id != id);
        }
    }
    let _ = tokio::time::timeout(WRITER_STALL_TIMEOUT, writer.shutdown()).await;
}
