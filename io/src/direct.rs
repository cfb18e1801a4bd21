use crate::error::IoError;
use crate::fifo::FifoSet;
use crate::stream::Stream;
use crate::{CLOSE_WAIT_TIMEOUT, wait_bounded};
use async_trait::async_trait;
use berth_supervisor::{IoConfig, SupervisorError, TaskIo};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::unix::pipe;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const COPY_BUFFER: usize = 32 * 1024;

/// Once draining, a pump stops after the FIFO stays quiet this long.
const DRAIN_IDLE: Duration = Duration::from_millis(100);

/// Reads and writes a task's FIFO set directly.
pub struct DirectIo {
    fifos: FifoSet,
    draining: CancellationToken,
    token: CancellationToken,
}

impl DirectIo {
    pub fn new(fifos: FifoSet) -> Self {
        Self {
            fifos,
            draining: CancellationToken::new(),
            token: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &IoConfig {
        self.fifos.config()
    }

    /// Starts copying stdin from `stream` into the FIFOs and the FIFO output
    /// into the stream's multiplexers.
    pub async fn connect(&self, stream: &Arc<Stream>) -> Result<(), IoError> {
        let config = self.fifos.config();

        if let Some(path) = &config.stdin {
            if let Some(mut reader) = stream.take_stdin_reader().await {
                let mut fifo = pipe::OpenOptions::new()
                    .read_write(true)
                    .open_sender(path)?;
                let token = self.token.clone();
                let draining = self.draining.clone();
                let owner = stream.clone();
                stream
                    .track(tokio::spawn(async move {
                        tokio::select! {
                            _ = token.cancelled() => {}
                            _ = draining.cancelled() => {}
                            _ = owner.closed() => {}
                            res = tokio::io::copy(&mut reader, &mut fifo) => {
                                if let Err(e) = res {
                                    debug!("stdin copy ended: {}", e);
                                }
                            }
                        }
                    }))
                    .await;
            }
        }

        // Receivers are opened read-write so they do not see EOF before the
        // task opens its end; draining is bounded by DRAIN_IDLE instead.
        if let Some(path) = &config.stdout {
            let fifo = pipe::OpenOptions::new()
                .read_write(true)
                .open_receiver(path)?;
            let handle = tokio::spawn(pump(
                fifo,
                stream.clone(),
                false,
                self.draining.clone(),
                self.token.clone(),
            ));
            stream.track(handle).await;
        }

        if let Some(path) = &config.stderr {
            let fifo = pipe::OpenOptions::new()
                .read_write(true)
                .open_receiver(path)?;
            let handle = tokio::spawn(pump(
                fifo,
                stream.clone(),
                true,
                self.draining.clone(),
                self.token.clone(),
            ));
            stream.track(handle).await;
        }

        Ok(())
    }

    /// Lets the output pumps finish what the FIFOs still hold, then stop.
    pub fn drain(&self) {
        self.draining.cancel();
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Stops copying and removes the FIFO directory.
    pub fn close(&self) -> Result<(), IoError> {
        self.token.cancel();
        self.fifos.close()
    }
}

async fn pump(
    mut src: impl AsyncRead + Unpin,
    stream: Arc<Stream>,
    stderr: bool,
    draining: CancellationToken,
    token: CancellationToken,
) {
    let mut buf = vec![0u8; COPY_BUFFER];
    loop {
        let read = async {
            if draining.is_cancelled() {
                tokio::time::timeout(DRAIN_IDLE, src.read(&mut buf))
                    .await
                    .ok()
            } else {
                tokio::select! {
                    _ = draining.cancelled() => {
                        tokio::time::timeout(DRAIN_IDLE, src.read(&mut buf))
                            .await
                            .ok()
                    }
                    res = src.read(&mut buf) => Some(res),
                }
            }
        };
        let n = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = stream.closed() => break,
            res = read => match res {
                None | Some(Ok(0)) => break,
                Some(Ok(n)) => n,
                Some(Err(e)) => {
                    debug!("output copy ended: {}", e);
                    break;
                }
            },
        };
        let out = if stderr { stream.stderr() } else { stream.stdout() };
        out.write(&buf[..n]).await;
    }
}

/// The IO handed to the supervisor for one task. Waiting and closing cascade
/// to the container's stream.
pub struct ContainerIo {
    direct: DirectIo,
    stream: Arc<Stream>,
}

impl ContainerIo {
    pub async fn new(fifos: FifoSet, stream: Arc<Stream>) -> Result<Self, IoError> {
        let direct = DirectIo::new(fifos);
        if let Err(e) = direct.connect(&stream).await {
            let _ = direct.close();
            return Err(e);
        }
        Ok(Self { direct, stream })
    }
}

#[async_trait]
impl TaskIo for ContainerIo {
    fn config(&self) -> IoConfig {
        self.direct.config().clone()
    }

    fn cancel(&self) {
        self.direct.cancel();
    }

    async fn wait(&self) {
        self.stream.wait().await;
    }

    async fn close(&self) -> Result<(), SupervisorError> {
        self.direct.drain();
        wait_bounded("output copy", CLOSE_WAIT_TIMEOUT, self.stream.wait()).await;
        let res = self.direct.close();
        self.stream.close().await;
        res.map_err(SupervisorError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_fifo_output_reaches_stream() {
        let root = tempfile::tempdir().unwrap();
        let fifos = FifoSet::new(root.path(), "c1", false, false).unwrap();
        let stdout_path = fifos.config().stdout.clone().unwrap();
        let stream = Arc::new(Stream::new(false));
        let (_, mut pipe_out) = stream.new_stdout_pipe().await;

        let io = ContainerIo::new(fifos, stream.clone()).await.unwrap();

        let mut task_side = pipe::OpenOptions::new()
            .read_write(true)
            .open_sender(&stdout_path)
            .unwrap();
        task_side.write_all(b"hello\n").await.unwrap();

        let mut buf = [0u8; 6];
        pipe_out.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\n");

        io.close().await.unwrap();
        io.wait().await;
        assert!(!stdout_path.exists());

        let mut rest = Vec::new();
        pipe_out.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_stdin_reaches_fifo() {
        let root = tempfile::tempdir().unwrap();
        let fifos = FifoSet::new(root.path(), "c1", true, false).unwrap();
        let stdin_path = fifos.config().stdin.clone().unwrap();
        let stream = Arc::new(Stream::new(true));

        let mut task_side = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(&stdin_path)
            .unwrap();
        let io = ContainerIo::new(fifos, stream.clone()).await.unwrap();
        assert!(io.config().stdin.is_some());

        stream.write_stdin(b"input").await.unwrap();
        let mut buf = [0u8; 5];
        task_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"input");

        io.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_keeps_trailing_output() {
        let root = tempfile::tempdir().unwrap();
        let fifos = FifoSet::new(root.path(), "c1", false, false).unwrap();
        let stdout_path = fifos.config().stdout.clone().unwrap();
        let stream = Arc::new(Stream::new(false));
        let (_, mut pipe_out) = stream.new_stdout_pipe().await;
        let io = ContainerIo::new(fifos, stream.clone()).await.unwrap();

        let mut task_side = pipe::OpenOptions::new()
            .read_write(true)
            .open_sender(&stdout_path)
            .unwrap();
        task_side.write_all(b"last words\n").await.unwrap();
        drop(task_side);

        tokio::time::timeout(Duration::from_secs(5), io.close())
            .await
            .unwrap()
            .unwrap();

        let mut out = Vec::new();
        pipe_out.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"last words\n");
    }
}
