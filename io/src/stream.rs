use crate::multiwriter::{BoxedReader, BoxedWriter, MultiWriter, WriterId};
use std::io;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const PIPE_BUFFER: usize = 64 * 1024;

/// The stdio of one container as seen by the client: a stdin pipe and two
/// output multiplexers.
pub struct Stream {
    use_stdin: bool,
    stdin_reader: Mutex<Option<BoxedReader>>,
    stdin_writer: Mutex<Option<BoxedWriter>>,
    stdout: MultiWriter,
    stderr: MultiWriter,
    copiers: Mutex<Vec<JoinHandle<()>>>,
    closed: CancellationToken,
}

impl Stream {
    /// Without stdin, writes to the stdin side are discarded.
    pub fn new(use_stdin: bool) -> Self {
        let (reader, writer): (Option<BoxedReader>, BoxedWriter) = if use_stdin {
            let (writer, reader) = tokio::io::duplex(PIPE_BUFFER);
            (Some(Box::new(reader)), Box::new(writer))
        } else {
            (None, Box::new(tokio::io::sink()))
        };
        Self {
            use_stdin,
            stdin_reader: Mutex::new(reader),
            stdin_writer: Mutex::new(Some(writer)),
            stdout: MultiWriter::new(),
            stderr: MultiWriter::new(),
            copiers: Mutex::new(Vec::new()),
            closed: CancellationToken::new(),
        }
    }

    pub fn use_stdin(&self) -> bool {
        self.use_stdin
    }

    pub fn stdout(&self) -> &MultiWriter {
        &self.stdout
    }

    pub fn stderr(&self) -> &MultiWriter {
        &self.stderr
    }

    /// Hands out the read side of stdin. Only the first caller gets it.
    pub async fn take_stdin_reader(&self) -> Option<BoxedReader> {
        self.stdin_reader.lock().await.take()
    }

    pub async fn write_stdin(&self, buf: &[u8]) -> io::Result<()> {
        let mut writer = self.stdin_writer.lock().await;
        match writer.as_mut() {
            Some(w) => {
                w.write_all(buf).await?;
                w.flush().await
            }
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "stdin is closed")),
        }
    }

    pub async fn close_stdin(&self) {
        let writer = self.stdin_writer.lock().await.take();
        if let Some(mut w) = writer {
            let _ = w.shutdown().await;
        }
    }

    pub async fn new_stdout_pipe(&self) -> (WriterId, DuplexStream) {
        let (writer, reader) = tokio::io::duplex(PIPE_BUFFER);
        (self.stdout.add_writer(Box::new(writer)).await, reader)
    }

    pub async fn new_stderr_pipe(&self) -> (WriterId, DuplexStream) {
        let (writer, reader) = tokio::io::duplex(PIPE_BUFFER);
        (self.stderr.add_writer(Box::new(writer)).await, reader)
    }

    /// Registers a copy loop feeding this stream so [`Stream::wait`] covers it.
    pub async fn track(&self, copier: JoinHandle<()>) {
        self.copiers.lock().await.push(copier);
    }

    /// Waits for every tracked copy loop to finish.
    pub async fn wait(&self) {
        let copiers: Vec<_> = self.copiers.lock().await.drain(..).collect();
        for copier in copiers {
            let _ = copier.await;
        }
    }

    /// Resolves once [`Stream::close`] has been called.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub async fn close(&self) {
        self.closed.cancel();
        self.stdout.close().await;
        self.stderr.close().await;
        self.close_stdin().await;
    }
}
