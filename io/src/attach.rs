use crate::error::IoError;
use crate::multiwriter::{BoxedReader, BoxedWriter, WriterId};
use crate::stream::Stream;
use berth_core::{Cancelled, Context};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const COPY_BUFFER: usize = 32 * 1024;

/// The caller's side of an attach session.
#[derive(Default)]
pub struct AttachConfig {
    pub use_stdin: bool,
    pub use_stdout: bool,
    pub use_stderr: bool,
    pub terminal: bool,
    pub close_stdin: bool,
    pub stdin: Option<BoxedReader>,
    pub stdout: Option<BoxedWriter>,
    pub stderr: Option<BoxedWriter>,
}

#[derive(Clone, Copy)]
enum Output {
    Stdout,
    Stderr,
}

/// Streams `stream` to and from the caller until the outputs end, the
/// caller's stdin closes the container's stdin, or `ctx` is cancelled.
pub async fn attach(ctx: &Context, stream: Arc<Stream>, config: AttachConfig) -> Result<(), IoError> {
    let token = ctx.token().child_token();
    let mut copiers = JoinSet::new();

    if config.use_stdout {
        if let Some(out) = config.stdout {
            let (id, pipe) = stream.new_stdout_pipe().await;
            copiers.spawn(copy_output(
                pipe,
                out,
                stream.clone(),
                Output::Stdout,
                id,
                token.clone(),
            ));
        }
    }
    if config.use_stderr && !config.terminal {
        if let Some(err) = config.stderr {
            let (id, pipe) = stream.new_stderr_pipe().await;
            copiers.spawn(copy_output(
                pipe,
                err,
                stream.clone(),
                Output::Stderr,
                id,
                token.clone(),
            ));
        }
    }
    if config.use_stdin {
        if let Some(input) = config.stdin {
            copiers.spawn(copy_input(
                input,
                stream.clone(),
                config.close_stdin,
                token.clone(),
            ));
        }
    }

    let mut first_err = None;
    loop {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                token.cancel();
                while copiers.join_next().await.is_some() {}
                return Err(Cancelled.into());
            }
            next = copiers.join_next() => match next {
                None => break,
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => {
                    token.cancel();
                    first_err.get_or_insert(e);
                }
                Some(Err(e)) => {
                    token.cancel();
                    warn!("attach copier failed: {}", e);
                }
            },
        }
    }

    match first_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn copy_output(
    mut pipe: DuplexStream,
    mut out: BoxedWriter,
    stream: Arc<Stream>,
    which: Output,
    id: WriterId,
    token: CancellationToken,
) -> Result<(), IoError> {
    let mut buf = vec![0u8; COPY_BUFFER];
    let res = loop {
        let n = tokio::select! {
            biased;
            _ = token.cancelled() => break Ok(()),
            read = pipe.read(&mut buf) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(e.into()),
            },
        };
        let written = tokio::select! {
            biased;
            _ = token.cancelled() => break Ok(()),
            res = async {
                out.write_all(&buf[..n]).await?;
                out.flush().await
            } => res,
        };
        if let Err(e) = written {
            break Err(e.into());
        }
    };

    drop(pipe);
    match which {
        Output::Stdout => stream.stdout().remove_writer(id).await,
        Output::Stderr => stream.stderr().remove_writer(id).await,
    }
    res
}

async fn copy_input(
    mut input: BoxedReader,
    stream: Arc<Stream>,
    close_stdin: bool,
    token: CancellationToken,
) -> Result<(), IoError> {
    let mut buf = vec![0u8; COPY_BUFFER];
    let res = loop {
        let n = tokio::select! {
            biased;
            _ = token.cancelled() => break Ok(()),
            read = input.read(&mut buf) => match read {
                Ok(0) => break Ok(()),
                Ok(n) => n,
                Err(e) => break Err(e.into()),
            },
        };
        let written = tokio::select! {
            biased;
            _ = token.cancelled() => break Ok(()),
            res = stream.write_stdin(&buf[..n]) => res,
        };
        if let Err(e) = written {
            break Err(e.into());
        }
    };

    if close_stdin {
        debug!("closing container stdin after attach");
        stream.close_stdin().await;
        token.cancel();
    }
    res
}
