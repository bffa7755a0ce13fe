//! Byte pumps between a session and a process.
//!
//! A pump copies bytes from a source to a destination until the source hits
//! EOF, either side fails, or its stop token fires. Pumps never retry; the
//! [`PumpReport`] tells the caller how the copy ended and the caller decides
//! what that means.
//!
//! The pty master only offers blocking `Read`/`Write` handles, so the
//! `*_blocking` variants run each read or write on the blocking pool.

use std::future::Future;
use std::io::{self, Read, Write};
use std::time::Duration;

use revsh_protocol::CancelReason;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Buffer size for a single copy step.
const CHUNK_SIZE: usize = 4096;

/// How a pump stopped.
#[derive(Debug)]
pub enum PumpEnd {
    /// The source reached EOF.
    Eof,
    /// The pump's stop token fired.
    Stopped,
    /// Reading or writing failed.
    Failed(io::Error),
}

impl PumpEnd {
    /// The cancellation reason an input pump ending this way implies.
    ///
    /// A stopped pump implies nothing: whoever stopped it is already tearing
    /// the session down.
    pub fn input_reason(&self) -> Option<CancelReason> {
        match self {
            PumpEnd::Eof => Some(CancelReason::InputClosed),
            PumpEnd::Failed(e) => Some(CancelReason::InputFailed(e.to_string())),
            PumpEnd::Stopped => None,
        }
    }
}

/// Summary of a finished pump.
#[derive(Debug)]
pub struct PumpReport {
    pub label: &'static str,
    pub bytes: u64,
    pub end: PumpEnd,
}

impl PumpReport {
    fn new(label: &'static str, bytes: u64, end: PumpEnd) -> Self {
        match &end {
            PumpEnd::Failed(e) => {
                tracing::debug!(pump = label, bytes, error = %e, "Pump failed")
            }
            _ => tracing::trace!(pump = label, bytes, end = ?end, "Pump finished"),
        }
        Self { label, bytes, end }
    }
}

/// Copies from an async source into an async destination.
pub async fn copy<R, W>(
    label: &'static str,
    src: &mut R,
    dst: &mut W,
    stop: &CancellationToken,
) -> PumpReport
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut bytes = 0u64;

    loop {
        let n = tokio::select! {
            biased;
            _ = stop.cancelled() => return PumpReport::new(label, bytes, PumpEnd::Stopped),
            read = src.read(&mut buffer) => match read {
                Ok(0) => return PumpReport::new(label, bytes, PumpEnd::Eof),
                Ok(n) => n,
                Err(e) => return PumpReport::new(label, bytes, PumpEnd::Failed(e)),
            },
        };

        let written = tokio::select! {
            biased;
            _ = stop.cancelled() => return PumpReport::new(label, bytes, PumpEnd::Stopped),
            written = write_chunk(dst, &buffer[..n]) => written,
        };

        if let Err(e) = written {
            return PumpReport::new(label, bytes, PumpEnd::Failed(e));
        }
        bytes += n as u64;
    }
}

/// Copies from a blocking reader into an async destination.
///
/// A read that is in flight when `stop` fires keeps its blocking thread
/// until the reader returns; its data is discarded.
pub async fn copy_from_blocking<W>(
    label: &'static str,
    src: Box<dyn Read + Send>,
    dst: &mut W,
    stop: &CancellationToken,
) -> PumpReport
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut reader = Some(src);
    let mut bytes = 0u64;

    loop {
        let Some(mut src) = reader.take() else {
            return PumpReport::new(label, bytes, PumpEnd::Stopped);
        };

        let read = tokio::task::spawn_blocking(move || {
            let mut buffer = vec![0u8; CHUNK_SIZE];
            let result = src.read(&mut buffer).map(|n| {
                buffer.truncate(n);
                buffer
            });
            (src, result)
        });

        let chunk = tokio::select! {
            biased;
            _ = stop.cancelled() => return PumpReport::new(label, bytes, PumpEnd::Stopped),
            joined = read => match joined {
                Ok((src, Ok(chunk))) => {
                    reader = Some(src);
                    chunk
                }
                Ok((_, Err(e))) => return PumpReport::new(label, bytes, PumpEnd::Failed(e)),
                Err(e) => {
                    return PumpReport::new(label, bytes, PumpEnd::Failed(io::Error::other(e)))
                }
            },
        };

        if chunk.is_empty() {
            return PumpReport::new(label, bytes, PumpEnd::Eof);
        }

        let written = tokio::select! {
            biased;
            _ = stop.cancelled() => return PumpReport::new(label, bytes, PumpEnd::Stopped),
            written = write_chunk(dst, &chunk) => written,
        };

        if let Err(e) = written {
            return PumpReport::new(label, bytes, PumpEnd::Failed(e));
        }
        bytes += chunk.len() as u64;
    }
}

/// Copies from an async source into a blocking writer.
///
/// The writer is handed back with the report so the caller decides when it
/// is closed. It is `None` only when `stop` fired during a write.
pub async fn copy_into_blocking<R>(
    label: &'static str,
    src: &mut R,
    dst: Box<dyn Write + Send>,
    stop: &CancellationToken,
) -> (PumpReport, Option<Box<dyn Write + Send>>)
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut writer = dst;
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut bytes = 0u64;

    loop {
        let n = tokio::select! {
            biased;
            _ = stop.cancelled() => {
                return (PumpReport::new(label, bytes, PumpEnd::Stopped), Some(writer))
            }
            read = src.read(&mut buffer) => match read {
                Ok(0) => return (PumpReport::new(label, bytes, PumpEnd::Eof), Some(writer)),
                Ok(n) => n,
                Err(e) => return (PumpReport::new(label, bytes, PumpEnd::Failed(e)), Some(writer)),
            },
        };

        let chunk = buffer[..n].to_vec();
        let write = tokio::task::spawn_blocking(move || {
            let result = writer.write_all(&chunk).and_then(|_| writer.flush());
            (writer, result)
        });

        tokio::select! {
            biased;
            _ = stop.cancelled() => return (PumpReport::new(label, bytes, PumpEnd::Stopped), None),
            joined = write => match joined {
                Ok((dst, Ok(()))) => writer = dst,
                Ok((dst, Err(e))) => {
                    return (PumpReport::new(label, bytes, PumpEnd::Failed(e)), Some(dst))
                }
                Err(e) => {
                    let end = PumpEnd::Failed(io::Error::other(e));
                    return (PumpReport::new(label, bytes, end), None);
                }
            },
        }
        bytes += n as u64;
    }
}

async fn write_chunk<W>(dst: &mut W, chunk: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    dst.write_all(chunk).await?;
    dst.flush().await
}

/// A spawned pump task.
///
/// The pump owns a stop token derived from its session's task group, so
/// cancelling the group stops every pump at once.
pub struct Pump<T> {
    label: &'static str,
    stop: CancellationToken,
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> Pump<T> {
    /// Spawns the future built by `make`, handing it the pump's stop token.
    pub fn spawn<F, Fut>(label: &'static str, group: &CancellationToken, make: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let stop = group.child_token();
        let handle = tokio::spawn(make(stop.clone()));
        Self {
            label,
            stop,
            handle,
        }
    }

    /// Waits for the pump to finish.
    ///
    /// Returns `None` if the task panicked or was aborted.
    pub async fn join(self) -> Option<T> {
        let label = self.label;
        match self.handle.await {
            Ok(output) => Some(output),
            Err(e) => {
                tracing::warn!(pump = label, error = %e, "Pump task did not complete");
                None
            }
        }
    }

    /// Waits up to `grace` for the pump to finish on its own, then stops it.
    pub async fn join_within(mut self, grace: Duration) -> Option<T> {
        let label = self.label;
        let finished = match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(finished) => finished,
            Err(_) => {
                tracing::debug!(pump = label, "Pump still running after grace period, stopping");
                self.stop.cancel();
                self.handle.await
            }
        };

        match finished {
            Ok(output) => Some(output),
            Err(e) => {
                tracing::warn!(pump = label, error = %e, "Pump task did not complete");
                None
            }
        }
    }
}
