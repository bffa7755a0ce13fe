//! Interactive shell sessions over a pseudo-terminal.
//!
//! The shell runs with the pty slave as its controlling terminal. The session
//! streams are pumped to and from the pty master, and window changes from the
//! remote side are applied to the master until the session ends.

use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use revsh_protocol::{
    BoxedReader, BoxedWriter, ExitReporter, PtyRequest, SessionParts, WindowSize,
    EXIT_FORCED_TERMINATION, EXIT_RUNTIME_FAILURE,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::bridge::{self, Pump, PumpEnd, PumpReport};
use super::exit_status::{self, Termination, UNKNOWN_STATE_NOTICE};
use super::{
    deadline_after, expired, report_exit, write_diagnostic, BridgeError, SessionId,
    SessionOutcome,
};
use crate::config::{DisconnectPolicy, SessionConfig};

/// A shell process attached to a pseudo-terminal.
pub struct PtyHandle {
    /// The PTY master, shared with the resize task.
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,

    /// The shell process.
    child: Box<dyn Child + Send + Sync>,

    /// Process ID.
    pid: Option<u32>,
}

/// Blocking ends of the pty master used by the pumps.
pub struct PtyStreams {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

impl PtyHandle {
    /// Spawns `shell` on a new pty of the given size.
    ///
    /// The shell inherits the daemon's environment plus `env`; `TERM` is set
    /// to `term` last so it cannot be overridden.
    pub fn spawn(
        shell: &str,
        term: &str,
        window: WindowSize,
        env: &BTreeMap<String, String>,
    ) -> Result<(Self, PtyStreams), BridgeError> {
        let start_error = |reason: String| BridgeError::ShellStart {
            shell: shell.to_string(),
            reason,
        };

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(window))
            .map_err(|e| start_error(e.to_string()))?;

        let mut cmd = CommandBuilder::new(shell);
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.env("TERM", term);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| start_error(e.to_string()))?;

        // Only the shell may hold the slave open, or the master never sees a
        // hangup when it exits.
        drop(pair.slave);

        let pid = child.process_id();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| start_error(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| start_error(e.to_string()))?;

        let handle = PtyHandle {
            master: Arc::new(Mutex::new(pair.master)),
            child,
            pid,
        };

        Ok((handle, PtyStreams { reader, writer }))
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the current terminal size.
    pub async fn size(&self) -> Result<WindowSize, BridgeError> {
        let master = self.master.lock().await;
        let size = master
            .get_size()
            .map_err(|e| BridgeError::ResizeFailed(e.to_string()))?;
        Ok(WindowSize::new(size.rows, size.cols))
    }

    /// Resizes the PTY to the given dimensions.
    pub async fn resize(&self, window: WindowSize) -> Result<(), BridgeError> {
        resize_master(&self.master, window).await
    }

    /// Returns a killer that can stop the shell from another task.
    pub fn killer(&self) -> Box<dyn ChildKiller + Send + Sync> {
        self.child.clone_killer()
    }

    /// Waits for the shell to exit on the blocking pool.
    ///
    /// The master stays alive until the wait completes.
    pub fn wait(self) -> JoinHandle<io::Result<Termination>> {
        let PtyHandle { master, child, pid } = self;

        tokio::task::spawn_blocking(move || {
            let termination = match pid {
                Some(pid) => reap(pid),
                None => Err(io::Error::other("shell has no process id")),
            };
            drop(child);
            drop(master);
            termination
        })
    }
}

/// Blocks until `pid` has exited and collects its status.
///
/// portable-pty reports a signal death as exit code 1, so the shell is
/// reaped here to keep the signal number.
fn reap(pid: u32) -> io::Result<Termination> {
    let pid = Pid::from_raw(pid as i32);
    loop {
        match waitpid(pid, None) {
            Ok(status) => return Ok(Termination::from(status)),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn pty_size(window: WindowSize) -> PtySize {
    PtySize {
        rows: window.rows,
        cols: window.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

async fn resize_master(
    master: &Mutex<Box<dyn MasterPty + Send>>,
    window: WindowSize,
) -> Result<(), BridgeError> {
    let master = master.lock().await;
    master
        .resize(pty_size(window))
        .map_err(|e| BridgeError::ResizeFailed(e.to_string()))
}

/// Applies window changes to the pty until the stream ends or `stop` fires.
async fn forward_resizes(
    session_id: SessionId,
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    mut resizes: mpsc::Receiver<WindowSize>,
    stop: CancellationToken,
) {
    loop {
        let window = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            next = resizes.recv() => match next {
                Some(window) => window,
                None => break,
            },
        };

        match resize_master(&master, window).await {
            Ok(()) => tracing::debug!(
                session_id = %session_id,
                rows = window.rows,
                cols = window.cols,
                "Resized PTY"
            ),
            Err(e) => tracing::warn!(session_id = %session_id, error = %e, "Failed to resize PTY"),
        }
    }

    tracing::trace!(session_id = %session_id, "Resize subscription ended");
}

/// A master read failing with EIO means every slave holder has gone away.
fn is_hangup(report: &PumpReport) -> bool {
    match &report.end {
        PumpEnd::Eof => true,
        PumpEnd::Failed(e) => e.raw_os_error() == Some(Errno::EIO as i32),
        PumpEnd::Stopped => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ShellEnd {
    Exited,
    Expired,
    Disconnected,
}

type WaitResult = Result<io::Result<Termination>, tokio::task::JoinError>;
type PtyWriter = Box<dyn Write + Send>;

/// Runs an interactive shell for `parts` on a pty.
///
/// Returns [`BridgeError::ShellStart`] without reporting an exit status when
/// the shell cannot be started.
pub async fn run(
    session_id: &SessionId,
    request: PtyRequest,
    parts: SessionParts,
    shell: &str,
    config: &SessionConfig,
) -> Result<SessionOutcome, BridgeError> {
    let SessionParts {
        reader,
        writer,
        done,
        exit,
        ..
    } = parts;
    let PtyRequest {
        term,
        window,
        resizes,
    } = request;

    let deadline = deadline_after(config.deadline());

    let (handle, streams) = match PtyHandle::spawn(shell, &term, window, &config.env) {
        Ok(spawned) => spawned,
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "Could not start shell");
            return Err(e);
        }
    };

    tracing::info!(
        session_id = %session_id,
        shell = %shell,
        term = %term,
        pid = ?handle.pid(),
        rows = window.rows,
        cols = window.cols,
        "Started shell"
    );

    let group = CancellationToken::new();
    let resize_task = tokio::spawn(forward_resizes(
        session_id.clone(),
        Arc::clone(&handle.master),
        resizes,
        group.child_token(),
    ));
    let (input, output) = start_pumps(&group, reader, writer, streams);

    let mut killer = handle.killer();
    let mut waiter = handle.wait();

    let (ended, status) = tokio::select! {
        biased;
        status = &mut waiter => (ShellEnd::Exited, Some(status)),
        _ = expired(deadline) => (ShellEnd::Expired, None),
        _ = done.cancelled(), if config.on_disconnect == DisconnectPolicy::Terminate => {
            (ShellEnd::Disconnected, None)
        }
    };

    // No report once the connection dropped, even if the shell exited since.
    let disconnected = ended == ShellEnd::Disconnected || done.is_cancelled();

    let status = match status {
        Some(status) => status,
        None => {
            if let Err(e) = killer.kill() {
                tracing::debug!(session_id = %session_id, error = %e, "Failed to signal shell");
            }
            waiter.await
        }
    };

    let writer = drain_output(session_id, output, config).await;
    teardown(&group, input, resize_task).await;

    if disconnected {
        tracing::info!(
            session_id = %session_id,
            reason = ?done.reason(),
            "Connection terminated, shell stopped"
        );
        return Ok(SessionOutcome::Disconnected);
    }

    finish(session_id, ended, status, writer, exit).await
}

fn start_pumps(
    group: &CancellationToken,
    mut reader: BoxedReader,
    mut writer: BoxedWriter,
    streams: PtyStreams,
) -> (
    Pump<(PumpReport, Option<PtyWriter>)>,
    Pump<(PumpReport, BoxedWriter)>,
) {
    let PtyStreams {
        reader: pty_reader,
        writer: pty_writer,
    } = streams;

    let input = Pump::spawn("pty-input", group, |stop| async move {
        bridge::copy_into_blocking("pty-input", &mut reader, pty_writer, &stop).await
    });

    let output = Pump::spawn("pty-output", group, |stop| async move {
        let report = bridge::copy_from_blocking("pty-output", pty_reader, &mut writer, &stop).await;
        (report, writer)
    });

    (input, output)
}

/// Lets the output pump flush what the shell wrote before it exited.
async fn drain_output(
    session_id: &SessionId,
    output: Pump<(PumpReport, BoxedWriter)>,
    config: &SessionConfig,
) -> Option<BoxedWriter> {
    let (report, writer) = output.join_within(config.drain_grace()).await?;

    if is_hangup(&report) {
        tracing::debug!(session_id = %session_id, bytes = report.bytes, "PTY hung up");
    } else if let PumpEnd::Failed(e) = &report.end {
        tracing::debug!(session_id = %session_id, error = %e, "PTY output pump failed");
    }

    Some(writer)
}

/// Stops the remaining tasks once the shell has been reaped.
///
/// The master writer is closed last: dropping it sends a newline and EOF to
/// the terminal, which must never reach a live shell.
async fn teardown(
    group: &CancellationToken,
    input: Pump<(PumpReport, Option<PtyWriter>)>,
    resize_task: JoinHandle<()>,
) {
    group.cancel();
    if let Some((_, writer)) = input.join().await {
        drop(writer);
    }
    if let Err(e) = resize_task.await {
        tracing::warn!(error = %e, "Resize task did not complete");
    }
}

async fn finish(
    session_id: &SessionId,
    ended: ShellEnd,
    status: WaitResult,
    writer: Option<BoxedWriter>,
    exit: Box<dyn ExitReporter>,
) -> Result<SessionOutcome, BridgeError> {
    if ended == ShellEnd::Expired {
        tracing::warn!(session_id = %session_id, "Session deadline exceeded, shell stopped");
        if let Some(mut writer) = writer {
            write_diagnostic(session_id, &mut writer, "session deadline exceeded\n").await;
        }
        return Ok(report_exit(session_id, exit, EXIT_FORCED_TERMINATION));
    }

    let termination = match status {
        Ok(Ok(termination)) => termination,
        Ok(Err(e)) => {
            tracing::error!(session_id = %session_id, error = %e, "Shell session ended with error");
            return Ok(report_exit(session_id, exit, EXIT_RUNTIME_FAILURE));
        }
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "Shell wait task failed");
            return Ok(report_exit(session_id, exit, EXIT_RUNTIME_FAILURE));
        }
    };

    match exit_status::exit_code(termination) {
        Some(code) => Ok(report_exit(session_id, exit, code)),
        None => {
            if let Some(mut writer) = writer {
                write_diagnostic(session_id, &mut writer, UNKNOWN_STATE_NOTICE).await;
            }
            Ok(SessionOutcome::Unreported)
        }
    }
}
