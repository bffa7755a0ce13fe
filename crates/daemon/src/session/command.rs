//! One-shot command sessions.
//!
//! The command reads the session input through a pipe. Its stdout and stderr
//! share a single pipe back to the session, so their relative order is kept.
//! When the session input ends the command is cancelled; an interactive
//! caller is expected to hold its input open until it wants the command gone.

use std::collections::BTreeMap;
use std::io::{self, PipeReader, PipeWriter};
use std::os::fd::OwnedFd;
use std::process::ExitStatus;

use revsh_protocol::{
    BoxedReader, BoxedWriter, CancelReason, CancelScope, ExitReporter, SessionParts,
    EXIT_FORCED_TERMINATION, EXIT_RUNTIME_FAILURE, EXIT_STDIN_UNAVAILABLE,
};
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::bridge::{self, Pump, PumpEnd, PumpReport};
use super::exit_status::{self, Termination, UNKNOWN_STATE_NOTICE};
use super::{deadline_after, expired, report_exit, write_diagnostic, SessionId, SessionOutcome};
use crate::config::{DisconnectPolicy, SessionConfig};

/// Both ends of the pipe feeding a command's stdin.
pub struct StdinPipe {
    /// Read end, handed to the child.
    child: PipeReader,
    /// Write end, kept by the daemon.
    parent: pipe::Sender,
}

impl StdinPipe {
    /// Opens a new pipe. Must be called from within a tokio runtime.
    pub fn open() -> io::Result<Self> {
        let (child, parent) = io::pipe()?;
        let parent = pipe::Sender::from_owned_fd(OwnedFd::from(parent))?;
        Ok(Self { child, parent })
    }
}

/// Opens the pipe that collects both stdout and stderr.
fn open_output() -> io::Result<(pipe::Receiver, PipeWriter)> {
    let (reader, writer) = io::pipe()?;
    let reader = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))?;
    Ok((reader, writer))
}

/// Spawns `argv` with the given pipes.
///
/// The `Command` is dropped on return, which closes the daemon's copies of
/// the child's pipe ends.
fn spawn_command(
    argv: &[String],
    env: &BTreeMap<String, String>,
    stdin: PipeReader,
    output: PipeWriter,
) -> io::Result<Child> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;
    let stderr = output.try_clone()?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(env)
        .stdin(stdin)
        .stdout(output)
        .stderr(stderr)
        .kill_on_drop(true);

    cmd.spawn()
}

#[derive(Debug)]
enum CommandEnd {
    Completed(io::Result<ExitStatus>),
    Cancelled(CancelReason),
    Disconnected,
}

/// Runs the session's command to completion and reports its exit status.
pub async fn run(
    session_id: &SessionId,
    parts: SessionParts,
    config: &SessionConfig,
) -> SessionOutcome {
    run_with_stdin(session_id, parts, config, StdinPipe::open()).await
}

async fn run_with_stdin(
    session_id: &SessionId,
    parts: SessionParts,
    config: &SessionConfig,
    stdin: io::Result<StdinPipe>,
) -> SessionOutcome {
    let SessionParts {
        command,
        raw_command,
        reader,
        mut writer,
        done,
        exit,
        ..
    } = parts;

    let deadline = deadline_after(config.deadline());

    let StdinPipe {
        child: child_stdin,
        parent: stdin_tx,
    } = match stdin {
        Ok(pipe) => pipe,
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "Could not open stdin pipe");
            return report_exit(session_id, exit, EXIT_STDIN_UNAVAILABLE);
        }
    };

    let spawned = open_output().and_then(|(output, output_tx)| {
        let child = spawn_command(&command, &config.env, child_stdin, output_tx)?;
        Ok((child, output))
    });

    let (mut child, output) = match spawned {
        Ok(spawned) => spawned,
        Err(e) => {
            tracing::error!(
                session_id = %session_id,
                command = %raw_command,
                error = %e,
                "Command execution failed"
            );
            let message = format!("command execution failed: {}\n", e);
            write_diagnostic(session_id, &mut writer, &message).await;
            return report_exit(session_id, exit, EXIT_RUNTIME_FAILURE);
        }
    };

    tracing::info!(
        session_id = %session_id,
        command = %raw_command,
        pid = ?child.id(),
        "Executing command"
    );

    let exec = CancelScope::new();
    let group = CancellationToken::new();
    let input = spawn_input_pump(&group, reader, stdin_tx, exec.clone());
    let output = Pump::spawn("command-output", &group, |stop| async move {
        let mut output = output;
        let report = bridge::copy("command-output", &mut output, &mut writer, &stop).await;
        (report, writer)
    });

    let ended = tokio::select! {
        biased;
        status = child.wait() => CommandEnd::Completed(status),
        reason = cancelled_or_expired(&exec, deadline) => CommandEnd::Cancelled(reason),
        _ = done.cancelled() => CommandEnd::Disconnected,
    };

    let outcome = match ended {
        CommandEnd::Completed(status) => {
            let writer = drain_output(session_id, output, config).await;
            complete(session_id, status, writer, exit).await
        }
        CommandEnd::Cancelled(reason) => {
            tracing::warn!(session_id = %session_id, reason = %reason, "Command cancelled");
            stop_process(session_id, &mut child).await;

            if let Some(mut writer) = drain_output(session_id, output, config).await {
                let message = format!("command execution failed: {}\n", reason);
                write_diagnostic(session_id, &mut writer, &message).await;
            }
            report_exit(session_id, exit, EXIT_FORCED_TERMINATION)
        }
        CommandEnd::Disconnected => {
            tracing::info!(
                session_id = %session_id,
                reason = ?done.reason(),
                policy = ?config.on_disconnect,
                "Connection terminated"
            );
            match config.on_disconnect {
                DisconnectPolicy::Terminate => stop_process(session_id, &mut child).await,
                DisconnectPolicy::Wait => wait_detached(session_id, &mut child, deadline).await,
            }
            drain_output(session_id, output, config).await;
            SessionOutcome::Disconnected
        }
    };

    group.cancel();
    input.join().await;

    outcome
}

/// Feeds the session input to the command and cancels `exec` when it ends.
fn spawn_input_pump(
    group: &CancellationToken,
    mut reader: BoxedReader,
    stdin: pipe::Sender,
    exec: CancelScope,
) -> Pump<PumpReport> {
    Pump::spawn("command-input", group, |stop| async move {
        let mut stdin = stdin;
        let report = bridge::copy("command-input", &mut reader, &mut stdin, &stop).await;
        drop(stdin);

        if let Some(reason) = input_cancel_reason(&report.end) {
            exec.cancel(reason);
        }
        report
    })
}

/// A broken pipe means the command closed its own stdin, not that the
/// session input ended.
fn input_cancel_reason(end: &PumpEnd) -> Option<CancelReason> {
    match end {
        PumpEnd::Failed(e) if e.kind() == io::ErrorKind::BrokenPipe => None,
        other => other.input_reason(),
    }
}

/// Completes when `exec` is cancelled or the deadline passes.
async fn cancelled_or_expired(exec: &CancelScope, deadline: Option<Instant>) -> CancelReason {
    tokio::select! {
        biased;
        _ = exec.cancelled() => {}
        _ = expired(deadline) => {
            exec.cancel(CancelReason::DeadlineExceeded);
        }
    }
    exec.reason().unwrap_or(CancelReason::DeadlineExceeded)
}

/// Kills the command and reaps it.
async fn stop_process(session_id: &SessionId, child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::debug!(session_id = %session_id, error = %e, "Failed to signal command");
    }
    match child.wait().await {
        Ok(status) => tracing::debug!(session_id = %session_id, status = %status, "Command reaped"),
        Err(e) => tracing::warn!(session_id = %session_id, error = %e, "Failed to reap command"),
    }
}

/// Waits for a command whose connection is gone. Only the deadline stops it.
async fn wait_detached(session_id: &SessionId, child: &mut Child, deadline: Option<Instant>) {
    let finished = tokio::select! {
        biased;
        status = child.wait() => Some(status),
        _ = expired(deadline) => None,
    };

    match finished {
        Some(status) => tracing::info!(
            session_id = %session_id,
            status = ?status,
            "Command finished after disconnect"
        ),
        None => {
            tracing::warn!(session_id = %session_id, "Session deadline exceeded, stopping command");
            stop_process(session_id, child).await;
        }
    }
}

async fn drain_output(
    session_id: &SessionId,
    output: Pump<(PumpReport, BoxedWriter)>,
    config: &SessionConfig,
) -> Option<BoxedWriter> {
    let (report, writer) = output.join_within(config.drain_grace()).await?;
    tracing::debug!(session_id = %session_id, bytes = report.bytes, "Command output drained");
    Some(writer)
}

async fn complete(
    session_id: &SessionId,
    status: io::Result<ExitStatus>,
    writer: Option<BoxedWriter>,
    exit: Box<dyn ExitReporter>,
) -> SessionOutcome {
    let status = match status {
        Ok(status) => status,
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "Waiting for command failed");
            if let Some(mut writer) = writer {
                let message = format!("command execution failed: {}\n", e);
                write_diagnostic(session_id, &mut writer, &message).await;
            }
            return report_exit(session_id, exit, EXIT_RUNTIME_FAILURE);
        }
    };

    match exit_status::exit_code(Termination::from(status)) {
        Some(code) => report_exit(session_id, exit, code),
        None => {
            if let Some(mut writer) = writer {
                write_diagnostic(session_id, &mut writer, UNKNOWN_STATE_NOTICE).await;
            }
            SessionOutcome::Unreported
        }
    }
}
