//! Local transport: one session over the daemon's own stdin and stdout.
//!
//! Used by `revshd run`. The local terminal stands in for the remote client:
//! in pty mode it is switched to raw mode and its window changes are
//! forwarded, and `SIGTERM`/`SIGHUP` play the part of a dropped connection.

use std::io::{self, IsTerminal};

use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use revsh_protocol::{CancelReason, CancelScope, PtyRequest, Session, WindowSize};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};

use crate::session::{BridgeError, SessionDispatcher, SessionOutcome};

/// What `revshd run` was asked to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRequest {
    /// Allocate a pty and start the shell.
    pub pty: bool,
    /// Terminal type for the pty.
    pub term: String,
    /// Command to run when no pty is requested.
    pub command: Vec<String>,
}

/// Restores cooked mode when dropped.
struct RawModeGuard;

impl RawModeGuard {
    /// Enables raw mode if stdin is a terminal.
    fn enable() -> io::Result<Option<Self>> {
        if !io::stdin().is_terminal() {
            return Ok(None);
        }
        enable_raw_mode()?;
        Ok(Some(Self))
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Returns the local terminal size, or the default when there is none.
fn local_window() -> WindowSize {
    match crossterm::terminal::size() {
        Ok((cols, rows)) => WindowSize::new(rows, cols),
        Err(_) => WindowSize::default(),
    }
}

/// The process exit code for a finished local session.
pub fn process_exit_code(result: &Result<SessionOutcome, BridgeError>) -> i32 {
    match result {
        Ok(SessionOutcome::Exited(code)) => *code,
        Ok(SessionOutcome::Closed) => 0,
        Ok(SessionOutcome::Disconnected) | Ok(SessionOutcome::Unreported) => 255,
        Err(_) => 1,
    }
}

/// Cancels `done` when the daemon is told to hang up.
async fn watch_hangup(done: CancelScope) -> io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;

    let name = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sighup.recv() => "SIGHUP",
        _ = done.cancelled() => return Ok(()),
    };

    tracing::info!(signal = name, "Received signal, closing session");
    done.cancel(CancelReason::Disconnected(format!("received {}", name)));
    Ok(())
}

/// Sends the local window size every time it changes.
async fn forward_window_changes(resizes: mpsc::Sender<WindowSize>) -> io::Result<()> {
    let mut sigwinch = signal(SignalKind::window_change())?;

    while sigwinch.recv().await.is_some() {
        let window = local_window();
        tracing::trace!(rows = window.rows, cols = window.cols, "Local window changed");
        if resizes.send(window).await.is_err() {
            break;
        }
    }
    Ok(())
}

/// Builds the session for `request` on top of stdin and stdout.
fn local_session(
    request: &RunRequest,
    done: CancelScope,
) -> (Session, oneshot::Receiver<i32>, Option<mpsc::Sender<WindowSize>>) {
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    let mut builder = Session::builder(user, "local")
        .command(request.command.clone())
        .done(done);

    let mut resizes = None;
    if request.pty {
        let (pty, tx) = PtyRequest::new(request.term.clone(), local_window());
        builder = builder.pty(pty);
        resizes = Some(tx);
    }

    let (exit_tx, exit_rx) = oneshot::channel();
    let session = builder.build(tokio::io::stdin(), tokio::io::stdout(), exit_tx);
    (session, exit_rx, resizes)
}

/// Serves one session over stdio.
///
/// See [`process_exit_code`] for turning the result into an exit code.
pub async fn serve(
    dispatcher: &SessionDispatcher,
    request: RunRequest,
) -> Result<SessionOutcome, BridgeError> {
    let done = CancelScope::new();
    let (session, exit_rx, resizes) = local_session(&request, done.clone());

    let hangup = tokio::spawn(watch_hangup(done.clone()));
    let window_task = resizes.map(|tx| tokio::spawn(forward_window_changes(tx)));

    let raw_mode = if request.pty {
        match RawModeGuard::enable() {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!(error = %e, "Could not switch terminal to raw mode");
                None
            }
        }
    } else {
        None
    };

    let result = dispatcher.dispatch(session).await;
    drop(raw_mode);

    hangup.abort();
    if let Some(task) = window_task {
        task.abort();
    }

    if let Ok(code) = exit_rx.await {
        tracing::debug!(code, "Session exit status received");
    }

    result
}
