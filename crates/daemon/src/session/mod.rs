//! Session execution.
//!
//! This module bridges one [`Session`](revsh_protocol::Session) to a local
//! process. The dispatcher classifies the session and hands it to the pty
//! runner or the command runner; both use the byte pumps in [`bridge`] and
//! the exit code translation in [`exit_status`].

pub mod bridge;
pub mod command;
pub mod dispatcher;
pub mod exit_status;
pub mod pty;

use std::time::Duration;

use revsh_protocol::{BoxedWriter, ExitReporter};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use uuid::Uuid;

pub use bridge::{Pump, PumpEnd, PumpReport};
pub use dispatcher::{SessionDispatcher, SessionKind};
pub use exit_status::Termination;
pub use pty::PtyHandle;

/// Unique identifier for one dispatched session, used to correlate logs.
pub type SessionId = String;

/// Generates a new session identifier.
pub fn new_session_id() -> SessionId {
    Uuid::new_v4().to_string()
}

/// Errors that escape a session runner.
///
/// Everything else is turned into an exit code inside the runner.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The pty-backed shell could not be started.
    #[error("failed to start shell {shell}: {reason}")]
    ShellStart { shell: String, reason: String },

    /// Failed to resize the pty.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),
}

/// How a dispatched session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// An exit status was reported with this code.
    Exited(i32),
    /// The transport went away first; no exit status was reported.
    Disconnected,
    /// Neither a pty nor a command was requested and the session closed.
    Closed,
    /// The process ended without a usable exit status.
    Unreported,
}

/// Reports `code` through the session's exit reporter.
pub(crate) fn report_exit(
    session_id: &SessionId,
    exit: Box<dyn ExitReporter>,
    code: i32,
) -> SessionOutcome {
    match exit.report(code) {
        Ok(()) => tracing::info!(session_id = %session_id, code, "Reported exit status"),
        Err(e) => tracing::debug!(
            session_id = %session_id,
            code,
            error = %e,
            "Could not report exit status"
        ),
    }
    SessionOutcome::Exited(code)
}

/// Writes a diagnostic line to the session, ignoring a dead channel.
pub(crate) async fn write_diagnostic(
    session_id: &SessionId,
    writer: &mut BoxedWriter,
    message: &str,
) {
    let result = async {
        writer.write_all(message.as_bytes()).await?;
        writer.flush().await
    }
    .await;

    if let Err(e) = result {
        tracing::debug!(session_id = %session_id, error = %e, "Could not write diagnostic");
    }
}

/// Converts an optional session budget into an absolute deadline.
pub(crate) fn deadline_after(budget: Option<Duration>) -> Option<Instant> {
    budget.map(|budget| Instant::now() + budget)
}

/// Completes when `deadline` passes; never completes without one.
pub(crate) async fn expired(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
