//! Translating a finished process into a session exit code.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Text sent to the remote side when a process ended without a usable status.
pub const UNKNOWN_STATE_NOTICE: &str =
    "process finished without an exit status; this is a bug in revsh, please report it\n";

/// Terminal state of a process as seen by the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The process exited with a code.
    Exited(i32),
    /// The process was terminated by a signal.
    Signaled(i32),
    /// The platform reported neither a code nor a signal.
    Unknown,
}

impl From<std::process::ExitStatus> for Termination {
    fn from(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Termination::Exited(code);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Termination::Signaled(signal);
            }
        }

        Termination::Unknown
    }
}

impl From<WaitStatus> for Termination {
    fn from(status: WaitStatus) -> Self {
        match status {
            WaitStatus::Exited(_, code) => Termination::Exited(code),
            WaitStatus::Signaled(_, signal, _) => Termination::Signaled(signal as i32),
            _ => Termination::Unknown,
        }
    }
}

/// Returns the exit code to report for `termination`.
///
/// Codes are passed through unchanged. A signal death maps to `128 + signal`,
/// as shells do. [`Termination::Unknown`] yields `None`: the caller reports
/// nothing and shows [`UNKNOWN_STATE_NOTICE`] instead.
pub fn exit_code(termination: Termination) -> Option<i32> {
    match termination {
        Termination::Exited(code) => Some(code),
        Termination::Signaled(signal) => {
            let name = Signal::try_from(signal)
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|_| signal.to_string());
            tracing::debug!(signal = %name, "Process terminated by signal");
            Some(128 + signal)
        }
        Termination::Unknown => {
            tracing::error!(
                "Process finished without an exit code or signal; this should not happen, \
                 please report it with the daemon logs"
            );
            None
        }
    }
}
