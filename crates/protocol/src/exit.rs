//! Exit status reporting.
//!
//! The bridge reports a process outcome to the remote side exactly once, or
//! not at all when the channel is already gone. [`ExitReporter::report`]
//! consumes the reporter, so a second report cannot be expressed.

use tokio::sync::oneshot;

use crate::error::{ChannelError, Result};

/// The process input pipe could not be set up; nothing was spawned.
pub const EXIT_STDIN_UNAVAILABLE: i32 = 1;

/// The process was stopped because its input ended or a deadline expired.
pub const EXIT_FORCED_TERMINATION: i32 = 254;

/// The process could not be started or its wait failed.
pub const EXIT_RUNTIME_FAILURE: i32 = 255;

/// Delivers the exit status of a session to the remote side.
pub trait ExitReporter: Send {
    /// Sends `code` as the session's exit status.
    ///
    /// Returns [`ChannelError::Closed`] if the channel is already gone.
    fn report(self: Box<Self>, code: i32) -> Result<()>;
}

impl ExitReporter for oneshot::Sender<i32> {
    fn report(self: Box<Self>, code: i32) -> Result<()> {
        (*self).send(code).map_err(|_| ChannelError::Closed)
    }
}
