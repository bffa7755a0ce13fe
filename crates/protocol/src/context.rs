//! Cancellation scopes.
//!
//! A [`CancelScope`] is a cancellation token that remembers why it was
//! cancelled. Sessions expose one so the bridge can tell a dropped connection
//! apart from other teardown causes, and the bridge creates its own scopes to
//! stop a running command.

use std::fmt;
use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

/// Why a scope was cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// The transport lost or closed the channel.
    Disconnected(String),
    /// The input stream reached EOF.
    InputClosed,
    /// Reading the input stream failed.
    InputFailed(String),
    /// A configured deadline expired.
    DeadlineExceeded,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Disconnected(detail) => write!(f, "connection closed: {}", detail),
            CancelReason::InputClosed => f.write_str("input stream closed"),
            CancelReason::InputFailed(detail) => write!(f, "input stream failed: {}", detail),
            CancelReason::DeadlineExceeded => f.write_str("deadline exceeded"),
        }
    }
}

/// A cancellation token paired with the reason it fired.
///
/// The first reason recorded wins; later calls to [`CancelScope::cancel`]
/// still cancel but leave the reason untouched.
#[derive(Debug, Clone, Default)]
pub struct CancelScope {
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl CancelScope {
    /// Creates a fresh, uncancelled scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the scope.
    ///
    /// Returns `true` if this call recorded the reason.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let recorded = self.reason.set(reason).is_ok();
        self.token.cancel();
        recorded
    }

    /// Returns whether the scope has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Waits until the scope is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Returns the recorded reason, if the scope was cancelled with one.
    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().cloned()
    }
}
