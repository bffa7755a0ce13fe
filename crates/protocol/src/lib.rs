//! # revsh Protocol Library
//!
//! This crate defines the contract between a transport (an SSH server, a
//! reverse tunnel, or the local stdio transport) and the revsh execution
//! bridge.
//!
//! ## Overview
//!
//! A transport authenticates a peer, multiplexes its channel, and then hands
//! the bridge one [`Session`] per channel. The session carries:
//!
//! - **Identity**: the authenticated user and the remote address
//! - **Request**: an optional [`PtyRequest`] and an optional command argv
//! - **Streams**: a byte reader and writer bound to the channel
//! - **Lifetime**: a [`CancelScope`] that fires when the channel goes away
//! - **Exit**: an [`ExitReporter`] used at most once to send the exit status
//!
//! ## Example Usage
//!
//! ```rust
//! use revsh_protocol::{CancelReason, Session};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (_client, server) = tokio::io::duplex(4096);
//! let (reader, writer) = tokio::io::split(server);
//! let (exit_tx, _exit_rx) = tokio::sync::oneshot::channel();
//!
//! let session = Session::builder("alice", "10.0.0.7:50022")
//!     .command(vec!["uname".into(), "-a".into()])
//!     .build(reader, writer, exit_tx);
//!
//! assert_eq!(session.raw_command(), "uname -a");
//! session.done().cancel(CancelReason::Disconnected("peer reset".into()));
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`session`]: the session handed to the bridge
//! - [`context`]: cancellation scopes with a recorded reason
//! - [`exit`]: exit reporting and the bridge's reserved exit codes
//! - [`error`]: error types

pub mod context;
pub mod error;
pub mod exit;
pub mod session;

pub use context::{CancelReason, CancelScope};
pub use error::{ChannelError, Result};
pub use exit::{
    ExitReporter, EXIT_FORCED_TERMINATION, EXIT_RUNTIME_FAILURE, EXIT_STDIN_UNAVAILABLE,
};
pub use session::{
    BoxedReader, BoxedWriter, PtyRequest, Session, SessionBuilder, SessionParts, WindowSize,
};
