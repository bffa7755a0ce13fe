//! # revsh Daemon Library
//!
//! This crate runs authenticated sessions against the local machine. A
//! transport hands over a [`Session`](revsh_protocol::Session); the daemon
//! decides what it needs, runs it, and reports how it ended.
//!
//! ## Overview
//!
//! - **Interactive shells** on a pseudo-terminal, with window-size changes
//! - **One-shot commands** with stdin from the session and merged output
//! - **Exit codes** that distinguish the command's own status from failures
//!   of the bridge itself
//!
//! ## Architecture
//!
//! ```text
//!               ┌────────────────────┐
//!  Session ───▶ │ SessionDispatcher  │
//!               └─────────┬──────────┘
//!           pty ┌─────────┴─────────┐ command
//!               ▼                   ▼
//!        ┌─────────────┐     ┌──────────────┐
//!        │ pty::run    │     │ command::run │
//!        └──────┬──────┘     └──────┬───────┘
//!               └──── bridge ───────┘
//!                       │
//!                 exit_status ──▶ ExitReporter
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, SessionDispatcher};
//! use revsh_protocol::Session;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let dispatcher = SessionDispatcher::new(config.session);
//!
//!     let (exit_tx, exit_rx) = tokio::sync::oneshot::channel();
//!     let session = Session::builder("alice", "local")
//!         .command(vec!["uname".into(), "-a".into()])
//!         .build(tokio::io::stdin(), tokio::io::stdout(), exit_tx);
//!
//!     dispatcher.dispatch(session).await?;
//!     println!("exit status: {}", exit_rx.await?);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`logging`]: Tracing subscriber setup
//! - [`session`]: Dispatching and running sessions
//! - [`stdio`]: Serving a session over the daemon's own stdio

pub mod config;
pub mod logging;
pub mod session;
pub mod stdio;

// Re-export protocol for convenience
pub use revsh_protocol as protocol;

// Re-export config types for convenience
pub use config::{Config, DisconnectPolicy, SessionConfig};

// Re-export session types for convenience
pub use session::{BridgeError, SessionDispatcher, SessionId, SessionKind, SessionOutcome};
