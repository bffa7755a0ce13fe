//! The session handed from a transport to the execution bridge.

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::context::CancelScope;
use crate::exit::ExitReporter;

/// Byte stream carrying remote input.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Byte stream carrying output back to the remote side.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl WindowSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

impl Default for WindowSize {
    fn default() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

/// A pseudo-terminal request negotiated by the transport.
#[derive(Debug)]
pub struct PtyRequest {
    /// Terminal type, exported to the shell as `TERM`.
    pub term: String,
    /// Initial window size.
    pub window: WindowSize,
    /// Window changes sent by the remote side for the life of the session.
    pub resizes: mpsc::Receiver<WindowSize>,
}

impl PtyRequest {
    /// Creates a request and the sender the transport uses for window changes.
    pub fn new(term: impl Into<String>, window: WindowSize) -> (Self, mpsc::Sender<WindowSize>) {
        let (tx, rx) = mpsc::channel(16);
        let request = Self {
            term: term.into(),
            window,
            resizes: rx,
        };
        (request, tx)
    }
}

/// One authenticated request to run a shell or a command.
pub struct Session {
    user: String,
    remote_addr: String,
    pty: Option<PtyRequest>,
    command: Vec<String>,
    raw_command: String,
    reader: BoxedReader,
    writer: BoxedWriter,
    done: CancelScope,
    exit: Box<dyn ExitReporter>,
}

/// A session taken apart so its pieces can move into separate tasks.
pub struct SessionParts {
    pub user: String,
    pub remote_addr: String,
    pub pty: Option<PtyRequest>,
    pub command: Vec<String>,
    pub raw_command: String,
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub done: CancelScope,
    pub exit: Box<dyn ExitReporter>,
}

impl Session {
    /// Starts building a session for `user` connecting from `remote_addr`.
    pub fn builder(user: impl Into<String>, remote_addr: impl Into<String>) -> SessionBuilder {
        SessionBuilder {
            user: user.into(),
            remote_addr: remote_addr.into(),
            pty: None,
            command: Vec::new(),
            raw_command: None,
            done: None,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Returns the negotiated terminal type and initial size, if a pty was requested.
    pub fn pty_request(&self) -> Option<(&str, WindowSize)> {
        self.pty.as_ref().map(|pty| (pty.term.as_str(), pty.window))
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// The command line as the client sent it, for diagnostics.
    pub fn raw_command(&self) -> &str {
        &self.raw_command
    }

    /// The scope cancelled by the transport when the channel goes away.
    pub fn done(&self) -> &CancelScope {
        &self.done
    }

    pub fn into_parts(self) -> SessionParts {
        SessionParts {
            user: self.user,
            remote_addr: self.remote_addr,
            pty: self.pty,
            command: self.command,
            raw_command: self.raw_command,
            reader: self.reader,
            writer: self.writer,
            done: self.done,
            exit: self.exit,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user", &self.user)
            .field("remote_addr", &self.remote_addr)
            .field("pty", &self.pty_request())
            .field("command", &self.command)
            .field("done", &self.done.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Builder for [`Session`].
#[derive(Debug)]
pub struct SessionBuilder {
    user: String,
    remote_addr: String,
    pty: Option<PtyRequest>,
    command: Vec<String>,
    raw_command: Option<String>,
    done: Option<CancelScope>,
}

impl SessionBuilder {
    pub fn pty(mut self, request: PtyRequest) -> Self {
        self.pty = Some(request);
        self
    }

    pub fn command(mut self, argv: Vec<String>) -> Self {
        self.command = argv;
        self
    }

    /// Overrides the raw command line. Defaults to the argv joined by spaces.
    pub fn raw_command(mut self, raw: impl Into<String>) -> Self {
        self.raw_command = Some(raw.into());
        self
    }

    /// Uses `scope` as the session's done signal instead of a fresh one.
    pub fn done(mut self, scope: CancelScope) -> Self {
        self.done = Some(scope);
        self
    }

    pub fn build<R, W, E>(self, reader: R, writer: W, exit: E) -> Session
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
        E: ExitReporter + 'static,
    {
        let raw_command = self
            .raw_command
            .unwrap_or_else(|| self.command.join(" "));

        Session {
            user: self.user,
            remote_addr: self.remote_addr,
            pty: self.pty,
            command: self.command,
            raw_command,
            reader: Box::new(reader),
            writer: Box::new(writer),
            done: self.done.unwrap_or_default(),
            exit: Box::new(exit),
        }
    }
}
