//! Routing a session to the runner that serves it.

use revsh_protocol::Session;

use super::{command, new_session_id, pty, BridgeError, SessionOutcome};
use crate::config::SessionConfig;

/// What a session asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// An interactive shell on a pseudo-terminal.
    Pty,
    /// A one-shot command without a terminal.
    Command,
    /// Neither; the session only stays open until the client leaves.
    Idle,
}

impl SessionKind {
    /// Classifies `session`. A pty request wins over a command.
    pub fn of(session: &Session) -> Self {
        if session.pty_request().is_some() {
            SessionKind::Pty
        } else if !session.command().is_empty() {
            SessionKind::Command
        } else {
            SessionKind::Idle
        }
    }
}

/// Entry point for every authenticated session.
#[derive(Debug, Clone)]
pub struct SessionDispatcher {
    config: SessionConfig,
}

impl SessionDispatcher {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    pub fn classify(&self, session: &Session) -> SessionKind {
        SessionKind::of(session)
    }

    /// Serves `session` until it ends.
    ///
    /// Only a shell that cannot be started is returned as an error; every
    /// other failure is reported to the client as an exit code.
    pub async fn dispatch(&self, session: Session) -> Result<SessionOutcome, BridgeError> {
        let session_id = new_session_id();
        let kind = self.classify(&session);

        tracing::info!(
            session_id = %session_id,
            user = %session.user(),
            remote = %session.remote_addr(),
            kind = ?kind,
            "New session"
        );

        let mut parts = session.into_parts();
        match parts.pty.take() {
            Some(request) => {
                pty::run(&session_id, request, parts, &self.config.shell, &self.config).await
            }
            None if !parts.command.is_empty() => {
                Ok(command::run(&session_id, parts, &self.config).await)
            }
            None => {
                parts.done.cancelled().await;
                tracing::info!(session_id = %session_id, "Idle session closed");
                Ok(SessionOutcome::Closed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revsh_protocol::{CancelReason, CancelScope, PtyRequest, WindowSize};
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn builder() -> revsh_protocol::SessionBuilder {
        Session::builder("tester", "127.0.0.1:2222")
    }

    fn build(builder: revsh_protocol::SessionBuilder) -> (Session, oneshot::Receiver<i32>) {
        let (exit_tx, exit_rx) = oneshot::channel();
        let session = builder.build(tokio::io::empty(), tokio::io::sink(), exit_tx);
        (session, exit_rx)
    }

    #[test]
    fn test_classify() {
        let (request, _resizes) = PtyRequest::new("xterm", WindowSize::default());
        let (pty, _) = build(builder().pty(request).command(vec!["ls".into()]));
        assert_eq!(SessionKind::of(&pty), SessionKind::Pty);

        let (command, _) = build(builder().command(vec!["ls".into(), "-l".into()]));
        assert_eq!(SessionKind::of(&command), SessionKind::Command);

        let (idle, _) = build(builder());
        assert_eq!(SessionKind::of(&idle), SessionKind::Idle);
    }

    #[tokio::test]
    async fn test_idle_session_waits_for_done() {
        let done = CancelScope::new();
        let (session, mut exit_rx) = build(builder().done(done.clone()));
        let dispatcher = SessionDispatcher::new(SessionConfig::default());

        let task = tokio::spawn(async move { dispatcher.dispatch(session).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        done.cancel(CancelReason::Disconnected("client left".into()));
        let outcome = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("idle session should end with its connection")
            .unwrap()
            .unwrap();

        assert_eq!(outcome, SessionOutcome::Closed);
        assert!(exit_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_shell_is_an_error() {
        let mut config = SessionConfig::default();
        config.shell = "/nonexistent/shell".to_string();
        let dispatcher = SessionDispatcher::new(config);

        let (request, _resizes) = PtyRequest::new("xterm", WindowSize::default());
        let (session, mut exit_rx) = build(builder().pty(request));

        let result = dispatcher.dispatch(session).await;

        assert!(matches!(result, Err(BridgeError::ShellStart { .. })));
        assert!(exit_rx.try_recv().is_err());
    }
}
