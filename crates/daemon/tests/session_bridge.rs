//! Integration tests for the session bridge.
//!
//! These tests drive real processes through the dispatcher:
//! - Command sessions and their exit codes
//! - Cancellation by input end, deadline and disconnect
//! - Interactive shells on a pty

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use daemon::config::{DisconnectPolicy, SessionConfig};
use daemon::session::{BridgeError, SessionDispatcher, SessionOutcome};
use revsh_protocol::{CancelReason, CancelScope, PtyRequest, Session, WindowSize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const BUFFER: usize = 64 * 1024;
const LIMIT: Duration = Duration::from_secs(10);

type SessionTask = JoinHandle<Result<SessionOutcome, BridgeError>>;

/// The client side of a session under test.
struct Client {
    /// Remote input; dropping it closes the session input.
    input: Option<DuplexStream>,
    /// Everything the session wrote back.
    output: DuplexStream,
    exit: oneshot::Receiver<i32>,
    done: CancelScope,
    resizes: Option<mpsc::Sender<WindowSize>>,
}

impl Client {
    async fn send(&mut self, text: &str) {
        let input = self.input.as_mut().expect("input already closed");
        input.write_all(text.as_bytes()).await.unwrap();
        input.flush().await.unwrap();
    }

    fn close_input(&mut self) {
        self.input = None;
    }

    /// Reads output until `needle` shows up.
    async fn read_until(&mut self, needle: &str) -> String {
        let mut seen = Vec::new();
        let mut buffer = [0u8; 1024];
        let deadline = Instant::now() + LIMIT;

        while !String::from_utf8_lossy(&seen).contains(needle) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.output.read(&mut buffer)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => seen.extend_from_slice(&buffer[..n]),
                Ok(Err(e)) => panic!("reading session output failed: {}", e),
                Err(_) => break,
            }
        }

        let text = String::from_utf8_lossy(&seen).into_owned();
        assert!(text.contains(needle), "expected {:?} in output {:?}", needle, text);
        text
    }

    /// Reads the rest of the output after the session has ended.
    async fn read_rest(&mut self) -> String {
        let mut output = String::new();
        tokio::time::timeout(LIMIT, self.output.read_to_string(&mut output))
            .await
            .expect("session output should close")
            .unwrap();
        output
    }
}

fn start(
    builder: revsh_protocol::SessionBuilder,
    config: SessionConfig,
    resizes: Option<mpsc::Sender<WindowSize>>,
) -> (SessionTask, Client) {
    let (input, session_input) = tokio::io::duplex(BUFFER);
    let (session_output, output) = tokio::io::duplex(BUFFER);
    let (exit_tx, exit) = oneshot::channel();
    let done = CancelScope::new();

    let session: Session = builder
        .done(done.clone())
        .build(session_input, session_output, exit_tx);
    let dispatcher = SessionDispatcher::new(config);
    let task = tokio::spawn(async move { dispatcher.dispatch(session).await });

    let client = Client {
        input: Some(input),
        output,
        exit,
        done,
        resizes,
    };
    (task, client)
}

fn start_command(args: &[&str], config: SessionConfig) -> (SessionTask, Client) {
    let argv = args.iter().map(|s| s.to_string()).collect();
    start(
        Session::builder("tester", "127.0.0.1:50022").command(argv),
        config,
        None,
    )
}

fn start_shell(config: SessionConfig) -> (SessionTask, Client) {
    let (request, resizes) = PtyRequest::new("xterm", WindowSize::new(24, 80));
    start(
        Session::builder("tester", "127.0.0.1:50022").pty(request),
        config,
        Some(resizes),
    )
}

fn sh_config() -> SessionConfig {
    SessionConfig {
        shell: "/bin/sh".to_string(),
        ..SessionConfig::default()
    }
}

/// Session input whose transport fails on the first read.
struct ResetInput;

impl AsyncRead for ResetInput {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "connection reset",
        )))
    }
}

async fn finish(task: SessionTask) -> Result<SessionOutcome, BridgeError> {
    tokio::time::timeout(LIMIT, task)
        .await
        .expect("session should finish")
        .expect("session task panicked")
}

// =============================================================================
// Command Session Tests
// =============================================================================

#[tokio::test]
async fn test_command_exit_code_is_reported() {
    let (task, mut client) = start_command(&["false"], sh_config());

    let outcome = finish(task).await.unwrap();

    assert_eq!(outcome, SessionOutcome::Exited(1));
    assert_eq!(client.exit.try_recv().unwrap(), 1);
}

#[tokio::test]
async fn test_command_custom_exit_code() {
    let (task, mut client) = start_command(&["sh", "-c", "exit 7"], sh_config());

    assert_eq!(finish(task).await.unwrap(), SessionOutcome::Exited(7));
    assert_eq!(client.exit.try_recv().unwrap(), 7);
}

#[tokio::test]
async fn test_command_stdout_and_stderr_reach_session() {
    let (task, mut client) =
        start_command(&["sh", "-c", "echo out; echo err >&2"], sh_config());

    assert_eq!(finish(task).await.unwrap(), SessionOutcome::Exited(0));

    let output = client.read_rest().await;
    assert_eq!(output, "out\nerr\n");
}

#[tokio::test]
async fn test_command_reads_session_input() {
    let (task, mut client) = start_command(&["head", "-n", "1"], sh_config());

    client.send("hello\n").await;

    assert_eq!(finish(task).await.unwrap(), SessionOutcome::Exited(0));
    assert_eq!(client.exit.try_recv().unwrap(), 0);
    assert_eq!(client.read_rest().await, "hello\n");
}

#[tokio::test]
async fn test_input_close_forces_termination() {
    let (task, mut client) = start_command(&["sleep", "100"], sh_config());
    let started = Instant::now();

    client.close_input();

    assert_eq!(finish(task).await.unwrap(), SessionOutcome::Exited(254));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(client.exit.try_recv().unwrap(), 254);
    assert_eq!(
        client.read_rest().await,
        "command execution failed: input stream closed\n"
    );
}

#[tokio::test]
async fn test_input_failure_forces_termination() {
    let (session_output, mut output) = tokio::io::duplex(BUFFER);
    let (exit_tx, mut exit) = oneshot::channel();
    let session = Session::builder("tester", "127.0.0.1:50022")
        .command(vec!["sleep".into(), "100".into()])
        .build(ResetInput, session_output, exit_tx);
    let dispatcher = SessionDispatcher::new(sh_config());
    let task = tokio::spawn(async move { dispatcher.dispatch(session).await });

    assert_eq!(finish(task).await.unwrap(), SessionOutcome::Exited(254));
    assert_eq!(exit.try_recv().unwrap(), 254);

    let mut text = String::new();
    output.read_to_string(&mut text).await.unwrap();
    assert_eq!(
        text,
        "command execution failed: input stream failed: connection reset\n"
    );
}

#[tokio::test]
async fn test_command_killed_by_signal() {
    let (task, mut client) = start_command(&["sh", "-c", "kill -9 $$"], sh_config());

    assert_eq!(finish(task).await.unwrap(), SessionOutcome::Exited(137));
    assert_eq!(client.exit.try_recv().unwrap(), 137);
}

#[tokio::test]
async fn test_missing_executable_is_runtime_failure() {
    let (task, mut client) = start_command(&["/does/not/exist"], sh_config());

    assert_eq!(finish(task).await.unwrap(), SessionOutcome::Exited(255));
    assert_eq!(client.exit.try_recv().unwrap(), 255);

    let output = client.read_rest().await;
    assert!(
        output.starts_with("command execution failed:"),
        "unexpected output {:?}",
        output
    );
}

#[tokio::test]
async fn test_deadline_forces_termination() {
    let config = SessionConfig {
        deadline_secs: Some(1),
        ..sh_config()
    };
    let (task, mut client) = start_command(&["sleep", "100"], config);
    let started = Instant::now();

    assert_eq!(finish(task).await.unwrap(), SessionOutcome::Exited(254));
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(
        client.read_rest().await,
        "command execution failed: deadline exceeded\n"
    );
}

#[tokio::test]
async fn test_disconnect_reports_nothing() {
    let (task, mut client) = start_command(&["sleep", "100"], sh_config());

    tokio::time::sleep(Duration::from_millis(100)).await;
    client
        .done
        .cancel(CancelReason::Disconnected("client went away".into()));

    assert_eq!(finish(task).await.unwrap(), SessionOutcome::Disconnected);
    assert!(client.exit.try_recv().is_err());
}

#[tokio::test]
async fn test_disconnect_with_wait_policy_lets_command_finish() {
    let config = SessionConfig {
        on_disconnect: DisconnectPolicy::Wait,
        ..sh_config()
    };
    let (task, mut client) = start_command(&["sh", "-c", "sleep 0.5; exit 3"], config);
    let started = Instant::now();

    client
        .done
        .cancel(CancelReason::Disconnected("client went away".into()));

    assert_eq!(finish(task).await.unwrap(), SessionOutcome::Disconnected);
    assert!(started.elapsed() >= Duration::from_millis(400));
    assert!(client.exit.try_recv().is_err());
}

// =============================================================================
// Idle Session Tests
// =============================================================================

#[tokio::test]
async fn test_idle_session_closes_with_connection() {
    let (task, mut client) = start(
        Session::builder("tester", "127.0.0.1:50022"),
        sh_config(),
        None,
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());

    client.done.cancel(CancelReason::Disconnected("eof".into()));

    assert_eq!(finish(task).await.unwrap(), SessionOutcome::Closed);
    assert!(client.exit.try_recv().is_err());
}

// =============================================================================
// PTY Session Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pty_runs_shell_input() {
    let (task, mut client) = start_shell(sh_config());

    client.send("echo marker_$((40+2))\n").await;
    client.read_until("marker_42").await;
    assert!(!task.is_finished());

    client.send("exit\n").await;
    assert_eq!(finish(task).await.unwrap(), SessionOutcome::Exited(0));
    assert_eq!(client.exit.try_recv().unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pty_exit_code() {
    let (task, mut client) = start_shell(sh_config());

    client.send("exit 3\n").await;

    assert_eq!(finish(task).await.unwrap(), SessionOutcome::Exited(3));
    assert_eq!(client.exit.try_recv().unwrap(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pty_killed_by_signal() {
    let (task, mut client) = start_shell(sh_config());

    client.send("kill -9 $$\n").await;

    assert_eq!(finish(task).await.unwrap(), SessionOutcome::Exited(137));
    assert_eq!(client.exit.try_recv().unwrap(), 137);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pty_shell_outlives_input_close() {
    let (task, mut client) = start_shell(sh_config());

    client.send("echo hi_$((3+4))\n").await;
    client.read_until("hi_7").await;

    client.close_input();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!task.is_finished(), "shell ended when its input closed");
    assert!(client.exit.try_recv().is_err());

    client
        .done
        .cancel(CancelReason::Disconnected("client went away".into()));
    assert_eq!(finish(task).await.unwrap(), SessionOutcome::Disconnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pty_window_change() {
    let (task, mut client) = start_shell(sh_config());

    client
        .resizes
        .as_ref()
        .unwrap()
        .send(WindowSize::new(40, 100))
        .await
        .unwrap();

    // The resize is applied asynchronously; ask until the shell sees it.
    let mut seen = false;
    for _ in 0..20 {
        client.send("stty size\n").await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut buffer = [0u8; 4096];
        if let Ok(Ok(n)) =
            tokio::time::timeout(Duration::from_millis(200), client.output.read(&mut buffer)).await
        {
            if String::from_utf8_lossy(&buffer[..n]).contains("40 100") {
                seen = true;
                break;
            }
        }
    }
    assert!(seen, "shell never reported the new window size");

    client.send("exit\n").await;
    assert_eq!(finish(task).await.unwrap(), SessionOutcome::Exited(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pty_environment() {
    let mut config = sh_config();
    config
        .env
        .insert("REVSH_MARK".to_string(), "configured".to_string());
    let (task, mut client) = start_shell(config);

    client.send("echo ${REVSH_MARK}_$TERM\n").await;
    client.read_until("configured_xterm").await;

    client.send("exit\n").await;
    assert_eq!(finish(task).await.unwrap(), SessionOutcome::Exited(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pty_disconnect_stops_shell() {
    let (task, mut client) = start_shell(sh_config());

    client.send("echo ready_$((1+1))\n").await;
    client.read_until("ready_2").await;

    client
        .done
        .cancel(CancelReason::Disconnected("client went away".into()));

    assert_eq!(finish(task).await.unwrap(), SessionOutcome::Disconnected);
    assert!(client.exit.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pty_exit_survives_disconnect_during_drain() {
    let config = SessionConfig {
        drain_grace_ms: 3000,
        ..sh_config()
    };
    let (task, mut client) = start_shell(config);

    // The background sleep keeps the pty open, so output drains for the
    // whole grace period after the shell has exited.
    client.send("(sleep 5 &); exit 5\n").await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    client
        .done
        .cancel(CancelReason::Disconnected("client went away".into()));

    assert_eq!(finish(task).await.unwrap(), SessionOutcome::Exited(5));
    assert_eq!(client.exit.try_recv().unwrap(), 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pty_deadline_forces_termination() {
    let config = SessionConfig {
        deadline_secs: Some(1),
        ..sh_config()
    };
    let (task, mut client) = start_shell(config);

    assert_eq!(finish(task).await.unwrap(), SessionOutcome::Exited(254));
    assert_eq!(client.exit.try_recv().unwrap(), 254);
}

#[tokio::test]
async fn test_pty_missing_shell_is_startup_failure() {
    let config = SessionConfig {
        shell: "/nonexistent/shell".to_string(),
        ..SessionConfig::default()
    };
    let (task, mut client) = start_shell(config);

    match finish(task).await {
        Err(BridgeError::ShellStart { shell, .. }) => assert_eq!(shell, "/nonexistent/shell"),
        other => panic!("expected shell start failure, got {:?}", other),
    }
    assert!(client.exit.try_recv().is_err());
}
