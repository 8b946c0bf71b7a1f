//! Subprocess supervision.
//!
//! Every child launch tees stdout/stderr to both a per-call buffer (for
//! results) and a live sink (for operator visibility). Cancellation kills
//! the child and returns whatever made it into the buffer; timeouts do the
//! same. Windows spawns suppress the console window.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {0}: {1}")]
    Spawn(String, std::io::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProcessError>;

/// Destination for live child output, line by line.
pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

/// Routes child output through tracing at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn write_line(&self, line: &str) {
        tracing::info!(target: "tool", "{line}");
    }
}

/// Drops child output; the buffer still captures it.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LogSink for NullSink {
    fn write_line(&self, _line: &str) {}
}

/// What a supervised child produced.
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    /// Exit code; -1 when the child was killed or died without a code.
    pub exit_code: i32,
    /// Combined stdout/stderr in arrival order.
    pub output: String,
    /// True when the child was killed by cancellation or timeout.
    pub killed: bool,
    /// True when the kill came from the timeout path.
    pub timed_out: bool,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        !self.killed && self.exit_code == 0
    }
}

#[cfg(windows)]
fn platform_setup(cmd: &mut Command) {
    // CREATE_NO_WINDOW: tool children must not pop consoles.
    #[allow(clippy::unreadable_literal)]
    cmd.creation_flags(0x08000000);
}

#[cfg(not(windows))]
fn platform_setup(_cmd: &mut Command) {}

async fn drain(
    reader: impl tokio::io::AsyncRead + Unpin,
    buffer: Arc<Mutex<String>>,
    sink: Arc<dyn LogSink>,
) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        sink.write_line(&line);
        let mut buf = buffer.lock().unwrap();
        buf.push_str(&line);
        buf.push('\n');
    }
}

/// Run a child to completion, teeing output to `sink` and an internal
/// buffer. `timeout` of zero means unbounded.
pub async fn run_supervised(
    mut cmd: Command,
    sink: Arc<dyn LogSink>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<CapturedOutput> {
    let program = format!("{:?}", cmd.as_std().get_program());
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    platform_setup(&mut cmd);

    debug!(program = %program, "spawning child");
    let mut child = cmd
        .spawn()
        .map_err(|e| ProcessError::Spawn(program.clone(), e))?;

    let buffer = Arc::new(Mutex::new(String::new()));
    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    let out_task = tokio::spawn(drain(stdout, Arc::clone(&buffer), Arc::clone(&sink)));
    let err_task = tokio::spawn(drain(stderr, Arc::clone(&buffer), Arc::clone(&sink)));

    let deadline = async {
        if timeout.is_zero() {
            std::future::pending::<()>().await;
        } else {
            tokio::time::sleep(timeout).await;
        }
    };

    let (exit_code, killed, timed_out) = tokio::select! {
        status = child.wait() => {
            let status = status?;
            (status.code().unwrap_or(-1), false, false)
        }
        () = deadline => {
            warn!(program = %program, timeout_sec = timeout.as_secs(), "child timed out, killing");
            child.start_kill().ok();
            child.wait().await.ok();
            (-1, true, true)
        }
        () = cancel.cancelled() => {
            warn!(program = %program, "cancelled, killing child");
            child.start_kill().ok();
            child.wait().await.ok();
            (-1, true, false)
        }
    };

    // Join the tee tasks so the buffer holds everything the child wrote
    // (or everything it managed to write before the kill).
    out_task.await.ok();
    err_task.await.ok();

    let output = buffer.lock().unwrap().clone();
    Ok(CapturedOutput {
        exit_code,
        output,
        killed,
        timed_out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sink that records lines for assertions.
    #[derive(Debug, Default)]
    struct RecordingSink(Mutex<Vec<String>>);

    impl LogSink for RecordingSink {
        fn write_line(&self, line: &str) {
            self.0.lock().unwrap().push(line.to_string());
        }
    }

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let sink = Arc::new(RecordingSink::default());
        let out = run_supervised(
            sh("echo one; echo two 1>&2"),
            Arc::clone(&sink) as Arc<dyn LogSink>,
            Duration::ZERO,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(out.success());
        assert!(out.output.contains("one"));
        assert!(out.output.contains("two"));
        let lines = sink.0.lock().unwrap();
        assert_eq!(lines.len(), 2);
    }

    #[tokio::test]
    async fn nonzero_exit_reported() {
        let out = run_supervised(
            sh("echo nope; exit 3"),
            Arc::new(NullSink),
            Duration::ZERO,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(!out.success());
        assert_eq!(out.exit_code, 3);
        assert!(out.output.contains("nope"));
    }

    #[tokio::test]
    async fn timeout_kills_and_keeps_partial_output() {
        let out = run_supervised(
            sh("echo started; sleep 30; echo never"),
            Arc::new(NullSink),
            Duration::from_millis(300),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(out.killed);
        assert!(out.timed_out);
        assert!(out.output.contains("started"));
        assert!(!out.output.contains("never"));
    }

    #[tokio::test]
    async fn cancellation_kills_child() {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel_clone.cancel();
        });
        let out = run_supervised(
            sh("echo started; sleep 30"),
            Arc::new(NullSink),
            Duration::ZERO,
            &cancel,
        )
        .await
        .unwrap();
        assert!(out.killed);
        assert!(!out.timed_out);
        assert!(out.output.contains("started"));
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let result = run_supervised(
            Command::new("definitely-not-a-real-binary-4f2a"),
            Arc::new(NullSink),
            Duration::ZERO,
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(ProcessError::Spawn(_, _))));
    }
}
