//! Child process orchestration: spawn a binary, stream its merged
//! stdout/stderr line by line, then collect the exit status.
//!
//! Timeouts are the caller's job; the runner itself never gives up on a
//! silent child.

use crate::classify::ExitKind;
use crate::error::{ReforgeError, Result};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::debug;

const LINE_CHANNEL_CAPACITY: usize = 256;

/// A spawned child with its output stream. Dropping the handle without
/// calling `kill` leaves the child running; pipelines always either wait
/// or kill.
pub struct RunningProcess {
    program: String,
    child: Child,
    lines: mpsc::Receiver<String>,
}

pub fn spawn(program: &str, args: &[String]) -> Result<RunningProcess> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ReforgeError::BinaryNotFound(program.to_string()),
            _ => ReforgeError::Process(format!("failed to spawn {}: {}", program, e)),
        })?;

    let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);

    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, tx);
    }

    debug!("Spawned {} {:?}", program, args);

    Ok(RunningProcess {
        program: program.to_string(),
        child,
        lines: rx,
    })
}

/// Pump one pipe into the shared line channel. `lines()` buffers partial
/// lines and emits an EOF-terminated final segment on its own, which is
/// exactly the contract callers need.
fn forward_lines<R>(pipe: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

impl RunningProcess {
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Next output line, from either pipe. `None` once both pipes hit EOF.
    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }

    /// Reap the child and report how it ended.
    pub async fn wait(&mut self) -> Result<ExitKind> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| ReforgeError::Process(format!("wait on {}: {}", self.program, e)))?;
        Ok(exit_kind(status))
    }

    /// Terminate the child and reap it. Safe to call on an already-dead
    /// child.
    pub async fn kill(&mut self) {
        let _ = self.child.kill().await;
        let _ = self.child.wait().await;
        self.lines.close();
    }
}

fn exit_kind(status: std::process::ExitStatus) -> ExitKind {
    if let Some(code) = status.code() {
        return ExitKind::Code(code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ExitKind::Code(128 + signal);
        }
    }
    ExitKind::PortError
}
