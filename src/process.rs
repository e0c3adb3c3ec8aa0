//! Child process helpers shared by the container runtime and session layers.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code, or -1 when the process was killed by a signal.
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Stdout decoded lossily.
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// One line of a streamed command's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
}

impl OutputLine {
    pub fn text(&self) -> &str {
        match self {
            OutputLine::Stdout(s) | OutputLine::Stderr(s) => s,
        }
    }
}

/// Runs a command to completion, killing it if `timeout` elapses first.
pub async fn run_captured(cmd: &mut Command, timeout: Duration) -> Result<ExecOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let program = format!("{:?}", cmd.as_std().get_program());
    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(result) => result.map_err(|e| {
            Error::Runtime(format!("failed to run {}: {}", program, e))
        })?,
        Err(_) => {
            return Err(Error::Runtime(format!(
                "{} timed out after {}s",
                program,
                timeout.as_secs()
            )))
        }
    };

    Ok(ExecOutput {
        status: output.status.code().unwrap_or(-1),
        stdout: output.stdout,
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Runs a command, forwarding each output line to `output_tx` as it appears.
///
/// Returns the exit code. A dropped receiver does not stop the child; the
/// remaining output is drained and discarded.
pub async fn run_streaming(cmd: &mut Command, output_tx: mpsc::Sender<OutputLine>) -> Result<i32> {
    let program = format!("{:?}", cmd.as_std().get_program());
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Runtime(format!("failed to spawn {}: {}", program, e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Runtime("stdout was not piped".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Runtime("stderr was not piped".to_string()))?;

    let mut stdout_reader = BufReader::new(stdout).lines();
    let mut stderr_reader = BufReader::new(stderr).lines();
    let mut stdout_open = true;
    let mut stderr_open = true;
    let mut forwarding = true;

    while stdout_open || stderr_open {
        let line = tokio::select! {
            line = stdout_reader.next_line(), if stdout_open => match line {
                Ok(Some(line)) => Some(OutputLine::Stdout(line)),
                Ok(None) => {
                    stdout_open = false;
                    None
                }
                Err(e) => {
                    tracing::error!(error = %e, "error reading stdout");
                    stdout_open = false;
                    None
                }
            },
            line = stderr_reader.next_line(), if stderr_open => match line {
                Ok(Some(line)) => Some(OutputLine::Stderr(line)),
                Ok(None) => {
                    stderr_open = false;
                    None
                }
                Err(e) => {
                    tracing::error!(error = %e, "error reading stderr");
                    stderr_open = false;
                    None
                }
            },
        };

        if let (Some(line), true) = (line, forwarding) {
            if output_tx.send(line).await.is_err() {
                tracing::warn!("output receiver dropped");
                forwarding = false;
            }
        }
    }

    let status = child
        .wait()
        .await
        .map_err(|e| Error::Runtime(format!("failed to wait for {}: {}", program, e)))?;

    Ok(status.code().unwrap_or(-1))
}
