//! Session transport over the OpenSSH client.
//!
//! A session is a control-master connection; every command and shell rides
//! on its socket. The password goes through `sshpass -e` so it never shows
//! up in the process list. Host keys are not verified since sandboxes are
//! rebuilt often and only reachable on the host network.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::process::{run_captured, ExecOutput};

use super::{RemoteSession, SessionConnector, SessionTarget, ShellChannel};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Opens [`SshSession`]s with the `ssh` and `sshpass` binaries.
#[derive(Debug, Clone)]
pub struct SshConnector {
    ssh_bin: String,
    sshpass_bin: String,
    control_dir: PathBuf,
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            ssh_bin: config.ssh_bin.clone(),
            sshpass_bin: config.sshpass_bin.clone(),
            control_dir: config.control_dir.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }
}

/// Options shared by every invocation against one target.
fn base_args(target: &SessionTarget, socket: &std::path::Path) -> Vec<String> {
    vec![
        "-S".to_string(),
        socket.to_string_lossy().into_owned(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        "LogLevel=ERROR".to_string(),
        "-p".to_string(),
        target.port.to_string(),
        format!("{}@{}", target.username, target.host),
    ]
}

#[async_trait]
impl SessionConnector for SshConnector {
    async fn connect(&self, target: &SessionTarget) -> Result<Box<dyn RemoteSession>> {
        tokio::fs::create_dir_all(&self.control_dir).await?;
        let socket = self
            .control_dir
            .join(format!("{}-{}.sock", target.username, Uuid::new_v4().simple()));

        let mut cmd = Command::new(&self.sshpass_bin);
        cmd.arg("-e")
            .arg(&self.ssh_bin)
            .args(["-M", "-N", "-f"])
            .args(["-o", "ControlPersist=yes", "-o"])
            .arg(format!(
                "ConnectTimeout={}",
                self.connect_timeout.as_secs().max(1)
            ))
            .args(base_args(target, &socket))
            .env("SSHPASS", &target.password);

        let out = run_captured(&mut cmd, self.connect_timeout + Duration::from_secs(5)).await?;
        if !out.success() {
            return Err(Error::Connection {
                user: target.username.clone(),
                reason: out.stderr.trim().to_string(),
            });
        }

        tracing::debug!(user = %target.username, port = target.port, "session established");
        Ok(Box::new(SshSession {
            ssh_bin: self.ssh_bin.clone(),
            target: target.clone(),
            socket,
        }))
    }
}

/// A control-master connection into one sandbox.
pub struct SshSession {
    ssh_bin: String,
    target: SessionTarget,
    socket: PathBuf,
}

impl SshSession {
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.ssh_bin);
        cmd.args(base_args(&self.target, &self.socket));
        cmd
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        let mut cmd = self.command();
        cmd.arg("--").arg(command);
        run_captured(&mut cmd, COMMAND_TIMEOUT).await
    }

    async fn exec_with_input(&self, command: &str, input: &[u8]) -> Result<ExecOutput> {
        let mut child = self
            .command()
            .arg("--")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Remote(format!("failed to spawn ssh: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Remote("stdin was not piped".to_string()))?;
        stdin.write_all(input).await?;
        stdin.shutdown().await?;
        drop(stdin);

        let output = tokio::time::timeout(COMMAND_TIMEOUT, child.wait_with_output())
            .await
            .map_err(|_| Error::Remote(format!("'{}' timed out", command)))??;
        Ok(ExecOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: output.stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn open_shell(&self) -> Result<Box<dyn ShellChannel>> {
        let mut child = self
            .command()
            .arg("-tt")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Remote(format!("failed to spawn shell: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Remote("stdin was not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Remote("stdout was not piped".to_string()))?;

        Ok(Box::new(SshShell {
            child: Mutex::new(child),
            stdin: Mutex::new(Some(stdin)),
            stdout: Mutex::new(stdout),
        }))
    }

    async fn close(&self) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["-O", "exit"]);
        let out = run_captured(&mut cmd, Duration::from_secs(10)).await?;
        if !out.success() {
            tracing::debug!(user = %self.target.username, stderr = %out.stderr.trim(), "control master already gone");
        }
        if let Err(e) = tokio::fs::remove_file(&self.socket).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = ?self.socket, error = %e, "failed to remove control socket");
            }
        }
        Ok(())
    }
}

/// An interactive shell over a pseudo-terminal.
pub struct SshShell {
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<ChildStdout>,
}

#[async_trait]
impl ShellChannel for SshShell {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.stdout.lock().await.read(buf).await?)
    }

    async fn write(&self, data: &[u8]) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        let stdin = stdin
            .as_mut()
            .ok_or_else(|| Error::Remote("shell input is closed".to_string()))?;
        stdin.write_all(data).await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.stdin.lock().await.take();
        let mut child = self.child.lock().await;
        if child.try_wait()?.is_none() {
            child.kill().await?;
        }
        Ok(())
    }
}
