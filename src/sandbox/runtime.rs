//! Container runtime control surface.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::process::{run_captured, run_streaming, ExecOutput, OutputLine};

/// A bind mount from the host into a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

/// Everything needed to launch one sandbox container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// Host port published to the container's session service on port 22.
    pub management_port: u16,
    /// Host device paths attached at the same path inside the container.
    pub devices: BTreeSet<String>,
    pub volumes: Vec<VolumeMount>,
    pub env: Vec<(String, String)>,
    /// Script run by `/bin/bash` as the container's main process.
    pub entry_script: String,
}

/// Snapshot of a container as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub name: String,
    /// Runtime status string, e.g. `running`, `exited`, `created`.
    pub status: String,
    pub running: bool,
    /// Host paths of attached devices.
    pub devices: BTreeSet<String>,
}

/// Operations on the container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Inspects a container. Returns `None` if it does not exist.
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>>;

    /// Creates and starts a container.
    async fn create(&self, spec: &ContainerSpec) -> Result<()>;

    /// Force-removes a container. Removing a missing container is not an error.
    async fn remove(&self, name: &str) -> Result<()>;

    /// Runs a command inside a running container and captures its output.
    async fn exec(&self, name: &str, user: Option<&str>, args: &[String]) -> Result<ExecOutput>;

    /// Runs a command inside a running container, streaming output lines.
    async fn exec_streaming(
        &self,
        name: &str,
        user: Option<&str>,
        args: &[String],
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<i32>;

    /// Names of running containers.
    async fn list_running(&self) -> Result<Vec<String>>;
}

/// [`ContainerRuntime`] backed by the `docker` command-line interface.
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
    timeout: Duration,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.bin)
    }

    fn run_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--hostname".to_string(),
            spec.name.clone(),
            "--restart".to_string(),
            "unless-stopped".to_string(),
            "-p".to_string(),
            format!("{}:22", spec.management_port),
            "--group-add".to_string(),
            "dialout".to_string(),
            "--entrypoint".to_string(),
            "/bin/bash".to_string(),
        ];

        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        for volume in &spec.volumes {
            args.push("-v".to_string());
            let mut mount = format!("{}:{}", volume.host.display(), volume.container);
            if volume.read_only {
                mount.push_str(":ro");
            }
            args.push(mount);
        }

        for device in &spec.devices {
            args.push("--device".to_string());
            args.push(format!("{}:{}:rwm", device, device));
        }

        args.push(spec.image.clone());
        args.push(spec.entry_script.clone());
        args
    }

    fn exec_args(name: &str, user: Option<&str>, args: &[String]) -> Vec<String> {
        let mut full = vec!["exec".to_string()];
        if let Some(user) = user {
            full.push("-u".to_string());
            full.push(user.to_string());
        }
        full.push(name.to_string());
        full.extend(args.iter().cloned());
        full
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEntry {
    name: String,
    state: InspectState,
    #[serde(default)]
    host_config: Option<InspectHostConfig>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    status: String,
    running: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHostConfig {
    #[serde(default)]
    devices: Option<Vec<InspectDevice>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectDevice {
    path_on_host: String,
}

/// Parses `docker inspect` JSON output for a single container.
pub fn parse_inspect(json: &str) -> Result<Option<ContainerInfo>> {
    let entries: Vec<InspectEntry> = serde_json::from_str(json)
        .map_err(|e| Error::Runtime(format!("unreadable inspect output: {}", e)))?;

    Ok(entries.into_iter().next().map(|entry| ContainerInfo {
        name: entry.name.trim_start_matches('/').to_string(),
        status: entry.state.status,
        running: entry.state.running,
        devices: entry
            .host_config
            .and_then(|h| h.devices)
            .unwrap_or_default()
            .into_iter()
            .map(|d| d.path_on_host)
            .collect(),
    }))
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>> {
        let mut cmd = self.command();
        cmd.args(["inspect", "--type", "container", name]);
        let out = run_captured(&mut cmd, self.timeout).await?;

        if !out.success() {
            if out.stderr.contains("No such") {
                return Ok(None);
            }
            return Err(Error::Runtime(format!(
                "inspect {} failed: {}",
                name,
                out.stderr.trim()
            )));
        }
        parse_inspect(&out.stdout_text())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<()> {
        tracing::info!(
            container = %spec.name,
            port = spec.management_port,
            devices = ?spec.devices,
            "starting container"
        );

        let mut cmd = self.command();
        cmd.args(Self::run_args(spec));
        let out = run_captured(&mut cmd, self.timeout).await?;
        if !out.success() {
            return Err(Error::Runtime(format!(
                "run {} failed: {}",
                spec.name,
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["rm", "-f", name]);
        let out = run_captured(&mut cmd, self.timeout).await?;
        if !out.success() && !out.stderr.contains("No such") {
            return Err(Error::Runtime(format!(
                "rm {} failed: {}",
                name,
                out.stderr.trim()
            )));
        }
        tracing::info!(container = %name, "container removed");
        Ok(())
    }

    async fn exec(&self, name: &str, user: Option<&str>, args: &[String]) -> Result<ExecOutput> {
        let mut cmd = self.command();
        cmd.args(Self::exec_args(name, user, args));
        run_captured(&mut cmd, self.timeout).await
    }

    async fn exec_streaming(
        &self,
        name: &str,
        user: Option<&str>,
        args: &[String],
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<i32> {
        let mut cmd = self.command();
        cmd.args(Self::exec_args(name, user, args));
        run_streaming(&mut cmd, output_tx).await
    }

    async fn list_running(&self) -> Result<Vec<String>> {
        let mut cmd = self.command();
        cmd.args(["ps", "--format", "{{.Names}}"]);
        let out = run_captured(&mut cmd, self.timeout).await?;
        if !out.success() {
            return Err(Error::Runtime(format!("ps failed: {}", out.stderr.trim())));
        }
        Ok(out
            .stdout_text()
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }
}
