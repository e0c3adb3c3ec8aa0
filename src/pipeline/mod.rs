//! Build/flash pipeline.
//!
//! A run goes through three stages inside the user's sandbox: prepare the
//! sketch layout, compile, and flash. Output of each stage is streamed line
//! by line to the subscriber while it is produced. Only the flash stage
//! holds the port lock. Every run ends with exactly one terminal event.

mod diagnostics;
mod hints;

pub use diagnostics::{parse_memory, DiagnosticEntry, Diagnostics, MemoryUsage, Usage};
pub use hints::{FlashFailureKind, HintDetector};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::broker::DeviceBroker;
use crate::config::ToolchainConfig;
use crate::error::{Error, Result};
use crate::naming::UserIdentity;
use crate::process::OutputLine;
use crate::sandbox::SandboxManager;
use crate::session::paths::{resolve, shell_quote};
use crate::subscriber::{emit_within, Event, EventSink, SubscriberId};

/// Pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Prepare,
    Compile,
    Flash,
}

/// One firmware build-and-flash request.
#[derive(Debug, Clone)]
pub struct FlashRequest {
    pub username: String,
    /// Sketch path relative to the sandbox home.
    pub sketch: String,
    /// Fully-qualified board profile.
    pub board: String,
    pub port: String,
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashReport {
    pub run_id: String,
    pub memory: Option<MemoryUsage>,
}

/// Result of a stand-alone compile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompileReport {
    pub success: bool,
    pub exit_code: i32,
    pub output: String,
    pub diagnostics: Diagnostics,
}

/// Where a tool's output lines go while it runs.
struct Forward<'a> {
    run_id: &'a str,
    stage: Stage,
    subscriber: &'a SubscriberId,
    /// Set once the subscriber stops draining; later lines are dropped.
    stalled: &'a AtomicBool,
}

const DEFAULT_EMIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs compile and flash operations in user sandboxes.
#[derive(Clone)]
pub struct FlashPipeline {
    manager: SandboxManager,
    broker: DeviceBroker,
    sink: Arc<dyn EventSink>,
    toolchain: ToolchainConfig,
    hints: Arc<HintDetector>,
    emit_timeout: Duration,
}

impl FlashPipeline {
    pub fn new(
        manager: SandboxManager,
        broker: DeviceBroker,
        sink: Arc<dyn EventSink>,
        toolchain: ToolchainConfig,
    ) -> Self {
        Self {
            manager,
            broker,
            sink,
            toolchain,
            hints: Arc::new(HintDetector::new()),
            emit_timeout: DEFAULT_EMIT_TIMEOUT,
        }
    }

    /// Sets how long a single event may wait on a full subscriber queue.
    pub fn with_emit_timeout(mut self, timeout: Duration) -> Self {
        self.emit_timeout = timeout;
        self
    }

    /// Compiles and flashes, streaming progress to `subscriber`.
    pub async fn run(&self, request: FlashRequest, subscriber: &SubscriberId) -> Result<FlashReport> {
        let run_id = Uuid::new_v4().to_string();
        tracing::info!(
            run_id = %run_id,
            user = %request.username,
            port = %request.port,
            board = %request.board,
            "pipeline started"
        );
        self.emit(
            subscriber,
            Event::PipelineStarted {
                run_id: run_id.clone(),
                port: request.port.clone(),
                board: request.board.clone(),
            },
        )
        .await;

        let result = self.execute(&run_id, &request, subscriber).await;

        let details = json!({
            "run_id": run_id,
            "port": request.port,
            "board": request.board,
            "sketch": request.sketch,
        });
        match result {
            Ok(report) => {
                tracing::info!(run_id = %run_id, user = %request.username, "pipeline succeeded");
                self.manager
                    .registry()
                    .log_action(&request.username, "Flash succeeded", true, Some(details))
                    .await;
                self.emit(
                    subscriber,
                    Event::PipelineSucceeded {
                        run_id,
                        memory: report.memory,
                    },
                )
                .await;
                Ok(report)
            }
            Err((stage, error)) => {
                tracing::warn!(run_id = %run_id, user = %request.username, stage = ?stage, error = %error, "pipeline failed");
                self.manager
                    .registry()
                    .log_action(
                        &request.username,
                        format!("Flash failed at {:?}", stage),
                        false,
                        Some(details),
                    )
                    .await;
                let (diagnostics, hints) = match &error {
                    Error::CompileFailure { diagnostics, .. } => (Some(diagnostics.clone()), vec![]),
                    Error::FlashFailure { hints, .. } => (None, hints.clone()),
                    _ => (None, vec![]),
                };
                self.emit(
                    subscriber,
                    Event::PipelineFailed {
                        run_id,
                        stage,
                        message: error.to_string(),
                        diagnostics,
                        hints,
                    },
                )
                .await;
                Err(error)
            }
        }
    }

    /// Compiles without flashing and reports diagnostics either way.
    pub async fn compile(&self, username: &str, sketch: &str, board: &str) -> Result<CompileReport> {
        let identity = UserIdentity::new(username)?;
        self.manager.ensure(username).await?;
        let target = self.prepare(&identity, sketch, None).await?;

        let (exit_code, lines) = self.compile_tool(&identity, board, &target, None).await?;
        let output = lines.join("\n");
        let mut diagnostics = Diagnostics::parse(&output);
        let success = exit_code == 0;
        if !success {
            diagnostics.ensure_error(&target, &output);
        }

        self.manager
            .registry()
            .log_action(
                username,
                "Compile",
                success,
                Some(json!({ "sketch": sketch, "board": board, "errors": diagnostics.errors.len() })),
            )
            .await;

        Ok(CompileReport {
            success,
            exit_code,
            output,
            diagnostics,
        })
    }

    async fn execute(
        &self,
        run_id: &str,
        request: &FlashRequest,
        subscriber: &SubscriberId,
    ) -> std::result::Result<FlashReport, (Stage, Error)> {
        let at = |stage: Stage| move |e: Error| (stage, e);
        let user = request.username.as_str();
        let identity = UserIdentity::new(user).map_err(at(Stage::Prepare))?;

        // Unavailable devices are rejected before the sandbox or the lock is touched.
        let present = self.manager.present_ports().await.map_err(at(Stage::Prepare))?;
        self.manager
            .registry()
            .check_access(user, &request.port, &present)
            .await
            .map_err(at(Stage::Prepare))?;

        self.stage_started(run_id, Stage::Prepare, subscriber).await;
        self.manager.ensure(user).await.map_err(at(Stage::Prepare))?;
        let stalled = AtomicBool::new(false);
        let forward = Forward {
            run_id,
            stage: Stage::Prepare,
            subscriber,
            stalled: &stalled,
        };
        let target = self
            .prepare(&identity, &request.sketch, Some(&forward))
            .await
            .map_err(at(Stage::Prepare))?;

        self.stage_started(run_id, Stage::Compile, subscriber).await;
        let forward = Forward {
            stage: Stage::Compile,
            ..forward
        };
        let (code, lines) = self
            .compile_tool(&identity, &request.board, &target, Some(&forward))
            .await
            .map_err(at(Stage::Compile))?;
        let output = lines.join("\n");
        if code != 0 {
            let mut diagnostics = Diagnostics::parse(&output);
            diagnostics.ensure_error(&target, &output);
            return Err((
                Stage::Compile,
                Error::CompileFailure {
                    exit_code: code,
                    diagnostics,
                },
            ));
        }
        let memory = Some(parse_memory(&output)).filter(|m| !m.is_empty());

        self.stage_started(run_id, Stage::Flash, subscriber).await;
        let forward = Forward {
            stage: Stage::Flash,
            ..forward
        };
        let container = identity.container_name();
        let (code, lines) = self
            .broker
            .with_lock(&request.port, || async {
                let chmod = ["chmod", "666", request.port.as_str()].map(str::to_string);
                if let Err(e) = self.manager.runtime().exec(&container, Some("root"), &chmod).await {
                    tracing::warn!(port = %request.port, error = %e, "could not open port permissions");
                }
                let args = vec![
                    self.toolchain.cli.clone(),
                    "upload".to_string(),
                    "-p".to_string(),
                    request.port.clone(),
                    "--fqbn".to_string(),
                    request.board.clone(),
                    target.clone(),
                ];
                self.run_tool(&container, identity.safe(), args, Some(&forward))
                    .await
            })
            .await
            .map_err(at(Stage::Flash))?;

        if code != 0 {
            let hints = self.hints.hints(&lines.join("\n"));
            return Err((
                Stage::Flash,
                Error::FlashFailure {
                    port: request.port.clone(),
                    exit_code: code,
                    hints,
                },
            ));
        }

        Ok(FlashReport {
            run_id: run_id.to_string(),
            memory,
        })
    }

    /// Places the sketch at `<dir>/<stem>/<stem>.ino`, copying it there if the
    /// copy is missing or older. Returns the path handed to the build tool.
    async fn prepare(
        &self,
        identity: &UserIdentity,
        sketch: &str,
        forward: Option<&Forward<'_>>,
    ) -> Result<String> {
        let home = identity.sandbox_home();
        let source = resolve(&home, sketch)?;
        let target = sketch_layout(&source).ok_or_else(|| Error::PathViolation {
            path: sketch.to_string(),
            reason: "is not a sketch file".to_string(),
        })?;
        resolve(&home, &target.to_string_lossy())?;

        let source = source.to_string_lossy().into_owned();
        let target = target.to_string_lossy().into_owned();
        if source == target {
            return Ok(target);
        }

        let folder = Path::new(&target)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let script = format!(
            "mkdir -p {folder} && if [ ! -f {dst} ] || [ {src} -nt {dst} ]; then cp -p {src} {dst}; fi",
            folder = shell_quote(&folder),
            src = shell_quote(&source),
            dst = shell_quote(&target),
        );
        let args = vec!["sh".to_string(), "-c".to_string(), script];
        let (code, lines) = self
            .run_tool(&identity.container_name(), identity.safe(), args, forward)
            .await?;
        if code != 0 {
            return Err(Error::Remote(format!(
                "could not prepare {}: {}",
                sketch,
                lines.join("\n")
            )));
        }
        Ok(target)
    }

    async fn compile_tool(
        &self,
        identity: &UserIdentity,
        board: &str,
        target: &str,
        forward: Option<&Forward<'_>>,
    ) -> Result<(i32, Vec<String>)> {
        let args = vec![
            self.toolchain.cli.clone(),
            "compile".to_string(),
            "--fqbn".to_string(),
            board.to_string(),
            target.to_string(),
        ];
        self.run_tool(&identity.container_name(), identity.safe(), args, forward)
            .await
    }

    /// Runs a command in the sandbox, forwarding lines as they arrive and
    /// collecting them for diagnostics.
    async fn run_tool(
        &self,
        container: &str,
        user: &str,
        args: Vec<String>,
        forward: Option<&Forward<'_>>,
    ) -> Result<(i32, Vec<String>)> {
        let (tx, mut rx) = mpsc::channel::<OutputLine>(64);
        let runtime = self.manager.runtime();

        let exec = runtime.exec_streaming(container, Some(user), &args, tx);
        let collect = async {
            let mut lines = Vec::new();
            while let Some(line) = rx.recv().await {
                let text = line.text().trim_end().to_string();
                if text.is_empty() {
                    continue;
                }
                if let Some(fwd) = forward.filter(|f| !f.stalled.load(Ordering::Relaxed)) {
                    let event = Event::Log {
                        run_id: fwd.run_id.to_string(),
                        stage: fwd.stage,
                        line: text.clone(),
                    };
                    if let Err(e) = emit_within(self.sink.as_ref(), fwd.subscriber, event, self.emit_timeout).await {
                        tracing::warn!(
                            run_id = %fwd.run_id,
                            subscriber = %fwd.subscriber,
                            error = %e,
                            "dropping remaining log lines"
                        );
                        fwd.stalled.store(true, Ordering::Relaxed);
                    }
                }
                lines.push(text);
            }
            lines
        };

        let (code, lines) = tokio::join!(exec, collect);
        Ok((code?, lines))
    }

    async fn stage_started(&self, run_id: &str, stage: Stage, subscriber: &SubscriberId) {
        self.emit(
            subscriber,
            Event::StageStarted {
                run_id: run_id.to_string(),
                stage,
            },
        )
        .await;
    }

    async fn emit(&self, subscriber: &SubscriberId, event: Event) {
        if let Err(e) = emit_within(self.sink.as_ref(), subscriber, event, self.emit_timeout).await {
            tracing::debug!(subscriber = %subscriber, error = %e, "dropping event");
        }
    }
}

/// Maps `<dir>/<name>.<ext>` to `<dir>/<name>/<name>.<ext>`, leaving paths
/// that already follow the layout unchanged.
fn sketch_layout(source: &Path) -> Option<PathBuf> {
    let file = source.file_name()?;
    let stem = source.file_stem()?;
    let parent = source.parent()?;
    if parent.file_name() == Some(stem) {
        return Some(source.to_path_buf());
    }
    Some(parent.join(stem).join(file))
}
