//! Trigger file handling.
//!
//! A udev hook drops a file whose content is one `add|remove <port>
//! [vendor] [product]` line per event. The watcher applies the events to
//! the registry, deletes the file, and requests a rescan.

use std::path::PathBuf;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::registry::{DeviceEvent, DeviceRegistry};

use super::RescanTrigger;

/// Polls for the trigger file.
#[derive(Clone)]
pub struct TriggerFileWatcher {
    path: PathBuf,
    poll: Duration,
    registry: DeviceRegistry,
}

impl TriggerFileWatcher {
    pub fn new(path: impl Into<PathBuf>, poll: Duration, registry: DeviceRegistry) -> Self {
        Self {
            path: path.into(),
            poll,
            registry,
        }
    }

    /// Consumes the trigger file if present. Returns whether it was.
    ///
    /// Every line is applied before the file is removed. A line that fails
    /// is logged and the remaining lines are still applied.
    pub async fn check_once(&self) -> Result<bool> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        for line in content.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let Some(event) = DeviceEvent::parse(line) else {
                tracing::warn!(line = %line, "ignoring malformed device event");
                continue;
            };
            match self.registry.apply_event(&event).await {
                Ok(diff) => {
                    tracing::debug!(port = %event.port, kind = ?event.kind, diff = ?diff, "device event applied")
                }
                Err(e) => {
                    tracing::error!(port = %event.port, kind = ?event.kind, error = %e, "failed to apply device event")
                }
            }
        }

        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        Ok(true)
    }

    /// Polls until cancelled, firing `trigger` whenever the file was found.
    pub async fn run(&self, trigger: RescanTrigger, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match self.check_once().await {
                Ok(true) => {
                    tracing::info!(path = ?self.path, "hardware change signalled");
                    trigger.fire();
                }
                Ok(false) => {}
                Err(e) => tracing::warn!(path = ?self.path, error = %e, "failed to read trigger file"),
            }
        }
    }
}
