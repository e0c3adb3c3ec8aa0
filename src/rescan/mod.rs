//! Hardware rescan coordinator.
//!
//! Reconciles the registry and the running sandboxes with the physically
//! present devices. A pass runs on a periodic timer and on external
//! triggers. Triggers arriving within the debounce window collapse into a
//! single pass, and a pass with no physical change writes nothing.

mod trigger;

pub use trigger::TriggerFileWatcher;

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::RescanConfig;
use crate::error::Result;
use crate::registry::RegistryDiff;
use crate::sandbox::SandboxManager;

/// A sandbox that could not be brought in line during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RescanFailure {
    pub user: String,
    pub error: String,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RescanReport {
    pub diff: RegistryDiff,
    /// Grants removed because they expired.
    pub expired: usize,
    /// Users whose sandbox only had permissions refreshed.
    pub refreshed: Vec<String>,
    /// Users whose sandbox was recreated.
    pub recreated: Vec<String>,
    pub failures: Vec<RescanFailure>,
}

impl RescanReport {
    /// True if the pass changed neither the registry nor any sandbox.
    pub fn is_noop(&self) -> bool {
        self.diff.is_empty() && self.expired == 0 && self.recreated.is_empty()
    }
}

/// Requests a rescan pass.
#[derive(Debug, Clone)]
pub struct RescanTrigger {
    tx: mpsc::Sender<()>,
}

impl RescanTrigger {
    /// Creates a trigger and the receiver the coordinator loop listens on.
    pub fn channel() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Asks for a pass. A request already pending absorbs this one.
    pub fn fire(&self) {
        if let Err(mpsc::error::TrySendError::Closed(())) = self.tx.try_send(()) {
            tracing::debug!("rescan coordinator is gone");
        }
    }
}

/// Drives reconciliation passes.
#[derive(Clone)]
pub struct RescanCoordinator {
    manager: SandboxManager,
    config: RescanConfig,
    pass_lock: Arc<Mutex<()>>,
}

impl RescanCoordinator {
    pub fn new(manager: SandboxManager, config: RescanConfig) -> Self {
        Self {
            manager,
            config,
            pass_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Runs one reconciliation pass.
    pub async fn reconcile_once(&self) -> Result<RescanReport> {
        let _pass = self.pass_lock.lock().await;
        let registry = self.manager.registry();
        let mut report = RescanReport {
            expired: registry.sweep_expired(Utc::now()).await?.len(),
            ..Default::default()
        };

        let present = self.manager.present_ports().await?;
        report.diff = registry.reconcile_present(&present).await?;
        if !report.diff.is_empty() {
            tracing::info!(diff = ?report.diff, "device registry updated");
        }

        for user in self.manager.running_users().await? {
            let outcome = match self.manager.rebuild_if_stale(&user).await {
                Ok(None) => self.manager.refresh_permissions(&user).await.map(|()| false),
                Ok(Some(_)) => Ok(true),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(false) => report.refreshed.push(user),
                Ok(true) => report.recreated.push(user),
                Err(e) => {
                    tracing::error!(user = %user, error = %e, "rescan could not reconcile sandbox");
                    report.failures.push(RescanFailure {
                        user,
                        error: e.to_string(),
                    });
                }
            }
        }

        Ok(report)
    }

    /// Runs passes on the timer and on triggers until cancelled.
    pub async fn run(&self, mut triggers: mpsc::Receiver<()>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let debounce = self.config.debounce();
        let mut triggers_open = true;

        tracing::info!(
            interval_secs = self.config.interval_secs,
            debounce_ms = self.config.debounce_ms,
            "rescan coordinator started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                t = triggers.recv(), if triggers_open => match t {
                    Some(()) => {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(debounce) => {}
                        }
                        let mut collapsed = 0;
                        while triggers.try_recv().is_ok() {
                            collapsed += 1;
                        }
                        tracing::debug!(collapsed, "hardware change triggered rescan");
                    }
                    None => {
                        triggers_open = false;
                        continue;
                    }
                },
                _ = ticker.tick() => {}
            }

            match self.reconcile_once().await {
                Ok(report) if report.is_noop() => tracing::debug!("rescan found no changes"),
                Ok(report) => tracing::info!(
                    added = report.diff.added.len(),
                    retired = report.diff.retired.len(),
                    recreated = report.recreated.len(),
                    failures = report.failures.len(),
                    "rescan complete"
                ),
                Err(e) => tracing::error!(error = %e, "rescan failed"),
            }
            ticker.reset();
        }

        tracing::info!("rescan coordinator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pending_trigger_absorbs_repeats() {
        let (trigger, mut rx) = RescanTrigger::channel();
        trigger.fire();
        trigger.fire();
        trigger.fire();
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn empty_report_is_noop() {
        let mut report = RescanReport::default();
        report.refreshed.push("alice".to_string());
        assert!(report.is_noop());
        report.recreated.push("bob".to_string());
        assert!(!report.is_noop());
    }
}
