//! Service wiring.
//!
//! [`Workbench`] builds every component from a [`Config`] and exposes the
//! operations the front end needs: sandbox lifecycle, flashing, sessions,
//! live monitoring and rescans.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::broker::DeviceBroker;
use crate::config::{Config, Validate};
use crate::error::Result;
use crate::pipeline::{CompileReport, FlashPipeline, FlashReport, FlashRequest};
use crate::registry::{DeviceRegistry, PortListing, StateStore, Store, UserRecord};
use crate::relay::{RelayRegistry, SerialOpener, Source, TtyOpener};
use crate::rescan::{RescanCoordinator, RescanReport, RescanTrigger, TriggerFileWatcher};
use crate::sandbox::{DockerCli, SandboxManager, SessionEndpoint, TcpProbe};
use crate::scanner::DevScanner;
use crate::session::{SessionBridge, SessionConnector, SessionHandle, SshConnector};
use crate::subscriber::{emit_within, ChannelHub, Event, SubscriberId};

const NOTICE_WAIT: Duration = Duration::from_millis(500);

/// All services of one host.
#[derive(Clone)]
pub struct Workbench {
    config: Config,
    registry: DeviceRegistry,
    manager: SandboxManager,
    hub: Arc<ChannelHub>,
    pipeline: FlashPipeline,
    sessions: SessionBridge,
    relays: RelayRegistry,
    rescan: RescanCoordinator,
}

impl Workbench {
    /// Builds the production stack: the docker CLI, host `/dev` scanning,
    /// OpenSSH sessions and host tty devices.
    pub fn from_config(config: Config) -> Result<Self> {
        for warning in config.validate().into_result()? {
            tracing::warn!(warning = %warning, "configuration");
        }

        let store: Arc<dyn Store> = match &config.store.path {
            Some(path) => Arc::new(StateStore::open(path)?),
            None => Arc::new(StateStore::in_memory()),
        };
        let registry = DeviceRegistry::new(store);
        let manager = SandboxManager::new(
            Arc::new(DockerCli::new(
                config.sandbox.runtime_bin.clone(),
                config.sandbox.command_timeout(),
            )),
            registry,
            Arc::new(DevScanner::new(
                config.rescan.dev_dir.clone(),
                config.rescan.port_prefixes.clone(),
            )),
            Arc::new(TcpProbe::default()),
            config.sandbox.clone(),
            SessionEndpoint {
                host: config.session.host.clone(),
                password: config.session.password.clone(),
            },
        );
        let connector = Arc::new(SshConnector::new(&config.session));

        Ok(Self::new(
            config,
            manager,
            Arc::new(ChannelHub::default()),
            connector,
            Arc::new(TtyOpener),
        ))
    }

    /// Wires the services around already-built backends.
    pub fn new(
        config: Config,
        manager: SandboxManager,
        hub: Arc<ChannelHub>,
        connector: Arc<dyn SessionConnector>,
        opener: Arc<dyn SerialOpener>,
    ) -> Self {
        let registry = manager.registry().clone();
        let pipeline = FlashPipeline::new(
            manager.clone(),
            DeviceBroker::new(),
            hub.clone(),
            config.toolchain.clone(),
        );
        let sessions = SessionBridge::new(
            registry.clone(),
            connector,
            config.session.host.clone(),
            config.session.password.clone(),
            config.session.connect_policy(),
        );
        let relays = RelayRegistry::new(hub.clone(), opener, config.serial.clone());
        let rescan = RescanCoordinator::new(manager.clone(), config.rescan.clone());

        Self {
            config,
            registry,
            manager,
            hub,
            pipeline,
            sessions,
            relays,
            rescan,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn manager(&self) -> &SandboxManager {
        &self.manager
    }

    pub fn relays(&self) -> &RelayRegistry {
        &self.relays
    }

    /// Registers a subscriber and returns its event stream.
    pub fn subscribe(&self, id: SubscriberId) -> mpsc::Receiver<Event> {
        self.hub.register(id)
    }

    /// Stops everything streaming to a subscriber and forgets it.
    pub async fn disconnect(&self, id: &SubscriberId) {
        self.hub.disconnect(id);
        let stopped = self.relays.stop_subscriber(id).await;
        tracing::debug!(subscriber = %id, stopped, "subscriber disconnected");
    }

    pub async fn add_user(&self, username: &str) -> Result<UserRecord> {
        let user = self.registry.store().create_user(username).await?;
        tracing::info!(user = %username, safe_name = %user.safe_name, "user created");
        Ok(user)
    }

    /// Grants a port. Takes effect in the sandbox on its next `ensure`.
    pub async fn grant(&self, username: &str, port: &str, expires_at: Option<DateTime<Utc>>) -> Result<()> {
        self.registry.grant(username, port, expires_at).await
    }

    pub async fn revoke(&self, username: &str, port: &str) -> Result<bool> {
        self.registry.revoke(username, port).await
    }

    /// Ports the user may currently select.
    pub async fn ports(&self, username: &str) -> Result<Vec<PortListing>> {
        let present = self.manager.present_ports().await?;
        self.registry.available_ports(username, &present).await
    }

    pub async fn ensure(&self, username: &str) -> Result<u16> {
        self.manager.ensure(username).await
    }

    pub async fn flash(&self, request: FlashRequest, subscriber: &SubscriberId) -> Result<FlashReport> {
        self.pipeline.run(request, subscriber).await
    }

    pub async fn compile(&self, username: &str, sketch: &str, board: &str) -> Result<CompileReport> {
        self.pipeline.compile(username, sketch, board).await
    }

    /// Opens a file session into the user's sandbox, provisioning it first.
    pub async fn open_session(&self, username: &str) -> Result<SessionHandle> {
        self.manager.ensure(username).await?;
        self.sessions.open_session(username).await
    }

    /// Starts relaying a granted serial port to `subscriber`.
    pub async fn monitor(
        &self,
        subscriber: &SubscriberId,
        username: &str,
        port: &str,
        baud: Option<u32>,
    ) -> Result<()> {
        let checked = match self.manager.present_ports().await {
            Ok(present) => self.registry.check_access(username, port, &present).await,
            Err(e) => Err(e),
        };
        if let Err(e) = checked {
            self.registry
                .log_action(username, format!("Serial monitor on {}", port), false, None)
                .await;
            self.notify(
                subscriber,
                Event::SerialError {
                    port: port.to_string(),
                    message: e.to_string(),
                },
            )
            .await;
            return Err(e);
        }
        self.registry
            .log_action(username, format!("Serial monitor on {}", port), true, None)
            .await;
        self.relays.start_serial(subscriber, port, baud).await
    }

    /// Starts an interactive shell in the user's sandbox for `subscriber`.
    pub async fn open_terminal(&self, subscriber: &SubscriberId, username: &str) -> Result<()> {
        let session = match self.open_session(username).await {
            Ok(session) => session,
            Err(e) => {
                self.notify(
                    subscriber,
                    Event::Error {
                        message: format!("Terminal unavailable: {}", e),
                    },
                )
                .await;
                return Err(e);
            }
        };
        self.relays.start_shell(subscriber, session).await
    }

    /// Forwards subscriber keystrokes or serial writes.
    pub async fn send(&self, subscriber: &SubscriberId, source: &Source, data: Vec<u8>) -> Result<()> {
        self.relays.send(subscriber, source, data).await
    }

    async fn notify(&self, subscriber: &SubscriberId, event: Event) {
        if let Err(e) = emit_within(self.hub.as_ref(), subscriber, event, NOTICE_WAIT).await {
            tracing::debug!(subscriber = %subscriber, error = %e, "notice not delivered");
        }
    }

    pub async fn rescan(&self) -> Result<RescanReport> {
        self.rescan.reconcile_once().await
    }

    /// Runs the background loops until `cancel` fires.
    pub async fn run_daemon(&self, cancel: CancellationToken) -> Result<()> {
        let report = self.rescan.reconcile_once().await?;
        tracing::info!(
            devices_added = report.diff.added.len(),
            recreated = report.recreated.len(),
            "initial rescan complete"
        );

        let (trigger, triggers) = RescanTrigger::channel();
        let watcher = TriggerFileWatcher::new(
            self.config.rescan.trigger_file.clone(),
            Duration::from_millis(self.config.rescan.trigger_poll_ms),
            self.registry.clone(),
        );
        let watcher_task = tokio::spawn({
            let cancel = cancel.clone();
            async move { watcher.run(trigger, cancel).await }
        });
        let rescan = self.rescan.clone();
        let rescan_task = tokio::spawn({
            let cancel = cancel.clone();
            async move { rescan.run(triggers, cancel).await }
        });

        cancel.cancelled().await;
        for task in [watcher_task, rescan_task] {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "background task failed");
            }
        }
        Ok(())
    }
}
