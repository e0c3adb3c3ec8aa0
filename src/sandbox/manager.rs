//! Sandbox lifecycle manager.
//!
//! A sandbox is either correctly provisioned or stale. Stale sandboxes are
//! destroyed and created again from scratch; device attachment is never
//! patched in place. Calls for the same user are serialised by a per-user
//! lock so the inspect-then-decide step always sees a consistent snapshot.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::backoff::RetryPolicy;
use crate::config::SandboxConfig;
use crate::error::{Error, Result};
use crate::locks::LockMap;
use crate::naming::{safe_name_from_container, UserIdentity};
use crate::registry::{DeviceRegistry, UserRecord};
use crate::scanner::DeviceScanner;

use super::bootstrap::{Bootstrap, CONTAINER_SCRIPT};
use super::ports::PortAllocator;
use super::probe::ReadinessProbe;
use super::reconcile::{decide, RebuildReason, Reconciliation};
use super::runtime::{ContainerRuntime, ContainerSpec, VolumeMount};

/// Where sandboxes publish their session service and how to log in.
#[derive(Debug, Clone)]
pub struct SessionEndpoint {
    pub host: String,
    pub password: String,
}

/// Creates, checks and rebuilds per-user sandboxes.
#[derive(Clone)]
pub struct SandboxManager {
    runtime: Arc<dyn ContainerRuntime>,
    registry: DeviceRegistry,
    scanner: Arc<dyn DeviceScanner>,
    probe: Arc<dyn ReadinessProbe>,
    config: SandboxConfig,
    endpoint: SessionEndpoint,
    ready_policy: RetryPolicy,
    ports: PortAllocator,
    user_locks: LockMap<String>,
}

impl SandboxManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: DeviceRegistry,
        scanner: Arc<dyn DeviceScanner>,
        probe: Arc<dyn ReadinessProbe>,
        config: SandboxConfig,
        endpoint: SessionEndpoint,
    ) -> Self {
        let ready_policy = config.ready_policy();
        let ports = PortAllocator::new(config.port_range);
        Self {
            runtime,
            registry,
            scanner,
            probe,
            config,
            endpoint,
            ready_policy,
            ports,
            user_locks: LockMap::new(),
        }
    }

    /// Overrides the readiness retry budget.
    pub fn with_ready_policy(mut self, policy: RetryPolicy) -> Self {
        self.ready_policy = policy;
        self
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn endpoint(&self) -> &SessionEndpoint {
        &self.endpoint
    }

    /// Physically present ports.
    pub async fn present_ports(&self) -> Result<BTreeSet<String>> {
        self.scanner.scan().await
    }

    /// Ports granted to the user that are physically present.
    pub async fn required_devices(&self, username: &str) -> Result<BTreeSet<String>> {
        let present = self.present_ports().await?;
        self.registry.required_ports(username, &present).await
    }

    /// Makes sure the user's sandbox runs with exactly the required devices.
    ///
    /// Returns the management port. Calling it again without a grant change
    /// returns the same port and leaves the container alone.
    pub async fn ensure(&self, username: &str) -> Result<u16> {
        let (user, identity) = self.lookup(username).await?;
        let lock = self.user_locks.get(&identity.safe().to_string());
        let _guard = lock.lock().await;

        let required = self.required_devices(username).await?;
        let container = identity.container_name();
        let observed = self
            .runtime
            .inspect(&container)
            .await
            .map_err(|e| provisioning(username, e))?;

        let reason = match (decide(&required, observed.as_ref()), user.management_port) {
            (Reconciliation::MatchesDesired, Some(port)) => {
                if self.wake_session_service(&container, port).await {
                    tracing::debug!(user = %username, port, "sandbox up to date");
                    return Ok(port);
                }
                RebuildReason::Unreachable
            }
            (Reconciliation::MatchesDesired, None) => RebuildReason::Absent,
            (Reconciliation::NeedsRebuild(reason), _) => reason,
        };

        tracing::info!(user = %username, container = %container, reason = %reason, "rebuilding sandbox");
        self.rebuild(username, &identity, &required).await
    }

    /// Destroys and creates the sandbox unconditionally.
    pub async fn recreate(&self, username: &str) -> Result<u16> {
        let (_, identity) = self.lookup(username).await?;
        let lock = self.user_locks.get(&identity.safe().to_string());
        let _guard = lock.lock().await;

        let required = self.required_devices(username).await?;
        tracing::info!(user = %username, devices = ?required, "recreating sandbox");
        self.rebuild(username, &identity, &required).await
    }

    /// Removes the user's sandbox. The persisted management port is kept.
    pub async fn destroy(&self, username: &str) -> Result<()> {
        let identity = UserIdentity::new(username)?;
        let lock = self.user_locks.get(&identity.safe().to_string());
        let _guard = lock.lock().await;

        self.runtime
            .remove(&identity.container_name())
            .await
            .map_err(|e| provisioning(username, e))
    }

    /// Usernames whose sandbox container is currently running.
    pub async fn running_users(&self) -> Result<Vec<String>> {
        let mut users = Vec::new();
        for container in self.runtime.list_running().await? {
            let Some(safe) = safe_name_from_container(&container) else {
                continue;
            };
            match self.registry.store().user_by_safe_name(safe).await? {
                Some(user) => users.push(user.username),
                None => tracing::debug!(container = %container, "running container has no user"),
            }
        }
        Ok(users)
    }

    /// Re-applies serial device permissions inside a running sandbox.
    pub async fn refresh_permissions(&self, username: &str) -> Result<()> {
        let identity = UserIdentity::new(username)?;
        let script = format!(
            "chmod 666 /dev/ttyUSB* /dev/ttyACM* 2>/dev/null || true; usermod -aG dialout {} 2>/dev/null || true",
            identity.safe()
        );
        let out = self
            .runtime
            .exec(
                &identity.container_name(),
                None,
                &["sh".to_string(), "-c".to_string(), script],
            )
            .await?;
        if !out.success() {
            tracing::warn!(user = %username, stderr = %out.stderr.trim(), "permission refresh failed");
        }
        Ok(())
    }

    /// Returns true if the running sandbox already has exactly `ports` attached
    /// and every one of them is visible inside it.
    pub async fn can_access(&self, username: &str, ports: &BTreeSet<String>) -> Result<bool> {
        let identity = UserIdentity::new(username)?;
        self.devices_visible(username, &identity.container_name(), ports)
            .await
    }

    /// Rebuilds the sandbox unless it already has access to every required
    /// device. Returns the management port when a rebuild happened.
    ///
    /// The check and the rebuild run under the user's lock, so a sandbox that
    /// a concurrent `ensure` has just brought up to date is left alone.
    pub async fn rebuild_if_stale(&self, username: &str) -> Result<Option<u16>> {
        let (_, identity) = self.lookup(username).await?;
        let lock = self.user_locks.get(&identity.safe().to_string());
        let _guard = lock.lock().await;

        let required = self.required_devices(username).await?;
        if self
            .devices_visible(username, &identity.container_name(), &required)
            .await?
        {
            return Ok(None);
        }
        tracing::info!(user = %username, devices = ?required, "sandbox lost device access");
        self.rebuild(username, &identity, &required).await.map(Some)
    }

    async fn devices_visible(
        &self,
        username: &str,
        container: &str,
        ports: &BTreeSet<String>,
    ) -> Result<bool> {
        let observed = self.runtime.inspect(container).await?;
        if decide(ports, observed.as_ref()) != Reconciliation::MatchesDesired {
            return Ok(false);
        }

        for port in ports {
            let out = self
                .runtime
                .exec(container, None, &["test".to_string(), "-e".to_string(), port.clone()])
                .await?;
            if !out.success() {
                tracing::debug!(user = %username, port = %port, "device missing inside sandbox");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn lookup(&self, username: &str) -> Result<(UserRecord, UserIdentity)> {
        let user = self.registry.user(username).await?;
        let identity = UserIdentity::new(user.username.clone())?;
        Ok((user, identity))
    }

    /// Starts the session service in a running sandbox and checks it answers.
    async fn wake_session_service(&self, container: &str, port: u16) -> bool {
        let args = ["service", "ssh", "start"].map(str::to_string);
        if let Err(e) = self.runtime.exec(container, None, &args).await {
            tracing::warn!(container = %container, error = %e, "could not start session service");
        }
        RetryPolicy::new(3, self.ready_policy.initial_delay, self.ready_policy.max_delay)
            .retry(|_| self.probe.probe(&self.endpoint.host, port))
            .await
            .is_ok()
    }

    async fn rebuild(
        &self,
        username: &str,
        identity: &UserIdentity,
        devices: &BTreeSet<String>,
    ) -> Result<u16> {
        let container = identity.container_name();
        self.runtime
            .remove(&container)
            .await
            .map_err(|e| provisioning(username, e))?;

        let port = self
            .ports
            .allocate(self.registry.store().as_ref(), username)
            .await?;

        let data_dir = identity.host_data_dir(&self.config.data_root);
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(|e| provisioning(username, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&data_dir, std::fs::Permissions::from_mode(0o777))
                .await
                .map_err(|e| provisioning(username, e))?;
        }

        let script = Bootstrap {
            safe_name: identity.safe(),
            password: &self.endpoint.password,
            toolchain_mount: self
                .config
                .toolchain_dir
                .as_ref()
                .map(|_| self.config.toolchain_mount.as_str()),
        }
        .write_to(&data_dir)
        .await
        .map_err(|e| provisioning(username, e))?;

        let mut volumes = vec![
            VolumeMount {
                host: data_dir.clone(),
                container: identity.sandbox_home().to_string_lossy().into_owned(),
                read_only: false,
            },
            VolumeMount {
                host: script.clone(),
                container: CONTAINER_SCRIPT.to_string(),
                read_only: true,
            },
        ];
        if let Some(toolchain) = &self.config.toolchain_dir {
            volumes.push(VolumeMount {
                host: toolchain.clone(),
                container: self.config.toolchain_mount.clone(),
                read_only: false,
            });
        }

        let spec = ContainerSpec {
            name: container.clone(),
            image: self.config.image.clone(),
            management_port: port,
            devices: devices.clone(),
            volumes,
            env: vec![("USERNAME".to_string(), identity.safe().to_string())],
            entry_script: CONTAINER_SCRIPT.to_string(),
        };
        self.runtime
            .create(&spec)
            .await
            .map_err(|e| provisioning(username, e))?;

        self.ready_policy
            .retry(|_| self.probe.probe(&self.endpoint.host, port))
            .await
            .map_err(|e| Error::Provisioning {
                user: username.to_string(),
                reason: format!("session service did not come up on port {}: {}", port, e),
            })?;

        if let Err(e) = tokio::fs::remove_file(&script).await {
            tracing::warn!(path = ?script, error = %e, "failed to remove host setup script");
        }

        tracing::info!(user = %username, container = %container, port, devices = ?devices, "sandbox ready");
        Ok(port)
    }
}

fn provisioning(username: &str, e: impl std::fmt::Display) -> Error {
    Error::Provisioning {
        user: username.to_string(),
        reason: e.to_string(),
    }
}
