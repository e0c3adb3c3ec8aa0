//! Device registry: physical ports, their status, and who may use them.
//!
//! Grants are the source of truth for access. A device's `in_use_by` is
//! derived from the active grants on its port (earliest grant wins) and is
//! recomputed after every grant change, expiry sweep or physical change.

mod classify;
mod model;
mod store;

pub use classify::{board_profiles, classify, BoardProfile, Classification};
pub use model::{
    ActionRecord, Device, DeviceEvent, DeviceEventKind, DeviceStatus, Grant, UserRecord,
};
pub use store::{StateStore, Store, StoreState};

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};

/// Ports whose registry rows changed during a reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistryDiff {
    /// Newly seen ports inserted as available.
    pub added: Vec<String>,
    /// Ports back from maintenance.
    pub reactivated: Vec<String>,
    /// Ports that vanished and were moved to maintenance.
    pub retired: Vec<String>,
}

impl RegistryDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.reactivated.is_empty() && self.retired.is_empty()
    }
}

/// A port a user may select, with display information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortListing {
    pub port: String,
    pub label: String,
    pub kind: String,
    pub boards: Vec<BoardProfile>,
}

/// Registry operations over a [`Store`].
#[derive(Clone)]
pub struct DeviceRegistry {
    store: Arc<dyn Store>,
}

impl DeviceRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Looks up a user, failing with [`Error::UnknownUser`].
    pub async fn user(&self, username: &str) -> Result<UserRecord> {
        self.store
            .user(username)
            .await?
            .ok_or_else(|| Error::UnknownUser(username.to_string()))
    }

    /// Applies a physical add/remove notification.
    pub async fn apply_event(&self, event: &DeviceEvent) -> Result<RegistryDiff> {
        let mut diff = RegistryDiff::default();
        let existing = self.store.device(&event.port).await?;

        match event.kind {
            DeviceEventKind::Add => {
                let class = classify(
                    &event.port,
                    event.vendor_id.as_deref(),
                    event.product_id.as_deref(),
                );
                match existing {
                    None => diff.added.push(event.port.clone()),
                    Some(ref d) if d.status == DeviceStatus::Maintenance => {
                        diff.reactivated.push(event.port.clone())
                    }
                    Some(_) => {}
                }
                let mut device = existing.unwrap_or_else(|| Device {
                    port: event.port.clone(),
                    tag: String::new(),
                    kind: String::new(),
                    status: DeviceStatus::Available,
                    in_use_by: None,
                });
                device.tag = class.tag;
                device.kind = class.kind;
                if device.status == DeviceStatus::Maintenance {
                    device.status = DeviceStatus::Available;
                }
                self.store.upsert_device(device).await?;
                self.refresh_assignment(&event.port, Utc::now()).await?;
                tracing::info!(port = %event.port, "hardware connected");
            }
            DeviceEventKind::Remove => {
                if let Some(mut device) = existing {
                    if device.status != DeviceStatus::Maintenance {
                        diff.retired.push(event.port.clone());
                    }
                    device.status = DeviceStatus::Maintenance;
                    device.in_use_by = None;
                    self.store.upsert_device(device).await?;
                    tracing::info!(port = %event.port, "hardware removed");
                }
            }
        }

        Ok(diff)
    }

    /// Brings the registry in line with the physically present port set.
    ///
    /// New ports are inserted as available, returning ports leave maintenance,
    /// vanished ports go to maintenance. Rows are never deleted, and nothing is
    /// written when the registry already matches.
    pub async fn reconcile_present(&self, present: &BTreeSet<String>) -> Result<RegistryDiff> {
        let mut diff = RegistryDiff::default();
        let now = Utc::now();

        for port in present {
            match self.store.device(port).await? {
                None => {
                    let class = classify(port, None, None);
                    self.store
                        .upsert_device(Device {
                            port: port.clone(),
                            tag: class.tag,
                            kind: class.kind,
                            status: DeviceStatus::Available,
                            in_use_by: None,
                        })
                        .await?;
                    tracing::info!(port = %port, "registered new device");
                    diff.added.push(port.clone());
                }
                Some(mut device) if device.status == DeviceStatus::Maintenance => {
                    device.status = DeviceStatus::Available;
                    self.store.upsert_device(device).await?;
                    tracing::info!(port = %port, "re-activated device");
                    diff.reactivated.push(port.clone());
                }
                Some(_) => {}
            }
            self.refresh_assignment(port, now).await?;
        }

        for mut device in self.store.devices().await? {
            if present.contains(&device.port) || device.status == DeviceStatus::Maintenance {
                continue;
            }
            tracing::warn!(port = %device.port, "device vanished, moving to maintenance");
            diff.retired.push(device.port.clone());
            device.status = DeviceStatus::Maintenance;
            device.in_use_by = None;
            self.store.upsert_device(device).await?;
        }

        Ok(diff)
    }

    /// Grants `port` to `username`, optionally until `expires_at`.
    pub async fn grant(
        &self,
        username: &str,
        port: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.user(username).await?;
        let usable = self
            .store
            .device(port)
            .await?
            .is_some_and(|d| d.status != DeviceStatus::Maintenance);
        if !usable {
            return Err(Error::DeviceUnavailable {
                port: port.to_string(),
                user: username.to_string(),
            });
        }

        let now = Utc::now();
        self.store
            .put_grant(Grant {
                username: username.to_string(),
                port: port.to_string(),
                granted_at: now,
                expires_at,
            })
            .await?;
        self.refresh_assignment(port, now).await?;
        self.log_action(username, format!("Granted {}", port), true, None)
            .await;
        Ok(())
    }

    /// Revokes a grant. Returns false if there was none.
    pub async fn revoke(&self, username: &str, port: &str) -> Result<bool> {
        let removed = self.store.remove_grant(username, port).await?;
        if removed {
            self.refresh_assignment(port, Utc::now()).await?;
            self.log_action(username, format!("Revoked {}", port), true, None)
                .await;
        }
        Ok(removed)
    }

    /// Deletes every grant that has expired by `now`.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<Vec<Grant>> {
        let expired: Vec<Grant> = self
            .store
            .grants()
            .await?
            .into_iter()
            .filter(|g| !g.is_active(now))
            .collect();

        for grant in &expired {
            self.store
                .remove_grant(&grant.username, &grant.port)
                .await?;
            self.refresh_assignment(&grant.port, now).await?;
            tracing::info!(user = %grant.username, port = %grant.port, "grant expired");
        }

        Ok(expired)
    }

    /// Ports covered by the user's active grants on non-retired devices.
    pub async fn granted_ports(&self, username: &str) -> Result<BTreeSet<String>> {
        let now = Utc::now();
        let mut ports = BTreeSet::new();
        for grant in self.store.grants().await? {
            if grant.username != username || !grant.is_active(now) {
                continue;
            }
            if let Some(device) = self.store.device(&grant.port).await? {
                if device.status != DeviceStatus::Maintenance {
                    ports.insert(grant.port);
                }
            }
        }
        Ok(ports)
    }

    /// The required device set: granted ports that are physically present.
    pub async fn required_ports(
        &self,
        username: &str,
        present: &BTreeSet<String>,
    ) -> Result<BTreeSet<String>> {
        Ok(self
            .granted_ports(username)
            .await?
            .intersection(present)
            .cloned()
            .collect())
    }

    /// Fails with [`Error::DeviceUnavailable`] unless `port` is present and granted.
    pub async fn check_access(
        &self,
        username: &str,
        port: &str,
        present: &BTreeSet<String>,
    ) -> Result<()> {
        if self.required_ports(username, present).await?.contains(port) {
            Ok(())
        } else {
            Err(Error::DeviceUnavailable {
                port: port.to_string(),
                user: username.to_string(),
            })
        }
    }

    /// Ports the user can pick from, with labels and board suggestions.
    pub async fn available_ports(
        &self,
        username: &str,
        present: &BTreeSet<String>,
    ) -> Result<Vec<PortListing>> {
        let mut listings = Vec::new();
        for port in self.required_ports(username, present).await? {
            let (label, kind) = match self.store.device(&port).await? {
                Some(device) => (device.tag, device.kind),
                None => {
                    let class = classify(&port, None, None);
                    (class.tag, class.kind)
                }
            };
            listings.push(PortListing {
                boards: board_profiles(&kind),
                port,
                label,
                kind,
            });
        }
        Ok(listings)
    }

    /// Appends to the user's action history. Failures are logged, not returned.
    pub async fn log_action(
        &self,
        username: &str,
        action: impl Into<String>,
        success: bool,
        details: Option<serde_json::Value>,
    ) {
        let record = ActionRecord {
            username: username.to_string(),
            action: action.into(),
            success,
            details,
            at: Utc::now(),
        };
        if let Err(e) = self.store.append_action(record).await {
            tracing::error!(user = %username, error = %e, "failed to record action");
        }
    }

    /// Recomputes status and `in_use_by` of a port from its active grants.
    async fn refresh_assignment(&self, port: &str, now: DateTime<Utc>) -> Result<()> {
        let Some(mut device) = self.store.device(port).await? else {
            return Ok(());
        };

        if device.status == DeviceStatus::Maintenance {
            device.in_use_by = None;
        } else {
            let holder = self
                .store
                .grants()
                .await?
                .into_iter()
                .filter(|g| g.port == port && g.is_active(now))
                .min_by_key(|g| g.granted_at)
                .map(|g| g.username);
            device.status = if holder.is_some() {
                DeviceStatus::InUse
            } else {
                DeviceStatus::Available
            };
            device.in_use_by = holder;
        }

        self.store.upsert_device(device).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ports(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|p| p.to_string()).collect()
    }

    async fn registry_with_alice() -> (DeviceRegistry, Arc<StateStore>) {
        let store = Arc::new(StateStore::in_memory());
        store.create_user("alice").await.unwrap();
        let registry = DeviceRegistry::new(store.clone());
        registry
            .reconcile_present(&ports(&["/dev/ttyUSB0", "/dev/ttyACM0"]))
            .await
            .unwrap();
        (registry, store)
    }

    #[tokio::test]
    async fn reconcile_inserts_and_retires() {
        let (registry, store) = registry_with_alice().await;
        assert_eq!(store.devices().await.unwrap().len(), 2);

        let diff = registry
            .reconcile_present(&ports(&["/dev/ttyUSB0"]))
            .await
            .unwrap();
        assert_eq!(diff.retired, vec!["/dev/ttyACM0".to_string()]);
        let acm = store.device("/dev/ttyACM0").await.unwrap().unwrap();
        assert_eq!(acm.status, DeviceStatus::Maintenance);

        let diff = registry
            .reconcile_present(&ports(&["/dev/ttyUSB0", "/dev/ttyACM0"]))
            .await
            .unwrap();
        assert_eq!(diff.reactivated, vec!["/dev/ttyACM0".to_string()]);
    }

    #[tokio::test]
    async fn reconcile_without_change_writes_nothing() {
        let (registry, store) = registry_with_alice().await;
        let rev = store.revision();
        let diff = registry
            .reconcile_present(&ports(&["/dev/ttyUSB0", "/dev/ttyACM0"]))
            .await
            .unwrap();
        assert!(diff.is_empty());
        assert_eq!(store.revision(), rev);
    }

    #[tokio::test]
    async fn grant_marks_device_in_use_and_revoke_frees_it() {
        let (registry, store) = registry_with_alice().await;
        registry.grant("alice", "/dev/ttyUSB0", None).await.unwrap();
        let dev = store.device("/dev/ttyUSB0").await.unwrap().unwrap();
        assert_eq!(dev.status, DeviceStatus::InUse);
        assert_eq!(dev.in_use_by.as_deref(), Some("alice"));

        assert!(registry.revoke("alice", "/dev/ttyUSB0").await.unwrap());
        let dev = store.device("/dev/ttyUSB0").await.unwrap().unwrap();
        assert_eq!(dev.status, DeviceStatus::Available);
        assert!(dev.in_use_by.is_none());
    }

    #[tokio::test]
    async fn grant_on_retired_device_is_rejected() {
        let (registry, _store) = registry_with_alice().await;
        registry
            .reconcile_present(&ports(&["/dev/ttyUSB0"]))
            .await
            .unwrap();
        let err = registry
            .grant("alice", "/dev/ttyACM0", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeviceUnavailable { .. }));
    }

    #[tokio::test]
    async fn required_ports_intersect_present_set() {
        let (registry, _store) = registry_with_alice().await;
        registry.grant("alice", "/dev/ttyUSB0", None).await.unwrap();
        registry.grant("alice", "/dev/ttyACM0", None).await.unwrap();

        let required = registry
            .required_ports("alice", &ports(&["/dev/ttyUSB0"]))
            .await
            .unwrap();
        assert_eq!(required, ports(&["/dev/ttyUSB0"]));

        assert!(registry
            .check_access("alice", "/dev/ttyACM0", &ports(&["/dev/ttyUSB0"]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn expired_grants_are_swept() {
        let (registry, store) = registry_with_alice().await;
        registry
            .grant(
                "alice",
                "/dev/ttyUSB0",
                Some(Utc::now() + Duration::minutes(5)),
            )
            .await
            .unwrap();

        assert!(registry.sweep_expired(Utc::now()).await.unwrap().is_empty());
        let swept = registry
            .sweep_expired(Utc::now() + Duration::minutes(10))
            .await
            .unwrap();
        assert_eq!(swept.len(), 1);
        let dev = store.device("/dev/ttyUSB0").await.unwrap().unwrap();
        assert_eq!(dev.status, DeviceStatus::Available);
    }

    #[tokio::test]
    async fn remove_event_clears_assignment_and_add_restores_it() {
        let (registry, store) = registry_with_alice().await;
        registry.grant("alice", "/dev/ttyUSB0", None).await.unwrap();

        let remove = DeviceEvent::parse("remove ttyUSB0").unwrap();
        let diff = registry.apply_event(&remove).await.unwrap();
        assert_eq!(diff.retired.len(), 1);
        let dev = store.device("/dev/ttyUSB0").await.unwrap().unwrap();
        assert_eq!(dev.status, DeviceStatus::Maintenance);
        assert!(dev.in_use_by.is_none());

        let add = DeviceEvent::parse("add ttyUSB0 10c4 ea60").unwrap();
        registry.apply_event(&add).await.unwrap();
        let dev = store.device("/dev/ttyUSB0").await.unwrap().unwrap();
        assert_eq!(dev.status, DeviceStatus::InUse);
        assert_eq!(dev.in_use_by.as_deref(), Some("alice"));
        assert_eq!(dev.tag, "USB-UART-CP2102-ttyUSB0");
    }

    #[tokio::test]
    async fn available_ports_carry_board_suggestions() {
        let (registry, _store) = registry_with_alice().await;
        registry.grant("alice", "/dev/ttyACM0", None).await.unwrap();
        let listings = registry
            .available_ports("alice", &ports(&["/dev/ttyUSB0", "/dev/ttyACM0"]))
            .await
            .unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].label, "Arduino-Uno-ttyACM0");
        assert!(!listings[0].boards.is_empty());
    }
}
