//! State store seam and its in-process implementation.
//!
//! The relational store of a full deployment sits behind [`Store`]. The
//! bundled [`StateStore`] keeps everything in memory and, when given a path,
//! writes a JSON snapshot after every mutation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};
use crate::naming::UserIdentity;

use super::model::{ActionRecord, Device, Grant, UserRecord};

/// Persistence operations needed by the registry and lifecycle manager.
#[async_trait]
pub trait Store: Send + Sync {
    /// Creates a user, rejecting identifiers whose safe name is taken.
    async fn create_user(&self, username: &str) -> Result<UserRecord>;
    async fn user(&self, username: &str) -> Result<Option<UserRecord>>;
    async fn user_by_safe_name(&self, safe_name: &str) -> Result<Option<UserRecord>>;
    async fn users(&self) -> Result<Vec<UserRecord>>;
    /// Deletes a user and all of their grants.
    async fn delete_user(&self, username: &str) -> Result<bool>;
    async fn set_management_port(&self, username: &str, port: Option<u16>) -> Result<()>;

    async fn devices(&self) -> Result<Vec<Device>>;
    async fn device(&self, port: &str) -> Result<Option<Device>>;
    async fn upsert_device(&self, device: Device) -> Result<()>;

    async fn grants(&self) -> Result<Vec<Grant>>;
    /// Inserts a grant, replacing any existing grant for the same user and port.
    async fn put_grant(&self, grant: Grant) -> Result<()>;
    async fn remove_grant(&self, username: &str, port: &str) -> Result<bool>;

    async fn append_action(&self, record: ActionRecord) -> Result<()>;
    async fn actions(&self, username: &str) -> Result<Vec<ActionRecord>>;
}

/// Serializable snapshot of the whole store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    pub users: BTreeMap<String, UserRecord>,
    #[serde(default)]
    pub devices: BTreeMap<String, Device>,
    #[serde(default)]
    pub grants: Vec<Grant>,
    #[serde(default)]
    pub actions: Vec<ActionRecord>,
}

/// In-memory store with optional JSON snapshot persistence.
pub struct StateStore {
    state: RwLock<StoreState>,
    path: Option<PathBuf>,
    revision: AtomicU64,
}

impl StateStore {
    /// Creates an empty store that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            path: None,
            revision: AtomicU64::new(0),
        }
    }

    /// Opens a store backed by `path`, loading the snapshot if it exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content).map_err(|e| {
                Error::Store(format!("failed to parse {}: {}", path.display(), e))
            })?
        } else {
            StoreState::default()
        };
        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
            revision: AtomicU64::new(0),
        })
    }

    /// Number of user, device and grant mutations since the store was opened.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Returns a copy of the current state.
    pub async fn snapshot(&self) -> StoreState {
        self.state.read().await.clone()
    }

    fn bump(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
    }

    async fn persist(&self, state: &StoreState) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        write_snapshot(path, state).await
    }
}

async fn write_snapshot(path: &Path, state: &StoreState) -> Result<()> {
    let json = serde_json::to_string_pretty(state)
        .map_err(|e| Error::Store(format!("failed to serialize state: {}", e)))?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl Store for StateStore {
    async fn create_user(&self, username: &str) -> Result<UserRecord> {
        let identity = UserIdentity::new(username)?;
        let mut state = self.state.write().await;

        if state.users.contains_key(username) {
            return Err(Error::Store(format!("user '{}' already exists", username)));
        }
        if let Some(existing) = state
            .users
            .values()
            .find(|u| u.safe_name == identity.safe())
        {
            return Err(Error::NameCollision {
                raw: username.to_string(),
                existing: existing.username.clone(),
                safe: identity.safe().to_string(),
            });
        }

        let record = UserRecord {
            username: username.to_string(),
            safe_name: identity.safe().to_string(),
            management_port: None,
            created_at: Utc::now(),
        };
        state.users.insert(username.to_string(), record.clone());
        self.bump();
        self.persist(&state).await?;
        Ok(record)
    }

    async fn user(&self, username: &str) -> Result<Option<UserRecord>> {
        Ok(self.state.read().await.users.get(username).cloned())
    }

    async fn user_by_safe_name(&self, safe_name: &str) -> Result<Option<UserRecord>> {
        Ok(self
            .state
            .read()
            .await
            .users
            .values()
            .find(|u| u.safe_name == safe_name)
            .cloned())
    }

    async fn users(&self) -> Result<Vec<UserRecord>> {
        Ok(self.state.read().await.users.values().cloned().collect())
    }

    async fn delete_user(&self, username: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.users.remove(username).is_none() {
            return Ok(false);
        }
        state.grants.retain(|g| g.username != username);
        self.bump();
        self.persist(&state).await?;
        Ok(true)
    }

    async fn set_management_port(&self, username: &str, port: Option<u16>) -> Result<()> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(username)
            .ok_or_else(|| Error::UnknownUser(username.to_string()))?;
        if user.management_port == port {
            return Ok(());
        }
        user.management_port = port;
        self.bump();
        self.persist(&state).await
    }

    async fn devices(&self) -> Result<Vec<Device>> {
        Ok(self.state.read().await.devices.values().cloned().collect())
    }

    async fn device(&self, port: &str) -> Result<Option<Device>> {
        Ok(self.state.read().await.devices.get(port).cloned())
    }

    async fn upsert_device(&self, device: Device) -> Result<()> {
        let mut state = self.state.write().await;
        if state.devices.get(&device.port) == Some(&device) {
            return Ok(());
        }
        state.devices.insert(device.port.clone(), device);
        self.bump();
        self.persist(&state).await
    }

    async fn grants(&self) -> Result<Vec<Grant>> {
        Ok(self.state.read().await.grants.clone())
    }

    async fn put_grant(&self, grant: Grant) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.users.contains_key(&grant.username) {
            return Err(Error::UnknownUser(grant.username));
        }
        state
            .grants
            .retain(|g| !(g.username == grant.username && g.port == grant.port));
        state.grants.push(grant);
        self.bump();
        self.persist(&state).await
    }

    async fn remove_grant(&self, username: &str, port: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        let before = state.grants.len();
        state
            .grants
            .retain(|g| !(g.username == username && g.port == port));
        if state.grants.len() == before {
            return Ok(false);
        }
        self.bump();
        self.persist(&state).await?;
        Ok(true)
    }

    async fn append_action(&self, record: ActionRecord) -> Result<()> {
        let mut state = self.state.write().await;
        state.actions.push(record);
        self.persist(&state).await
    }

    async fn actions(&self, username: &str) -> Result<Vec<ActionRecord>> {
        Ok(self
            .state
            .read()
            .await
            .actions
            .iter()
            .filter(|a| a.username == username)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::model::DeviceStatus;

    fn device(port: &str) -> Device {
        Device {
            port: port.to_string(),
            tag: format!("Device-{}", port),
            kind: "Generic Serial".to_string(),
            status: DeviceStatus::Available,
            in_use_by: None,
        }
    }

    #[tokio::test]
    async fn colliding_safe_names_are_rejected() {
        let store = StateStore::in_memory();
        store.create_user("a_b").await.unwrap();
        let err = store.create_user("a.b").await.unwrap_err();
        match err {
            Error::NameCollision { existing, safe, .. } => {
                assert_eq!(existing, "a_b");
                assert_eq!(safe, "a_b");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unchanged_device_upsert_does_not_bump_revision() {
        let store = StateStore::in_memory();
        store.upsert_device(device("/dev/ttyUSB0")).await.unwrap();
        let rev = store.revision();
        store.upsert_device(device("/dev/ttyUSB0")).await.unwrap();
        assert_eq!(store.revision(), rev);
    }

    #[tokio::test]
    async fn deleting_user_cascades_grants() {
        let store = StateStore::in_memory();
        store.create_user("alice").await.unwrap();
        store
            .put_grant(Grant {
                username: "alice".to_string(),
                port: "/dev/ttyUSB0".to_string(),
                granted_at: Utc::now(),
                expires_at: None,
            })
            .await
            .unwrap();
        assert!(store.delete_user("alice").await.unwrap());
        assert!(store.grants().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn grant_for_unknown_user_fails() {
        let store = StateStore::in_memory();
        let err = store
            .put_grant(Grant {
                username: "ghost".to_string(),
                port: "/dev/ttyUSB0".to_string(),
                granted_at: Utc::now(),
                expires_at: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownUser(_)));
    }

    #[tokio::test]
    async fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        {
            let store = StateStore::open(&path).unwrap();
            store.create_user("alice").await.unwrap();
            store
                .set_management_port("alice", Some(2201))
                .await
                .unwrap();
            store.upsert_device(device("/dev/ttyACM0")).await.unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        let alice = store.user("alice").await.unwrap().unwrap();
        assert_eq!(alice.management_port, Some(2201));
        assert!(store.device("/dev/ttyACM0").await.unwrap().is_some());
    }
}
