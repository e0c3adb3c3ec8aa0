//! Management port allocation.

use std::collections::BTreeSet;
use std::net::TcpListener;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::registry::Store;

/// Hands out management ports from an inclusive range.
///
/// Clones share one claim lock, so concurrent allocations for different
/// users never pick the same port.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    low: u16,
    high: u16,
    claim: Arc<Mutex<()>>,
}

impl PortAllocator {
    pub fn new((low, high): (u16, u16)) -> Self {
        Self {
            low,
            high,
            claim: Arc::new(Mutex::new(())),
        }
    }

    /// Returns the user's persisted port, or the first free one in range.
    ///
    /// A port is free when no other user holds it and nothing on the host is
    /// bound to it. The chosen port is persisted before returning.
    pub async fn allocate(&self, store: &dyn Store, username: &str) -> Result<u16> {
        let user = store
            .user(username)
            .await?
            .ok_or_else(|| Error::UnknownUser(username.to_string()))?;
        if let Some(port) = user.management_port {
            return Ok(port);
        }

        // Held from reading the taken set until the choice is persisted.
        let _claim = self.claim.lock().await;
        if let Some(port) = store.user(username).await?.and_then(|u| u.management_port) {
            return Ok(port);
        }

        let taken: BTreeSet<u16> = store
            .users()
            .await?
            .into_iter()
            .filter(|u| u.username != username)
            .filter_map(|u| u.management_port)
            .collect();

        let port = (self.low..=self.high)
            .find(|p| !taken.contains(p) && host_port_free(*p))
            .ok_or_else(|| Error::Provisioning {
                user: username.to_string(),
                reason: format!("no free management port in {}-{}", self.low, self.high),
            })?;

        store.set_management_port(username, Some(port)).await?;
        tracing::info!(user = %username, port, "allocated management port");
        Ok(port)
    }
}

fn host_port_free(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}
