//! Physical serial port discovery.

use std::collections::BTreeSet;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::Result;

/// Source of the set of physically present ports.
#[async_trait]
pub trait DeviceScanner: Send + Sync {
    async fn scan(&self) -> Result<BTreeSet<String>>;
}

/// Scans a device directory for nodes with known serial prefixes.
#[derive(Debug, Clone)]
pub struct DevScanner {
    dir: PathBuf,
    prefixes: Vec<String>,
}

impl DevScanner {
    pub fn new(dir: impl Into<PathBuf>, prefixes: Vec<String>) -> Self {
        Self {
            dir: dir.into(),
            prefixes,
        }
    }
}

#[async_trait]
impl DeviceScanner for DevScanner {
    async fn scan(&self) -> Result<BTreeSet<String>> {
        let mut ports = BTreeSet::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if self.prefixes.iter().any(|p| name.starts_with(p.as_str())) {
                ports.insert(self.dir.join(name.as_ref()).to_string_lossy().into_owned());
            }
        }
        tracing::debug!(count = ports.len(), "scanned serial ports");
        Ok(ports)
    }
}
