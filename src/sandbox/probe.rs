//! Session service readiness checks.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::error::{Error, Result};

/// Checks whether a sandbox's session service accepts connections.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self, host: &str, port: u16) -> Result<()>;
}

/// Connects over TCP and waits for the SSH identification banner.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

fn unreachable(host: &str, port: u16, reason: impl Into<String>) -> Error {
    Error::Connection {
        user: format!("{}:{}", host, port),
        reason: reason.into(),
    }
}

#[async_trait]
impl ReadinessProbe for TcpProbe {
    async fn probe(&self, host: &str, port: u16) -> Result<()> {
        let mut stream = tokio::time::timeout(self.timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| unreachable(host, port, "connect timed out"))?
            .map_err(|e| unreachable(host, port, e.to_string()))?;

        let mut banner = [0u8; 4];
        tokio::time::timeout(self.timeout, stream.read_exact(&mut banner))
            .await
            .map_err(|_| unreachable(host, port, "no banner"))?
            .map_err(|e| unreachable(host, port, e.to_string()))?;

        if &banner == b"SSH-" {
            Ok(())
        } else {
            Err(unreachable(host, port, "unexpected banner"))
        }
    }
}
