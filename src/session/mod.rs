//! Remote session bridge.
//!
//! Opens authenticated sessions into a user's sandbox for file operations
//! and interactive shells. Every path a caller supplies is resolved against
//! the sandbox home first; escapes and reserved files are refused and
//! recorded as security events.

pub mod paths;
mod ssh;

pub use ssh::{SshConnector, SshSession, SshShell};

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::backoff::RetryPolicy;
use crate::error::{Error, Result};
use crate::naming::UserIdentity;
use crate::process::ExecOutput;
use crate::registry::DeviceRegistry;

use paths::{is_reserved, resolve, sanitize_filename, shell_quote, validate_name};

/// Address and credentials of a sandbox's session service.
#[derive(Debug, Clone)]
pub struct SessionTarget {
    pub host: String,
    pub port: u16,
    /// OS user inside the sandbox (the safe name).
    pub username: String,
    pub password: String,
}

/// Establishes sessions.
#[async_trait]
pub trait SessionConnector: Send + Sync {
    async fn connect(&self, target: &SessionTarget) -> Result<Box<dyn RemoteSession>>;
}

/// An open session into a sandbox.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Runs a shell command line.
    async fn exec(&self, command: &str) -> Result<ExecOutput>;

    /// Runs a shell command line with `input` on its stdin.
    async fn exec_with_input(&self, command: &str, input: &[u8]) -> Result<ExecOutput>;

    /// Starts an interactive shell.
    async fn open_shell(&self) -> Result<Box<dyn ShellChannel>>;

    async fn close(&self) -> Result<()>;
}

/// Byte stream of an interactive shell.
#[async_trait]
pub trait ShellChannel: Send + Sync {
    /// Reads available output. Returns 0 once the shell has exited.
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    async fn write(&self, data: &[u8]) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirEntry {
    pub name: String,
    /// Path relative to the sandbox home.
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    /// Modification time, seconds since the epoch.
    pub modified: f64,
}

/// Opens sessions with bounded retries.
#[derive(Clone)]
pub struct SessionBridge {
    registry: DeviceRegistry,
    connector: Arc<dyn SessionConnector>,
    host: String,
    password: String,
    policy: RetryPolicy,
}

impl SessionBridge {
    pub fn new(
        registry: DeviceRegistry,
        connector: Arc<dyn SessionConnector>,
        host: impl Into<String>,
        password: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            connector,
            host: host.into(),
            password: password.into(),
            policy,
        }
    }

    /// Opens a session into the user's sandbox.
    ///
    /// Fails with [`Error::Connection`] once the retry budget is spent.
    pub async fn open_session(&self, username: &str) -> Result<SessionHandle> {
        let user = self.registry.user(username).await?;
        let identity = UserIdentity::new(user.username.clone())?;
        let port = user.management_port.ok_or_else(|| Error::Connection {
            user: username.to_string(),
            reason: "sandbox has no management port".to_string(),
        })?;

        let target = SessionTarget {
            host: self.host.clone(),
            port,
            username: identity.safe().to_string(),
            password: self.password.clone(),
        };

        let session = self
            .policy
            .retry(|attempt| {
                tracing::debug!(user = %username, port, attempt, "connecting to sandbox");
                self.connector.connect(&target)
            })
            .await
            .map_err(|e| Error::Connection {
                user: username.to_string(),
                reason: e.to_string(),
            })?;

        Ok(SessionHandle {
            session: Some(session),
            home: identity.sandbox_home(),
            identity,
            registry: self.registry.clone(),
        })
    }
}

/// A live session scoped to one user's home.
///
/// Call [`SessionHandle::close`] when done. A handle dropped while still open
/// is closed on a background task.
pub struct SessionHandle {
    session: Option<Box<dyn RemoteSession>>,
    identity: UserIdentity,
    home: PathBuf,
    registry: DeviceRegistry,
}

impl SessionHandle {
    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    fn session(&self) -> Result<&dyn RemoteSession> {
        self.session
            .as_deref()
            .ok_or_else(|| Error::Remote("session is closed".to_string()))
    }

    /// Resolves a caller path, recording violations as security events.
    async fn contain(&self, requested: &str) -> Result<PathBuf> {
        match resolve(&self.home, requested) {
            Ok(path) => Ok(path),
            Err(e) => {
                tracing::warn!(
                    security = true,
                    user = %self.identity.raw(),
                    path = %requested,
                    error = %e,
                    "path violation"
                );
                self.registry
                    .log_action(
                        self.identity.raw(),
                        "Path violation",
                        false,
                        Some(serde_json::json!({ "path": requested })),
                    )
                    .await;
                Err(e)
            }
        }
    }

    async fn run(&self, command: &str) -> Result<ExecOutput> {
        let out = self.session()?.exec(command).await?;
        if out.success() {
            return Ok(out);
        }
        if out.stderr.contains("No such file") {
            return Err(Error::NotFound(out.stderr.trim().to_string()));
        }
        Err(Error::Remote(out.stderr.trim().to_string()))
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.home)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Lists a directory, directories first, hiding dotfiles and reserved entries.
    pub async fn list_dir(&self, dir: &str) -> Result<Vec<DirEntry>> {
        let path = self.contain(dir).await?;
        let command = format!(
            "find {} -mindepth 1 -maxdepth 1 -printf '%y\\t%s\\t%T@\\t%f\\n'",
            shell_quote(&path.to_string_lossy())
        );
        let out = self.run(&command).await?;
        let mut entries = parse_listing(&out.stdout_text(), &path)
            .into_iter()
            .map(|mut e| {
                e.path = self.relative(Path::new(&e.path));
                e
            })
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
        Ok(entries)
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let path = self.contain(path).await?;
        let out = self
            .run(&format!("cat -- {}", shell_quote(&path.to_string_lossy())))
            .await?;
        Ok(out.stdout)
    }

    /// Writes `content`, creating parent directories as needed.
    pub async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = self.contain(path).await?;
        let parent = path.parent().unwrap_or(&self.home);
        let command = format!(
            "mkdir -p {} && cat > {}",
            shell_quote(&parent.to_string_lossy()),
            shell_quote(&path.to_string_lossy())
        );
        let out = self.session()?.exec_with_input(&command, content).await?;
        if !out.success() {
            return Err(Error::Remote(out.stderr.trim().to_string()));
        }
        self.record("Write file", &path).await;
        Ok(())
    }

    pub async fn create_dir(&self, path: &str) -> Result<()> {
        let path = self.contain(path).await?;
        self.run(&format!("mkdir -p -- {}", shell_quote(&path.to_string_lossy())))
            .await?;
        self.record("Create directory", &path).await;
        Ok(())
    }

    /// Renames an entry within its directory. `new_name` must be a bare name.
    pub async fn rename(&self, path: &str, new_name: &str) -> Result<String> {
        let source = self.contain(path).await?;
        if let Err(e) = validate_name(new_name) {
            tracing::warn!(security = true, user = %self.identity.raw(), name = %new_name, "rejected rename target");
            return Err(e);
        }
        if source == self.home {
            return Err(Error::PathViolation {
                path: path.to_string(),
                reason: "the home directory cannot be renamed".to_string(),
            });
        }
        let parent = source.parent().unwrap_or(&self.home);
        let target = self
            .contain(&parent.join(new_name).to_string_lossy())
            .await?;
        self.run(&format!(
            "mv -- {} {}",
            shell_quote(&source.to_string_lossy()),
            shell_quote(&target.to_string_lossy())
        ))
        .await?;
        self.record("Rename", &target).await;
        Ok(self.relative(&target))
    }

    pub async fn remove(&self, path: &str) -> Result<()> {
        let path = self.contain(path).await?;
        if path == self.home {
            return Err(Error::PathViolation {
                path: path.to_string_lossy().into_owned(),
                reason: "the home directory cannot be removed".to_string(),
            });
        }
        self.run(&format!("rm -rf -- {}", shell_quote(&path.to_string_lossy())))
            .await?;
        self.record("Delete", &path).await;
        Ok(())
    }

    /// Stores an uploaded file under `dir` with a sanitised name.
    ///
    /// Returns the stored path relative to the home.
    pub async fn upload(&self, dir: &str, filename: &str, content: &[u8]) -> Result<String> {
        let name = sanitize_filename(filename)?;
        let dir = self.contain(dir).await?;
        let target = dir.join(&name);
        let relative = self.relative(&target);
        self.write_file(&relative, content).await?;
        Ok(relative)
    }

    pub async fn open_shell(&self) -> Result<Box<dyn ShellChannel>> {
        let shell = self.session()?.open_shell().await?;
        self.registry
            .log_action(self.identity.raw(), "Terminal connected", true, None)
            .await;
        Ok(shell)
    }

    /// Closes the session. Closing twice is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        match self.session.take() {
            Some(session) => session.close().await,
            None => Ok(()),
        }
    }

    async fn record(&self, action: &str, path: &Path) {
        self.registry
            .log_action(
                self.identity.raw(),
                action,
                true,
                Some(serde_json::json!({ "path": self.relative(path) })),
            )
            .await;
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("user", &self.identity.raw())
            .field("home", &self.home)
            .field("open", &self.session.is_some())
            .finish()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let user = self.identity.raw().to_string();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = session.close().await {
                        tracing::error!(user = %user, error = %e, "failed to close session on drop");
                    }
                });
            }
            Err(_) => tracing::error!(user = %user, "session dropped outside a runtime, not closed"),
        }
    }
}

/// Parses `find -printf '%y\t%s\t%T@\t%f\n'` output.
///
/// Hidden and reserved entries are dropped. Returned paths are absolute.
fn parse_listing(output: &str, dir: &Path) -> Vec<DirEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(4, '\t');
            let kind = fields.next()?;
            let size = fields.next()?.parse().ok()?;
            let modified = fields.next()?.parse().ok()?;
            let name = fields.next()?.to_string();
            if name.starts_with('.') || is_reserved(&name) {
                return None;
            }
            Some(DirEntry {
                path: dir.join(&name).to_string_lossy().into_owned(),
                is_dir: kind == "d",
                name,
                size,
                modified,
            })
        })
        .collect()
}
