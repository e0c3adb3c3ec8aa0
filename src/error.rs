//! Error types for the devbench sandbox core.

use thiserror::Error;

use crate::pipeline::Diagnostics;

/// Top-level error type for sandbox, session, pipeline and relay operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The sandbox could not be created or started.
    #[error("failed to provision sandbox for {user}: {reason}")]
    Provisioning { user: String, reason: String },

    /// The sandbox session service could not be reached.
    #[error("session service unreachable for {user}: {reason}")]
    Connection { user: String, reason: String },

    /// The build tool exited non-zero.
    #[error("compile failed with exit code {exit_code} ({} errors)", diagnostics.errors.len())]
    CompileFailure {
        exit_code: i32,
        diagnostics: Diagnostics,
    },

    /// The flasher exited non-zero.
    #[error("flash to {port} failed with exit code {exit_code}")]
    FlashFailure {
        port: String,
        exit_code: i32,
        hints: Vec<String>,
    },

    /// The port is not physically present or not granted to the user.
    #[error("device {port} is not available to {user}")]
    DeviceUnavailable { port: String, user: String },

    /// A path would escape the sandbox home or names a reserved file.
    #[error("path '{path}' is not allowed: {reason}")]
    PathViolation { path: String, reason: String },

    /// Two raw identifiers normalise to the same safe name.
    #[error("identifier '{raw}' collides with existing user '{existing}' (both map to '{safe}')")]
    NameCollision {
        raw: String,
        existing: String,
        safe: String,
    },

    /// The identifier is empty or otherwise unusable.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// No such user in the store.
    #[error("unknown user: {0}")]
    UnknownUser(String),

    /// A remote file or directory does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The container runtime CLI failed.
    #[error("container runtime error: {0}")]
    Runtime(String),

    /// A command inside a session failed.
    #[error("remote command failed: {0}")]
    Remote(String),

    /// The state store could not be read or written.
    #[error("state store error: {0}")]
    Store(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Serial device error.
    #[error("serial error on {port}: {reason}")]
    Serial { port: String, reason: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true for infrastructure errors that a caller may retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Connection { .. } | Error::Provisioning { .. } | Error::Runtime(_)
        )
    }
}

/// Result type alias for devbench operations.
pub type Result<T> = std::result::Result<T, Error>;
