//! Configuration loading and validation.
//!
//! Configuration is read from a TOML file. Every field has a default, so a
//! missing file or an empty section is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::RetryPolicy;
use crate::error::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub toolchain: ToolchainConfig,
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub rescan: RescanConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl Config {
    /// Loads configuration from `path`, returning defaults if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = ?path, "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("failed to parse {}: {}", path.display(), e)))
    }

    /// Parses configuration from TOML text.
    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

/// Sandbox container settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Container runtime CLI binary.
    #[serde(default = "default_runtime_bin")]
    pub runtime_bin: String,
    /// Image every sandbox is created from.
    #[serde(default = "default_image")]
    pub image: String,
    /// Host directory holding one persistent data directory per user.
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    /// Shared toolchain assets mounted read-write into every sandbox.
    #[serde(default)]
    pub toolchain_dir: Option<PathBuf>,
    /// Mount point of the shared toolchain inside the sandbox.
    #[serde(default = "default_toolchain_mount")]
    pub toolchain_mount: String,
    /// Inclusive range for management port allocation.
    #[serde(default = "default_port_range")]
    pub port_range: (u16, u16),
    /// Timeout for a single runtime CLI call, in seconds.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Readiness probe attempts after creation.
    #[serde(default = "default_ready_attempts")]
    pub ready_attempts: u32,
    /// Initial delay between readiness probes, in milliseconds.
    #[serde(default = "default_ready_delay_ms")]
    pub ready_delay_ms: u64,
    /// Maximum delay between readiness probes, in milliseconds.
    #[serde(default = "default_ready_max_delay_ms")]
    pub ready_max_delay_ms: u64,
}

fn default_runtime_bin() -> String {
    "docker".to_string()
}

fn default_image() -> String {
    "devbench-env:latest".to_string()
}

fn default_data_root() -> PathBuf {
    PathBuf::from("/var/lib/devbench/users")
}

fn default_toolchain_mount() -> String {
    "/root/.arduino15".to_string()
}

fn default_port_range() -> (u16, u16) {
    (2200, 2299)
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_ready_attempts() -> u32 {
    30
}

fn default_ready_delay_ms() -> u64 {
    250
}

fn default_ready_max_delay_ms() -> u64 {
    2000
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            runtime_bin: default_runtime_bin(),
            image: default_image(),
            data_root: default_data_root(),
            toolchain_dir: None,
            toolchain_mount: default_toolchain_mount(),
            port_range: default_port_range(),
            command_timeout_secs: default_command_timeout_secs(),
            ready_attempts: default_ready_attempts(),
            ready_delay_ms: default_ready_delay_ms(),
            ready_max_delay_ms: default_ready_max_delay_ms(),
        }
    }
}

impl SandboxConfig {
    /// Timeout for a single runtime CLI call.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Retry budget for the post-creation readiness wait.
    pub fn ready_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.ready_attempts,
            Duration::from_millis(self.ready_delay_ms),
            Duration::from_millis(self.ready_max_delay_ms),
        )
    }
}

/// Remote session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Host on which management ports are published.
    #[serde(default = "default_host")]
    pub host: String,
    /// Internal credential shared by every sandbox's OS user.
    #[serde(default = "default_password")]
    pub password: String,
    /// OpenSSH client binary.
    #[serde(default = "default_ssh_bin")]
    pub ssh_bin: String,
    /// Password helper binary.
    #[serde(default = "default_sshpass_bin")]
    pub sshpass_bin: String,
    /// Directory for control-master sockets.
    #[serde(default = "default_control_dir")]
    pub control_dir: PathBuf,
    /// Connect attempts before giving up.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Timeout for one connect attempt, in seconds.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_password() -> String {
    "devbench".to_string()
}

fn default_ssh_bin() -> String {
    "ssh".to_string()
}

fn default_sshpass_bin() -> String {
    "sshpass".to_string()
}

fn default_control_dir() -> PathBuf {
    std::env::temp_dir().join("devbench-ssh")
}

fn default_connect_attempts() -> u32 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    5
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            password: default_password(),
            ssh_bin: default_ssh_bin(),
            sshpass_bin: default_sshpass_bin(),
            control_dir: default_control_dir(),
            connect_attempts: default_connect_attempts(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl SessionConfig {
    /// Retry budget for opening a session.
    pub fn connect_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.connect_attempts,
            Duration::from_millis(500),
            Duration::from_secs(2),
        )
    }
}

/// Build and flash tool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainConfig {
    /// Build/flash CLI available inside every sandbox.
    #[serde(default = "default_tool_cli")]
    pub cli: String,
}

fn default_tool_cli() -> String {
    "arduino-cli".to_string()
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            cli: default_tool_cli(),
        }
    }
}

/// Serial relay settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    #[serde(default = "default_baud")]
    pub default_baud: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
}

fn default_baud() -> u32 {
    9600
}

fn default_poll_interval_ms() -> u64 {
    20
}

fn default_flush_interval_ms() -> u64 {
    100
}

fn default_read_chunk() -> usize {
    1024
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            default_baud: default_baud(),
            poll_interval_ms: default_poll_interval_ms(),
            flush_interval_ms: default_flush_interval_ms(),
            read_chunk: default_read_chunk(),
        }
    }
}

/// Hardware rescan settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescanConfig {
    /// Periodic reconciliation interval, in seconds.
    #[serde(default = "default_rescan_interval_secs")]
    pub interval_secs: u64,
    /// Window within which a burst of triggers collapses into one pass.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// File whose appearance signals a physical device change.
    #[serde(default = "default_trigger_file")]
    pub trigger_file: PathBuf,
    /// How often the trigger file is checked, in milliseconds.
    #[serde(default = "default_trigger_poll_ms")]
    pub trigger_poll_ms: u64,
    /// Directory scanned for serial device nodes.
    #[serde(default = "default_dev_dir")]
    pub dev_dir: PathBuf,
    /// Device node name prefixes treated as serial hardware.
    #[serde(default = "default_port_prefixes")]
    pub port_prefixes: Vec<String>,
}

fn default_rescan_interval_secs() -> u64 {
    60
}

fn default_debounce_ms() -> u64 {
    2000
}

fn default_trigger_file() -> PathBuf {
    PathBuf::from("/tmp/usb_event_trigger")
}

fn default_trigger_poll_ms() -> u64 {
    500
}

fn default_dev_dir() -> PathBuf {
    PathBuf::from("/dev")
}

fn default_port_prefixes() -> Vec<String> {
    vec!["ttyUSB".to_string(), "ttyACM".to_string()]
}

impl Default for RescanConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_rescan_interval_secs(),
            debounce_ms: default_debounce_ms(),
            trigger_file: default_trigger_file(),
            trigger_poll_ms: default_trigger_poll_ms(),
            dev_dir: default_dev_dir(),
            port_prefixes: default_port_prefixes(),
        }
    }
}

impl RescanConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// State store settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// JSON snapshot file. When unset, state lives in memory only.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Validation result containing all found issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation errors (fatal).
    pub errors: Vec<String>,
    /// List of validation warnings (non-fatal).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Adds an error to the result.
    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Adds a warning to the result.
    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    /// Merges another validation result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Converts to a Result, failing if there are errors.
    pub fn into_result(self) -> Result<Vec<String>> {
        if self.is_valid() {
            Ok(self.warnings)
        } else {
            Err(Error::Config(self.errors.join("; ")))
        }
    }
}

/// Trait for validatable configuration types.
pub trait Validate {
    /// Validates the configuration and returns any issues found.
    fn validate(&self) -> ValidationResult;
}

impl Validate for SandboxConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        let (low, high) = self.port_range;
        if low == 0 || low > high {
            result.add_error(format!("port_range ({}, {}) is empty or invalid", low, high));
        }
        if self.image.trim().is_empty() {
            result.add_error("image cannot be empty");
        }
        if self.ready_attempts == 0 {
            result.add_error("ready_attempts must be at least 1");
        }
        if self.toolchain_dir.is_none() {
            result.add_warning("toolchain_dir is not set; sandboxes will not share toolchain assets");
        }
        if self.command_timeout_secs < 5 {
            result.add_warning("command_timeout_secs under 5 may abort container creation");
        }

        result
    }
}

impl Validate for SerialConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.poll_interval_ms == 0 {
            result.add_error("poll_interval_ms must be positive");
        }
        if self.flush_interval_ms < self.poll_interval_ms {
            result.add_warning("flush_interval_ms below poll_interval_ms disables batching");
        }
        if self.read_chunk == 0 {
            result.add_error("read_chunk must be positive");
        }

        result
    }
}

impl Validate for RescanConfig {
    fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.port_prefixes.is_empty() {
            result.add_error("port_prefixes cannot be empty");
        }
        if self.interval_secs == 0 {
            result.add_error("interval_secs must be positive");
        }
        if self.debounce_ms > self.interval_secs * 1000 {
            result.add_warning("debounce window is longer than the rescan interval");
        }

        result
    }
}

impl Validate for Config {
    fn validate(&self) -> ValidationResult {
        let mut result = self.sandbox.validate();
        result.merge(self.serial.validate());
        result.merge(self.rescan.validate());

        if self.session.password.is_empty() {
            result.add_error("session password cannot be empty");
        }
        if self.store.path.is_none() {
            result.add_warning("store.path is not set; grants and ports are lost on restart");
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.sandbox.runtime_bin, "docker");
        assert_eq!(config.sandbox.port_range, (2200, 2299));
        assert_eq!(config.serial.flush_interval_ms, 100);
        assert_eq!(config.rescan.port_prefixes, vec!["ttyUSB", "ttyACM"]);
        assert!(config.store.path.is_none());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config = Config::from_toml(
            r#"
[sandbox]
image = "lab-env:v3"
port_range = [3000, 3010]

[serial]
default_baud = 115200
"#,
        )
        .unwrap();
        assert_eq!(config.sandbox.image, "lab-env:v3");
        assert_eq!(config.sandbox.port_range, (3000, 3010));
        assert_eq!(config.sandbox.runtime_bin, "docker");
        assert_eq!(config.serial.default_baud, 115200);
        assert_eq!(config.serial.poll_interval_ms, 20);
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.toolchain.cli, "arduino-cli");
    }

    #[test]
    fn load_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devbench.toml");
        std::fs::write(&path, "not valid toml {{{{").unwrap();
        assert!(matches!(Config::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn inverted_port_range_is_an_error() {
        let sandbox = SandboxConfig {
            port_range: (2300, 2200),
            ..SandboxConfig::default()
        };
        let result = sandbox.validate();
        assert!(!result.is_valid());
        assert!(result.into_result().is_err());
    }

    #[test]
    fn defaults_are_valid_with_warnings() {
        let result = Config::default().validate();
        assert!(result.is_valid());
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("store.path")));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let serial = SerialConfig {
            poll_interval_ms: 0,
            ..SerialConfig::default()
        };
        assert!(!serial.validate().is_valid());
    }
}
