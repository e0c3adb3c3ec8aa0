//! devbench - shared embedded hardware workbench
//!
//! This library gives each user an isolated sandbox container with exactly the
//! serial devices they were granted, and runs firmware builds, flashes, file
//! sessions and live serial/shell relays against those sandboxes.

pub mod app;
pub mod backoff;
pub mod broker;
pub mod config;
pub mod error;
pub mod locks;
pub mod naming;
pub mod pipeline;
pub mod process;
pub mod registry;
pub mod relay;
pub mod rescan;
pub mod sandbox;
pub mod scanner;
pub mod session;
pub mod subscriber;

pub use app::Workbench;
pub use error::{Error, Result};

pub use backoff::{ExponentialBackoff, RetryPolicy};
pub use broker::DeviceBroker;
pub use config::{Config, Validate, ValidationResult};
pub use naming::{make_safe_name, UserIdentity};
pub use pipeline::{CompileReport, Diagnostics, FlashPipeline, FlashReport, FlashRequest, Stage};
pub use registry::{Device, DeviceRegistry, DeviceStatus, Grant, StateStore, Store, UserRecord};
pub use relay::{RelayRegistry, Source};
pub use rescan::{RescanCoordinator, RescanReport};
pub use sandbox::{ContainerRuntime, SandboxManager};
pub use scanner::{DevScanner, DeviceScanner};
pub use session::{SessionBridge, SessionHandle};
pub use subscriber::{ChannelHub, Event, EventSink, SubscriberId};
