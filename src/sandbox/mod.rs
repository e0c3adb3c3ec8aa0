//! Per-user sandbox containers.
//!
//! [`SandboxManager`] drives a [`ContainerRuntime`] so that each user's
//! container carries exactly the devices the registry grants them.

mod bootstrap;
mod manager;
mod ports;
mod probe;
mod reconcile;
mod runtime;

pub use bootstrap::{Bootstrap, CONTAINER_SCRIPT, SCRIPT_NAME};
pub use manager::{SandboxManager, SessionEndpoint};
pub use ports::PortAllocator;
pub use probe::{ReadinessProbe, TcpProbe};
pub use reconcile::{decide, RebuildReason, Reconciliation};
pub use runtime::{parse_inspect, ContainerInfo, ContainerRuntime, ContainerSpec, DockerCli, VolumeMount};
