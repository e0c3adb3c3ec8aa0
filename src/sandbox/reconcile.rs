//! Rebuild-or-keep decision for a sandbox container.

use std::collections::BTreeSet;
use std::fmt;

use super::runtime::ContainerInfo;

/// Why a sandbox must be destroyed and created again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildReason {
    Absent,
    Stopped { status: String },
    DeviceDrift {
        missing: BTreeSet<String>,
        extra: BTreeSet<String>,
    },
    /// Running with the right devices but the session service never came up.
    Unreachable,
}

impl fmt::Display for RebuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RebuildReason::Absent => write!(f, "absent"),
            RebuildReason::Stopped { status } => write!(f, "not running ({})", status),
            RebuildReason::DeviceDrift { missing, extra } => write!(
                f,
                "device drift (missing {:?}, extra {:?})",
                missing, extra
            ),
            RebuildReason::Unreachable => write!(f, "session service unreachable"),
        }
    }
}

/// Outcome of comparing the desired sandbox with the observed one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    MatchesDesired,
    NeedsRebuild(RebuildReason),
}

/// Decides from a single inspect snapshot whether the container matches.
pub fn decide(desired: &BTreeSet<String>, observed: Option<&ContainerInfo>) -> Reconciliation {
    let Some(info) = observed else {
        return Reconciliation::NeedsRebuild(RebuildReason::Absent);
    };
    if !info.running {
        return Reconciliation::NeedsRebuild(RebuildReason::Stopped {
            status: info.status.clone(),
        });
    }
    if &info.devices != desired {
        return Reconciliation::NeedsRebuild(RebuildReason::DeviceDrift {
            missing: desired.difference(&info.devices).cloned().collect(),
            extra: info.devices.difference(desired).cloned().collect(),
        });
    }
    Reconciliation::MatchesDesired
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn running(devices: &[&str]) -> ContainerInfo {
        ContainerInfo {
            name: "alice-dev".to_string(),
            status: "running".to_string(),
            running: true,
            devices: set(devices),
        }
    }

    #[test]
    fn missing_container_needs_rebuild() {
        assert_eq!(
            decide(&set(&[]), None),
            Reconciliation::NeedsRebuild(RebuildReason::Absent)
        );
    }

    #[test]
    fn stopped_container_needs_rebuild() {
        let mut info = running(&[]);
        info.running = false;
        info.status = "exited".to_string();
        assert!(matches!(
            decide(&set(&[]), Some(&info)),
            Reconciliation::NeedsRebuild(RebuildReason::Stopped { .. })
        ));
    }

    #[test]
    fn equal_device_sets_match() {
        let info = running(&["/dev/ttyUSB0"]);
        assert_eq!(
            decide(&set(&["/dev/ttyUSB0"]), Some(&info)),
            Reconciliation::MatchesDesired
        );
    }

    #[test]
    fn drift_reports_both_directions() {
        let info = running(&["/dev/ttyUSB0"]);
        match decide(&set(&["/dev/ttyACM0"]), Some(&info)) {
            Reconciliation::NeedsRebuild(RebuildReason::DeviceDrift { missing, extra }) => {
                assert_eq!(missing, set(&["/dev/ttyACM0"]));
                assert_eq!(extra, set(&["/dev/ttyUSB0"]));
            }
            other => panic!("unexpected decision: {:?}", other),
        }
    }

    #[test]
    fn revoked_device_is_extra() {
        let info = running(&["/dev/ttyUSB0"]);
        assert!(matches!(
            decide(&set(&[]), Some(&info)),
            Reconciliation::NeedsRebuild(RebuildReason::DeviceDrift { .. })
        ));
    }
}
