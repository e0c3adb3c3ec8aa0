//! Remediation hints for flash failures.
//!
//! Pattern-matches flasher output and maps each recognised failure class to
//! one suggestion for the user.

use serde::{Deserialize, Serialize};

/// Class of flash failure recognised in tool output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlashFailureKind {
    PermissionDenied,
    PortBusy,
    Timeout,
    ConnectionLost,
}

impl FlashFailureKind {
    /// The suggestion shown for this failure class.
    pub fn hint(self) -> &'static str {
        match self {
            FlashFailureKind::PermissionDenied => {
                "The port is not accessible from your workspace. Rescan ports and try again."
            }
            FlashFailureKind::PortBusy => {
                "The port is busy. Close any open serial monitor on this port and retry."
            }
            FlashFailureKind::Timeout => {
                "The board did not answer. Hold the BOOT button while flashing starts."
            }
            FlashFailureKind::ConnectionLost => {
                "The connection dropped mid-transfer. Try another USB cable or port."
            }
        }
    }
}

/// Detects flash failure classes from output lines.
pub struct HintDetector {
    patterns: Vec<(FlashFailureKind, &'static str)>,
}

impl Default for HintDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl HintDetector {
    pub fn new() -> Self {
        Self {
            patterns: vec![
                (FlashFailureKind::PermissionDenied, "permission denied"),
                (FlashFailureKind::PermissionDenied, "eacces"),
                (FlashFailureKind::PortBusy, "resource busy"),
                (FlashFailureKind::PortBusy, "device or resource busy"),
                (FlashFailureKind::PortBusy, "port is busy"),
                (FlashFailureKind::PortBusy, "ebusy"),
                (FlashFailureKind::Timeout, "timed out"),
                (FlashFailureKind::Timeout, "failed to connect to"),
                (FlashFailureKind::Timeout, "not in sync"),
                (FlashFailureKind::Timeout, "wrong boot mode"),
                (FlashFailureKind::ConnectionLost, "packet content transfer stopped"),
            ],
        }
    }

    /// Returns the failure classes found in `line`.
    pub fn analyze(&self, line: &str) -> Vec<FlashFailureKind> {
        let lower = line.to_lowercase();
        let mut kinds = Vec::new();
        for (kind, pattern) in &self.patterns {
            if lower.contains(pattern) && !kinds.contains(kind) {
                kinds.push(*kind);
            }
        }
        kinds
    }

    /// Returns one hint per distinct failure class found in `output`, in the
    /// order the classes first appear.
    pub fn hints(&self, output: &str) -> Vec<String> {
        let mut seen = Vec::new();
        for line in output.lines() {
            for kind in self.analyze(line) {
                if !seen.contains(&kind) {
                    seen.push(kind);
                }
            }
        }
        seen.into_iter().map(|k| k.hint().to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_class_has_a_distinct_hint() {
        let kinds = [
            FlashFailureKind::PermissionDenied,
            FlashFailureKind::PortBusy,
            FlashFailureKind::Timeout,
            FlashFailureKind::ConnectionLost,
        ];
        for (i, a) in kinds.iter().enumerate() {
            for b in &kinds[i + 1..] {
                assert_ne!(a.hint(), b.hint());
            }
        }
    }

    #[test]
    fn permission_error_maps_to_rescan_hint() {
        let hints = HintDetector::new().hints(
            "A fatal error occurred: Could not open /dev/ttyUSB0, the port doesn't exist\n\
             [Errno 13] Permission denied: '/dev/ttyUSB0'",
        );
        assert_eq!(hints, vec![FlashFailureKind::PermissionDenied.hint()]);
    }

    #[test]
    fn busy_port_is_detected() {
        let kinds = HintDetector::new()
            .analyze("could not open port /dev/ttyACM0: [Errno 16] Device or resource busy");
        assert_eq!(kinds, vec![FlashFailureKind::PortBusy]);
    }

    #[test]
    fn bootloader_timeout_is_detected() {
        let hints = HintDetector::new().hints(
            "Connecting........_____....\nA fatal error occurred: Failed to connect to ESP32: Timed out waiting for packet header",
        );
        assert_eq!(hints, vec![FlashFailureKind::Timeout.hint()]);
    }

    #[test]
    fn multiple_classes_keep_first_seen_order() {
        let hints = HintDetector::new().hints(
            "Packet content transfer stopped (received 8 bytes)\nTimed out waiting for packet header",
        );
        assert_eq!(
            hints,
            vec![
                FlashFailureKind::ConnectionLost.hint(),
                FlashFailureKind::Timeout.hint()
            ]
        );
    }

    #[test]
    fn clean_output_has_no_hints() {
        assert!(HintDetector::new()
            .hints("Hard resetting via RTS pin...")
            .is_empty());
    }
}
