//! Records held by the state store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a physical port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Available,
    InUse,
    Maintenance,
}

/// One physical serial port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Host device path, e.g. `/dev/ttyUSB0`. Unique.
    pub port: String,
    /// Display tag, e.g. `USB-SERIAL-CH340-ttyUSB0`.
    pub tag: String,
    /// Device-type classification, e.g. `ESP32/ESP8266`.
    pub kind: String,
    pub status: DeviceStatus,
    /// Set only while `status` is `InUse`.
    pub in_use_by: Option<String>,
}

/// A user known to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: String,
    pub safe_name: String,
    /// Persisted management port of the user's sandbox.
    pub management_port: Option<u16>,
    pub created_at: DateTime<Utc>,
}

/// Assignment of a device to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub username: String,
    pub port: String,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Grant {
    /// Returns true if the grant is in force at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expiry| expiry > now)
    }
}

/// One entry of a user's action history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRecord {
    pub username: String,
    pub action: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub at: DateTime<Utc>,
}

/// Add/remove classification of a physical device event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceEventKind {
    Add,
    Remove,
}

/// Inbound physical add/remove notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceEvent {
    pub port: String,
    pub kind: DeviceEventKind,
    #[serde(default)]
    pub vendor_id: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
}

impl DeviceEvent {
    /// Parses `add|remove <port> [vendor] [product]`.
    ///
    /// Bare device names such as `ttyUSB0` are placed under `/dev`.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let kind = match parts.next()? {
            "add" => DeviceEventKind::Add,
            "remove" => DeviceEventKind::Remove,
            _ => return None,
        };
        let port = parts.next()?;
        let port = if port.starts_with('/') {
            port.to_string()
        } else {
            format!("/dev/{}", port)
        };
        let known = |s: &str| s != "N/A" && !s.is_empty();
        let vendor_id = parts.next().filter(|s| known(s)).map(str::to_string);
        let product_id = parts.next().filter(|s| known(s)).map(str::to_string);
        Some(Self {
            port,
            kind,
            vendor_id,
            product_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn grant_without_expiry_is_always_active() {
        let now = Utc::now();
        let grant = Grant {
            username: "alice".to_string(),
            port: "/dev/ttyUSB0".to_string(),
            granted_at: now,
            expires_at: None,
        };
        assert!(grant.is_active(now + Duration::days(365)));
    }

    #[test]
    fn grant_expires_at_deadline() {
        let now = Utc::now();
        let grant = Grant {
            username: "alice".to_string(),
            port: "/dev/ttyUSB0".to_string(),
            granted_at: now,
            expires_at: Some(now + Duration::hours(1)),
        };
        assert!(grant.is_active(now));
        assert!(!grant.is_active(now + Duration::hours(1)));
    }

    #[test]
    fn device_event_parses_udev_style_line() {
        let event = DeviceEvent::parse("add ttyUSB0 1a86 7523").unwrap();
        assert_eq!(event.port, "/dev/ttyUSB0");
        assert_eq!(event.kind, DeviceEventKind::Add);
        assert_eq!(event.vendor_id.as_deref(), Some("1a86"));
        assert_eq!(event.product_id.as_deref(), Some("7523"));
    }

    #[test]
    fn device_event_drops_unknown_ids() {
        let event = DeviceEvent::parse("remove /dev/ttyACM1 N/A N/A").unwrap();
        assert_eq!(event.kind, DeviceEventKind::Remove);
        assert_eq!(event.port, "/dev/ttyACM1");
        assert!(event.vendor_id.is_none());
    }

    #[test]
    fn device_event_rejects_garbage() {
        assert!(DeviceEvent::parse("").is_none());
        assert!(DeviceEvent::parse("plug ttyUSB0").is_none());
        assert!(DeviceEvent::parse("add").is_none());
    }

    #[test]
    fn device_status_serializes_to_snake_case() {
        let json = serde_json::to_string(&DeviceStatus::InUse).unwrap();
        assert_eq!(json, "\"in_use\"");
    }
}
