//! Display tag and device-type classification for detected ports.

/// Known USB-serial bridges keyed by `vendor:product`: (type, tag prefix).
const KNOWN_DEVICES: &[(&str, &str, &str)] = &[
    ("1a86:7523", "CH340/CH341", "USB-SERIAL-CH340"),
    ("10c4:ea60", "CP2102", "USB-UART-CP2102"),
    ("0403:6001", "FTDI", "FTDI-Device"),
    ("2341:0043", "Arduino Uno", "Arduino-Uno"),
];

/// Tag and type assigned to a port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub tag: String,
    pub kind: String,
}

/// Classifies a port from its USB ids when known, otherwise from its node name.
pub fn classify(port: &str, vendor_id: Option<&str>, product_id: Option<&str>) -> Classification {
    let node = port.rsplit('/').next().unwrap_or(port);

    if let (Some(vendor), Some(product)) = (vendor_id, product_id) {
        let key = format!("{}:{}", vendor.to_lowercase(), product.to_lowercase());
        if let Some((_, kind, prefix)) = KNOWN_DEVICES.iter().find(|(id, _, _)| *id == key) {
            return Classification {
                tag: format!("{}-{}", prefix, node),
                kind: kind.to_string(),
            };
        }
    }

    if node.contains("ttyACM") {
        Classification {
            tag: format!("Arduino-Uno-{}", node),
            kind: "Arduino AVR".to_string(),
        }
    } else if node.contains("ttyUSB") {
        Classification {
            tag: format!("ESP32-NodeMCU-{}", node),
            kind: "ESP32/ESP8266".to_string(),
        }
    } else {
        Classification {
            tag: format!("Device-{}", node),
            kind: "Generic Serial".to_string(),
        }
    }
}

/// A board profile the build tool accepts.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BoardProfile {
    pub name: String,
    /// Fully-qualified board name passed to the build tool.
    pub fqbn: String,
}

impl BoardProfile {
    fn new(name: &str, fqbn: &str) -> Self {
        Self {
            name: name.to_string(),
            fqbn: fqbn.to_string(),
        }
    }
}

/// Suggested board profiles for a device type.
pub fn board_profiles(kind: &str) -> Vec<BoardProfile> {
    let kind = kind.to_lowercase();
    let esp32 = BoardProfile::new("ESP32 Dev Module", "esp32:esp32:esp32");
    let esp8266 = BoardProfile::new("ESP8266 NodeMCU", "esp8266:esp8266:nodemcuv2");

    if kind.contains("esp32") {
        vec![esp32, BoardProfile::new("AI Thinker ESP32-CAM", "esp32:esp32:esp32cam")]
    } else if kind.contains("esp8266") {
        vec![esp8266]
    } else {
        vec![esp32, esp8266, BoardProfile::new("Arduino Uno", "arduino:avr:uno")]
    }
}
