//! Device snapshots as seen over the engine bus.

use serde::{Deserialize, Serialize};

/// Device type tag reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Phone,
    Tablet,
    Desktop,
    Unknown,
}

impl DeviceType {
    pub fn from_str(s: &str) -> Self {
        match s {
            "phone" => Self::Phone,
            "tablet" => Self::Tablet,
            "desktop" => Self::Desktop,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Phone => "phone",
            Self::Tablet => "tablet",
            Self::Desktop => "desktop",
            Self::Unknown => "unknown",
        }
    }

    /// Freedesktop icon name for notifications and the device list.
    pub fn icon_name(&self) -> &'static str {
        match self {
            Self::Phone => "phone",
            // "pda" is the closest standard icon name for tablets
            Self::Tablet => "pda",
            Self::Desktop => "computer",
            Self::Unknown => "",
        }
    }
}

/// Read-only snapshot of a remote device.
///
/// The engine owns device identity; the shell never mutates these fields,
/// only replaces whole snapshots as membership events arrive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub device_type: DeviceType,
    pub paired: bool,
}

impl Device {
    pub fn new(id: impl Into<String>, name: impl Into<String>, device_type: DeviceType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            device_type,
            paired: false,
        }
    }

    pub fn icon_name(&self) -> &'static str {
        self.device_type.icon_name()
    }
}

/// Entry in the persisted known-device list.
///
/// The shell owns the file; the engine receives the list at startup and the
/// shell rewrites it whenever a device pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownDevice {
    pub id: String,
    pub name: String,
}
