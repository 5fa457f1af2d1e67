/*!
 * Device identity and connectivity model.
 *
 * A device is known by its serial. Everything else here is a snapshot of
 * what the transport last reported about it.
 */
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Property holding the hardware product type
pub const PROP_PRODUCT_TYPE: &str = "ro.hardware";
/// Property holding the product variant
pub const PROP_PRODUCT_VARIANT: &str = "ro.product.device";
/// Property holding the platform SDK level
pub const PROP_SDK_VERSION: &str = "ro.build.version.sdk";
/// Property holding the build id
pub const PROP_BUILD_ID: &str = "ro.build.id";

/// Serial prefix of null-device placeholders
pub const NULL_DEVICE_SERIAL_PREFIX: &str = "null-device";
/// Serial prefix of emulators
pub const EMULATOR_SERIAL_PREFIX: &str = "emulator";
/// Serial prefix of tcp-device placeholders
pub const TCP_DEVICE_SERIAL_PREFIX: &str = "tcp-device";

/// Kind of target behind a device record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// A physical device attached to the host
    Physical,
    /// An emulator instance
    Emulator,
    /// A placeholder for jobs that need no device at all
    NullDevice,
    /// A placeholder for a device reached over tcp
    TcpDevice,
    /// A device only visible through the bootloader protocol
    FastbootOnly,
}

impl DeviceKind {
    /// Guess the kind of a device from its serial
    pub fn from_serial(serial: &str) -> Self {
        if serial.starts_with(NULL_DEVICE_SERIAL_PREFIX) {
            DeviceKind::NullDevice
        } else if serial.starts_with(TCP_DEVICE_SERIAL_PREFIX) {
            DeviceKind::TcpDevice
        } else if serial.starts_with(EMULATOR_SERIAL_PREFIX) {
            DeviceKind::Emulator
        } else {
            DeviceKind::Physical
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::Physical => "physical",
            DeviceKind::Emulator => "emulator",
            DeviceKind::NullDevice => "null-device",
            DeviceKind::TcpDevice => "tcp-device",
            DeviceKind::FastbootOnly => "fastboot-only",
        };
        f.write_str(name)
    }
}

/// Connectivity state of a device as seen by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectivityState {
    /// Reachable and accepting commands
    Online,
    /// Not reachable, or in a state we cannot use
    #[default]
    NotAvailable,
    /// In the bootloader
    Fastboot,
    /// Booted into recovery
    Recovery,
}

impl ConnectivityState {
    /// Map a raw transport state string onto a connectivity state
    ///
    /// Unknown and garbled states map to `NotAvailable`.
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "device" | "online" => ConnectivityState::Online,
            "bootloader" | "fastboot" => ConnectivityState::Fastboot,
            "recovery" => ConnectivityState::Recovery,
            _ => ConnectivityState::NotAvailable,
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectivityState::Online => "ONLINE",
            ConnectivityState::NotAvailable => "NOT_AVAILABLE",
            ConnectivityState::Fastboot => "FASTBOOT",
            ConnectivityState::Recovery => "RECOVERY",
        };
        f.write_str(name)
    }
}

/// Device attributes used for selection and reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// The stable device serial
    pub serial: String,
    /// The device kind
    pub kind: DeviceKind,
    /// Whether this record stands in for a device that is not connected
    pub placeholder: bool,
    /// Device properties as last reported
    pub properties: HashMap<String, String>,
    /// Battery level in percent, if known
    pub battery_level: Option<u32>,
}

impl DeviceInfo {
    /// Create info for a connected device
    pub fn new<S: Into<String>>(serial: S, kind: DeviceKind) -> Self {
        Self {
            serial: serial.into(),
            kind,
            placeholder: false,
            properties: HashMap::new(),
            battery_level: None,
        }
    }

    /// Create info for a placeholder, deriving the kind from the serial
    pub fn placeholder<S: Into<String>>(serial: S) -> Self {
        let serial = serial.into();
        let kind = DeviceKind::from_serial(&serial);
        Self {
            placeholder: true,
            ..Self::new(serial, kind)
        }
    }

    /// Set a property
    pub fn with_property<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Set the battery level
    pub fn with_battery_level(mut self, level: u32) -> Self {
        self.battery_level = Some(level);
        self
    }

    /// Look up a property
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// SDK level parsed from the properties
    pub fn sdk_level(&self) -> Option<u32> {
        self.property(PROP_SDK_VERSION)
            .and_then(|v| v.trim().parse().ok())
    }
}

/// What the transport reports when a device appears or changes state
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceHandle {
    /// The device attributes
    pub info: DeviceInfo,
    /// The raw transport state string ("device", "offline", "bootloader", ...)
    pub raw_state: String,
}

impl DeviceHandle {
    /// Create a new handle
    pub fn new<S: Into<String>>(info: DeviceInfo, raw_state: S) -> Self {
        Self {
            info,
            raw_state: raw_state.into(),
        }
    }

    /// The device serial
    pub fn serial(&self) -> &str {
        &self.info.serial
    }

    /// The connectivity state the raw state maps to
    pub fn connectivity(&self) -> ConnectivityState {
        ConnectivityState::from_raw(&self.raw_state)
    }

    /// Whether the raw state is an explicit offline report
    ///
    /// Only these reports take a device out of the available set; other
    /// non-online states just update connectivity.
    pub fn is_offline_report(&self) -> bool {
        matches!(
            self.raw_state.trim().to_ascii_lowercase().as_str(),
            "offline" | "unauthorized"
        )
    }
}
