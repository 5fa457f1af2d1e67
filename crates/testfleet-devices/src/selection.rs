/*!
 * Device selection.
 *
 * A [`DeviceSelection`] is an immutable set of match criteria evaluated
 * against a device's attributes. It holds no state and can be shared freely.
 */
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::device::{DeviceInfo, DeviceKind, PROP_PRODUCT_TYPE, PROP_PRODUCT_VARIANT};

/// Criteria a device must satisfy to be selected
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSelection {
    /// Allowed serials (empty = any)
    #[serde(default)]
    pub serials: HashSet<String>,
    /// Serials that never match
    #[serde(default)]
    pub exclude_serials: HashSet<String>,
    /// Allowed product types, optionally as `type:variant` (empty = any)
    #[serde(default)]
    pub product_types: HashSet<String>,
    /// Properties that must be present with exactly these values
    #[serde(default)]
    pub properties: HashMap<String, String>,
    /// Minimum battery level in percent
    #[serde(default)]
    pub min_battery_level: Option<u32>,
    /// Maximum battery level in percent
    #[serde(default)]
    pub max_battery_level: Option<u32>,
    /// Minimum SDK level
    #[serde(default)]
    pub min_sdk_level: Option<u32>,
    /// Maximum SDK level
    #[serde(default)]
    pub max_sdk_level: Option<u32>,
    /// Request a null-device placeholder
    #[serde(default)]
    pub null_device_requested: bool,
    /// Request an emulator
    #[serde(default)]
    pub emulator_requested: bool,
    /// Request an emulator placeholder that is not running yet
    #[serde(default)]
    pub stub_emulator_requested: bool,
    /// Request a tcp-device placeholder
    #[serde(default)]
    pub tcp_device_requested: bool,
    /// Request a physical device
    #[serde(default)]
    pub device_requested: bool,
    /// Accept devices only visible through the bootloader
    #[serde(default)]
    pub fastboot_requested: bool,
}

impl DeviceSelection {
    /// Selection that matches any regular device
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to the given serial
    pub fn with_serial<S: Into<String>>(mut self, serial: S) -> Self {
        self.serials.insert(serial.into());
        self
    }

    /// Never match the given serial
    pub fn excluding<S: Into<String>>(mut self, serial: S) -> Self {
        self.exclude_serials.insert(serial.into());
        self
    }

    /// Restrict to a product type
    pub fn with_product_type<S: Into<String>>(mut self, product: S) -> Self {
        self.product_types.insert(product.into());
        self
    }

    /// Require a property value
    pub fn with_property<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Require a battery level range
    pub fn with_battery_range(mut self, min: Option<u32>, max: Option<u32>) -> Self {
        self.min_battery_level = min;
        self.max_battery_level = max;
        self
    }

    /// Require an SDK level range
    pub fn with_sdk_range(mut self, min: Option<u32>, max: Option<u32>) -> Self {
        self.min_sdk_level = min;
        self.max_sdk_level = max;
        self
    }

    /// Ask for a null-device placeholder
    pub fn null_device(mut self) -> Self {
        self.null_device_requested = true;
        self
    }

    /// Ask for an emulator
    pub fn emulator(mut self) -> Self {
        self.emulator_requested = true;
        self
    }

    /// Ask for an emulator placeholder
    pub fn stub_emulator(mut self) -> Self {
        self.emulator_requested = true;
        self.stub_emulator_requested = true;
        self
    }

    /// Ask for a tcp-device placeholder
    pub fn tcp_device(mut self) -> Self {
        self.tcp_device_requested = true;
        self
    }

    /// Ask for a physical device
    pub fn physical_device(mut self) -> Self {
        self.device_requested = true;
        self
    }

    /// Accept fastboot-only devices
    pub fn fastboot(mut self) -> Self {
        self.fastboot_requested = true;
        self
    }

    /// Evaluate the selection against a device
    pub fn matches(&self, info: &DeviceInfo) -> bool {
        if !self.serials.is_empty() && !self.serials.contains(&info.serial) {
            return false;
        }
        if self.exclude_serials.contains(&info.serial) {
            return false;
        }
        if !self.matches_kind(info) {
            return false;
        }
        if !self.matches_product(info) {
            return false;
        }
        if self
            .properties
            .iter()
            .any(|(key, value)| info.property(key) != Some(value.as_str()))
        {
            return false;
        }
        if !self.matches_sdk(info) {
            return false;
        }
        // placeholders have no battery to read
        if !info.placeholder && !self.matches_battery(info) {
            return false;
        }
        true
    }

    fn matches_kind(&self, info: &DeviceInfo) -> bool {
        match info.kind {
            DeviceKind::NullDevice => self.null_device_requested,
            DeviceKind::TcpDevice => self.tcp_device_requested,
            DeviceKind::FastbootOnly => self.fastboot_requested,
            DeviceKind::Emulator => {
                if self.null_device_requested
                    || self.tcp_device_requested
                    || self.device_requested
                {
                    return false;
                }
                // a running emulator never satisfies a stub request and vice versa
                if info.placeholder {
                    self.stub_emulator_requested
                } else {
                    !self.stub_emulator_requested
                }
            }
            DeviceKind::Physical => {
                !(self.null_device_requested
                    || self.tcp_device_requested
                    || self.emulator_requested)
            }
        }
    }

    fn matches_product(&self, info: &DeviceInfo) -> bool {
        if self.product_types.is_empty() {
            return true;
        }
        let product = info.property(PROP_PRODUCT_TYPE).unwrap_or_default();
        let variant = info.property(PROP_PRODUCT_VARIANT).unwrap_or_default();
        self.product_types.iter().any(|wanted| match wanted.split_once(':') {
            Some((wanted_type, wanted_variant)) => {
                wanted_type.eq_ignore_ascii_case(product)
                    && wanted_variant.eq_ignore_ascii_case(variant)
            }
            None => wanted.eq_ignore_ascii_case(product),
        })
    }

    fn matches_sdk(&self, info: &DeviceInfo) -> bool {
        if self.min_sdk_level.is_none() && self.max_sdk_level.is_none() {
            return true;
        }
        let Some(level) = info.sdk_level() else {
            return false;
        };
        self.min_sdk_level.map_or(true, |min| level >= min)
            && self.max_sdk_level.map_or(true, |max| level <= max)
    }

    fn matches_battery(&self, info: &DeviceInfo) -> bool {
        if self.min_battery_level.is_none() && self.max_battery_level.is_none() {
            return true;
        }
        let Some(level) = info.battery_level else {
            return false;
        };
        self.min_battery_level.map_or(true, |min| level >= min)
            && self.max_battery_level.map_or(true, |max| level <= max)
    }
}
