//! Device descriptors and discovery records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::ProtocolKind;

/// Stable external device identifier.
pub type DeviceId = String;

/// What a device can do, as advertised by the device itself.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// Protocols the device speaks, in the device's own preference order
    pub supported_protocols: Vec<ProtocolKind>,
    /// Runs on battery
    #[serde(default)]
    pub battery_powered: bool,
    /// Moves around (wearables, tags)
    #[serde(default)]
    pub mobile: bool,
    /// Maximum transfer rate in bytes per second, if known
    #[serde(default)]
    pub max_transfer_rate: Option<u64>,
}

impl DeviceCapabilities {
    /// Capabilities for a device speaking the given protocols.
    pub fn with_protocols(protocols: impl IntoIterator<Item = ProtocolKind>) -> Self {
        let mut supported_protocols = Vec::new();
        for protocol in protocols {
            if !supported_protocols.contains(&protocol) {
                supported_protocols.push(protocol);
            }
        }
        Self {
            supported_protocols,
            ..Self::default()
        }
    }

    /// Whether the device speaks `protocol`.
    pub fn supports(&self, protocol: ProtocolKind) -> bool {
        self.supported_protocols.contains(&protocol)
    }
}

/// Immutable description of a device, replaced wholesale on rediscovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Stable external identifier
    pub device_id: DeviceId,
    /// Device type (e.g. "thermostat", "light", "sensor")
    pub device_type: String,
    /// Model name
    pub model: String,
    /// Vendor name
    #[serde(default)]
    pub vendor: Option<String>,
    /// Explicit protocol hint, usually the protocol the device was discovered on
    #[serde(default)]
    pub protocol_hint: Option<ProtocolKind>,
    /// Advertised capabilities
    #[serde(default)]
    pub capabilities: DeviceCapabilities,
}

impl DeviceDescriptor {
    /// Create a new descriptor with no capabilities.
    pub fn new(device_id: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_type: device_type.into(),
            model: "generic".to_string(),
            vendor: None,
            protocol_hint: None,
            capabilities: DeviceCapabilities::default(),
        }
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the vendor.
    pub fn with_vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = Some(vendor.into());
        self
    }

    /// Set the protocol hint.
    pub fn with_protocol_hint(mut self, protocol: ProtocolKind) -> Self {
        self.protocol_hint = Some(protocol);
        self
    }

    /// Set the supported protocols.
    pub fn with_protocols(mut self, protocols: impl IntoIterator<Item = ProtocolKind>) -> Self {
        let caps = DeviceCapabilities::with_protocols(protocols);
        self.capabilities.supported_protocols = caps.supported_protocols;
        self
    }

    /// Mark the device as battery powered.
    pub fn battery_powered(mut self, battery: bool) -> Self {
        self.capabilities.battery_powered = battery;
        self
    }

    /// Mark the device as mobile.
    pub fn mobile(mut self, mobile: bool) -> Self {
        self.capabilities.mobile = mobile;
        self
    }

    /// Set the maximum transfer rate.
    pub fn with_max_transfer_rate(mut self, bytes_per_sec: u64) -> Self {
        self.capabilities.max_transfer_rate = Some(bytes_per_sec);
        self
    }

    /// Whether the device speaks `protocol`.
    pub fn supports(&self, protocol: ProtocolKind) -> bool {
        self.capabilities.supports(protocol)
    }
}

/// A device seen during discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    /// Stable external identifier
    pub device_id: DeviceId,
    /// Device type
    pub device_type: String,
    /// Vendor name
    pub vendor: Option<String>,
    /// Model name
    pub model: Option<String>,
    /// Protocol the device was discovered on
    pub protocol: ProtocolKind,
    /// Received signal strength in dBm, where the protocol reports one
    pub signal_strength: Option<i16>,
    /// When the device was seen
    pub discovered_at: DateTime<Utc>,
}

impl DiscoveredDevice {
    /// Create a discovery record stamped with the current time.
    pub fn new(
        device_id: impl Into<String>,
        device_type: impl Into<String>,
        protocol: ProtocolKind,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_type: device_type.into(),
            vendor: None,
            model: None,
            protocol,
            signal_strength: None,
            discovered_at: Utc::now(),
        }
    }

    /// Set vendor and model.
    pub fn with_vendor_model(mut self, vendor: Option<String>, model: Option<String>) -> Self {
        self.vendor = vendor;
        self.model = model;
        self
    }

    /// Set the signal strength.
    pub fn with_signal(mut self, rssi: i16) -> Self {
        self.signal_strength = Some(rssi);
        self
    }

    /// Build a descriptor for connecting to this device over the protocol it was found on.
    pub fn descriptor(&self) -> DeviceDescriptor {
        let mut descriptor = DeviceDescriptor::new(&self.device_id, &self.device_type)
            .with_protocol_hint(self.protocol)
            .with_protocols([self.protocol]);
        if let Some(model) = &self.model {
            descriptor.model = model.clone();
        }
        descriptor.vendor = self.vendor.clone();
        descriptor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_builder() {
        let d = DeviceDescriptor::new("bulb-1", "light")
            .with_model("A19")
            .with_protocols([ProtocolKind::Matter, ProtocolKind::Ble, ProtocolKind::Matter])
            .battery_powered(false);

        assert_eq!(d.capabilities.supported_protocols.len(), 2);
        assert!(d.supports(ProtocolKind::Ble));
        assert!(!d.supports(ProtocolKind::Mqtt));
    }

    #[test]
    fn test_discovered_to_descriptor() {
        let found = DiscoveredDevice::new("tag-7", "sensor", ProtocolKind::Ble)
            .with_vendor_model(Some("Acme".into()), Some("T1".into()))
            .with_signal(-60);
        let d = found.descriptor();
        assert_eq!(d.protocol_hint, Some(ProtocolKind::Ble));
        assert_eq!(d.model, "T1");
        assert!(d.supports(ProtocolKind::Ble));
    }
}
