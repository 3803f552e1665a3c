//! Wire protocol identifiers and their static profiles.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A wire protocol a device can be reached through.
///
/// The declaration order is significant: it is the tie-break order used when
/// two protocols score the same, and the "first available" order used by the
/// adapter manager.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// Message broker protocol
    Mqtt,
    /// Bluetooth Low Energy
    Ble,
    /// Zigbee/Matter mesh commissioning
    Matter,
    /// Vendor cloud SDK over Wi-Fi
    Cloud,
    /// Generic REST over HTTP
    Http,
    /// Low-latency duplex transport
    WebSocket,
}

impl ProtocolKind {
    /// Every known protocol in declaration order.
    pub const ALL: [ProtocolKind; 6] = [
        ProtocolKind::Mqtt,
        ProtocolKind::Ble,
        ProtocolKind::Matter,
        ProtocolKind::Cloud,
        ProtocolKind::Http,
        ProtocolKind::WebSocket,
    ];

    /// Canonical protocol name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mqtt => "mqtt",
            Self::Ble => "ble",
            Self::Matter => "matter",
            Self::Cloud => "cloud",
            Self::Http => "http",
            Self::WebSocket => "websocket",
        }
    }

    /// Static characteristics of this protocol.
    pub fn profile(&self) -> ProtocolProfile {
        match self {
            Self::Mqtt => ProtocolProfile {
                nominal_latency_ms: 50,
                mesh: false,
                retained_session: true,
                duplex: true,
                power_cost: 6,
                reliability: 80,
                medium: NetworkMedium::Wifi,
                expected_connect_ms: 1500,
            },
            Self::Ble => ProtocolProfile {
                nominal_latency_ms: 30,
                mesh: false,
                retained_session: false,
                duplex: true,
                power_cost: 2,
                reliability: 60,
                medium: NetworkMedium::Bluetooth,
                expected_connect_ms: 3000,
            },
            Self::Matter => ProtocolProfile {
                nominal_latency_ms: 80,
                mesh: true,
                retained_session: true,
                duplex: true,
                power_cost: 4,
                reliability: 90,
                medium: NetworkMedium::Wifi,
                expected_connect_ms: 5000,
            },
            Self::Cloud => ProtocolProfile {
                nominal_latency_ms: 200,
                mesh: false,
                retained_session: true,
                duplex: false,
                power_cost: 7,
                reliability: 75,
                medium: NetworkMedium::Internet,
                expected_connect_ms: 2500,
            },
            Self::Http => ProtocolProfile {
                nominal_latency_ms: 120,
                mesh: false,
                retained_session: false,
                duplex: false,
                power_cost: 8,
                reliability: 70,
                medium: NetworkMedium::Wifi,
                expected_connect_ms: 1000,
            },
            Self::WebSocket => ProtocolProfile {
                nominal_latency_ms: 20,
                mesh: false,
                retained_session: false,
                duplex: true,
                power_cost: 7,
                reliability: 70,
                medium: NetworkMedium::Wifi,
                expected_connect_ms: 800,
            },
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown protocol name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown protocol: {0}")]
pub struct UnknownProtocol(pub String);

impl FromStr for ProtocolKind {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mqtt" => Ok(Self::Mqtt),
            "ble" | "bluetooth" | "bluetooth_le" => Ok(Self::Ble),
            "matter" | "zigbee" | "thread" => Ok(Self::Matter),
            "cloud" | "cloud_sdk" | "wifi" => Ok(Self::Cloud),
            "http" | "rest" => Ok(Self::Http),
            "websocket" | "ws" => Ok(Self::WebSocket),
            other => Err(UnknownProtocol(other.to_string())),
        }
    }
}

/// Network medium a protocol needs to be reachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMedium {
    /// Local Wi-Fi network
    Wifi,
    /// Bluetooth radio
    Bluetooth,
    /// Any internet uplink (Wi-Fi or cellular)
    Internet,
}

/// Static characteristics used by connection strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolProfile {
    /// Typical one-way latency in milliseconds
    pub nominal_latency_ms: u32,
    /// Messages are relayed through a mesh
    pub mesh: bool,
    /// Sessions survive reconnects (retained state / persistent sessions)
    pub retained_session: bool,
    /// Both sides can push messages at any time
    pub duplex: bool,
    /// Relative power cost on the device, 1 (cheapest) to 10
    pub power_cost: u8,
    /// Relative delivery reliability, 0 to 100
    pub reliability: u8,
    /// Medium the protocol needs
    pub medium: NetworkMedium,
    /// Typical time to establish a session
    pub expected_connect_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_aliases() {
        assert_eq!("MQTT".parse::<ProtocolKind>().unwrap(), ProtocolKind::Mqtt);
        assert_eq!("zigbee".parse::<ProtocolKind>().unwrap(), ProtocolKind::Matter);
        assert_eq!("ws".parse::<ProtocolKind>().unwrap(), ProtocolKind::WebSocket);
        assert!("lora".parse::<ProtocolKind>().is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        for kind in ProtocolKind::ALL {
            assert_eq!(kind.to_string().parse::<ProtocolKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_declaration_order() {
        assert!(ProtocolKind::Mqtt < ProtocolKind::Ble);
        assert!(ProtocolKind::Http < ProtocolKind::WebSocket);
    }
}
