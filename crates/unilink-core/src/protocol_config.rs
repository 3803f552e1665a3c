//! Typed per-protocol adapter configuration.
//!
//! These are the inputs of the adapter factory. A configuration whose variant
//! does not match the requested protocol is a configuration error.

use serde::{Deserialize, Serialize};

use crate::error::ConnectionError;
use crate::protocol::ProtocolKind;

/// Message broker (MQTT) configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Client id; empty means "derive from device id"
    pub client_id: String,
    /// QoS level 0, 1 or 2
    pub qos: u8,
    pub keep_alive_secs: u64,
    pub clean_session: bool,
    /// Prefix of the announce topic used for discovery
    pub discovery_prefix: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            client_id: String::new(),
            qos: 1,
            keep_alive_secs: 60,
            clean_session: false,
            discovery_prefix: "unilink".to_string(),
        }
    }
}

impl MqttConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    /// Broker address as `host:port`.
    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Short-range wireless (BLE) configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    pub scan_timeout_ms: u64,
    /// Advertised service UUIDs to accept during scans; empty accepts all
    pub service_filters: Vec<String>,
    /// Characteristic commands are written to
    pub command_characteristic: String,
    pub mtu: u16,
    /// Peripheral address or id to bind to; empty means "the device id"
    pub peripheral: String,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            scan_timeout_ms: 10_000,
            service_filters: Vec::new(),
            command_characteristic: "0000ff01-0000-1000-8000-00805f9b34fb".to_string(),
            mtu: 185,
            peripheral: String::new(),
        }
    }
}

/// Vendor cloud SDK configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    pub product_key: String,
    pub device_name: String,
    pub device_secret: Option<String>,
    pub region: String,
    /// Explicit endpoint overriding the regional default
    pub endpoint: Option<String>,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            product_key: "default".to_string(),
            device_name: String::new(),
            device_secret: None,
            region: "us-east-1".to_string(),
            endpoint: None,
        }
    }
}

impl CloudConfig {
    /// Endpoint the SDK talks to.
    pub fn resolved_endpoint(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("iot.{}.cloud.unilink.io", self.region))
    }
}

/// Mesh commissioning (Zigbee/Matter) configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatterConfig {
    /// Operational network name (Wi-Fi SSID or Thread network)
    pub network_name: String,
    pub network_credentials: Option<String>,
    pub vendor_id: u16,
    pub product_id: u16,
    pub fabric_id: u64,
    /// Endpoint commands are addressed to
    pub endpoint: u16,
}

impl Default for MatterConfig {
    fn default() -> Self {
        Self {
            network_name: "home".to_string(),
            network_credentials: None,
            vendor_id: 0xFFF1,
            product_id: 0x8000,
            fabric_id: 1,
            endpoint: 1,
        }
    }
}

/// Generic HTTP configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub base_url: String,
    pub auth_token: Option<String>,
    pub timeout_secs: u64,
    /// Path probed when opening the link
    pub health_path: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            auth_token: None,
            timeout_secs: 10,
            health_path: "/health".to_string(),
        }
    }
}

/// Adapter configuration for one protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ProtocolConfig {
    Mqtt(MqttConfig),
    Ble(BleConfig),
    Matter(MatterConfig),
    Cloud(CloudConfig),
    Http(HttpConfig),
}

impl ProtocolConfig {
    /// Protocol this configuration is for.
    pub fn protocol(&self) -> ProtocolKind {
        match self {
            Self::Mqtt(_) => ProtocolKind::Mqtt,
            Self::Ble(_) => ProtocolKind::Ble,
            Self::Matter(_) => ProtocolKind::Matter,
            Self::Cloud(_) => ProtocolKind::Cloud,
            Self::Http(_) => ProtocolKind::Http,
        }
    }

    /// Check the values make sense for the protocol.
    pub fn validate(&self) -> Result<(), ConnectionError> {
        let invalid = |msg: String| Err(ConnectionError::ConfigurationError(msg));
        match self {
            Self::Mqtt(c) => {
                if c.host.trim().is_empty() {
                    return invalid("MQTT host must not be empty".to_string());
                }
                if c.port == 0 {
                    return invalid("MQTT port must not be 0".to_string());
                }
                if c.qos > 2 {
                    return invalid(format!("MQTT QoS {} is not 0, 1 or 2", c.qos));
                }
                if c.username.is_some() != c.password.is_some() {
                    return invalid("MQTT username and password must be set together".to_string());
                }
                Ok(())
            }
            Self::Ble(c) => {
                if c.scan_timeout_ms == 0 {
                    return invalid("BLE scan timeout must be positive".to_string());
                }
                if c.mtu < 23 {
                    return invalid(format!("BLE MTU {} below the minimum of 23", c.mtu));
                }
                Ok(())
            }
            Self::Matter(c) => {
                if c.network_name.trim().is_empty() {
                    return invalid("Matter network name must not be empty".to_string());
                }
                if c.vendor_id == 0 {
                    return invalid("Matter vendor id must not be 0".to_string());
                }
                Ok(())
            }
            Self::Cloud(c) => {
                if c.product_key.trim().is_empty() {
                    return invalid("cloud product key must not be empty".to_string());
                }
                if c.region.trim().is_empty() {
                    return invalid("cloud region must not be empty".to_string());
                }
                Ok(())
            }
            Self::Http(c) => {
                if !(c.base_url.starts_with("http://") || c.base_url.starts_with("https://")) {
                    return invalid(format!("HTTP base url '{}' is not http(s)", c.base_url));
                }
                if c.timeout_secs == 0 {
                    return invalid("HTTP timeout must be positive".to_string());
                }
                Ok(())
            }
        }
    }
}
