//! Transports carry encoded frames between an adapter and a device.
//!
//! A transport knows nothing about commands or connection state; it opens a
//! link, writes frames and reports inbound traffic and link loss through an
//! ordered signal channel. Reference adapters are written against the
//! [`Transport`] trait so the same session logic runs over a broker, HTTP or
//! the in-process loopback network.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use unilink_core::device::DiscoveredDevice;
use unilink_core::error::ConnectionError;
use unilink_core::protocol::ProtocolKind;
use unilink_core::protocol_config::ProtocolConfig;

pub mod loopback;

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use loopback::{LoopbackNetwork, LoopbackTransport, LoopbackTransportProvider};

#[cfg(feature = "http")]
pub use http::HttpTransport;

#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;

/// Capacity of a transport's inbound signal channel.
pub const SIGNAL_CHANNEL_CAPACITY: usize = 256;

/// Transport-level error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Transport is not open")]
    NotOpen,

    #[error("Link lost: {0}")]
    LinkLost(String),

    #[error("No such peer: {0}")]
    NoPeer(String),

    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("Authentication rejected")]
    AuthRejected,

    #[error("Network unreachable: {0}")]
    Unreachable(String),

    #[error("Operation timeout after {0}ms")]
    Timeout(u64),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl From<TransportError> for ConnectionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotOpen => ConnectionError::NotConnected,
            TransportError::LinkLost(_) => ConnectionError::ConnectionLost,
            TransportError::NoPeer(id) => ConnectionError::DeviceNotFound(id),
            TransportError::Refused(reason) => ConnectionError::ResourceUnavailable(reason),
            TransportError::AuthRejected => ConnectionError::AuthenticationFailed,
            TransportError::Unreachable(_) => ConnectionError::NetworkUnavailable,
            TransportError::Timeout(ms) => ConnectionError::Timeout(ms),
            TransportError::Io(detail) => ConnectionError::ProtocolError(detail),
            TransportError::Unsupported(op) => ConnectionError::UnsupportedOperation(op),
        }
    }
}

/// One encoded unit of traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Topic, characteristic, path or cluster address, depending on the protocol
    pub address: Option<String>,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(address: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            address: Some(address.into()),
            payload,
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// A device announcing itself on a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    pub device_id: String,
    pub device_type: String,
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Received signal strength in dBm
    #[serde(default)]
    pub rssi: Option<i16>,
    /// Advertised service UUIDs (BLE)
    #[serde(default)]
    pub services: Vec<String>,
    /// Commissionable node vendor id (Matter)
    #[serde(default)]
    pub vendor_id: Option<u16>,
    /// Commissionable node product id (Matter)
    #[serde(default)]
    pub product_id: Option<u16>,
    /// Cloud product key
    #[serde(default)]
    pub product_key: Option<String>,
}

impl Advertisement {
    pub fn new(device_id: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_type: device_type.into(),
            vendor: None,
            model: None,
            rssi: None,
            services: Vec::new(),
            vendor_id: None,
            product_id: None,
            product_key: None,
        }
    }

    pub fn with_vendor_model(mut self, vendor: impl Into<String>, model: impl Into<String>) -> Self {
        self.vendor = Some(vendor.into());
        self.model = Some(model.into());
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.services.push(service.into());
        self
    }

    pub fn with_matter_ids(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.vendor_id = Some(vendor_id);
        self.product_id = Some(product_id);
        self
    }

    pub fn with_product_key(mut self, product_key: impl Into<String>) -> Self {
        self.product_key = Some(product_key.into());
        self
    }

    /// Discovery record for this advertisement seen on `protocol`.
    pub fn into_discovered(self, protocol: ProtocolKind) -> DiscoveredDevice {
        let mut device = DiscoveredDevice::new(self.device_id, self.device_type, protocol)
            .with_vendor_model(self.vendor, self.model);
        if let Some(rssi) = self.rssi {
            device = device.with_signal(rssi);
        }
        device
    }
}

/// Inbound traffic and link events, delivered in order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    Message(Frame),
    Advertisement(Advertisement),
    LinkDown(String),
}

/// A bidirectional link to a single device.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Protocol this transport speaks.
    fn protocol(&self) -> ProtocolKind;

    /// Open the link to `device_id`. Reopening replaces any previous link.
    async fn open(&self, device_id: &str) -> Result<(), TransportError>;

    /// Close the link. Closing a closed transport is not an error.
    async fn close(&self) -> Result<(), TransportError>;

    /// Write one frame.
    async fn write(&self, frame: Frame) -> Result<(), TransportError>;

    async fn subscribe(&self, address: &str) -> Result<(), TransportError>;

    async fn unsubscribe(&self, address: &str) -> Result<(), TransportError>;

    /// Round trip on the open link; used for keep-alive.
    async fn probe(&self) -> Result<Duration, TransportError>;

    /// Subscribe to inbound signals. Subscribe before `open` to see every signal.
    fn signals(&self) -> broadcast::Receiver<TransportSignal>;

    /// Listen for advertisements for `window`. The receiver closes when the
    /// window ends.
    async fn scan(&self, window: Duration) -> Result<mpsc::Receiver<Advertisement>, TransportError>;
}

/// Source of transports for the adapter factory.
pub trait TransportProvider: Send + Sync {
    fn transport_for(&self, config: &ProtocolConfig) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Broker and HTTP transports where compiled in, loopback links for BLE,
/// Matter and cloud.
#[derive(Clone, Default)]
pub struct DefaultTransportProvider {
    loopback: LoopbackNetwork,
}

impl DefaultTransportProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `network` for the protocols without a native transport.
    pub fn with_loopback(network: LoopbackNetwork) -> Self {
        Self { loopback: network }
    }

    pub fn loopback(&self) -> &LoopbackNetwork {
        &self.loopback
    }
}

impl TransportProvider for DefaultTransportProvider {
    fn transport_for(&self, config: &ProtocolConfig) -> Result<Arc<dyn Transport>, TransportError> {
        match config {
            #[cfg(feature = "mqtt")]
            ProtocolConfig::Mqtt(mqtt) => Ok(Arc::new(MqttTransport::new(mqtt.clone()))),
            #[cfg(not(feature = "mqtt"))]
            ProtocolConfig::Mqtt(_) => Err(TransportError::Unsupported(
                "mqtt support is not compiled in".to_string(),
            )),
            #[cfg(feature = "http")]
            ProtocolConfig::Http(http) => Ok(Arc::new(HttpTransport::new(http.clone())?)),
            #[cfg(not(feature = "http"))]
            ProtocolConfig::Http(_) => Err(TransportError::Unsupported(
                "http support is not compiled in".to_string(),
            )),
            ProtocolConfig::Ble(_) | ProtocolConfig::Matter(_) | ProtocolConfig::Cloud(_) => {
                Ok(Arc::new(self.loopback.transport(config.protocol())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_mapping() {
        assert_eq!(
            ConnectionError::from(TransportError::LinkLost("reset".into())),
            ConnectionError::ConnectionLost
        );
        assert_eq!(
            ConnectionError::from(TransportError::NoPeer("lamp".into())),
            ConnectionError::DeviceNotFound("lamp".into())
        );
        assert_eq!(
            ConnectionError::from(TransportError::AuthRejected),
            ConnectionError::AuthenticationFailed
        );
    }

    #[test]
    fn test_advertisement_json() {
        let json = r#"{"device_id":"hub-1","device_type":"gateway","rssi":-40}"#;
        let ad: Advertisement = serde_json::from_str(json).unwrap();
        let found = ad.into_discovered(ProtocolKind::Mqtt);
        assert_eq!(found.device_id, "hub-1");
        assert_eq!(found.signal_strength, Some(-40));
        assert_eq!(found.protocol, ProtocolKind::Mqtt);
    }

    #[test]
    fn test_default_provider_routes_radio_protocols_to_loopback() {
        let provider = DefaultTransportProvider::new();
        let transport = provider
            .transport_for(&ProtocolConfig::Ble(Default::default()))
            .unwrap();
        assert_eq!(transport.protocol(), ProtocolKind::Ble);
    }
}
