//! Adapter factory.
//!
//! The only place that knows every concrete adapter type. Adapters are created
//! by protocol name plus a typed [`ProtocolConfig`]; the factory checks the
//! configuration matches the protocol, validates it, asks the transport
//! provider for a link and hands back a boxed [`ProtocolAdapter`].

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use unilink_core::connection::ConnectionParameters;
use unilink_core::error::ConnectionError;
use unilink_core::protocol::ProtocolKind;
use unilink_core::protocol_config::ProtocolConfig;

use crate::adapter::{DeviceDiscovery, ProtocolAdapter};
use crate::adapters;
use crate::transport::{TransportError, TransportProvider};

/// Adapter construction failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FactoryError {
    /// No adapter implementation exists for the requested name.
    #[error("Unsupported adapter type: {0}")]
    UnsupportedType(String),

    /// The configuration does not fit the protocol or is invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transport unavailable: {0}")]
    Transport(#[from] TransportError),
}

impl From<FactoryError> for ConnectionError {
    fn from(err: FactoryError) -> Self {
        match err {
            FactoryError::UnsupportedType(name) => {
                ConnectionError::UnsupportedOperation(format!("no adapter for {}", name))
            }
            FactoryError::Configuration(msg) => ConnectionError::ConfigurationError(msg),
            FactoryError::Transport(e) => e.into(),
        }
    }
}

pub type FactoryResult<T> = Result<T, FactoryError>;

/// Creation counters, for observability only.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoryStats {
    pub adapters_created: u64,
    pub discoveries_created: u64,
    pub failures: u64,
    pub by_protocol: HashMap<String, u64>,
}

/// Builds adapters and discovery handles.
pub struct AdapterFactory {
    transports: Arc<dyn TransportProvider>,
    parameters: ConnectionParameters,
    stats: RwLock<FactoryStats>,
}

impl AdapterFactory {
    pub fn new(transports: Arc<dyn TransportProvider>, parameters: ConnectionParameters) -> Self {
        Self {
            transports,
            parameters,
            stats: RwLock::new(FactoryStats::default()),
        }
    }

    /// Connection parameters handed to every adapter.
    pub fn parameters(&self) -> &ConnectionParameters {
        &self.parameters
    }

    /// Protocols an adapter can be built for.
    pub fn available_adapters() -> Vec<ProtocolKind> {
        ProtocolKind::ALL
            .iter()
            .copied()
            .filter(|kind| Self::supports(*kind))
            .collect()
    }

    pub fn supports(kind: ProtocolKind) -> bool {
        !matches!(kind, ProtocolKind::WebSocket)
    }

    /// Create an adapter by protocol name.
    pub fn create_adapter(
        &self,
        protocol_name: &str,
        config: &ProtocolConfig,
    ) -> FactoryResult<Box<dyn ProtocolAdapter>> {
        let kind = Self::resolve(protocol_name)?;
        self.create_adapter_for(kind, config)
    }

    /// Create an adapter from an untyped JSON configuration.
    ///
    /// The JSON must be the configuration of `protocol_name`, without the
    /// `protocol` tag.
    pub fn create_adapter_from_value(
        &self,
        protocol_name: &str,
        config: &serde_json::Value,
    ) -> FactoryResult<Box<dyn ProtocolAdapter>> {
        let kind = Self::resolve(protocol_name)?;
        let typed = Self::parse_config(kind, config)?;
        self.create_adapter_for(kind, &typed)
    }

    pub fn create_adapter_for(
        &self,
        kind: ProtocolKind,
        config: &ProtocolConfig,
    ) -> FactoryResult<Box<dyn ProtocolAdapter>> {
        let result = self.build_adapter(kind, config);
        self.record(kind, result.is_ok(), false);
        result
    }

    /// Create a discovery handle by protocol name.
    pub fn create_discovery(
        &self,
        protocol_name: &str,
        config: &ProtocolConfig,
    ) -> FactoryResult<Box<dyn DeviceDiscovery>> {
        let kind = Self::resolve(protocol_name)?;
        let result = self.build_discovery(kind, config);
        self.record(kind, result.is_ok(), true);
        result
    }

    pub fn stats(&self) -> FactoryStats {
        self.stats.read().clone()
    }

    fn resolve(protocol_name: &str) -> FactoryResult<ProtocolKind> {
        let kind: ProtocolKind = protocol_name
            .parse()
            .map_err(|_| FactoryError::UnsupportedType(protocol_name.to_string()))?;
        if !Self::supports(kind) {
            return Err(FactoryError::UnsupportedType(kind.to_string()));
        }
        Ok(kind)
    }

    fn parse_config(kind: ProtocolKind, value: &serde_json::Value) -> FactoryResult<ProtocolConfig> {
        let invalid = |e: serde_json::Error| {
            FactoryError::Configuration(format!("Invalid {} config: {}", kind, e))
        };
        let config = match kind {
            ProtocolKind::Mqtt => ProtocolConfig::Mqtt(serde_json::from_value(value.clone()).map_err(invalid)?),
            ProtocolKind::Ble => ProtocolConfig::Ble(serde_json::from_value(value.clone()).map_err(invalid)?),
            ProtocolKind::Matter => {
                ProtocolConfig::Matter(serde_json::from_value(value.clone()).map_err(invalid)?)
            }
            ProtocolKind::Cloud => {
                ProtocolConfig::Cloud(serde_json::from_value(value.clone()).map_err(invalid)?)
            }
            ProtocolKind::Http => ProtocolConfig::Http(serde_json::from_value(value.clone()).map_err(invalid)?),
            ProtocolKind::WebSocket => return Err(FactoryError::UnsupportedType(kind.to_string())),
        };
        Ok(config)
    }

    fn check(kind: ProtocolKind, config: &ProtocolConfig) -> FactoryResult<()> {
        if !Self::supports(kind) {
            return Err(FactoryError::UnsupportedType(kind.to_string()));
        }
        if config.protocol() != kind {
            return Err(FactoryError::Configuration(format!(
                "{} configuration given for {} adapter",
                config.protocol(),
                kind
            )));
        }
        config
            .validate()
            .map_err(|e| FactoryError::Configuration(e.to_string()))
    }

    fn build_adapter(
        &self,
        kind: ProtocolKind,
        config: &ProtocolConfig,
    ) -> FactoryResult<Box<dyn ProtocolAdapter>> {
        Self::check(kind, config)?;
        let transport = self.transports.transport_for(config)?;
        let params = self.parameters.clone();
        let adapter = match config {
            ProtocolConfig::Mqtt(c) => adapters::create_mqtt_adapter(c, transport, params),
            ProtocolConfig::Ble(c) => adapters::create_ble_adapter(c, transport, params),
            ProtocolConfig::Matter(c) => adapters::create_matter_adapter(c, transport, params),
            ProtocolConfig::Cloud(c) => adapters::create_cloud_adapter(c, transport, params),
            ProtocolConfig::Http(c) => adapters::create_http_adapter(c, transport, params),
        };
        debug!(protocol = %kind, "Adapter created");
        Ok(Box::new(adapter))
    }

    fn build_discovery(
        &self,
        kind: ProtocolKind,
        config: &ProtocolConfig,
    ) -> FactoryResult<Box<dyn DeviceDiscovery>> {
        Self::check(kind, config)?;
        let transport = self.transports.transport_for(config)?;
        let discovery = match config {
            ProtocolConfig::Mqtt(c) => adapters::create_mqtt_discovery(c, transport),
            ProtocolConfig::Ble(c) => adapters::create_ble_discovery(c, transport),
            ProtocolConfig::Matter(c) => adapters::create_matter_discovery(c, transport),
            ProtocolConfig::Cloud(c) => adapters::create_cloud_discovery(c, transport),
            ProtocolConfig::Http(_) => {
                return Err(FactoryError::UnsupportedType("http discovery".to_string()))
            }
        };
        Ok(Box::new(discovery))
    }

    fn record(&self, kind: ProtocolKind, ok: bool, discovery: bool) {
        let mut stats = self.stats.write();
        if !ok {
            stats.failures += 1;
            warn!(protocol = %kind, discovery, "Factory request failed");
            return;
        }
        if discovery {
            stats.discoveries_created += 1;
        } else {
            stats.adapters_created += 1;
            *stats.by_protocol.entry(kind.to_string()).or_default() += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LoopbackNetwork, LoopbackTransportProvider};
    use unilink_core::protocol_config::{BleConfig, MqttConfig};

    fn factory() -> AdapterFactory {
        AdapterFactory::new(
            Arc::new(LoopbackTransportProvider::new(LoopbackNetwork::new())),
            ConnectionParameters::default(),
        )
    }

    #[test]
    fn test_unknown_name_is_unsupported() {
        let f = factory();
        let cfg = ProtocolConfig::Ble(BleConfig::default());
        assert!(matches!(
            f.create_adapter("lora", &cfg),
            Err(FactoryError::UnsupportedType(_))
        ));
        assert!(matches!(
            f.create_adapter("ws", &cfg),
            Err(FactoryError::UnsupportedType(_))
        ));
    }

    #[test]
    fn test_mismatched_config_is_configuration_error() {
        let f = factory();
        let cfg = ProtocolConfig::Mqtt(MqttConfig::default());
        assert!(matches!(
            f.create_adapter("ble", &cfg),
            Err(FactoryError::Configuration(_))
        ));
        assert_eq!(f.stats().failures, 1);
    }

    #[test]
    fn test_create_counts_per_protocol() {
        let f = factory();
        let cfg = ProtocolConfig::Ble(BleConfig::default());
        let adapter = f.create_adapter("bluetooth", &cfg).unwrap();
        assert_eq!(adapter.protocol(), ProtocolKind::Ble);
        f.create_adapter("ble", &cfg).unwrap();
        let stats = f.stats();
        assert_eq!(stats.adapters_created, 2);
        assert_eq!(stats.by_protocol.get("ble"), Some(&2));
    }

    #[test]
    fn test_from_value() {
        let f = factory();
        let adapter = f
            .create_adapter_from_value("ble", &serde_json::json!({"mtu": 247}))
            .unwrap();
        assert_eq!(adapter.name(), "ble");
        assert!(matches!(
            f.create_adapter_from_value("ble", &serde_json::json!({"mtu": "big"})),
            Err(FactoryError::Configuration(_))
        ));
    }

    #[test]
    fn test_http_has_no_discovery() {
        let f = factory();
        let cfg = ProtocolConfig::Http(Default::default());
        assert!(f.create_discovery("http", &cfg).is_err());
        assert!(!AdapterFactory::available_adapters().contains(&ProtocolKind::WebSocket));
    }
}
