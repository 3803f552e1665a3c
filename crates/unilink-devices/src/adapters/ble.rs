//! BLE adapter: frames addressed by GATT characteristic.

use std::sync::Arc;
use std::time::Duration;

use unilink_core::connection::ConnectionParameters;
use unilink_core::error::{ConnectionError, ConnectionResult};
use unilink_core::protocol::ProtocolKind;
use unilink_core::protocol_config::BleConfig;

use super::codec::{encode_json, MessageCodec};
use super::discovery::ScanDiscovery;
use super::session::SessionAdapter;
use crate::adapter::AdapterMessage;
use crate::transport::{Frame, Transport};

/// ATT header bytes taken out of every MTU.
const ATT_HEADER_LEN: usize = 3;

pub struct BleCodec {
    characteristic: String,
    mtu: u16,
}

impl BleCodec {
    pub fn new(config: &BleConfig) -> Self {
        Self {
            characteristic: config.command_characteristic.clone(),
            mtu: config.mtu,
        }
    }

    fn max_payload(&self) -> usize {
        (self.mtu as usize).saturating_sub(ATT_HEADER_LEN)
    }
}

impl MessageCodec for BleCodec {
    fn encode(&self, _device_id: &str, message: &AdapterMessage) -> ConnectionResult<Frame> {
        let payload = encode_json(&message.payload)?;
        if payload.len() > self.max_payload() {
            return Err(ConnectionError::ProtocolError(format!(
                "frame of {} bytes exceeds MTU payload of {} bytes",
                payload.len(),
                self.max_payload()
            )));
        }
        Ok(Frame {
            address: Some(
                message
                    .topic
                    .clone()
                    .unwrap_or_else(|| self.characteristic.clone()),
            ),
            payload,
        })
    }

    /// Subscribing enables notifications on a characteristic.
    fn subscription_address(&self, _device_id: &str, topic: &str) -> ConnectionResult<String> {
        Ok(topic.to_ascii_lowercase())
    }
}

pub fn create_ble_adapter(
    config: &BleConfig,
    transport: Arc<dyn Transport>,
    params: ConnectionParameters,
) -> SessionAdapter {
    SessionAdapter::new(
        "ble",
        ProtocolKind::Ble,
        transport,
        Box::new(BleCodec::new(config)),
        params,
    )
}

/// Advertisement scan honoring service filters and the scan timeout.
pub fn create_ble_discovery(config: &BleConfig, transport: Arc<dyn Transport>) -> ScanDiscovery {
    let filters: Vec<String> = config
        .service_filters
        .iter()
        .map(|s| s.to_ascii_lowercase())
        .collect();
    ScanDiscovery::new(ProtocolKind::Ble, transport)
        .with_max_window(Duration::from_millis(config.scan_timeout_ms))
        .with_filter(Arc::new(move |ad| {
            filters.is_empty()
                || ad
                    .services
                    .iter()
                    .any(|s| filters.contains(&s.to_ascii_lowercase()))
        }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_targets_characteristic() {
        let codec = BleCodec::new(&BleConfig::default());
        let frame = codec
            .encode("tag", &AdapterMessage::new(serde_json::json!({"type": "switch", "on": true})))
            .unwrap();
        assert_eq!(
            frame.address.as_deref(),
            Some("0000ff01-0000-1000-8000-00805f9b34fb")
        );
    }

    #[test]
    fn test_mtu_limit() {
        let codec = BleCodec::new(&BleConfig {
            mtu: 23,
            ..BleConfig::default()
        });
        let big = serde_json::json!({"name": "x".repeat(40)});
        assert!(matches!(
            codec.encode("tag", &AdapterMessage::new(big)),
            Err(ConnectionError::ProtocolError(_))
        ));
    }
}
