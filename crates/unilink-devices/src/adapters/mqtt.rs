//! MQTT adapter: JSON envelopes on per-device downlink topics.

use std::sync::Arc;

use unilink_core::connection::ConnectionParameters;
use unilink_core::error::ConnectionResult;
use unilink_core::protocol::ProtocolKind;
use unilink_core::protocol_config::MqttConfig;

use super::codec::{decode_json, encode_json, MessageCodec};
use super::discovery::ScanDiscovery;
use super::session::SessionAdapter;
use crate::adapter::AdapterMessage;
use crate::transport::{Frame, Transport};

pub fn uplink_topic(device_id: &str) -> String {
    format!("device/{}/uplink", device_id)
}

pub fn downlink_topic(device_id: &str) -> String {
    format!("device/{}/downlink", device_id)
}

/// Wraps payloads in `{device_id, timestamp, data}`.
pub struct MqttCodec;

impl MessageCodec for MqttCodec {
    fn encode(&self, device_id: &str, message: &AdapterMessage) -> ConnectionResult<Frame> {
        let envelope = serde_json::json!({
            "device_id": device_id,
            "timestamp": chrono::Utc::now().timestamp_millis(),
            "data": message.payload,
        });
        Ok(Frame {
            address: Some(
                message
                    .topic
                    .clone()
                    .unwrap_or_else(|| downlink_topic(device_id)),
            ),
            payload: encode_json(&envelope)?,
        })
    }

    fn decode(&self, frame: &Frame) -> serde_json::Value {
        match decode_json(&frame.payload) {
            serde_json::Value::Object(mut map) if map.contains_key("data") => {
                map.remove("data").unwrap_or_default()
            }
            other => other,
        }
    }

    fn subscription_address(&self, device_id: &str, topic: &str) -> ConnectionResult<String> {
        if topic.contains('/') {
            Ok(topic.to_string())
        } else {
            Ok(format!("device/{}/{}", device_id, topic))
        }
    }
}

pub fn create_mqtt_adapter(
    _config: &MqttConfig,
    transport: Arc<dyn Transport>,
    params: ConnectionParameters,
) -> SessionAdapter {
    SessionAdapter::new("mqtt", ProtocolKind::Mqtt, transport, Box::new(MqttCodec), params)
}

/// Discovery over the broker's announce topic.
pub fn create_mqtt_discovery(_config: &MqttConfig, transport: Arc<dyn Transport>) -> ScanDiscovery {
    ScanDiscovery::new(ProtocolKind::Mqtt, transport)
}
