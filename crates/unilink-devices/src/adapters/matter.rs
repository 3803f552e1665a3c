//! Matter adapter: frames addressed by endpoint and cluster.

use std::sync::Arc;

use unilink_core::connection::ConnectionParameters;
use unilink_core::error::ConnectionResult;
use unilink_core::protocol::ProtocolKind;
use unilink_core::protocol_config::MatterConfig;

use super::codec::{decode_json, encode_json, MessageCodec};
use super::discovery::ScanDiscovery;
use super::session::SessionAdapter;
use crate::adapter::AdapterMessage;
use crate::transport::{Frame, Transport};

/// Cluster a command payload is addressed to, keyed by the payload's `type` tag.
pub fn cluster_for(payload: &serde_json::Value) -> &'static str {
    match payload.get("type").and_then(|t| t.as_str()) {
        Some("switch") | Some("timer") => "on_off",
        Some("dim") => "level_control",
        Some("color") => "color_control",
        Some("temperature") => "thermostat",
        Some("scene") => "scenes",
        _ => "vendor_specific",
    }
}

pub struct MatterCodec {
    endpoint: u16,
}

impl MatterCodec {
    pub fn new(config: &MatterConfig) -> Self {
        Self {
            endpoint: config.endpoint,
        }
    }

    fn address(&self, cluster: &str) -> String {
        format!("endpoint/{}/cluster/{}", self.endpoint, cluster)
    }
}

impl MessageCodec for MatterCodec {
    fn encode(&self, _device_id: &str, message: &AdapterMessage) -> ConnectionResult<Frame> {
        let cluster = cluster_for(&message.payload);
        let body = serde_json::json!({
            "endpoint": self.endpoint,
            "cluster": cluster,
            "fields": message.payload,
        });
        Ok(Frame {
            address: Some(
                message
                    .topic
                    .clone()
                    .unwrap_or_else(|| self.address(cluster)),
            ),
            payload: encode_json(&body)?,
        })
    }

    fn decode(&self, frame: &Frame) -> serde_json::Value {
        let mut value = decode_json(&frame.payload);
        match value.get_mut("fields") {
            Some(fields) => fields.take(),
            None => value,
        }
    }

    fn subscription_address(&self, _device_id: &str, topic: &str) -> ConnectionResult<String> {
        if topic.contains('/') {
            Ok(topic.to_string())
        } else {
            Ok(self.address(topic))
        }
    }
}

pub fn create_matter_adapter(
    config: &MatterConfig,
    transport: Arc<dyn Transport>,
    params: ConnectionParameters,
) -> SessionAdapter {
    SessionAdapter::new(
        "matter",
        ProtocolKind::Matter,
        transport,
        Box::new(MatterCodec::new(config)),
        params,
    )
}

/// Commissionable node scan filtered by vendor and product id.
pub fn create_matter_discovery(config: &MatterConfig, transport: Arc<dyn Transport>) -> ScanDiscovery {
    let vendor_id = config.vendor_id;
    let product_id = config.product_id;
    ScanDiscovery::new(ProtocolKind::Matter, transport).with_filter(Arc::new(move |ad| {
        ad.vendor_id.map_or(true, |v| v == vendor_id)
            && ad.product_id.map_or(true, |p| p == product_id)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use unilink_core::command::CommandPayload;

    #[test]
    fn test_cluster_routing() {
        let codec = MatterCodec::new(&MatterConfig::default());
        let dim = AdapterMessage::new(CommandPayload::Dim { level: 40 }.to_json());
        let frame = codec.encode("bulb", &dim).unwrap();
        assert_eq!(
            frame.address.as_deref(),
            Some("endpoint/1/cluster/level_control")
        );
        assert_eq!(codec.decode(&frame)["level"], 40);
    }

    #[test]
    fn test_unknown_type_goes_to_vendor_cluster() {
        assert_eq!(cluster_for(&serde_json::json!({"x": 1})), "vendor_specific");
        assert_eq!(cluster_for(&serde_json::json!({"type": "scene"})), "scenes");
    }
}
