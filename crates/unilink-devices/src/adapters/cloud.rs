//! Cloud SDK adapter: service invocations scoped by product key and region.

use std::sync::Arc;

use unilink_core::connection::ConnectionParameters;
use unilink_core::error::ConnectionResult;
use unilink_core::protocol::ProtocolKind;
use unilink_core::protocol_config::CloudConfig;

use super::codec::{decode_json, encode_json, MessageCodec};
use super::discovery::ScanDiscovery;
use super::session::SessionAdapter;
use crate::adapter::AdapterMessage;
use crate::transport::{Frame, Transport};

pub struct CloudCodec {
    product_key: String,
    device_name: String,
    region: String,
}

impl CloudCodec {
    pub fn new(config: &CloudConfig) -> Self {
        Self {
            product_key: config.product_key.clone(),
            device_name: config.device_name.clone(),
            region: config.region.clone(),
        }
    }

    fn device_name<'a>(&'a self, device_id: &'a str) -> &'a str {
        if self.device_name.is_empty() {
            device_id
        } else {
            &self.device_name
        }
    }
}

impl MessageCodec for CloudCodec {
    fn encode(&self, device_id: &str, message: &AdapterMessage) -> ConnectionResult<Frame> {
        let device_name = self.device_name(device_id);
        let body = serde_json::json!({
            "id": uuid::Uuid::new_v4().to_string(),
            "product_key": self.product_key,
            "device_name": device_name,
            "region": self.region,
            "params": message.payload,
        });
        let address = message.topic.clone().unwrap_or_else(|| {
            format!("/{}/{}/thing/service/invoke", self.product_key, device_name)
        });
        Ok(Frame {
            address: Some(address),
            payload: encode_json(&body)?,
        })
    }

    fn decode(&self, frame: &Frame) -> serde_json::Value {
        let mut value = decode_json(&frame.payload);
        match value.get_mut("params") {
            Some(params) => params.take(),
            None => value,
        }
    }

    fn subscription_address(&self, device_id: &str, topic: &str) -> ConnectionResult<String> {
        Ok(format!(
            "/{}/{}/{}",
            self.product_key,
            self.device_name(device_id),
            topic.trim_start_matches('/')
        ))
    }
}

pub fn create_cloud_adapter(
    config: &CloudConfig,
    transport: Arc<dyn Transport>,
    params: ConnectionParameters,
) -> SessionAdapter {
    SessionAdapter::new(
        "cloud",
        ProtocolKind::Cloud,
        transport,
        Box::new(CloudCodec::new(config)),
        params,
    )
}

/// Account device listing restricted to the configured product key.
pub fn create_cloud_discovery(config: &CloudConfig, transport: Arc<dyn Transport>) -> ScanDiscovery {
    let product_key = config.product_key.clone();
    ScanDiscovery::new(ProtocolKind::Cloud, transport).with_filter(Arc::new(move |ad| {
        ad.product_key.as_deref().map_or(true, |key| key == product_key)
    }))
}
