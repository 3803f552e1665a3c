//! HTTP adapter: JSON bodies posted to the device's command endpoint.

use std::sync::Arc;

use unilink_core::connection::ConnectionParameters;
use unilink_core::error::{ConnectionError, ConnectionResult};
use unilink_core::protocol::ProtocolKind;
use unilink_core::protocol_config::HttpConfig;

use super::codec::{encode_json, MessageCodec};
use super::session::SessionAdapter;
use crate::adapter::AdapterMessage;
use crate::transport::{Frame, Transport};

pub struct HttpCodec;

impl MessageCodec for HttpCodec {
    fn encode(&self, device_id: &str, message: &AdapterMessage) -> ConnectionResult<Frame> {
        Ok(Frame {
            address: Some(
                message
                    .topic
                    .clone()
                    .unwrap_or_else(|| format!("/devices/{}/commands", device_id)),
            ),
            payload: encode_json(&message.payload)?,
        })
    }

    fn subscription_address(&self, _device_id: &str, _topic: &str) -> ConnectionResult<String> {
        Err(ConnectionError::UnsupportedOperation(
            "http has no subscriptions".to_string(),
        ))
    }
}

pub fn create_http_adapter(
    _config: &HttpConfig,
    transport: Arc<dyn Transport>,
    params: ConnectionParameters,
) -> SessionAdapter {
    SessionAdapter::new("http", ProtocolKind::Http, transport, Box::new(HttpCodec), params)
}
