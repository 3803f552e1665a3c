//! Message codecs turn adapter messages into transport frames.

use unilink_core::error::ConnectionResult;

use crate::adapter::AdapterMessage;
use crate::transport::Frame;

/// Per-protocol framing.
pub trait MessageCodec: Send + Sync {
    /// Frame a message for `device_id`.
    fn encode(&self, device_id: &str, message: &AdapterMessage) -> ConnectionResult<Frame>;

    /// Payload of an inbound frame.
    fn decode(&self, frame: &Frame) -> serde_json::Value {
        decode_json(&frame.payload)
    }

    /// Transport address for a subscription to `topic`.
    fn subscription_address(&self, device_id: &str, topic: &str) -> ConnectionResult<String>;
}

/// JSON payload, or the lossy text when the bytes are not JSON.
pub fn decode_json(payload: &[u8]) -> serde_json::Value {
    serde_json::from_slice(payload)
        .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(payload).into_owned()))
}

pub(crate) fn encode_json(value: &serde_json::Value) -> ConnectionResult<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| unilink_core::error::ConnectionError::ProtocolError(e.to_string()))
}
