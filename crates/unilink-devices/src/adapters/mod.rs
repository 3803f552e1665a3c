//! Reference protocol adapters.
//!
//! Every adapter is a [`SessionAdapter`] over a [`Transport`](crate::transport::Transport)
//! with a protocol-specific [`MessageCodec`]. Discovery is a [`ScanDiscovery`]
//! with a protocol-specific advertisement filter.

pub mod ble;
pub mod cloud;
pub mod codec;
pub mod diagnostics;
pub mod discovery;
pub mod http;
pub mod matter;
pub mod mqtt;
pub mod session;

pub use ble::{create_ble_adapter, create_ble_discovery, BleCodec};
pub use cloud::{create_cloud_adapter, create_cloud_discovery, CloudCodec};
pub use codec::MessageCodec;
pub use diagnostics::DiagnosticsTracker;
pub use discovery::{AdvertisementFilter, ScanDiscovery};
pub use http::{create_http_adapter, HttpCodec};
pub use matter::{create_matter_adapter, create_matter_discovery, MatterCodec};
pub use mqtt::{create_mqtt_adapter, create_mqtt_discovery, MqttCodec};
pub use session::SessionAdapter;
