//! Core types for the UniLink connectivity layer.
//!
//! This crate defines the shared data model, error taxonomy, connectivity
//! events, the bounded event bus and configuration loading. It performs no I/O
//! beyond reading configuration files.

pub mod command;
pub mod config;
pub mod connection;
pub mod context;
pub mod device;
pub mod error;
pub mod event;
pub mod eventbus;
pub mod protocol;
pub mod protocol_config;

pub use command::{
    CommandId, CommandPayload, CommandPriority, CommandStatus, CommandType, DeviceCommand,
    DeviceCommandResult,
};
pub use config::{
    ConfigError, ConnectivityConfig, OverflowPolicy, ProcessorConfig, QueueConfig, QueueOrdering,
};
pub use connection::{
    BackoffPolicy, ConnectionInfo, ConnectionParameters, ConnectionQuality, ConnectionState,
    ConnectionStatistics, QualityLevel,
};
pub use context::{
    CommunicationContext, ConnectionHistory, ConnectionRecord, NetworkEnvironment,
    PriorityFactor, SecurityLevel, UserPreferences,
};
pub use device::{DeviceCapabilities, DeviceDescriptor, DeviceId, DiscoveredDevice};
pub use error::{ConnectionError, ConnectionResult, ControlError, ControlResult};
pub use event::{ConnectivityEvent, EventMetadata};
pub use eventbus::{EventBus, EventBusReceiver, FilteredReceiver, DEFAULT_CHANNEL_CAPACITY};
pub use protocol::{NetworkMedium, ProtocolKind, ProtocolProfile, UnknownProtocol};
pub use protocol_config::{
    BleConfig, CloudConfig, HttpConfig, MatterConfig, MqttConfig, ProtocolConfig,
};

/// Re-exports commonly used types.
pub mod prelude {
    pub use crate::command::{CommandPayload, CommandPriority, DeviceCommand, DeviceCommandResult};
    pub use crate::config::ConnectivityConfig;
    pub use crate::connection::{ConnectionInfo, ConnectionQuality, ConnectionState};
    pub use crate::context::CommunicationContext;
    pub use crate::device::{DeviceDescriptor, DiscoveredDevice};
    pub use crate::error::{ConnectionError, ConnectionResult, ControlError, ControlResult};
    pub use crate::event::ConnectivityEvent;
    pub use crate::eventbus::EventBus;
    pub use crate::protocol::ProtocolKind;
}
