//! Events published by the connectivity layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::command::DeviceCommandResult;
use crate::connection::{ConnectionQuality, ConnectionState, QualityLevel};
use crate::device::DiscoveredDevice;
use crate::protocol::ProtocolKind;

/// Event published on the connectivity event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConnectivityEvent {
    /// A device session changed state
    StateChanged {
        device_id: String,
        protocol: Option<ProtocolKind>,
        old_state: ConnectionState,
        new_state: ConnectionState,
        timestamp: DateTime<Utc>,
    },
    /// New quality metrics for a device session
    QualityUpdated {
        device_id: String,
        protocol: ProtocolKind,
        quality: ConnectionQuality,
        score: u8,
        level: QualityLevel,
        timestamp: DateTime<Utc>,
    },
    /// A device was seen during discovery
    DeviceDiscovered { device: DiscoveredDevice },
    /// A command reached a terminal status
    CommandCompleted { result: DeviceCommandResult },
    /// The communicator switched to another strategy
    StrategyChanged {
        device_id: String,
        from: Option<String>,
        to: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    /// Reconnection gave up; terminal for this session
    ConnectionFailed {
        device_id: String,
        protocol: Option<ProtocolKind>,
        attempts: u32,
        error: String,
        timestamp: DateTime<Utc>,
    },
    /// A device pushed data to us
    MessageReceived {
        device_id: String,
        protocol: ProtocolKind,
        topic: Option<String>,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    },
}

impl ConnectivityEvent {
    /// Build a state-change event stamped now.
    pub fn state_changed(
        device_id: impl Into<String>,
        protocol: Option<ProtocolKind>,
        old_state: ConnectionState,
        new_state: ConnectionState,
    ) -> Self {
        Self::StateChanged {
            device_id: device_id.into(),
            protocol,
            old_state,
            new_state,
            timestamp: Utc::now(),
        }
    }

    /// Build a quality event stamped now.
    pub fn quality_updated(
        device_id: impl Into<String>,
        protocol: ProtocolKind,
        quality: ConnectionQuality,
    ) -> Self {
        Self::QualityUpdated {
            device_id: device_id.into(),
            protocol,
            score: quality.score(),
            level: quality.level(),
            quality,
            timestamp: Utc::now(),
        }
    }

    /// Device the event is about.
    pub fn device_id(&self) -> &str {
        match self {
            Self::StateChanged { device_id, .. }
            | Self::QualityUpdated { device_id, .. }
            | Self::StrategyChanged { device_id, .. }
            | Self::ConnectionFailed { device_id, .. }
            | Self::MessageReceived { device_id, .. } => device_id,
            Self::DeviceDiscovered { device } => &device.device_id,
            Self::CommandCompleted { result } => &result.device_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::StateChanged { timestamp, .. }
            | Self::QualityUpdated { timestamp, .. }
            | Self::StrategyChanged { timestamp, .. }
            | Self::ConnectionFailed { timestamp, .. }
            | Self::MessageReceived { timestamp, .. } => *timestamp,
            Self::DeviceDiscovered { device } => device.discovered_at,
            Self::CommandCompleted { result } => result.timestamp,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "state_changed",
            Self::QualityUpdated { .. } => "quality_updated",
            Self::DeviceDiscovered { .. } => "device_discovered",
            Self::CommandCompleted { .. } => "command_completed",
            Self::StrategyChanged { .. } => "strategy_changed",
            Self::ConnectionFailed { .. } => "connection_failed",
            Self::MessageReceived { .. } => "message_received",
        }
    }
}

/// Metadata attached to every published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub event_id: String,
    /// Component that published the event (e.g. "communicator:lamp-1")
    pub source: String,
    pub published_at: DateTime<Utc>,
}

impl EventMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            source: source.into(),
            published_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let event = ConnectivityEvent::state_changed(
            "lamp",
            Some(ProtocolKind::Matter),
            ConnectionState::Connecting,
            ConnectionState::Connected,
        );
        assert_eq!(event.device_id(), "lamp");
        assert_eq!(event.type_name(), "state_changed");
    }

    #[test]
    fn test_quality_event_carries_score() {
        let event = ConnectivityEvent::quality_updated(
            "lamp",
            ProtocolKind::Ble,
            ConnectionQuality::default(),
        );
        match event {
            ConnectivityEvent::QualityUpdated { score, level, .. } => {
                assert_eq!(score, 80);
                assert_eq!(level, QualityLevel::Excellent);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_event_json_tag() {
        let event = ConnectivityEvent::DeviceDiscovered {
            device: DiscoveredDevice::new("tag", "sensor", ProtocolKind::Ble),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "device_discovered");
    }
}
