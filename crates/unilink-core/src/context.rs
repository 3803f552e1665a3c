//! Communication context: everything a strategy needs to pick a protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::device::DeviceDescriptor;
use crate::protocol::{NetworkMedium, ProtocolKind};

/// Default number of connection records kept per device.
pub const DEFAULT_HISTORY_CAPACITY: usize = 20;

/// Snapshot of the local network environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEnvironment {
    pub wifi_available: bool,
    /// Wi-Fi signal in [0, 1]
    pub wifi_signal: f64,
    pub cellular_available: bool,
    /// Cellular signal in [0, 1]
    pub cellular_signal: f64,
    pub bluetooth_available: bool,
    /// Bluetooth signal in [0, 1]
    pub bluetooth_signal: f64,
    pub captured_at: DateTime<Utc>,
}

impl Default for NetworkEnvironment {
    fn default() -> Self {
        Self {
            wifi_available: true,
            wifi_signal: 0.8,
            cellular_available: false,
            cellular_signal: 0.0,
            bluetooth_available: true,
            bluetooth_signal: 0.8,
            captured_at: Utc::now(),
        }
    }
}

impl NetworkEnvironment {
    /// An environment with no connectivity at all.
    pub fn offline() -> Self {
        Self {
            wifi_available: false,
            wifi_signal: 0.0,
            cellular_available: false,
            cellular_signal: 0.0,
            bluetooth_available: false,
            bluetooth_signal: 0.0,
            captured_at: Utc::now(),
        }
    }

    /// Whether `medium` can currently be used.
    pub fn is_available(&self, medium: NetworkMedium) -> bool {
        match medium {
            NetworkMedium::Wifi => self.wifi_available,
            NetworkMedium::Bluetooth => self.bluetooth_available,
            NetworkMedium::Internet => self.wifi_available || self.cellular_available,
        }
    }

    /// Best signal in [0, 1] for `medium`, 0 when unavailable.
    pub fn signal_for(&self, medium: NetworkMedium) -> f64 {
        let signal = match medium {
            NetworkMedium::Wifi if self.wifi_available => self.wifi_signal,
            NetworkMedium::Bluetooth if self.bluetooth_available => self.bluetooth_signal,
            NetworkMedium::Internet => {
                let wifi = if self.wifi_available { self.wifi_signal } else { 0.0 };
                let cell = if self.cellular_available {
                    self.cellular_signal
                } else {
                    0.0
                };
                wifi.max(cell)
            }
            _ => 0.0,
        };
        signal.clamp(0.0, 1.0)
    }

    /// Whether `protocol` is reachable in this environment.
    pub fn supports_protocol(&self, protocol: ProtocolKind) -> bool {
        self.is_available(protocol.profile().medium)
    }
}

/// What the user wants to optimise for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityFactor {
    Speed,
    Reliability,
    Power,
    Security,
    #[default]
    Balanced,
}

/// Required security level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Low,
    #[default]
    Standard,
    High,
    Critical,
}

/// User preferences that bias strategy selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPreferences {
    pub priority: PriorityFactor,
    /// Whether the communicator may switch protocols on its own
    pub allow_protocol_switching: bool,
    pub security_level: SecurityLevel,
    /// Explicit power-saving request
    #[serde(default)]
    pub power_saving_mode: bool,
}

impl Default for UserPreferences {
    fn default() -> Self {
        Self {
            priority: PriorityFactor::Balanced,
            allow_protocol_switching: true,
            security_level: SecurityLevel::Standard,
            power_saving_mode: false,
        }
    }
}

impl UserPreferences {
    /// Whether the user asked for power saving, explicitly or through the priority.
    pub fn power_saving_requested(&self) -> bool {
        self.power_saving_mode || self.priority == PriorityFactor::Power
    }
}

/// Outcome of one past connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub protocol: ProtocolKind,
    pub duration_ms: u64,
    pub quality_score: u8,
    pub success: bool,
    pub recorded_at: DateTime<Utc>,
}

impl ConnectionRecord {
    pub fn new(protocol: ProtocolKind, duration_ms: u64, quality_score: u8, success: bool) -> Self {
        Self {
            protocol,
            duration_ms,
            quality_score,
            success,
            recorded_at: Utc::now(),
        }
    }
}

/// Bounded connection history, oldest records dropped first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionHistory {
    records: VecDeque<ConnectionRecord>,
    capacity: usize,
}

impl Default for ConnectionHistory {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }
}

impl ConnectionHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, record: ConnectionRecord) {
        while self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn records(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.records.iter()
    }

    pub fn most_recent(&self) -> Option<&ConnectionRecord> {
        self.records.back()
    }

    /// Success ratio over all records, or over the records of one protocol.
    /// `None` when there is nothing to judge by.
    pub fn success_rate(&self, protocol: Option<ProtocolKind>) -> Option<f64> {
        let (total, ok) = self
            .records
            .iter()
            .filter(|r| protocol.map_or(true, |p| r.protocol == p))
            .fold((0usize, 0usize), |(total, ok), r| {
                (total + 1, ok + usize::from(r.success))
            });
        if total == 0 {
            None
        } else {
            Some(ok as f64 / total as f64)
        }
    }
}

/// Everything known about one device's communication situation.
///
/// Owned by the device communicator and replaced atomically on update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunicationContext {
    pub device: DeviceDescriptor,
    pub network: NetworkEnvironment,
    pub preferences: UserPreferences,
    pub history: ConnectionHistory,
    pub updated_at: DateTime<Utc>,
}

impl CommunicationContext {
    pub fn new(device: DeviceDescriptor) -> Self {
        Self {
            device,
            network: NetworkEnvironment::default(),
            preferences: UserPreferences::default(),
            history: ConnectionHistory::default(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_network(mut self, network: NetworkEnvironment) -> Self {
        self.network = network;
        self
    }

    pub fn with_preferences(mut self, preferences: UserPreferences) -> Self {
        self.preferences = preferences;
        self
    }

    pub fn with_history(mut self, history: ConnectionHistory) -> Self {
        self.history = history;
        self
    }

    /// Supported protocols that are reachable right now, in device order.
    pub fn reachable_protocols(&self) -> Vec<ProtocolKind> {
        self.device
            .capabilities
            .supported_protocols
            .iter()
            .copied()
            .filter(|p| self.network.supports_protocol(*p))
            .collect()
    }

    /// Whether replacing `self` with `next` changes what strategies would see
    /// about the device itself. Timestamp bumps and history growth do not count.
    pub fn device_changed(&self, next: &CommunicationContext) -> bool {
        self.device.device_type != next.device.device_type
            || self.device.capabilities != next.device.capabilities
    }
}
