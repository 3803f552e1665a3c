//! Connectivity configuration.
//!
//! Every field has a default, so an empty TOML file is a valid configuration.
//! Values are resolved in this order: defaults, TOML file, `UNILINK_*`
//! environment variables. [`ConnectivityConfig::validate`] runs last.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::{BackoffPolicy, ConnectionParameters};
use crate::protocol::ProtocolKind;
use crate::protocol_config::{
    BleConfig, CloudConfig, HttpConfig, MatterConfig, MqttConfig, ProtocolConfig,
};

/// Default values shared across crates.
pub mod defaults {
    /// Re-evaluate the active strategy this often
    pub const REEVALUATION_INTERVAL_SECS: u64 = 300;
    /// Switch strategy when the active one scores below this
    pub const REEVALUATION_THRESHOLD: u8 = 60;
    /// Sample connection quality this often while connected
    pub const QUALITY_MONITOR_INTERVAL_SECS: u64 = 30;
    /// Drop connection records that have been idle this long
    pub const INACTIVITY_TIMEOUT_SECS: u64 = 300;
    /// Run the inactivity sweep this often
    pub const SWEEP_INTERVAL_SECS: u64 = 60;
    /// Stop discovery after this long
    pub const DISCOVERY_TIMEOUT_SECS: u64 = 10;
    /// Maximum queued commands per device
    pub const QUEUE_MAX_SIZE: usize = 100;
    /// Commands executing at the same time
    pub const PROCESSOR_MAX_CONCURRENT: usize = 10;
    /// Idle wait between queue polls
    pub const PROCESSOR_POLL_INTERVAL_MS: u64 = 50;
}

/// Environment variable names.
pub mod env_vars {
    /// Path of the TOML configuration file
    pub const CONFIG: &str = "UNILINK_CONFIG";
    /// `true` switches logging to JSON lines
    pub const LOG_JSON: &str = "UNILINK_LOG_JSON";
    pub const EVENT_CHANNEL_CAPACITY: &str = "UNILINK_EVENT_CHANNEL_CAPACITY";
    pub const REEVALUATION_INTERVAL_SECS: &str = "UNILINK_REEVALUATION_INTERVAL_SECS";
    pub const REEVALUATION_THRESHOLD: &str = "UNILINK_REEVALUATION_THRESHOLD";
    pub const AUTO_RECONNECT: &str = "UNILINK_AUTO_RECONNECT";
    pub const MAX_RECONNECT_ATTEMPTS: &str = "UNILINK_MAX_RECONNECT_ATTEMPTS";
    pub const INACTIVITY_TIMEOUT_SECS: &str = "UNILINK_INACTIVITY_TIMEOUT_SECS";
    pub const QUEUE_MAX_SIZE: &str = "UNILINK_QUEUE_MAX_SIZE";
    pub const PROCESSOR_MAX_CONCURRENT: &str = "UNILINK_PROCESSOR_MAX_CONCURRENT";
    pub const MQTT_HOST: &str = "UNILINK_MQTT_HOST";
    pub const MQTT_PORT: &str = "UNILINK_MQTT_PORT";
    pub const HTTP_BASE_URL: &str = "UNILINK_HTTP_BASE_URL";
    pub const CLOUD_REGION: &str = "UNILINK_CLOUD_REGION";

    /// Whether JSON logging was requested.
    pub fn log_json() -> bool {
        std::env::var(LOG_JSON)
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false)
    }
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Invalid value '{value}' for {var}")]
    Env { var: String, value: String },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Event bus settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: crate::eventbus::DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Device communicator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunicatorConfig {
    pub reevaluation_interval_secs: u64,
    pub reevaluation_threshold: u8,
    pub quality_monitor_interval_secs: u64,
    pub history_capacity: usize,
}

impl Default for CommunicatorConfig {
    fn default() -> Self {
        Self {
            reevaluation_interval_secs: defaults::REEVALUATION_INTERVAL_SECS,
            reevaluation_threshold: defaults::REEVALUATION_THRESHOLD,
            quality_monitor_interval_secs: defaults::QUALITY_MONITOR_INTERVAL_SECS,
            history_capacity: crate::context::DEFAULT_HISTORY_CAPACITY,
        }
    }
}

impl CommunicatorConfig {
    pub fn reevaluation_interval(&self) -> Duration {
        Duration::from_secs(self.reevaluation_interval_secs)
    }

    pub fn quality_monitor_interval(&self) -> Duration {
        Duration::from_secs(self.quality_monitor_interval_secs)
    }
}

/// Session and reconnection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub auto_reconnect: bool,
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: f64,
    pub connect_timeout_ms: u64,
    pub operation_timeout_ms: u64,
    pub keep_alive_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        let params = ConnectionParameters::default();
        Self {
            auto_reconnect: params.auto_reconnect,
            max_attempts: params.max_reconnect_attempts,
            initial_delay_ms: params.backoff.initial_delay_ms,
            max_delay_ms: params.backoff.max_delay_ms,
            multiplier: params.backoff.multiplier,
            jitter: params.backoff.jitter,
            connect_timeout_ms: params.connect_timeout_ms,
            operation_timeout_ms: params.operation_timeout_ms,
            keep_alive_secs: params.keep_alive_secs,
        }
    }
}

impl ReconnectConfig {
    /// Session parameters for new connections.
    pub fn parameters(&self) -> ConnectionParameters {
        ConnectionParameters {
            connect_timeout_ms: self.connect_timeout_ms,
            operation_timeout_ms: self.operation_timeout_ms,
            keep_alive_secs: self.keep_alive_secs,
            auto_reconnect: self.auto_reconnect,
            max_reconnect_attempts: self.max_attempts,
            backoff: BackoffPolicy {
                initial_delay_ms: self.initial_delay_ms,
                max_delay_ms: self.max_delay_ms,
                multiplier: self.multiplier,
                jitter: self.jitter,
            },
        }
    }
}

/// Adapter manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub inactivity_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub discovery_timeout_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: defaults::INACTIVITY_TIMEOUT_SECS,
            sweep_interval_secs: defaults::SWEEP_INTERVAL_SECS,
            discovery_timeout_secs: defaults::DISCOVERY_TIMEOUT_SECS,
        }
    }
}

impl ManagerConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.inactivity_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }
}

/// Order in which queued commands leave the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOrdering {
    /// Arrival order only
    Fifo,
    /// Highest priority first, arrival order among equals
    #[default]
    Priority,
}

/// What happens when a device's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Refuse the new command
    #[default]
    Reject,
    /// Evict the oldest queued command to make room
    DropOldest,
}

/// Command queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Capacity per target device
    pub max_size: usize,
    pub ordering: QueueOrdering,
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: defaults::QUEUE_MAX_SIZE,
            ordering: QueueOrdering::Priority,
            overflow: OverflowPolicy::Reject,
        }
    }
}

impl QueueConfig {
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_ordering(mut self, ordering: QueueOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }
}

/// Command processor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Idle wait between queue polls
    pub poll_interval_ms: u64,
    /// Commands executing at the same time
    pub max_concurrent: usize,
    /// Capacity of the result broadcast channel
    pub result_channel_capacity: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::PROCESSOR_POLL_INTERVAL_MS,
            max_concurrent: defaults::PROCESSOR_MAX_CONCURRENT,
            result_channel_capacity: 256,
        }
    }
}

impl ProcessorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Default adapter configuration per protocol.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolDefaults {
    pub mqtt: MqttConfig,
    pub ble: BleConfig,
    pub matter: MatterConfig,
    pub cloud: CloudConfig,
    pub http: HttpConfig,
}

impl ProtocolDefaults {
    /// Configured defaults for `protocol`; `None` for protocols without an adapter.
    pub fn config_for(&self, protocol: ProtocolKind) -> Option<ProtocolConfig> {
        match protocol {
            ProtocolKind::Mqtt => Some(ProtocolConfig::Mqtt(self.mqtt.clone())),
            ProtocolKind::Ble => Some(ProtocolConfig::Ble(self.ble.clone())),
            ProtocolKind::Matter => Some(ProtocolConfig::Matter(self.matter.clone())),
            ProtocolKind::Cloud => Some(ProtocolConfig::Cloud(self.cloud.clone())),
            ProtocolKind::Http => Some(ProtocolConfig::Http(self.http.clone())),
            ProtocolKind::WebSocket => None,
        }
    }
}

/// Complete connectivity configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
    pub events: EventsConfig,
    pub communicator: CommunicatorConfig,
    pub reconnect: ReconnectConfig,
    pub manager: ManagerConfig,
    pub queue: QueueConfig,
    pub processor: ProcessorConfig,
    pub protocols: ProtocolDefaults,
}

impl ConnectivityConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from a TOML file, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `UNILINK_CONFIG` if set, otherwise use defaults with
    /// environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(env_vars::CONFIG) {
            Ok(path) if !path.trim().is_empty() => Self::load(path),
            _ => {
                let mut config = Self::default();
                config.apply_env_overrides()?;
                config.validate()?;
                Ok(config)
            }
        }
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Apply `UNILINK_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(var: &str, value: String) -> Result<T, ConfigError> {
            value.trim().parse().map_err(|_| ConfigError::Env {
                var: var.to_string(),
                value,
            })
        }

        if let Some(v) = lookup(env_vars::EVENT_CHANNEL_CAPACITY) {
            self.events.channel_capacity = parsed(env_vars::EVENT_CHANNEL_CAPACITY, v)?;
        }
        if let Some(v) = lookup(env_vars::REEVALUATION_INTERVAL_SECS) {
            self.communicator.reevaluation_interval_secs =
                parsed(env_vars::REEVALUATION_INTERVAL_SECS, v)?;
        }
        if let Some(v) = lookup(env_vars::REEVALUATION_THRESHOLD) {
            self.communicator.reevaluation_threshold = parsed(env_vars::REEVALUATION_THRESHOLD, v)?;
        }
        if let Some(v) = lookup(env_vars::AUTO_RECONNECT) {
            self.reconnect.auto_reconnect = parsed(env_vars::AUTO_RECONNECT, v)?;
        }
        if let Some(v) = lookup(env_vars::MAX_RECONNECT_ATTEMPTS) {
            self.reconnect.max_attempts = parsed(env_vars::MAX_RECONNECT_ATTEMPTS, v)?;
        }
        if let Some(v) = lookup(env_vars::INACTIVITY_TIMEOUT_SECS) {
            self.manager.inactivity_timeout_secs = parsed(env_vars::INACTIVITY_TIMEOUT_SECS, v)?;
        }
        if let Some(v) = lookup(env_vars::QUEUE_MAX_SIZE) {
            self.queue.max_size = parsed(env_vars::QUEUE_MAX_SIZE, v)?;
        }
        if let Some(v) = lookup(env_vars::PROCESSOR_MAX_CONCURRENT) {
            self.processor.max_concurrent = parsed(env_vars::PROCESSOR_MAX_CONCURRENT, v)?;
        }
        if let Some(v) = lookup(env_vars::MQTT_HOST) {
            self.protocols.mqtt.host = v;
        }
        if let Some(v) = lookup(env_vars::MQTT_PORT) {
            self.protocols.mqtt.port = parsed(env_vars::MQTT_PORT, v)?;
        }
        if let Some(v) = lookup(env_vars::HTTP_BASE_URL) {
            self.protocols.http.base_url = v;
        }
        if let Some(v) = lookup(env_vars::CLOUD_REGION) {
            self.protocols.cloud.region = v;
        }
        Ok(())
    }

    /// Reject values the runtime cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.events.channel_capacity == 0 {
            return invalid("events.channel_capacity must be positive");
        }
        if self.communicator.reevaluation_threshold > 100 {
            return invalid("communicator.reevaluation_threshold must be within 0..=100");
        }
        if self.communicator.reevaluation_interval_secs == 0 {
            return invalid("communicator.reevaluation_interval_secs must be positive");
        }
        if self.communicator.quality_monitor_interval_secs == 0 {
            return invalid("communicator.quality_monitor_interval_secs must be positive");
        }
        if self.communicator.history_capacity == 0 {
            return invalid("communicator.history_capacity must be positive");
        }
        if self.reconnect.multiplier < 1.0 {
            return invalid("reconnect.multiplier must be at least 1.0");
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return invalid("reconnect.jitter must be within 0..=1");
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return invalid("reconnect.initial_delay_ms must not exceed max_delay_ms");
        }
        if self.reconnect.connect_timeout_ms == 0 || self.reconnect.operation_timeout_ms == 0 {
            return invalid("reconnect timeouts must be positive");
        }
        if self.manager.inactivity_timeout_secs == 0 || self.manager.sweep_interval_secs == 0 {
            return invalid("manager inactivity timeout and sweep interval must be positive");
        }
        if self.queue.max_size == 0 {
            return invalid("queue.max_size must be positive");
        }
        if self.processor.max_concurrent == 0 {
            return invalid("processor.max_concurrent must be positive");
        }
        if self.processor.result_channel_capacity == 0 {
            return invalid("processor.result_channel_capacity must be positive");
        }

        for protocol in ProtocolKind::ALL {
            if let Some(config) = self.protocols.config_for(protocol) {
                config
                    .validate()
                    .map_err(|e| ConfigError::Invalid(format!("protocols.{}: {}", protocol, e)))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_validate() {
        let config = ConnectivityConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.communicator.reevaluation_threshold, 60);
        assert_eq!(config.communicator.history_capacity, 20);
        assert_eq!(config.reconnect.max_attempts, 3);
    }

    #[test]
    fn test_partial_toml() {
        let config = ConnectivityConfig::from_toml_str(
            r#"
            [queue]
            max_size = 10
            overflow = "drop_oldest"

            [protocols.mqtt]
            host = "broker.local"
            "#,
        )
        .unwrap();
        assert_eq!(config.queue.max_size, 10);
        assert_eq!(config.queue.overflow, OverflowPolicy::DropOldest);
        assert_eq!(config.queue.ordering, QueueOrdering::Priority);
        assert_eq!(config.protocols.mqtt.host, "broker.local");
        assert_eq!(config.protocols.mqtt.port, 1883);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = ConnectivityConfig::default();
        let text = config.to_toml_string().unwrap();
        assert_eq!(ConnectivityConfig::from_toml_str(&text).unwrap(), config);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (env_vars::QUEUE_MAX_SIZE, "7"),
            (env_vars::MQTT_HOST, "10.0.0.2"),
            (env_vars::AUTO_RECONNECT, "false"),
        ]
        .into_iter()
        .collect();

        let mut config = ConnectivityConfig::default();
        config
            .apply_overrides_from(|var| vars.get(var).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.queue.max_size, 7);
        assert_eq!(config.protocols.mqtt.host, "10.0.0.2");
        assert!(!config.reconnect.auto_reconnect);
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = ConnectivityConfig::default();
        let err = config
            .apply_overrides_from(|var| (var == env_vars::MQTT_PORT).then(|| "abc".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
    }

    #[test]
    fn test_validation_rejects() {
        let mut config = ConnectivityConfig::default();
        config.communicator.reevaluation_threshold = 101;
        assert!(config.validate().is_err());

        let mut config = ConnectivityConfig::default();
        config.queue.max_size = 0;
        assert!(config.validate().is_err());

        let mut config = ConnectivityConfig::default();
        config.protocols.mqtt.qos = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_reconnect_parameters() {
        let reconnect = ReconnectConfig {
            max_attempts: 5,
            initial_delay_ms: 10,
            ..ReconnectConfig::default()
        };
        let params = reconnect.parameters();
        assert_eq!(params.max_reconnect_attempts, 5);
        assert_eq!(params.backoff.initial_delay_ms, 10);
    }

    #[test]
    fn test_protocol_defaults() {
        let defaults = ProtocolDefaults::default();
        assert!(defaults.config_for(ProtocolKind::WebSocket).is_none());
        assert_eq!(
            defaults.config_for(ProtocolKind::Ble).map(|c| c.protocol()),
            Some(ProtocolKind::Ble)
        );
    }
}
