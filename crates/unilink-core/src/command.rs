//! Device command data structures.
//!
//! Command parameters are a typed sum type per command type, validated before
//! dispatch so shape mismatches never reach an adapter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::device::DeviceId;
use crate::error::ControlError;

/// Unique command identifier.
pub type CommandId = String;

/// Default command timeout.
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 10_000;

/// Command priority levels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum CommandPriority {
    /// Background operations
    Low = 1,
    /// Regular operations
    #[default]
    Normal = 2,
    /// User-initiated operations
    High = 3,
    /// Urgent operations
    Critical = 4,
}

impl CommandPriority {
    /// All priorities, lowest first.
    pub const ALL: [CommandPriority; 4] = [
        CommandPriority::Low,
        CommandPriority::Normal,
        CommandPriority::High,
        CommandPriority::Critical,
    ];

    pub fn value(&self) -> u8 {
        *self as u8
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            CommandPriority::Low => "low",
            CommandPriority::Normal => "normal",
            CommandPriority::High => "high",
            CommandPriority::Critical => "critical",
        }
    }
}

impl std::fmt::Display for CommandPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.type_name())
    }
}

/// Command type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    Switch,
    Dim,
    Color,
    Temperature,
    Scene,
    Timer,
    Custom,
    Batch,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Switch => "switch",
            Self::Dim => "dim",
            Self::Color => "color",
            Self::Temperature => "temperature",
            Self::Scene => "scene",
            Self::Timer => "timer",
            Self::Custom => "custom",
            Self::Batch => "batch",
        }
    }
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed command parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CommandPayload {
    /// Turn on or off
    Switch { on: bool },
    /// Brightness in percent
    Dim { level: u8 },
    /// HSV color; hue in degrees, saturation and brightness in [0, 1]
    Color {
        hue: f64,
        saturation: f64,
        brightness: f64,
    },
    /// Target temperature in degrees Celsius
    Temperature { celsius: f64 },
    /// Activate a stored scene
    Scene { scene_id: String },
    /// Run `action` after `delay_secs`
    Timer {
        delay_secs: u64,
        action: Box<CommandPayload>,
    },
    /// Vendor specific command with free-form parameters
    Custom {
        name: String,
        #[serde(default)]
        params: serde_json::Map<String, serde_json::Value>,
    },
    /// Several payloads applied in order
    Batch { items: Vec<CommandPayload> },
}

impl CommandPayload {
    pub fn command_type(&self) -> CommandType {
        match self {
            Self::Switch { .. } => CommandType::Switch,
            Self::Dim { .. } => CommandType::Dim,
            Self::Color { .. } => CommandType::Color,
            Self::Temperature { .. } => CommandType::Temperature,
            Self::Scene { .. } => CommandType::Scene,
            Self::Timer { .. } => CommandType::Timer,
            Self::Custom { .. } => CommandType::Custom,
            Self::Batch { .. } => CommandType::Batch,
        }
    }

    /// Check parameter ranges for this command type.
    pub fn validate(&self) -> Result<(), ControlError> {
        match self {
            Self::Switch { .. } => Ok(()),
            Self::Dim { level } if *level > 100 => Err(ControlError::InvalidParameters(format!(
                "dim level {} out of range 0..=100",
                level
            ))),
            Self::Dim { .. } => Ok(()),
            Self::Color {
                hue,
                saturation,
                brightness,
            } => {
                if !(0.0..360.0).contains(hue) {
                    return Err(ControlError::InvalidParameters(format!(
                        "hue {} out of range 0..360",
                        hue
                    )));
                }
                if !(0.0..=1.0).contains(saturation) || !(0.0..=1.0).contains(brightness) {
                    return Err(ControlError::InvalidParameters(
                        "saturation and brightness must be within 0..=1".to_string(),
                    ));
                }
                Ok(())
            }
            Self::Temperature { celsius } => {
                if !(-40.0..=100.0).contains(celsius) {
                    return Err(ControlError::InvalidParameters(format!(
                        "temperature {} out of range -40..=100",
                        celsius
                    )));
                }
                Ok(())
            }
            Self::Scene { scene_id } if scene_id.trim().is_empty() => Err(
                ControlError::InvalidParameters("scene id must not be empty".to_string()),
            ),
            Self::Scene { .. } => Ok(()),
            Self::Timer { delay_secs, action } => {
                if *delay_secs == 0 {
                    return Err(ControlError::InvalidParameters(
                        "timer delay must be positive".to_string(),
                    ));
                }
                if matches!(**action, Self::Timer { .. }) {
                    return Err(ControlError::InvalidParameters(
                        "nested timers are not supported".to_string(),
                    ));
                }
                action.validate()
            }
            Self::Custom { name, .. } if name.trim().is_empty() => Err(
                ControlError::InvalidParameters("custom command name must not be empty".to_string()),
            ),
            Self::Custom { .. } => Ok(()),
            Self::Batch { items } => {
                if items.is_empty() {
                    return Err(ControlError::InvalidParameters(
                        "batch must contain at least one item".to_string(),
                    ));
                }
                items.iter().try_for_each(CommandPayload::validate)
            }
        }
    }

    /// JSON body used by adapters when encoding the command on the wire.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// A command addressed to one device. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub command_id: CommandId,
    pub device_id: DeviceId,
    pub payload: CommandPayload,
    pub priority: CommandPriority,
    pub timeout_ms: u64,
    /// How many times the command may be retried after a failed execution
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
}

impl DeviceCommand {
    /// Create a command with a generated id.
    pub fn new(device_id: impl Into<String>, payload: CommandPayload) -> Self {
        Self {
            command_id: Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            payload,
            priority: CommandPriority::Normal,
            timeout_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            max_retries: 0,
            created_at: Utc::now(),
        }
    }

    /// Use a caller-supplied id.
    pub fn with_id(mut self, command_id: impl Into<String>) -> Self {
        self.command_id = command_id.into();
        self
    }

    pub fn with_priority(mut self, priority: CommandPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    pub fn with_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn command_type(&self) -> CommandType {
        self.payload.command_type()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Validate the command before dispatch.
    pub fn validate(&self) -> Result<(), ControlError> {
        if self.device_id.trim().is_empty() {
            return Err(ControlError::InvalidParameters(
                "target device id must not be empty".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ControlError::InvalidParameters(
                "timeout must be positive".to_string(),
            ));
        }
        self.payload.validate()
    }
}

/// Terminal status of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Outcome of executing a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommandResult {
    pub command_id: CommandId,
    pub device_id: DeviceId,
    pub status: CommandStatus,
    /// Device response, if any
    pub payload: Option<serde_json::Value>,
    pub error: Option<ControlError>,
    pub execution_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl DeviceCommandResult {
    pub fn completed(
        command: &DeviceCommand,
        payload: Option<serde_json::Value>,
        elapsed: Duration,
    ) -> Self {
        Self::build(command, CommandStatus::Completed, payload, None, elapsed)
    }

    pub fn failed(command: &DeviceCommand, error: ControlError, elapsed: Duration) -> Self {
        Self::build(command, CommandStatus::Failed, None, Some(error), elapsed)
    }

    pub fn cancelled(command: &DeviceCommand, reason: impl Into<String>) -> Self {
        Self::build(
            command,
            CommandStatus::Cancelled,
            None,
            Some(ControlError::ExecutionFailed(reason.into())),
            Duration::ZERO,
        )
    }

    /// A failed result carrying a timeout error for `command`.
    pub fn timed_out(command: &DeviceCommand) -> Self {
        Self::failed(
            command,
            ControlError::Timeout(command.timeout_ms),
            command.timeout(),
        )
    }

    fn build(
        command: &DeviceCommand,
        status: CommandStatus,
        payload: Option<serde_json::Value>,
        error: Option<ControlError>,
        elapsed: Duration,
    ) -> Self {
        Self {
            command_id: command.command_id.clone(),
            device_id: command.device_id.clone(),
            status,
            payload,
            error,
            execution_time_ms: elapsed.as_millis().min(u64::MAX as u128) as u64,
            timestamp: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Completed
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.error, Some(ControlError::Timeout(_)))
    }
}
