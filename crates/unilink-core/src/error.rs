//! Error taxonomy for the connectivity layer.
//!
//! Two families of errors flow through the system:
//! - [`ConnectionError`] is raised by transports, protocol adapters and the
//!   device communicator. Some variants are recoverable through the adapter's
//!   own reconnection logic (see [`ConnectionError::is_retryable`]).
//! - [`ControlError`] is raised by the adapter manager and the command layer.
//!   These are usage/configuration errors and are never retried automatically,
//!   except for failed command executions which the command processor may retry
//!   within the command's retry budget.

use serde::{Deserialize, Serialize};

/// Result type for connection-level operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Result type for control-level operations.
pub type ControlResult<T> = Result<T, ControlError>;

/// Error type for connection-level operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ConnectionError {
    /// Operation did not complete in time
    #[error("Operation timeout after {0}ms")]
    Timeout(u64),

    /// Credentials were rejected by the remote side
    #[error("Authentication failed")]
    AuthenticationFailed,

    /// The network medium the protocol needs is not available
    #[error("Network unavailable")]
    NetworkUnavailable,

    /// The target device could not be found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The device refused the operation because it is busy
    #[error("Device is busy")]
    DeviceBusy,

    /// Protocol-level failure
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Invalid or mismatched configuration
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// A required resource (socket, radio, slot) is unavailable
    #[error("Resource unavailable: {0}")]
    ResourceUnavailable(String),

    /// Missing OS or account permission
    #[error("Permission denied")]
    PermissionDenied,

    /// The operation is not supported by this adapter
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// The operation is not valid in the current connection state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The operation requires an established connection
    #[error("Not connected")]
    NotConnected,

    /// The connection went away while the operation was in flight
    #[error("Connection lost")]
    ConnectionLost,

    /// Reconnection gave up after the configured number of attempts
    #[error("Connection failed after {0} attempts")]
    RetriesExhausted(u32),

    /// Anything else
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl ConnectionError {
    /// Whether an adapter may recover from this error by reconnecting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::NetworkUnavailable
                | Self::DeviceBusy
                | Self::ProtocolError(_)
                | Self::ResourceUnavailable(_)
                | Self::ConnectionLost
                | Self::Unknown(_)
        )
    }

    /// Whether this error describes a lost or missing link.
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            Self::NotConnected | Self::ConnectionLost | Self::NetworkUnavailable
        )
    }
}

/// Error type for device control operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ControlError {
    /// No such device
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The device has no routing entry in the adapter manager
    #[error("Device not routed: {0}")]
    DeviceNotRouted(String),

    /// No adapter is registered for the requested protocol
    #[error("Adapter not available: {0}")]
    AdapterNotAvailable(String),

    /// The adapter cannot execute this command type
    #[error("Command not supported: {0}")]
    CommandNotSupported(String),

    /// Parameters do not match the command type's schema
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// The command was dispatched but failed
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    /// No result arrived within the command timeout
    #[error("Command timeout after {0}ms")]
    Timeout(u64),
}

impl ControlError {
    /// Whether the command processor may retry a command that failed with this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExecutionFailed(_))
    }
}

impl From<ConnectionError> for ControlError {
    fn from(err: ConnectionError) -> Self {
        match err {
            ConnectionError::Timeout(ms) => ControlError::Timeout(ms),
            ConnectionError::DeviceNotFound(id) => ControlError::DeviceNotFound(id),
            ConnectionError::UnsupportedOperation(op) => ControlError::CommandNotSupported(op),
            ConnectionError::ConfigurationError(msg) => ControlError::InvalidParameters(msg),
            other => ControlError::ExecutionFailed(other.to_string()),
        }
    }
}
