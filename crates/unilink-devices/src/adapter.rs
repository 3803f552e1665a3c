//! Protocol adapter contract.
//!
//! A [`ProtocolAdapter`] is one logical session with one device over one
//! protocol. It is owned by exactly one device communicator and never shared.
//! Adapters report what happens on the link through [`AdapterEvent`]s; they
//! never touch the device registry or the event bus directly.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use unilink_core::command::DeviceCommand;
use unilink_core::connection::{ConnectionQuality, ConnectionState, ConnectionStatistics};
use unilink_core::device::{DeviceDescriptor, DiscoveredDevice};
use unilink_core::error::{ConnectionError, ConnectionResult};
use unilink_core::protocol::ProtocolKind;

/// Stream of connection states; yields the current state first.
pub type StateStream = Pin<Box<dyn Stream<Item = ConnectionState> + Send>>;

/// Stream of adapter events.
pub type AdapterEventStream = Pin<Box<dyn Stream<Item = AdapterEvent> + Send>>;

/// Stream of discovered devices; ends when the discovery window closes.
pub type DiscoveryStream = Pin<Box<dyn Stream<Item = DiscoveredDevice> + Send>>;

/// Message sent through an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterMessage {
    /// Protocol-specific address; the codec picks a default when absent
    #[serde(default)]
    pub topic: Option<String>,
    pub payload: serde_json::Value,
}

impl AdapterMessage {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            topic: None,
            payload,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Message carrying a command's payload.
    pub fn command(command: &DeviceCommand) -> Self {
        Self::new(command.payload.to_json())
    }
}

/// Something that happened on an adapter's link.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    StateChanged {
        old: ConnectionState,
        new: ConnectionState,
    },
    Message {
        topic: Option<String>,
        payload: serde_json::Value,
    },
    /// The link came back after `attempts` reconnection attempts.
    Reconnected { attempts: u32 },
    /// Reconnection gave up. Emitted once per lost link.
    ConnectionFailed {
        attempts: u32,
        error: ConnectionError,
    },
}

/// Point-in-time link measurements.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    /// Moving average of write round trips
    pub latency_ms: f64,
    /// Bytes written per second over the measurement window
    pub throughput_bps: f64,
    /// Failed writes over total writes
    pub packet_loss: f64,
    /// Errors over operations
    pub error_rate: f64,
    pub stability: f64,
    pub reconnects: u32,
    pub operations: u64,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            latency_ms: 0.0,
            throughput_bps: 0.0,
            packet_loss: 0.0,
            error_rate: 0.0,
            stability: 1.0,
            reconnects: 0,
            operations: 0,
        }
    }
}

impl Diagnostics {
    pub fn quality(&self) -> ConnectionQuality {
        ConnectionQuality {
            stability: self.stability,
            latency_ms: self.latency_ms,
            throughput_bps: self.throughput_bps,
            packet_loss: self.packet_loss,
            error_rate: self.error_rate,
        }
    }
}

/// Uniform connect/send/subscribe contract over one protocol.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    /// Protocol this adapter speaks.
    fn protocol(&self) -> ProtocolKind;

    /// Adapter name, for logs.
    fn name(&self) -> &str;

    /// Open a session with `device`.
    ///
    /// Resolves once the session is established or has failed within the
    /// connect timeout. Calling it on a connected adapter returns a new state
    /// stream without touching the link.
    async fn connect(&self, device: &DeviceDescriptor) -> ConnectionResult<StateStream>;

    /// Close the session and cancel any pending reconnection.
    async fn disconnect(&self) -> ConnectionResult<()>;

    /// Send one message. Fails fast when not connected.
    async fn send(&self, message: AdapterMessage) -> ConnectionResult<()>;

    async fn subscribe(&self, topic: &str) -> ConnectionResult<()>;

    async fn unsubscribe(&self, topic: &str) -> ConnectionResult<()>;

    fn current_state(&self) -> ConnectionState;

    fn diagnostics(&self) -> Diagnostics;

    fn statistics(&self) -> ConnectionStatistics;

    /// Subscribe to link events.
    fn events(&self) -> AdapterEventStream;
}

/// Finds devices reachable over one protocol.
#[async_trait]
pub trait DeviceDiscovery: Send + Sync {
    fn protocol(&self) -> ProtocolKind;

    /// Start a discovery window of at most `window`.
    async fn discover(&self, window: Duration) -> ConnectionResult<DiscoveryStream>;
}
