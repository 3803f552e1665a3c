//! Persistence collaborator seam.
//!
//! Durable device records are kept outside this crate. A [`ConnectionStateSink`]
//! is fed from a background task subscribed to the event bus, never from inside
//! a connect or command call.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use unilink_core::connection::ConnectionState;
use unilink_core::event::ConnectivityEvent;
use unilink_core::eventbus::EventBus;
use unilink_core::protocol::ProtocolKind;

use crate::scheduler::ScheduledTask;

/// A connection-state fact worth persisting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    pub device_id: String,
    pub protocol: Option<ProtocolKind>,
    pub state: ConnectionState,
    /// Set when the session ended in a terminal failure
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StateRecord {
    /// Record for events that change what a persistence layer should store.
    pub fn from_event(event: &ConnectivityEvent) -> Option<Self> {
        match event {
            ConnectivityEvent::StateChanged {
                device_id,
                protocol,
                new_state,
                timestamp,
                ..
            } => Some(Self {
                device_id: device_id.clone(),
                protocol: *protocol,
                state: *new_state,
                error: None,
                timestamp: *timestamp,
            }),
            ConnectivityEvent::ConnectionFailed {
                device_id,
                protocol,
                error,
                timestamp,
                ..
            } => Some(Self {
                device_id: device_id.clone(),
                protocol: *protocol,
                state: ConnectionState::Disconnected,
                error: Some(error.clone()),
                timestamp: *timestamp,
            }),
            _ => None,
        }
    }
}

/// Receives connection-state changes for durable device records.
#[async_trait]
pub trait ConnectionStateSink: Send + Sync {
    async fn record(&self, record: StateRecord) -> Result<(), SinkError>;
}

/// A sink could not store a record. Logged by the forwarder, never propagated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("State sink error: {0}")]
pub struct SinkError(pub String);

/// Keeps the latest record per device in memory.
#[derive(Debug, Default)]
pub struct MemoryStateSink {
    latest: RwLock<HashMap<String, StateRecord>>,
    history: RwLock<Vec<StateRecord>>,
}

impl MemoryStateSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self, device_id: &str) -> Option<StateRecord> {
        self.latest.read().get(device_id).cloned()
    }

    pub fn records(&self) -> Vec<StateRecord> {
        self.history.read().clone()
    }

    pub fn len(&self) -> usize {
        self.history.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.read().is_empty()
    }
}

#[async_trait]
impl ConnectionStateSink for MemoryStateSink {
    async fn record(&self, record: StateRecord) -> Result<(), SinkError> {
        self.latest
            .write()
            .insert(record.device_id.clone(), record.clone());
        self.history.write().push(record);
        Ok(())
    }
}

/// Forward state events from `bus` into `sink` until the task is dropped.
pub fn spawn_state_forwarder(bus: &EventBus, sink: Arc<dyn ConnectionStateSink>) -> ScheduledTask {
    let mut rx = bus.subscribe_filtered(|event: &ConnectivityEvent| {
        matches!(
            event,
            ConnectivityEvent::StateChanged { .. } | ConnectivityEvent::ConnectionFailed { .. }
        )
    });
    ScheduledTask::spawn("state-sink", async move {
        while let Some((event, _)) = rx.recv().await {
            let Some(record) = StateRecord::from_event(&event) else {
                continue;
            };
            let device_id = record.device_id.clone();
            if let Err(e) = sink.record(record).await {
                warn!(device_id = %device_id, error = %e, "State sink rejected record");
            }
        }
        debug!("State sink forwarder stopped");
    })
}
