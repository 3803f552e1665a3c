//! Manager-level adapters.
//!
//! A [`DeviceAdapter`] owns every device reached through one protocol type.
//! [`ConnectivityAdapter`] is the implementation the manager uses: it keeps
//! one [`DeviceCommunicator`] per device, pinned to its protocol through a
//! protocol-exclusive strategy, or driven by the full strategy engine when
//! registered as the automatic adapter.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use unilink_core::command::DeviceCommand;
use unilink_core::config::{CommunicatorConfig, ProtocolDefaults};
use unilink_core::connection::{
    ConnectionInfo, ConnectionQuality, ConnectionState, ConnectionStatistics,
};
use unilink_core::context::{CommunicationContext, NetworkEnvironment, UserPreferences};
use unilink_core::device::DeviceDescriptor;
use unilink_core::error::{ConnectionError, ConnectionResult, ControlError, ControlResult};
use unilink_core::event::ConnectivityEvent;
use unilink_core::eventbus::EventBus;
use unilink_core::protocol::ProtocolKind;

use crate::adapter::{AdapterMessage, DeviceDiscovery, DiscoveryStream};
use crate::communicator::DeviceCommunicator;
use crate::factory::{AdapterFactory, FactoryError};
use crate::strategy::StrategyEngine;

/// Name of the adapter that lets the strategy engine pick the protocol.
pub const AUTOMATIC_ADAPTER: &str = "automatic";

/// Events about devices owned by one adapter.
pub type DeviceEventStream = Pin<Box<dyn Stream<Item = ConnectivityEvent> + Send>>;

/// Status snapshot of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub protocol: Option<ProtocolKind>,
    pub adapter_type: String,
    pub state: ConnectionState,
    pub strategy: Option<String>,
    pub quality: Option<ConnectionQuality>,
    pub statistics: Option<ConnectionStatistics>,
    pub last_active: Option<DateTime<Utc>>,
}

/// Owns the devices reached through one protocol type.
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    /// Registry key: a protocol name or [`AUTOMATIC_ADAPTER`].
    fn adapter_type(&self) -> &str;

    /// The protocol this adapter is pinned to, `None` for the automatic adapter.
    fn protocol(&self) -> Option<ProtocolKind>;

    fn is_initialized(&self) -> bool;

    /// Prepare discovery. Idempotent.
    async fn initialize(&self) -> ConnectionResult<()>;

    /// Start a discovery window. Requires [`initialize`](Self::initialize).
    async fn discover(&self, window: Duration) -> ConnectionResult<DiscoveryStream>;

    async fn connect(&self, device: &DeviceDescriptor) -> ConnectionResult<ConnectionInfo>;

    async fn disconnect(&self, device_id: &str) -> ConnectionResult<()>;

    /// Send a command to a connected device, bounded by the command timeout.
    async fn execute(&self, command: &DeviceCommand) -> ControlResult<Option<serde_json::Value>>;

    fn status(&self, device_id: &str) -> Option<DeviceStatus>;

    fn connected_devices(&self) -> Vec<String>;

    fn connection_info(&self, device_id: &str) -> Option<ConnectionInfo>;

    /// Events for devices owned by this adapter.
    fn events(&self) -> DeviceEventStream;

    /// Disconnect every device and stop every timer.
    async fn shutdown(&self);
}

/// [`DeviceAdapter`] backed by one [`DeviceCommunicator`] per device.
pub struct ConnectivityAdapter {
    adapter_type: String,
    protocol: Option<ProtocolKind>,
    factory: Arc<AdapterFactory>,
    engine: Arc<StrategyEngine>,
    bus: EventBus,
    config: CommunicatorConfig,
    network: RwLock<NetworkEnvironment>,
    preferences: RwLock<UserPreferences>,
    discovery: RwLock<Option<Arc<dyn DeviceDiscovery>>>,
    initialized: AtomicBool,
    devices: Arc<DashMap<String, DeviceCommunicator>>,
}

impl ConnectivityAdapter {
    /// Adapter whose devices only ever use `protocol`.
    pub fn pinned(
        protocol: ProtocolKind,
        factory: Arc<AdapterFactory>,
        bus: EventBus,
        config: CommunicatorConfig,
        defaults: ProtocolDefaults,
    ) -> Self {
        let engine = Arc::new(StrategyEngine::exclusive(protocol, defaults));
        Self::build(protocol.as_str(), Some(protocol), factory, engine, bus, config)
    }

    /// Adapter that lets `engine` choose the protocol per device.
    pub fn automatic(
        factory: Arc<AdapterFactory>,
        engine: Arc<StrategyEngine>,
        bus: EventBus,
        config: CommunicatorConfig,
    ) -> Self {
        Self::build(AUTOMATIC_ADAPTER, None, factory, engine, bus, config)
    }

    fn build(
        adapter_type: &str,
        protocol: Option<ProtocolKind>,
        factory: Arc<AdapterFactory>,
        engine: Arc<StrategyEngine>,
        bus: EventBus,
        config: CommunicatorConfig,
    ) -> Self {
        Self {
            adapter_type: adapter_type.to_string(),
            protocol,
            factory,
            engine,
            bus,
            config,
            network: RwLock::new(NetworkEnvironment::default()),
            preferences: RwLock::new(UserPreferences::default()),
            discovery: RwLock::new(None),
            initialized: AtomicBool::new(false),
            devices: Arc::new(DashMap::new()),
        }
    }

    pub fn with_network(self, network: NetworkEnvironment) -> Self {
        *self.network.write() = network;
        self
    }

    pub fn with_preferences(self, preferences: UserPreferences) -> Self {
        *self.preferences.write() = preferences;
        self
    }

    /// Network environment applied to devices connected from now on.
    pub fn set_network(&self, network: NetworkEnvironment) {
        *self.network.write() = network;
    }

    /// The communicator for a device, if this adapter owns it.
    pub fn communicator(&self, device_id: &str) -> Option<DeviceCommunicator> {
        self.devices.get(device_id).map(|c| c.value().clone())
    }

    pub fn has_discovery(&self) -> bool {
        self.discovery.read().is_some()
    }

    fn context_for(&self, device: &DeviceDescriptor) -> CommunicationContext {
        let mut device = device.clone();
        if let Some(protocol) = self.protocol {
            if device.capabilities.supported_protocols.is_empty() {
                device.capabilities.supported_protocols.push(protocol);
            }
        }
        CommunicationContext::new(device)
            .with_network(self.network.read().clone())
            .with_preferences(self.preferences.read().clone())
    }
}

#[async_trait]
impl DeviceAdapter for ConnectivityAdapter {
    fn adapter_type(&self) -> &str {
        &self.adapter_type
    }

    fn protocol(&self) -> Option<ProtocolKind> {
        self.protocol
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    async fn initialize(&self) -> ConnectionResult<()> {
        if self.is_initialized() {
            return Ok(());
        }
        if let Some(protocol) = self.protocol {
            if let Some(config) = self.engine.defaults().config_for(protocol) {
                match self.factory.create_discovery(protocol.as_str(), &config) {
                    Ok(discovery) => *self.discovery.write() = Some(Arc::from(discovery)),
                    Err(FactoryError::UnsupportedType(_)) => {
                        debug!(adapter = %self.adapter_type, "Protocol has no discovery");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        self.initialized.store(true, Ordering::SeqCst);
        info!(adapter = %self.adapter_type, "Adapter initialized");
        Ok(())
    }

    async fn discover(&self, window: Duration) -> ConnectionResult<DiscoveryStream> {
        if !self.is_initialized() {
            return Err(ConnectionError::InvalidState(format!(
                "adapter {} is not initialized",
                self.adapter_type
            )));
        }
        let discovery = self.discovery.read().clone();
        match discovery {
            Some(discovery) => discovery.discover(window).await,
            None => Err(ConnectionError::UnsupportedOperation(format!(
                "discovery over {}",
                self.adapter_type
            ))),
        }
    }

    async fn connect(&self, device: &DeviceDescriptor) -> ConnectionResult<ConnectionInfo> {
        let context = self.context_for(device);
        let existing = self.communicator(&device.device_id);
        let communicator = match existing {
            Some(communicator) if !communicator.is_shut_down() => {
                communicator.update_context(context);
                communicator
            }
            _ => {
                let communicator = DeviceCommunicator::new(
                    context,
                    self.factory.clone(),
                    self.engine.clone(),
                    self.bus.clone(),
                    self.config.clone(),
                );
                self.devices
                    .insert(device.device_id.clone(), communicator.clone());
                communicator
            }
        };

        if let Err(e) = communicator.connect().await {
            warn!(
                adapter = %self.adapter_type,
                device_id = %device.device_id,
                error = %e,
                "Device connect failed"
            );
            self.devices.remove(&device.device_id);
            communicator.abandon(&e).await;
            return Err(e);
        }
        communicator
            .connection_info()
            .ok_or(ConnectionError::NotConnected)
    }

    async fn disconnect(&self, device_id: &str) -> ConnectionResult<()> {
        let (_, communicator) = self
            .devices
            .remove(device_id)
            .ok_or_else(|| ConnectionError::DeviceNotFound(device_id.to_string()))?;
        communicator.shutdown().await;
        debug!(adapter = %self.adapter_type, device_id = %device_id, "Device disconnected");
        Ok(())
    }

    async fn execute(&self, command: &DeviceCommand) -> ControlResult<Option<serde_json::Value>> {
        command.validate()?;
        let communicator = self
            .communicator(&command.device_id)
            .ok_or_else(|| ControlError::DeviceNotFound(command.device_id.clone()))?;
        let started = Instant::now();
        let sent =
            tokio::time::timeout(command.timeout(), communicator.send(AdapterMessage::command(command)))
                .await;
        match sent {
            Err(_) => Err(ControlError::Timeout(command.timeout_ms)),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(())) => Ok(Some(json!({
                "acknowledged": true,
                "command_type": command.command_type().as_str(),
                "protocol": communicator.protocol(),
                "round_trip_ms": started.elapsed().as_millis() as u64,
            }))),
        }
    }

    fn status(&self, device_id: &str) -> Option<DeviceStatus> {
        let communicator = self.communicator(device_id)?;
        let info = communicator.connection_info();
        Some(DeviceStatus {
            device_id: device_id.to_string(),
            protocol: communicator.protocol(),
            adapter_type: self.adapter_type.clone(),
            state: communicator.state(),
            strategy: communicator.current_strategy(),
            quality: info.as_ref().map(|i| i.quality),
            statistics: info.as_ref().map(|i| i.statistics.clone()),
            last_active: info.map(|i| i.last_active),
        })
    }

    fn connected_devices(&self) -> Vec<String> {
        self.devices
            .iter()
            .filter(|entry| entry.value().state() == ConnectionState::Connected)
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn connection_info(&self, device_id: &str) -> Option<ConnectionInfo> {
        self.communicator(device_id)?.connection_info()
    }

    fn events(&self) -> DeviceEventStream {
        let devices = self.devices.clone();
        let mut rx = self.bus.subscribe();
        Box::pin(async_stream::stream! {
            while let Some((event, _)) = rx.recv().await {
                if devices.contains_key(event.device_id()) {
                    yield event;
                }
            }
        })
    }

    async fn shutdown(&self) {
        let ids: Vec<String> = self.devices.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, communicator)) = self.devices.remove(&id) {
                communicator.shutdown().await;
            }
        }
        self.initialized.store(false, Ordering::SeqCst);
        info!(adapter = %self.adapter_type, "Adapter shut down");
    }
}
