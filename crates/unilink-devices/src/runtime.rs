//! The connectivity runtime.
//!
//! One [`ConnectivityRuntime`] is built at startup and handed to whatever
//! needs the connectivity layer. It wires the event bus, adapter factory,
//! strategy engine, adapter manager, command queue and processor together and
//! owns the background tasks. Its lifecycle is explicit:
//! `Initialized -> Active -> ShutDown`.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::info;

use unilink_commands::{CommandExecutor, CommandProcessor, CommandQueue, CommandTicket, QueueError};
use unilink_core::command::{DeviceCommand, DeviceCommandResult};
use unilink_core::config::{ConfigError, ConnectivityConfig};
use unilink_core::connection::ConnectionInfo;
use unilink_core::context::{NetworkEnvironment, UserPreferences};
use unilink_core::device::{DeviceDescriptor, DiscoveredDevice};
use unilink_core::error::{ConnectionError, ControlError};
use unilink_core::eventbus::{EventBus, EventBusReceiver};
use unilink_core::protocol::ProtocolKind;

use crate::factory::AdapterFactory;
use crate::manager::{
    spawn_state_forwarder, AdapterManager, ConnectionStateSink, ConnectivityAdapter, DeviceStatus,
};
use crate::scheduler::ScheduledTask;
use crate::strategy::StrategyEngine;
use crate::transport::{DefaultTransportProvider, TransportProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    Initialized,
    Active,
    ShutDown,
}

/// Errors surfaced by runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Builder for [`ConnectivityRuntime`].
pub struct RuntimeBuilder {
    config: ConnectivityConfig,
    transports: Option<Arc<dyn TransportProvider>>,
    sink: Option<Arc<dyn ConnectionStateSink>>,
    network: NetworkEnvironment,
    preferences: UserPreferences,
}

impl RuntimeBuilder {
    /// Use `transports` instead of the default provider.
    pub fn with_transports(mut self, transports: Arc<dyn TransportProvider>) -> Self {
        self.transports = Some(transports);
        self
    }

    /// Forward connection-state changes to a persistence collaborator.
    pub fn with_state_sink(mut self, sink: Arc<dyn ConnectionStateSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_network(mut self, network: NetworkEnvironment) -> Self {
        self.network = network;
        self
    }

    pub fn with_preferences(mut self, preferences: UserPreferences) -> Self {
        self.preferences = preferences;
        self
    }

    /// Validate the configuration and wire every component.
    pub fn build(self) -> RuntimeResult<ConnectivityRuntime> {
        let config = self.config;
        config.validate()?;

        let bus = EventBus::with_capacity(config.events.channel_capacity).named("unilink");
        let transports = self
            .transports
            .unwrap_or_else(|| Arc::new(DefaultTransportProvider::new()));
        let factory = Arc::new(AdapterFactory::new(transports, config.reconnect.parameters()));
        let engine = Arc::new(StrategyEngine::with_default_strategies(
            config.protocols.clone(),
        ));

        let manager = Arc::new(AdapterManager::new(bus.clone(), config.manager.clone()));
        for protocol in AdapterFactory::available_adapters() {
            let adapter = ConnectivityAdapter::pinned(
                protocol,
                factory.clone(),
                bus.clone(),
                config.communicator.clone(),
                config.protocols.clone(),
            )
            .with_network(self.network.clone())
            .with_preferences(self.preferences.clone());
            manager.register(Arc::new(adapter));
        }
        let automatic = ConnectivityAdapter::automatic(
            factory.clone(),
            engine.clone(),
            bus.clone(),
            config.communicator.clone(),
        )
        .with_network(self.network)
        .with_preferences(self.preferences);
        manager.register(Arc::new(automatic));

        let queue = Arc::new(CommandQueue::new(config.queue.clone()));
        let executor: Arc<dyn CommandExecutor> = manager.clone();
        let processor = CommandProcessor::new(queue.clone(), executor, config.processor.clone());

        Ok(ConnectivityRuntime {
            config,
            bus,
            factory,
            engine,
            manager,
            queue,
            processor,
            sink: self.sink,
            state: RwLock::new(RuntimeState::Initialized),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// Context object for the connectivity layer.
pub struct ConnectivityRuntime {
    config: ConnectivityConfig,
    bus: EventBus,
    factory: Arc<AdapterFactory>,
    engine: Arc<StrategyEngine>,
    manager: Arc<AdapterManager>,
    queue: Arc<CommandQueue>,
    processor: CommandProcessor,
    sink: Option<Arc<dyn ConnectionStateSink>>,
    state: RwLock<RuntimeState>,
    tasks: Mutex<Vec<ScheduledTask>>,
}

impl ConnectivityRuntime {
    pub fn builder(config: ConnectivityConfig) -> RuntimeBuilder {
        RuntimeBuilder {
            config,
            transports: None,
            sink: None,
            network: NetworkEnvironment::default(),
            preferences: UserPreferences::default(),
        }
    }

    /// Initialize adapters and start background work.
    pub async fn start(&self) -> RuntimeResult<()> {
        let current = self.state();
        if current != RuntimeState::Initialized {
            return Err(ConnectionError::InvalidState(format!(
                "runtime cannot start from {:?}",
                current
            ))
            .into());
        }

        self.manager.start();
        let ready = self.manager.initialize_all().await;
        self.processor.start().await;

        let mut tasks = Vec::new();
        let manager = Arc::downgrade(&self.manager);
        tasks.push(ScheduledTask::interval(
            "inactivity-sweep",
            self.config.manager.sweep_interval(),
            move || {
                let manager = manager.clone();
                async move {
                    let Some(manager) = manager.upgrade() else {
                        return false;
                    };
                    manager.sweep_inactive().await;
                    true
                }
            },
        ));
        if let Some(sink) = &self.sink {
            tasks.push(spawn_state_forwarder(&self.bus, sink.clone()));
        }
        *self.tasks.lock() = tasks;
        *self.state.write() = RuntimeState::Active;

        info!(adapters = ready, "Connectivity runtime started");
        Ok(())
    }

    /// Stop background work, cancel queued commands and disconnect every device.
    pub async fn shutdown(&self) {
        if self.state() == RuntimeState::ShutDown {
            return;
        }
        *self.state.write() = RuntimeState::ShutDown;

        self.processor.stop().await;
        let cancelled = self.processor.cancel_all("runtime shut down").await;
        self.queue.close().await;
        self.tasks.lock().clear();
        self.manager.shutdown().await;

        info!(cancelled, "Connectivity runtime shut down");
    }

    pub fn state(&self) -> RuntimeState {
        *self.state.read()
    }

    fn ensure_active(&self) -> RuntimeResult<()> {
        match self.state() {
            RuntimeState::Active => Ok(()),
            other => Err(ConnectionError::InvalidState(format!("runtime is {:?}", other)).into()),
        }
    }

    pub async fn discover_devices(
        &self,
        protocols: Option<&[ProtocolKind]>,
    ) -> RuntimeResult<Vec<DiscoveredDevice>> {
        self.ensure_active()?;
        Ok(self.manager.discover_devices(protocols).await)
    }

    pub async fn connect_device(
        &self,
        device: &DeviceDescriptor,
        preferred: Option<ProtocolKind>,
    ) -> RuntimeResult<ConnectionInfo> {
        self.ensure_active()?;
        Ok(self.manager.connect_to_device(device, preferred).await?)
    }

    /// Disconnect a device and cancel its queued commands.
    pub async fn disconnect_device(&self, device_id: &str) -> RuntimeResult<()> {
        self.ensure_active()?;
        self.processor
            .cancel_device(device_id, "device disconnected")
            .await;
        Ok(self.manager.disconnect_from_device(device_id).await?)
    }

    /// Queue a command for execution.
    pub async fn submit_command(&self, command: DeviceCommand) -> RuntimeResult<CommandTicket> {
        self.ensure_active()?;
        Ok(self.processor.submit(command).await?)
    }

    /// Queue a command and wait for its terminal result.
    pub async fn execute_command(&self, command: DeviceCommand) -> RuntimeResult<DeviceCommandResult> {
        let ticket = self.submit_command(command).await?;
        Ok(ticket.wait().await)
    }

    pub fn device_status(&self, device_id: &str) -> RuntimeResult<DeviceStatus> {
        self.ensure_active()?;
        Ok(self.manager.device_status(device_id)?)
    }

    pub fn subscribe(&self) -> EventBusReceiver {
        self.bus.subscribe()
    }

    pub fn config(&self) -> &ConnectivityConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn factory(&self) -> &Arc<AdapterFactory> {
        &self.factory
    }

    pub fn engine(&self) -> &Arc<StrategyEngine> {
        &self.engine
    }

    pub fn manager(&self) -> &Arc<AdapterManager> {
        &self.manager
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    pub fn processor(&self) -> &CommandProcessor {
        &self.processor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LoopbackNetwork, LoopbackTransportProvider};

    fn runtime() -> ConnectivityRuntime {
        ConnectivityRuntime::builder(ConnectivityConfig::default())
            .with_transports(Arc::new(LoopbackTransportProvider::new(LoopbackNetwork::new())))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let rt = runtime();
        assert_eq!(rt.state(), RuntimeState::Initialized);
        assert!(matches!(
            rt.device_status("x"),
            Err(RuntimeError::Connection(ConnectionError::InvalidState(_)))
        ));

        rt.start().await.unwrap();
        assert_eq!(rt.state(), RuntimeState::Active);
        assert!(rt.start().await.is_err());

        rt.shutdown().await;
        assert_eq!(rt.state(), RuntimeState::ShutDown);
        assert!(rt.discover_devices(None).await.is_err());
    }

    #[test]
    fn test_registers_every_adapter() {
        let rt = runtime();
        assert_eq!(
            rt.manager().adapter_types(),
            vec!["automatic", "ble", "cloud", "http", "matter", "mqtt"]
        );
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = ConnectivityConfig::default();
        config.communicator.reevaluation_threshold = 101;
        assert!(matches!(
            ConnectivityRuntime::builder(config).build(),
            Err(RuntimeError::Config(_))
        ));
    }
}
