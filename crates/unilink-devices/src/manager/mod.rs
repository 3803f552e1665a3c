//! Adapter Manager.
//!
//! Routes devices to the manager-level adapter that owns them. The manager
//! holds the registered adapters keyed by adapter type, a device id to adapter
//! type routing table, the set of discovered devices and the connection table.
//!
//! Routing errors are never retried here. Retries belong to the command
//! processor or to the adapters' own reconnection logic.

mod adapter;
mod sink;
mod table;

pub use adapter::{
    ConnectivityAdapter, DeviceAdapter, DeviceEventStream, DeviceStatus, AUTOMATIC_ADAPTER,
};
pub use sink::{spawn_state_forwarder, ConnectionStateSink, MemoryStateSink, SinkError, StateRecord};
pub use table::ConnectionTable;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use unilink_commands::CommandExecutor;
use unilink_core::command::{DeviceCommand, DeviceCommandResult};
use unilink_core::config::ManagerConfig;
use unilink_core::connection::{ConnectionInfo, ConnectionState};
use unilink_core::device::{DeviceDescriptor, DiscoveredDevice};
use unilink_core::error::{ConnectionError, ControlError, ControlResult};
use unilink_core::event::ConnectivityEvent;
use unilink_core::eventbus::{EventBus, EventBusReceiver};
use unilink_core::protocol::ProtocolKind;

use crate::scheduler::ScheduledTask;

/// Protocol a device type connects over when nothing else says otherwise.
pub fn default_protocol_for(device_type: &str) -> Option<ProtocolKind> {
    match device_type.to_ascii_lowercase().as_str() {
        "thermostat" => Some(ProtocolKind::Cloud),
        "light" | "bulb" | "plug" | "switch" => Some(ProtocolKind::Matter),
        "sensor" | "lock" => Some(ProtocolKind::Ble),
        "gateway" | "hub" => Some(ProtocolKind::Mqtt),
        "camera" => Some(ProtocolKind::Http),
        _ => None,
    }
}

/// Manager statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerStats {
    pub registered_adapters: usize,
    pub initialized_adapters: usize,
    pub routed_devices: usize,
    pub discovered_devices: usize,
    pub connected_devices: usize,
}

pub struct AdapterManager {
    adapters: RwLock<HashMap<String, Arc<dyn DeviceAdapter>>>,
    routes: Arc<DashMap<String, String>>,
    discovered: Arc<DashMap<String, DiscoveredDevice>>,
    table: Arc<ConnectionTable>,
    bus: EventBus,
    config: ManagerConfig,
    table_sync: Mutex<Option<ScheduledTask>>,
    /// Serializes connect and disconnect per device
    device_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl AdapterManager {
    pub fn new(bus: EventBus, config: ManagerConfig) -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
            routes: Arc::new(DashMap::new()),
            discovered: Arc::new(DashMap::new()),
            table: Arc::new(ConnectionTable::new()),
            bus,
            config,
            table_sync: Mutex::new(None),
            device_locks: DashMap::new(),
        }
    }

    fn device_lock(&self, device_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.device_locks
            .entry(device_id.to_string())
            .or_default()
            .clone()
    }

    /// Keep the connection table in step with the event bus. Idempotent.
    pub fn start(&self) {
        let mut slot = self.table_sync.lock();
        if slot.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let table = self.table.clone();
        let mut rx = self.bus.subscribe();
        *slot = Some(ScheduledTask::spawn("connection-table-sync", async move {
            while let Some((event, _)) = rx.recv().await {
                apply_to_table(&table, &event);
            }
        }));
    }

    /// Register an adapter under its adapter type, replacing any previous one.
    pub fn register(&self, adapter: Arc<dyn DeviceAdapter>) {
        let key = adapter.adapter_type().to_string();
        info!(adapter = %key, "Registering adapter");
        self.adapters.write().insert(key, adapter);
    }

    /// Remove an adapter, shut it down and drop the routes pointing at it.
    pub async fn unregister(&self, adapter_type: &str) -> bool {
        let removed = self.adapters.write().remove(adapter_type);
        let Some(adapter) = removed else {
            return false;
        };
        let orphaned: Vec<String> = self
            .routes
            .iter()
            .filter(|r| r.value() == adapter_type)
            .map(|r| r.key().clone())
            .collect();
        for device_id in &orphaned {
            self.routes.remove(device_id);
            self.table.remove(device_id);
        }
        adapter.shutdown().await;
        info!(adapter = %adapter_type, routes = orphaned.len(), "Adapter unregistered");
        true
    }

    pub fn adapter(&self, adapter_type: &str) -> Option<Arc<dyn DeviceAdapter>> {
        self.adapters.read().get(adapter_type).cloned()
    }

    pub fn adapter_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.adapters.read().keys().cloned().collect();
        types.sort();
        types
    }

    fn adapter_for(&self, protocol: ProtocolKind) -> Option<Arc<dyn DeviceAdapter>> {
        self.adapter(protocol.as_str())
    }

    fn snapshot(&self) -> Vec<Arc<dyn DeviceAdapter>> {
        self.adapters.read().values().cloned().collect()
    }

    /// Initialize every registered adapter. Returns how many are initialized.
    pub async fn initialize_all(&self) -> usize {
        let mut ready = 0;
        for adapter in self.snapshot() {
            match adapter.initialize().await {
                Ok(()) => ready += 1,
                Err(e) => warn!(
                    adapter = %adapter.adapter_type(),
                    error = %e,
                    "Adapter initialization failed"
                ),
            }
        }
        ready
    }

    /// Run discovery on the requested (or all) initialized protocol adapters
    /// and merge the results.
    ///
    /// A failure on one protocol does not stop the others. Every device is
    /// routed to the adapter that found it first, unless it already has a
    /// route.
    pub async fn discover_devices(
        &self,
        protocols: Option<&[ProtocolKind]>,
    ) -> Vec<DiscoveredDevice> {
        let window = self.config.discovery_timeout();
        let targets: Vec<Arc<dyn DeviceAdapter>> = self
            .snapshot()
            .into_iter()
            .filter(|a| a.is_initialized())
            .filter(|a| match (a.protocol(), protocols) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(p), Some(wanted)) => wanted.contains(&p),
            })
            .collect();

        let mut streams = Vec::with_capacity(targets.len());
        for adapter in targets {
            let key = adapter.adapter_type().to_string();
            match adapter.discover(window).await {
                Ok(stream) => streams.push(stream.map(move |device| (key.clone(), device))),
                Err(ConnectionError::UnsupportedOperation(_)) => {
                    debug!(adapter = %key, "Adapter has no discovery");
                }
                Err(e) => warn!(adapter = %key, error = %e, "Discovery failed"),
            }
        }
        if streams.is_empty() {
            return Vec::new();
        }

        let deadline = tokio::time::Instant::now() + window;
        let mut merged = futures::stream::select_all(streams);
        let mut found = Vec::new();
        while let Ok(Some((key, device))) = tokio::time::timeout_at(deadline, merged.next()).await {
            self.routes
                .entry(device.device_id.clone())
                .or_insert_with(|| key.clone());
            self.discovered
                .insert(device.device_id.clone(), device.clone());
            debug!(device_id = %device.device_id, adapter = %key, "Device discovered");
            self.bus.publish(ConnectivityEvent::DeviceDiscovered {
                device: device.clone(),
            });
            found.push(device);
        }
        info!(count = found.len(), "Discovery finished");
        found
    }

    /// Connect a device and route it to the adapter that connected it.
    ///
    /// The adapter is chosen from, in order: `preferred`, an existing route,
    /// the descriptor's protocol hint, the device-type default, the first
    /// registered adapter whose protocol the device supports, and finally the
    /// automatic adapter. The route is committed only on success.
    pub async fn connect_to_device(
        &self,
        device: &DeviceDescriptor,
        preferred: Option<ProtocolKind>,
    ) -> ControlResult<ConnectionInfo> {
        let lock = self.device_lock(&device.device_id);
        let _guard = lock.lock().await;

        let existing = self.routed_adapter(&device.device_id);
        if let (Some(route), Some(p)) = (&existing, preferred) {
            if route != p.as_str() {
                debug!(device_id = %device.device_id, from = %route, to = %p, "Re-routing device");
                self.release(&device.device_id, route).await;
            }
        }

        let adapter = self.choose_adapter(device, preferred)?;
        let key = adapter.adapter_type().to_string();
        debug!(device_id = %device.device_id, adapter = %key, "Connecting device");
        let info = adapter.connect(device).await?;

        // Only the routed adapter may hold a session for the device
        for other in self.snapshot() {
            if other.adapter_type() != key && other.status(&device.device_id).is_some() {
                if let Err(e) = other.disconnect(&device.device_id).await {
                    debug!(device_id = %device.device_id, adapter = %other.adapter_type(), error = %e, "Stale session already gone");
                }
            }
        }
        self.routes.insert(device.device_id.clone(), key);
        self.table.insert(info.clone());
        info!(
            device_id = %device.device_id,
            protocol = %info.protocol,
            "Device connected"
        );
        Ok(info)
    }

    fn choose_adapter(
        &self,
        device: &DeviceDescriptor,
        preferred: Option<ProtocolKind>,
    ) -> ControlResult<Arc<dyn DeviceAdapter>> {
        if let Some(p) = preferred {
            return self
                .adapter_for(p)
                .ok_or_else(|| ControlError::AdapterNotAvailable(p.to_string()));
        }
        let routed = self
            .routed_adapter(&device.device_id)
            .and_then(|key| self.adapter(&key));
        if let Some(adapter) = routed {
            return Ok(adapter);
        }

        let compatible = |p: ProtocolKind| {
            device.capabilities.supported_protocols.is_empty() || device.supports(p)
        };
        let candidates = device
            .protocol_hint
            .into_iter()
            .chain(default_protocol_for(&device.device_type).filter(|p| compatible(*p)))
            .chain(ProtocolKind::ALL.into_iter().filter(|p| compatible(*p)));
        for protocol in candidates {
            if let Some(adapter) = self.adapter_for(protocol) {
                return Ok(adapter);
            }
        }
        self.adapter(AUTOMATIC_ADAPTER).ok_or_else(|| {
            ControlError::AdapterNotAvailable(format!("no adapter for {}", device.device_id))
        })
    }

    fn routed(&self, device_id: &str) -> ControlResult<Arc<dyn DeviceAdapter>> {
        let key = self
            .routed_adapter(device_id)
            .ok_or_else(|| ControlError::DeviceNotRouted(device_id.to_string()))?;
        self.adapter(&key)
            .ok_or(ControlError::AdapterNotAvailable(key))
    }

    /// Execute a command on the device's adapter.
    pub async fn execute_command(
        &self,
        command: &DeviceCommand,
    ) -> ControlResult<Option<serde_json::Value>> {
        let adapter = self.routed(&command.device_id)?;
        let output = adapter.execute(command).await?;
        self.table.touch(&command.device_id);
        Ok(output)
    }

    /// Execute a command and fold the outcome into a result.
    pub async fn execute_with_result(&self, command: &DeviceCommand) -> DeviceCommandResult {
        let started = Instant::now();
        let result = match self.execute_command(command).await {
            Ok(output) => DeviceCommandResult::completed(command, output, started.elapsed()),
            Err(ControlError::Timeout(_)) => DeviceCommandResult::timed_out(command),
            Err(e) => DeviceCommandResult::failed(command, e, started.elapsed()),
        };
        self.bus.publish(ConnectivityEvent::CommandCompleted {
            result: result.clone(),
        });
        result
    }

    /// Execute every command independently; one result per command, in order.
    pub async fn execute_batch(&self, commands: &[DeviceCommand]) -> Vec<DeviceCommandResult> {
        futures::future::join_all(commands.iter().map(|c| self.execute_with_result(c))).await
    }

    pub fn device_status(&self, device_id: &str) -> ControlResult<DeviceStatus> {
        self.routed(device_id)?
            .status(device_id)
            .ok_or_else(|| ControlError::DeviceNotFound(device_id.to_string()))
    }

    /// Disconnect a device and drop its route.
    pub async fn disconnect_from_device(&self, device_id: &str) -> ControlResult<()> {
        let lock = self.device_lock(device_id);
        let _guard = lock.lock().await;

        let (_, key) = self
            .routes
            .remove(device_id)
            .ok_or_else(|| ControlError::DeviceNotRouted(device_id.to_string()))?;
        self.table.remove(device_id);
        let Some(adapter) = self.adapter(&key) else {
            return Ok(());
        };
        match adapter.disconnect(device_id).await {
            // Discovered but never connected
            Ok(()) | Err(ConnectionError::DeviceNotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self, device_id: &str, adapter_type: &str) {
        self.routes.remove(device_id);
        self.table.remove(device_id);
        if let Some(adapter) = self.adapter(adapter_type) {
            if let Err(e) = adapter.disconnect(device_id).await {
                debug!(device_id = %device_id, adapter = %adapter_type, error = %e, "Released device already gone");
            }
        }
    }

    /// Disconnect devices idle for longer than the inactivity timeout.
    pub async fn sweep_inactive(&self) -> Vec<String> {
        let stale = self
            .table
            .sweep_inactive(self.config.inactivity_timeout(), Utc::now());
        for device_id in &stale {
            if let Err(e) = self.disconnect_from_device(device_id).await {
                debug!(device_id = %device_id, error = %e, "Inactive device already gone");
            }
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "Disconnected inactive devices");
        }
        stale
    }

    pub fn routed_adapter(&self, device_id: &str) -> Option<String> {
        self.routes.get(device_id).map(|r| r.value().clone())
    }

    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.discovered.iter().map(|d| d.value().clone()).collect()
    }

    pub fn connection_table(&self) -> &ConnectionTable {
        &self.table
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn stats(&self) -> ManagerStats {
        let (registered, initialized) = {
            let adapters = self.adapters.read();
            (
                adapters.len(),
                adapters.values().filter(|a| a.is_initialized()).count(),
            )
        };
        ManagerStats {
            registered_adapters: registered,
            initialized_adapters: initialized,
            routed_devices: self.routes.len(),
            discovered_devices: self.discovered.len(),
            connected_devices: self.table.connected_count(),
        }
    }

    pub fn subscribe(&self) -> EventBusReceiver {
        self.bus.subscribe()
    }

    /// Shut down every adapter and forget all routes.
    pub async fn shutdown(&self) {
        self.table_sync.lock().take();
        for adapter in self.snapshot() {
            adapter.shutdown().await;
        }
        self.routes.clear();
        self.table.clear();
        self.device_locks.clear();
        info!("Adapter manager shut down");
    }
}

fn apply_to_table(table: &ConnectionTable, event: &ConnectivityEvent) {
    match event {
        ConnectivityEvent::StateChanged {
            device_id,
            protocol,
            new_state,
            ..
        } => {
            table.set_state_from(device_id, *protocol, *new_state);
        }
        ConnectivityEvent::QualityUpdated {
            device_id, quality, ..
        } => {
            table.set_quality(device_id, *quality);
        }
        ConnectivityEvent::MessageReceived { device_id, .. } => {
            table.touch(device_id);
        }
        ConnectivityEvent::ConnectionFailed { device_id, .. } => {
            table.set_state(device_id, ConnectionState::Disconnected);
        }
        _ => {}
    }
}

#[async_trait]
impl CommandExecutor for AdapterManager {
    async fn execute(&self, command: &DeviceCommand) -> DeviceCommandResult {
        self.execute_with_result(command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_type_defaults() {
        assert_eq!(default_protocol_for("Thermostat"), Some(ProtocolKind::Cloud));
        assert_eq!(default_protocol_for("bulb"), Some(ProtocolKind::Matter));
        assert_eq!(default_protocol_for("lock"), Some(ProtocolKind::Ble));
        assert_eq!(default_protocol_for("hub"), Some(ProtocolKind::Mqtt));
        assert_eq!(default_protocol_for("camera"), Some(ProtocolKind::Http));
        assert_eq!(default_protocol_for("toaster"), None);
    }

    #[tokio::test]
    async fn test_unrouted_device_fails_fast() {
        let manager = AdapterManager::new(EventBus::new(), ManagerConfig::default());
        let cmd = DeviceCommand::new(
            "lamp",
            unilink_core::command::CommandPayload::Switch { on: true },
        );
        assert!(matches!(
            manager.execute_command(&cmd).await,
            Err(ControlError::DeviceNotRouted(_))
        ));
        assert!(matches!(
            manager.device_status("lamp"),
            Err(ControlError::DeviceNotRouted(_))
        ));
        assert!(matches!(
            manager.disconnect_from_device("lamp").await,
            Err(ControlError::DeviceNotRouted(_))
        ));

        let result = manager.execute_with_result(&cmd).await;
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn test_no_adapter_registered() {
        let manager = AdapterManager::new(EventBus::new(), ManagerConfig::default());
        let err = manager
            .connect_to_device(&DeviceDescriptor::new("t", "thermostat"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::AdapterNotAvailable(_)));
        assert_eq!(manager.stats().routed_devices, 0);
    }
}
