//! Live connection records, one per device.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use unilink_core::connection::{ConnectionInfo, ConnectionQuality, ConnectionState};
use unilink_core::protocol::ProtocolKind;

/// Device id to live [`ConnectionInfo`]. All mutation goes through one lock.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    entries: RwLock<HashMap<String, ConnectionInfo>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `info`, replacing any previous record for the device.
    pub fn insert(&self, info: ConnectionInfo) -> Option<ConnectionInfo> {
        self.entries.write().insert(info.device_id.clone(), info)
    }

    pub fn get(&self, device_id: &str) -> Option<ConnectionInfo> {
        self.entries.read().get(device_id).cloned()
    }

    pub fn remove(&self, device_id: &str) -> Option<ConnectionInfo> {
        self.entries.write().remove(device_id)
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.entries.read().contains_key(device_id)
    }

    pub fn set_state(&self, device_id: &str, state: ConnectionState) -> bool {
        self.update(device_id, |info| info.set_state(state))
    }

    /// Like [`set_state`](Self::set_state), but ignored when the update comes
    /// from a session over another protocol than the recorded one.
    pub fn set_state_from(
        &self,
        device_id: &str,
        protocol: Option<ProtocolKind>,
        state: ConnectionState,
    ) -> bool {
        let mut entries = self.entries.write();
        match entries.get_mut(device_id) {
            Some(info) if protocol.map_or(true, |p| p == info.protocol) => {
                info.set_state(state);
                true
            }
            _ => false,
        }
    }

    pub fn set_quality(&self, device_id: &str, quality: ConnectionQuality) -> bool {
        self.update(device_id, |info| info.update_quality(quality))
    }

    pub fn touch(&self, device_id: &str) -> bool {
        self.update(device_id, ConnectionInfo::touch)
    }

    fn update(&self, device_id: &str, f: impl FnOnce(&mut ConnectionInfo)) -> bool {
        match self.entries.write().get_mut(device_id) {
            Some(info) => {
                f(info);
                true
            }
            None => false,
        }
    }

    /// Remove records idle for longer than `timeout`; returns their device ids.
    pub fn sweep_inactive(&self, timeout: Duration, now: DateTime<Utc>) -> Vec<String> {
        let mut entries = self.entries.write();
        let stale: Vec<String> = entries
            .values()
            .filter(|info| info.is_inactive(timeout, now))
            .map(|info| info.device_id.clone())
            .collect();
        for id in &stale {
            entries.remove(id);
        }
        stale
    }

    pub fn list(&self) -> Vec<ConnectionInfo> {
        self.entries.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn connected_count(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|info| info.state == ConnectionState::Connected)
            .count()
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unilink_core::connection::ConnectionParameters;

    fn info(id: &str) -> ConnectionInfo {
        ConnectionInfo::new(id, ProtocolKind::Ble, ConnectionParameters::default())
    }

    #[test]
    fn test_one_record_per_device() {
        let table = ConnectionTable::new();
        table.insert(info("a"));
        let replaced = table.insert(info("a"));
        assert!(replaced.is_some());
        assert_eq!(table.len(), 1);
        assert_eq!(table.connected_count(), 1);
    }

    #[test]
    fn test_sweep_removes_idle_records() {
        let table = ConnectionTable::new();
        table.insert(info("idle"));
        table.insert(info("busy"));
        let later = Utc::now() + chrono::Duration::seconds(120);
        table.touch("busy");
        let removed = table.sweep_inactive(Duration::from_secs(60), later);
        assert_eq!(removed.len(), 2);

        table.insert(info("fresh"));
        assert!(table
            .sweep_inactive(Duration::from_secs(60), Utc::now())
            .is_empty());
        assert!(table.contains("fresh"));
    }

    #[test]
    fn test_state_updates() {
        let table = ConnectionTable::new();
        table.insert(info("a"));
        assert!(table.set_state("a", ConnectionState::Error));
        assert!(!table.set_state("missing", ConnectionState::Error));
        assert_eq!(table.connected_count(), 0);
    }

    #[test]
    fn test_state_from_other_protocol_is_ignored() {
        let table = ConnectionTable::new();
        table.insert(info("a"));
        assert!(!table.set_state_from("a", Some(ProtocolKind::Mqtt), ConnectionState::Disconnected));
        assert_eq!(table.connected_count(), 1);
        assert!(table.set_state_from("a", Some(ProtocolKind::Ble), ConnectionState::Error));
        assert!(table.set_state_from("a", None, ConnectionState::Disconnected));
        assert_eq!(table.get("a").unwrap().state, ConnectionState::Disconnected);
    }
}
