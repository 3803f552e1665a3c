//! In-process loopback network.
//!
//! Devices are registered per protocol on a shared [`LoopbackNetwork`]. Each
//! [`LoopbackTransport`] opens a link to one registered device. The network
//! can inject latency, refused connects, write failures, link loss and
//! advertisements, and records every frame written so callers can inspect
//! what an adapter put on the wire.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use unilink_core::protocol::ProtocolKind;
use unilink_core::protocol_config::ProtocolConfig;

use super::{
    Advertisement, Frame, Transport, TransportError, TransportProvider, TransportSignal,
    SIGNAL_CHANNEL_CAPACITY,
};

type PeerKey = (ProtocolKind, String);

#[derive(Debug, Clone)]
struct Peer {
    reachable: bool,
    latency: Duration,
    refuse_connects: u32,
    reject_auth: bool,
    fail_writes: u32,
    written: Vec<Frame>,
    subscriptions: HashSet<String>,
}

impl Default for Peer {
    fn default() -> Self {
        Self {
            reachable: true,
            latency: Duration::ZERO,
            refuse_connects: 0,
            reject_auth: false,
            fail_writes: 0,
            written: Vec::new(),
            subscriptions: HashSet::new(),
        }
    }
}

struct Link {
    key: PeerKey,
    signals: broadcast::Sender<TransportSignal>,
}

#[derive(Default)]
struct NetworkState {
    peers: HashMap<PeerKey, Peer>,
    advertisements: Vec<(ProtocolKind, Advertisement)>,
    links: HashMap<u64, Link>,
    next_link: u64,
}

impl NetworkState {
    fn peer_mut(&mut self, protocol: ProtocolKind, device_id: &str) -> Option<&mut Peer> {
        self.peers.get_mut(&(protocol, device_id.to_string()))
    }

    fn drop_links(&mut self, key: &PeerKey, reason: &str) -> usize {
        let ids: Vec<u64> = self
            .links
            .iter()
            .filter(|(_, link)| &link.key == key)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(link) = self.links.remove(id) {
                let _ = link.signals.send(TransportSignal::LinkDown(reason.to_string()));
            }
        }
        ids.len()
    }
}

/// Shared in-process network. Cheap to clone.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a reachable device on `protocol`.
    pub fn add_device(&self, protocol: ProtocolKind, device_id: impl Into<String>) {
        let key = (protocol, device_id.into());
        let mut state = self.state.lock();
        state.peers.entry(key).or_default().reachable = true;
    }

    /// Remove a device and tear down its open links.
    pub fn remove_device(&self, protocol: ProtocolKind, device_id: &str) {
        let key = (protocol, device_id.to_string());
        let mut state = self.state.lock();
        state.peers.remove(&key);
        state.drop_links(&key, "device removed");
    }

    pub fn set_reachable(&self, protocol: ProtocolKind, device_id: &str, reachable: bool) {
        if let Some(peer) = self.state.lock().peer_mut(protocol, device_id) {
            peer.reachable = reachable;
        }
    }

    pub fn set_latency(&self, protocol: ProtocolKind, device_id: &str, latency: Duration) {
        if let Some(peer) = self.state.lock().peer_mut(protocol, device_id) {
            peer.latency = latency;
        }
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_next_connects(&self, protocol: ProtocolKind, device_id: &str, count: u32) {
        if let Some(peer) = self.state.lock().peer_mut(protocol, device_id) {
            peer.refuse_connects = count;
        }
    }

    pub fn reject_auth(&self, protocol: ProtocolKind, device_id: &str, reject: bool) {
        if let Some(peer) = self.state.lock().peer_mut(protocol, device_id) {
            peer.reject_auth = reject;
        }
    }

    /// Fail the next `count` writes with an I/O error.
    pub fn fail_next_writes(&self, protocol: ProtocolKind, device_id: &str, count: u32) {
        if let Some(peer) = self.state.lock().peer_mut(protocol, device_id) {
            peer.fail_writes = count;
        }
    }

    /// Drop every open link to a device. Returns how many links went down.
    pub fn drop_link(&self, protocol: ProtocolKind, device_id: &str) -> usize {
        let key = (protocol, device_id.to_string());
        let dropped = self.state.lock().drop_links(&key, "link dropped by peer");
        debug!(protocol = %protocol, device_id, dropped, "Loopback link dropped");
        dropped
    }

    /// Deliver an uplink message to every open link of a device.
    pub fn push_message(
        &self,
        protocol: ProtocolKind,
        device_id: &str,
        address: Option<&str>,
        payload: Vec<u8>,
    ) -> usize {
        let key = (protocol, device_id.to_string());
        let state = self.state.lock();
        let frame = Frame {
            address: address.map(str::to_string),
            payload,
        };
        state
            .links
            .values()
            .filter(|link| link.key == key)
            .filter(|link| {
                link.signals
                    .send(TransportSignal::Message(frame.clone()))
                    .is_ok()
            })
            .count()
    }

    /// Make an advertisement visible to scans on `protocol`.
    pub fn advertise(&self, protocol: ProtocolKind, advertisement: Advertisement) {
        let mut state = self.state.lock();
        state
            .advertisements
            .retain(|(p, ad)| !(*p == protocol && ad.device_id == advertisement.device_id));
        state.advertisements.push((protocol, advertisement));
    }

    pub fn clear_advertisements(&self, protocol: ProtocolKind) {
        self.state.lock().advertisements.retain(|(p, _)| *p != protocol);
    }

    /// Frames written to a device, oldest first.
    pub fn written(&self, protocol: ProtocolKind, device_id: &str) -> Vec<Frame> {
        self.state
            .lock()
            .peers
            .get(&(protocol, device_id.to_string()))
            .map(|peer| peer.written.clone())
            .unwrap_or_default()
    }

    /// Addresses a device's links are subscribed to.
    pub fn subscriptions(&self, protocol: ProtocolKind, device_id: &str) -> Vec<String> {
        let mut subs: Vec<String> = self
            .state
            .lock()
            .peers
            .get(&(protocol, device_id.to_string()))
            .map(|peer| peer.subscriptions.iter().cloned().collect())
            .unwrap_or_default();
        subs.sort();
        subs
    }

    /// Number of open links to a device.
    pub fn open_links(&self, protocol: ProtocolKind, device_id: &str) -> usize {
        let key = (protocol, device_id.to_string());
        self.state
            .lock()
            .links
            .values()
            .filter(|link| link.key == key)
            .count()
    }

    /// A new, closed transport on this network.
    pub fn transport(&self, protocol: ProtocolKind) -> LoopbackTransport {
        LoopbackTransport::new(self.clone(), protocol)
    }

    fn release(&self, link_id: u64) {
        self.state.lock().links.remove(&link_id);
    }
}

/// Link to one device on a [`LoopbackNetwork`].
pub struct LoopbackTransport {
    network: LoopbackNetwork,
    protocol: ProtocolKind,
    link: Mutex<Option<(String, u64)>>,
    signals: broadcast::Sender<TransportSignal>,
}

impl LoopbackTransport {
    pub fn new(network: LoopbackNetwork, protocol: ProtocolKind) -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);
        Self {
            network,
            protocol,
            link: Mutex::new(None),
            signals,
        }
    }

    fn current_link(&self) -> Result<(String, u64), TransportError> {
        self.link.lock().clone().ok_or(TransportError::NotOpen)
    }

    /// Latency of the open link, or the reason it is unusable.
    fn live_latency(&self) -> Result<(String, Duration), TransportError> {
        let (device_id, link_id) = self.current_link()?;
        let state = self.network.state.lock();
        if !state.links.contains_key(&link_id) {
            return Err(TransportError::LinkLost("link closed by peer".to_string()));
        }
        match state.peers.get(&(self.protocol, device_id.clone())) {
            Some(peer) if peer.reachable => Ok((device_id, peer.latency)),
            _ => Err(TransportError::LinkLost(format!("{} unreachable", device_id))),
        }
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    async fn open(&self, device_id: &str) -> Result<(), TransportError> {
        if let Some((_, old)) = self.link.lock().take() {
            self.network.release(old);
        }

        let latency = {
            let mut state = self.network.state.lock();
            let peer = state
                .peer_mut(self.protocol, device_id)
                .ok_or_else(|| TransportError::NoPeer(device_id.to_string()))?;
            if !peer.reachable {
                return Err(TransportError::Unreachable(device_id.to_string()));
            }
            if peer.refuse_connects > 0 {
                peer.refuse_connects -= 1;
                return Err(TransportError::Refused(format!("{} refused link", device_id)));
            }
            if peer.reject_auth {
                return Err(TransportError::AuthRejected);
            }
            peer.latency
        };
        tokio::time::sleep(latency).await;

        let mut state = self.network.state.lock();
        let link_id = state.next_link;
        state.next_link += 1;
        state.links.insert(
            link_id,
            Link {
                key: (self.protocol, device_id.to_string()),
                signals: self.signals.clone(),
            },
        );
        *self.link.lock() = Some((device_id.to_string(), link_id));
        trace!(protocol = %self.protocol, device_id, link_id, "Loopback link open");
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some((_, link_id)) = self.link.lock().take() {
            self.network.release(link_id);
        }
        Ok(())
    }

    async fn write(&self, frame: Frame) -> Result<(), TransportError> {
        let (device_id, latency) = self.live_latency()?;
        {
            let mut state = self.network.state.lock();
            if let Some(peer) = state.peer_mut(self.protocol, &device_id) {
                if peer.fail_writes > 0 {
                    peer.fail_writes -= 1;
                    return Err(TransportError::Io("write rejected by peer".to_string()));
                }
            }
        }
        tokio::time::sleep(latency).await;

        if let Some(peer) = self.network.state.lock().peer_mut(self.protocol, &device_id) {
            peer.written.push(frame);
        }
        Ok(())
    }

    async fn subscribe(&self, address: &str) -> Result<(), TransportError> {
        let (device_id, _) = self.live_latency()?;
        if let Some(peer) = self.network.state.lock().peer_mut(self.protocol, &device_id) {
            peer.subscriptions.insert(address.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, address: &str) -> Result<(), TransportError> {
        let (device_id, _) = self.live_latency()?;
        if let Some(peer) = self.network.state.lock().peer_mut(self.protocol, &device_id) {
            peer.subscriptions.remove(address);
        }
        Ok(())
    }

    async fn probe(&self) -> Result<Duration, TransportError> {
        let started = Instant::now();
        let (_, latency) = self.live_latency()?;
        tokio::time::sleep(latency * 2).await;
        Ok(started.elapsed())
    }

    fn signals(&self) -> broadcast::Receiver<TransportSignal> {
        self.signals.subscribe()
    }

    /// Loopback scans end as soon as every current advertisement is delivered.
    async fn scan(&self, _window: Duration) -> Result<mpsc::Receiver<Advertisement>, TransportError> {
        let found: Vec<Advertisement> = self
            .network
            .state
            .lock()
            .advertisements
            .iter()
            .filter(|(protocol, _)| *protocol == self.protocol)
            .map(|(_, ad)| ad.clone())
            .collect();

        let (tx, rx) = mpsc::channel(found.len().max(1));
        tokio::spawn(async move {
            for ad in found {
                if tx.send(ad).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        if let Some((_, link_id)) = self.link.lock().take() {
            self.network.release(link_id);
        }
    }
}

/// Routes every protocol to one loopback network.
#[derive(Clone, Default)]
pub struct LoopbackTransportProvider {
    network: LoopbackNetwork,
}

impl LoopbackTransportProvider {
    pub fn new(network: LoopbackNetwork) -> Self {
        Self { network }
    }

    pub fn network(&self) -> &LoopbackNetwork {
        &self.network
    }
}

impl TransportProvider for LoopbackTransportProvider {
    fn transport_for(&self, config: &ProtocolConfig) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(self.network.transport(config.protocol())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_open_write_close() {
        let network = LoopbackNetwork::new();
        network.add_device(ProtocolKind::Ble, "tag");
        let transport = network.transport(ProtocolKind::Ble);

        transport.open("tag").await.unwrap();
        assert_eq!(network.open_links(ProtocolKind::Ble, "tag"), 1);

        transport.write(Frame::new("char", b"on".to_vec())).await.unwrap();
        assert_eq!(network.written(ProtocolKind::Ble, "tag").len(), 1);

        transport.close().await.unwrap();
        assert_eq!(network.open_links(ProtocolKind::Ble, "tag"), 0);
        assert_eq!(
            transport.write(Frame::new("char", vec![])).await,
            Err(TransportError::NotOpen)
        );
    }

    #[tokio::test]
    async fn test_unknown_and_unreachable_peers() {
        let network = LoopbackNetwork::new();
        let transport = network.transport(ProtocolKind::Matter);
        assert!(matches!(
            transport.open("ghost").await,
            Err(TransportError::NoPeer(_))
        ));

        network.add_device(ProtocolKind::Matter, "bulb");
        network.set_reachable(ProtocolKind::Matter, "bulb", false);
        assert!(matches!(
            transport.open("bulb").await,
            Err(TransportError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_refused_connects_are_counted_down() {
        let network = LoopbackNetwork::new();
        network.add_device(ProtocolKind::Cloud, "thermo");
        network.refuse_next_connects(ProtocolKind::Cloud, "thermo", 1);
        let transport = network.transport(ProtocolKind::Cloud);

        assert!(matches!(
            transport.open("thermo").await,
            Err(TransportError::Refused(_))
        ));
        assert!(transport.open("thermo").await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_link_signals_link_down() {
        let network = LoopbackNetwork::new();
        network.add_device(ProtocolKind::Ble, "tag");
        let transport = network.transport(ProtocolKind::Ble);
        let mut signals = transport.signals();
        transport.open("tag").await.unwrap();

        assert_eq!(network.drop_link(ProtocolKind::Ble, "tag"), 1);
        assert!(matches!(
            signals.recv().await.unwrap(),
            TransportSignal::LinkDown(_)
        ));
        assert!(matches!(
            transport.write(Frame::new("c", vec![])).await,
            Err(TransportError::LinkLost(_))
        ));
    }

    #[tokio::test]
    async fn test_scan_filters_by_protocol() {
        let network = LoopbackNetwork::new();
        network.advertise(ProtocolKind::Ble, Advertisement::new("tag-1", "sensor"));
        network.advertise(ProtocolKind::Ble, Advertisement::new("tag-2", "sensor"));
        network.advertise(ProtocolKind::Matter, Advertisement::new("bulb", "light"));

        let transport = network.transport(ProtocolKind::Ble);
        let mut rx = transport.scan(Duration::from_millis(10)).await.unwrap();
        let mut ids = Vec::new();
        while let Some(ad) = rx.recv().await {
            ids.push(ad.device_id);
        }
        assert_eq!(ids, vec!["tag-1", "tag-2"]);
    }

    #[tokio::test]
    async fn test_dropping_transport_releases_link() {
        let network = LoopbackNetwork::new();
        network.add_device(ProtocolKind::Ble, "tag");
        {
            let transport = network.transport(ProtocolKind::Ble);
            transport.open("tag").await.unwrap();
            assert_eq!(network.open_links(ProtocolKind::Ble, "tag"), 1);
        }
        assert_eq!(network.open_links(ProtocolKind::Ble, "tag"), 0);
    }
}
