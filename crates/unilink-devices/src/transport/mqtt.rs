//! MQTT broker transport.
//!
//! Topic layout:
//! - `device/{device_id}/downlink` carries commands to the device
//! - `device/{device_id}/uplink` carries device messages back
//! - `{discovery_prefix}/announce` carries JSON [`Advertisement`]s

use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use unilink_core::protocol::ProtocolKind;
use unilink_core::protocol_config::MqttConfig;

use crate::adapters::mqtt::{downlink_topic, uplink_topic};

use super::{Advertisement, Frame, Transport, TransportError, TransportSignal, SIGNAL_CHANNEL_CAPACITY};

/// Capacity of the rumqttc request channel.
const REQUEST_CHANNEL_CAPACITY: usize = 10;

fn qos_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

struct MqttSession {
    client: AsyncClient,
    device_id: String,
    poller: JoinHandle<()>,
}

/// Transport over an MQTT broker.
pub struct MqttTransport {
    config: MqttConfig,
    session: Mutex<Option<MqttSession>>,
    signals: broadcast::Sender<TransportSignal>,
}

impl MqttTransport {
    pub fn new(config: MqttConfig) -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);
        Self {
            config,
            session: Mutex::new(None),
            signals,
        }
    }

    fn announce_topic(&self) -> String {
        format!("{}/announce", self.config.discovery_prefix)
    }

    fn client_id_for(&self, device_id: &str) -> String {
        if self.config.client_id.is_empty() {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("unilink-{}-{}", device_id, &suffix[..8])
        } else {
            self.config.client_id.clone()
        }
    }

    fn options(&self, client_id: String) -> MqttOptions {
        let mut options = MqttOptions::new(client_id, &self.config.host, self.config.port);
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs.max(5)));
        options.set_clean_session(self.config.clean_session);
        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            options.set_credentials(username, password);
        }
        options
    }

    /// Connect a client and wait for the broker's ConnAck.
    async fn start(
        &self,
        client_id: String,
        signals: broadcast::Sender<TransportSignal>,
    ) -> Result<(AsyncClient, JoinHandle<()>), TransportError> {
        let (client, eventloop) = AsyncClient::new(self.options(client_id), REQUEST_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let poller = tokio::spawn(poll_events(eventloop, signals, self.announce_topic(), ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => Ok((client, poller)),
            Ok(Err(e)) => {
                poller.abort();
                Err(e)
            }
            Err(_) => {
                poller.abort();
                Err(TransportError::Io("mqtt event loop stopped".to_string()))
            }
        }
    }

    fn client(&self) -> Result<(AsyncClient, String), TransportError> {
        let session = self.session.lock();
        match session.as_ref() {
            Some(s) if s.poller.is_finished() => {
                Err(TransportError::LinkLost("mqtt event loop stopped".to_string()))
            }
            Some(s) => Ok((s.client.clone(), s.device_id.clone())),
            None => Err(TransportError::NotOpen),
        }
    }
}

/// Drive the rumqttc event loop, turning packets into transport signals.
async fn poll_events(
    mut eventloop: EventLoop,
    signals: broadcast::Sender<TransportSignal>,
    announce_topic: String,
    ready: oneshot::Sender<Result<(), TransportError>>,
) {
    let mut ready = Some(ready);
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                let result = match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized => {
                        Err(TransportError::AuthRejected)
                    }
                    other => Err(TransportError::Refused(format!("{:?}", other))),
                };
                let refused = result.is_err();
                match ready.take() {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => debug!("MQTT session re-established by broker"),
                }
                if refused {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let signal = if publish.topic == announce_topic {
                    match serde_json::from_slice::<Advertisement>(&publish.payload) {
                        Ok(ad) => TransportSignal::Advertisement(ad),
                        Err(e) => {
                            debug!(error = %e, "Ignoring malformed announce payload");
                            continue;
                        }
                    }
                } else {
                    TransportSignal::Message(Frame {
                        address: Some(publish.topic.clone()),
                        payload: publish.payload.to_vec(),
                    })
                };
                let _ = signals.send(signal);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                match ready.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(TransportError::Unreachable(e.to_string())));
                    }
                    None => {
                        warn!(error = %e, "MQTT connection lost");
                        let _ = signals.send(TransportSignal::LinkDown(e.to_string()));
                    }
                }
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::Mqtt
    }

    async fn open(&self, device_id: &str) -> Result<(), TransportError> {
        self.close().await?;

        let client_id = self.client_id_for(device_id);
        let (client, poller) = self.start(client_id, self.signals.clone()).await?;
        if let Err(e) = client
            .subscribe(uplink_topic(device_id), qos_level(self.config.qos))
            .await
        {
            poller.abort();
            return Err(TransportError::Io(e.to_string()));
        }

        info!(broker = %self.config.broker_addr(), device_id, "MQTT link open");
        *self.session.lock() = Some(MqttSession {
            client,
            device_id: device_id.to_string(),
            poller,
        });
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        let session = self.session.lock().take();
        if let Some(session) = session {
            let _ = session.client.disconnect().await;
            session.poller.abort();
        }
        Ok(())
    }

    async fn write(&self, frame: Frame) -> Result<(), TransportError> {
        let (client, device_id) = self.client()?;
        let topic = frame.address.unwrap_or_else(|| downlink_topic(&device_id));
        client
            .publish(topic, qos_level(self.config.qos), false, frame.payload)
            .await
            .map_err(|e| TransportError::LinkLost(e.to_string()))
    }

    async fn subscribe(&self, address: &str) -> Result<(), TransportError> {
        let (client, _) = self.client()?;
        client
            .subscribe(address, qos_level(self.config.qos))
            .await
            .map_err(|e| TransportError::LinkLost(e.to_string()))
    }

    async fn unsubscribe(&self, address: &str) -> Result<(), TransportError> {
        let (client, _) = self.client()?;
        client
            .unsubscribe(address)
            .await
            .map_err(|e| TransportError::LinkLost(e.to_string()))
    }

    async fn probe(&self) -> Result<Duration, TransportError> {
        let (client, device_id) = self.client()?;
        let started = Instant::now();
        client
            .publish(
                format!("device/{}/ping", device_id),
                QoS::AtMostOnce,
                false,
                Vec::new(),
            )
            .await
            .map_err(|e| TransportError::LinkLost(e.to_string()))?;
        Ok(started.elapsed())
    }

    fn signals(&self) -> broadcast::Receiver<TransportSignal> {
        self.signals.subscribe()
    }

    async fn scan(&self, window: Duration) -> Result<mpsc::Receiver<Advertisement>, TransportError> {
        let (scan_signals, mut scan_rx) = broadcast::channel(SIGNAL_CHANNEL_CAPACITY);
        let client_id = self.client_id_for("scan");
        let (client, poller) = self.start(client_id, scan_signals).await?;
        client
            .subscribe(self.announce_topic(), qos_level(self.config.qos))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let deadline = tokio::time::sleep(window);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    signal = scan_rx.recv() => match signal {
                        Ok(TransportSignal::Advertisement(ad)) => {
                            if tx.send(ad).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            let _ = client.disconnect().await;
            poller.abort();
        });
        Ok(rx)
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        if let Some(session) = self.session.lock().take() {
            session.poller.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_derivation() {
        let transport = MqttTransport::new(MqttConfig::default());
        assert!(transport.client_id_for("lamp").starts_with("unilink-lamp-"));

        let pinned = MqttTransport::new(MqttConfig::default().with_client_id("fixed"));
        assert_eq!(pinned.client_id_for("lamp"), "fixed");
    }

    #[test]
    fn test_qos_levels() {
        assert_eq!(qos_level(0), QoS::AtMostOnce);
        assert_eq!(qos_level(1), QoS::AtLeastOnce);
        assert_eq!(qos_level(2), QoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn test_write_before_open() {
        let transport = MqttTransport::new(MqttConfig::default());
        assert_eq!(
            transport.write(Frame::new("t", vec![])).await,
            Err(TransportError::NotOpen)
        );
    }
}
