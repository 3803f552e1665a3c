//! Session core shared by the reference adapters.
//!
//! A [`SessionAdapter`] drives one transport through the connection state
//! machine. After a successful connect a supervisor task watches the link:
//! inbound frames become [`AdapterEvent::Message`]s, keep-alive probes run on
//! the configured interval, and a lost link is reconnected with exponential
//! backoff. When the attempt cap is reached the session settles in
//! `Disconnected` and emits a single [`AdapterEvent::ConnectionFailed`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use unilink_core::connection::{ConnectionParameters, ConnectionState, ConnectionStatistics};
use unilink_core::device::DeviceDescriptor;
use unilink_core::error::{ConnectionError, ConnectionResult};
use unilink_core::protocol::ProtocolKind;

use super::codec::MessageCodec;
use super::diagnostics::DiagnosticsTracker;
use crate::adapter::{
    AdapterEvent, AdapterEventStream, AdapterMessage, Diagnostics, ProtocolAdapter, StateStream,
};
use crate::transport::{Frame, Transport, TransportError, TransportSignal};

const EVENT_CHANNEL_CAPACITY: usize = 256;

struct Shared {
    protocol: ProtocolKind,
    transport: Arc<dyn Transport>,
    codec: Box<dyn MessageCodec>,
    params: ConnectionParameters,
    device_id: RwLock<Option<String>>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<AdapterEvent>,
    /// Bumped whenever in-flight operations must fail with `ConnectionLost`.
    teardown: watch::Sender<u64>,
    diagnostics: Mutex<DiagnosticsTracker>,
    statistics: Mutex<ConnectionStatistics>,
}

impl Shared {
    fn current(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn device_id(&self) -> ConnectionResult<String> {
        self.device_id
            .read()
            .clone()
            .ok_or(ConnectionError::NotConnected)
    }

    /// Move to `next` if the edge exists. Events are emitted under the state
    /// lock so subscribers see transitions in order.
    fn transition(&self, next: ConnectionState) -> bool {
        let events = &self.events;
        let mut rejected = None;
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(next) {
                rejected = Some(*current);
                return false;
            }
            let old = *current;
            *current = next;
            let _ = events.send(AdapterEvent::StateChanged { old, new: next });
            true
        });
        if let Some(from) = rejected {
            warn!(
                protocol = %self.protocol,
                from = %from,
                to = %next,
                "Ignoring invalid state transition"
            );
        }
        changed
    }

    fn emit(&self, event: AdapterEvent) {
        let _ = self.events.send(event);
    }

    fn fail_in_flight(&self) {
        self.teardown.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    async fn open_link(&self, device_id: &str) -> ConnectionResult<()> {
        let timeout = self.params.connect_timeout();
        match tokio::time::timeout(timeout, self.transport.open(device_id)).await {
            Ok(result) => result.map_err(ConnectionError::from),
            Err(_) => {
                let _ = self.transport.close().await;
                Err(ConnectionError::Timeout(self.params.connect_timeout_ms))
            }
        }
    }

    /// Run one link operation bounded by the operation timeout and by teardown.
    async fn run_operation<F>(&self, op: F) -> ConnectionResult<()>
    where
        F: std::future::Future<Output = Result<(), TransportError>> + Send,
    {
        let mut teardown = self.teardown.subscribe();
        let timeout = self.params.operation_timeout();
        tokio::select! {
            result = tokio::time::timeout(timeout, op) => match result {
                Ok(result) => result.map_err(ConnectionError::from),
                Err(_) => Err(ConnectionError::Timeout(self.params.operation_timeout_ms)),
            },
            _ = teardown.changed() => Err(ConnectionError::ConnectionLost),
        }
    }

    fn on_message(&self, frame: Frame) {
        let payload = self.codec.decode(&frame);
        self.statistics.lock().record_received(frame.len());
        self.emit(AdapterEvent::Message {
            topic: frame.address,
            payload,
        });
    }

    /// Handle a lost link. Returns true when the link was re-established.
    async fn recover(
        &self,
        reason: &str,
        signals: &mut broadcast::Receiver<TransportSignal>,
    ) -> bool {
        let device_id = match self.device_id() {
            Ok(id) => id,
            Err(_) => return false,
        };
        warn!(protocol = %self.protocol, device_id = %device_id, reason, "Link lost");

        self.fail_in_flight();
        self.diagnostics.lock().record_error();
        self.transition(ConnectionState::Error);
        let _ = self.transport.close().await;

        if !self.params.auto_reconnect {
            self.transition(ConnectionState::Disconnected);
            self.emit(AdapterEvent::ConnectionFailed {
                attempts: 0,
                error: ConnectionError::ConnectionLost,
            });
            return false;
        }

        let max_attempts = self.params.max_reconnect_attempts;
        let mut last_error = ConnectionError::ConnectionLost;
        for attempt in 1..=max_attempts {
            let delay = self.params.backoff.jittered_delay_for(attempt);
            debug!(
                protocol = %self.protocol,
                device_id = %device_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Scheduling reconnect"
            );
            tokio::time::sleep(delay).await;

            self.transition(ConnectionState::Connecting);
            self.statistics.lock().record_attempt();
            match self.open_link(&device_id).await {
                Ok(()) => {
                    {
                        let mut stats = self.statistics.lock();
                        stats.record_connected();
                        stats.record_reconnect();
                    }
                    self.diagnostics.lock().record_reconnect();
                    *signals = signals.resubscribe();
                    self.transition(ConnectionState::Connected);
                    self.emit(AdapterEvent::Reconnected { attempts: attempt });
                    info!(protocol = %self.protocol, device_id = %device_id, attempt, "Reconnected");
                    return true;
                }
                Err(e) => {
                    self.statistics.lock().record_connect_failure();
                    self.diagnostics.lock().record_error();
                    self.transition(ConnectionState::Error);
                    let _ = self.transport.close().await;
                    warn!(
                        protocol = %self.protocol,
                        device_id = %device_id,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Reconnect attempt failed"
                    );
                    last_error = e;
                }
            }
        }

        error!(
            protocol = %self.protocol,
            device_id = %device_id,
            attempts = max_attempts,
            "Giving up on reconnection"
        );
        self.transition(ConnectionState::Disconnected);
        self.emit(AdapterEvent::ConnectionFailed {
            attempts: max_attempts,
            error: last_error,
        });
        false
    }
}

/// Watch an established link until it is lost for good or the task is aborted.
async fn supervise(shared: Arc<Shared>, mut signals: broadcast::Receiver<TransportSignal>) {
    let keep_alive = shared.params.keep_alive().max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + keep_alive, keep_alive);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let lost = tokio::select! {
            signal = signals.recv() => match signal {
                Ok(TransportSignal::Message(frame)) => {
                    shared.on_message(frame);
                    None
                }
                Ok(TransportSignal::Advertisement(_)) => None,
                Ok(TransportSignal::LinkDown(reason)) => Some(reason),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(protocol = %shared.protocol, skipped, "Inbound signals dropped");
                    None
                }
                Err(broadcast::error::RecvError::Closed) => Some("transport closed".to_string()),
            },
            _ = ticker.tick() => {
                match tokio::time::timeout(shared.params.operation_timeout(), shared.transport.probe()).await {
                    Ok(Ok(rtt)) => {
                        shared.diagnostics.lock().record_probe(rtt);
                        None
                    }
                    Ok(Err(e)) => Some(e.to_string()),
                    Err(_) => Some("keep-alive timed out".to_string()),
                }
            }
        };

        if let Some(reason) = lost {
            if !shared.recover(&reason, &mut signals).await {
                return;
            }
            ticker.reset();
        }
    }
}

/// Protocol adapter built from a transport and a codec.
pub struct SessionAdapter {
    name: String,
    shared: Arc<Shared>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    connect_lock: tokio::sync::Mutex<()>,
}

impl SessionAdapter {
    pub fn new(
        name: impl Into<String>,
        protocol: ProtocolKind,
        transport: Arc<dyn Transport>,
        codec: Box<dyn MessageCodec>,
        params: ConnectionParameters,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (teardown, _) = watch::channel(0);
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                protocol,
                transport,
                codec,
                params,
                device_id: RwLock::new(None),
                state,
                events,
                teardown,
                diagnostics: Mutex::new(DiagnosticsTracker::new()),
                statistics: Mutex::new(ConnectionStatistics::default()),
            }),
            supervisor: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn parameters(&self) -> &ConnectionParameters {
        &self.shared.params
    }

    /// Device the session is bound to.
    pub fn device_id(&self) -> Option<String> {
        self.shared.device_id.read().clone()
    }

    fn state_stream(&self) -> StateStream {
        let mut rx = self.shared.state.subscribe();
        Box::pin(async_stream::stream! {
            let current = *rx.borrow_and_update();
            yield current;
            while rx.changed().await.is_ok() {
                let next = *rx.borrow_and_update();
                yield next;
            }
        })
    }

    fn stop_supervisor(&self) {
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
    }

    fn ensure_connected(&self) -> ConnectionResult<String> {
        if self.shared.current() != ConnectionState::Connected {
            return Err(ConnectionError::NotConnected);
        }
        self.shared.device_id()
    }
}

#[async_trait]
impl ProtocolAdapter for SessionAdapter {
    fn protocol(&self) -> ProtocolKind {
        self.shared.protocol
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self, device: &DeviceDescriptor) -> ConnectionResult<StateStream> {
        let _guard = self.connect_lock.lock().await;
        let shared = &self.shared;

        if shared.current() == ConnectionState::Connected {
            return Ok(self.state_stream());
        }
        // A manual connect takes over from any pending reconnection.
        self.stop_supervisor();
        if shared.current() == ConnectionState::Connecting {
            shared.transition(ConnectionState::Error);
        }

        *shared.device_id.write() = Some(device.device_id.clone());
        shared.transition(ConnectionState::Connecting);
        shared.statistics.lock().record_attempt();

        let signals = shared.transport.signals();
        let started = Instant::now();
        match shared.open_link(&device.device_id).await {
            Ok(()) => {
                shared.statistics.lock().record_connected();
                shared.transition(ConnectionState::Connected);
                let task = tokio::spawn(supervise(shared.clone(), signals));
                *self.supervisor.lock() = Some(task);
                info!(
                    adapter = %self.name,
                    device_id = %device.device_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Connected"
                );
                Ok(self.state_stream())
            }
            Err(e) => {
                shared.statistics.lock().record_connect_failure();
                shared.diagnostics.lock().record_error();
                shared.transition(ConnectionState::Error);
                let _ = shared.transport.close().await;
                warn!(
                    adapter = %self.name,
                    device_id = %device.device_id,
                    error = %e,
                    "Connect failed"
                );
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> ConnectionResult<()> {
        let _guard = self.connect_lock.lock().await;
        let shared = &self.shared;

        self.stop_supervisor();
        shared.fail_in_flight();

        match shared.current() {
            ConnectionState::Connected => {
                shared.transition(ConnectionState::Disconnecting);
                if let Err(e) = shared.transport.close().await {
                    debug!(adapter = %self.name, error = %e, "Transport close failed");
                }
                shared.statistics.lock().record_disconnect();
                shared.transition(ConnectionState::Disconnected);
                info!(adapter = %self.name, "Disconnected");
            }
            ConnectionState::Connecting | ConnectionState::Error => {
                let _ = shared.transport.close().await;
                shared.transition(ConnectionState::Disconnected);
            }
            ConnectionState::Disconnecting | ConnectionState::Disconnected => {}
        }
        Ok(())
    }

    async fn send(&self, message: AdapterMessage) -> ConnectionResult<()> {
        let device_id = self.ensure_connected()?;
        let shared = &self.shared;
        let frame = shared.codec.encode(&device_id, &message)?;
        let bytes = frame.len();

        let started = Instant::now();
        let result = shared.run_operation(shared.transport.write(frame)).await;
        match &result {
            Ok(()) => {
                shared.diagnostics.lock().record_write(started.elapsed(), bytes);
                shared.statistics.lock().record_sent(bytes);
            }
            Err(e) => {
                shared.diagnostics.lock().record_write_failure();
                shared.statistics.lock().record_send_failure();
                debug!(adapter = %self.name, device_id = %device_id, error = %e, "Send failed");
            }
        }
        result
    }

    async fn subscribe(&self, topic: &str) -> ConnectionResult<()> {
        let device_id = self.ensure_connected()?;
        let address = self.shared.codec.subscription_address(&device_id, topic)?;
        self.shared
            .run_operation(self.shared.transport.subscribe(&address))
            .await
    }

    async fn unsubscribe(&self, topic: &str) -> ConnectionResult<()> {
        let device_id = self.ensure_connected()?;
        let address = self.shared.codec.subscription_address(&device_id, topic)?;
        self.shared
            .run_operation(self.shared.transport.unsubscribe(&address))
            .await
    }

    fn current_state(&self) -> ConnectionState {
        self.shared.current()
    }

    fn diagnostics(&self) -> Diagnostics {
        self.shared.diagnostics.lock().snapshot()
    }

    fn statistics(&self) -> ConnectionStatistics {
        self.shared.statistics.lock().clone()
    }

    fn events(&self) -> AdapterEventStream {
        let mut rx = self.shared.events.subscribe();
        Box::pin(async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => yield event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

impl Drop for SessionAdapter {
    fn drop(&mut self) {
        self.stop_supervisor();
    }
}
