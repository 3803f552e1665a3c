//! Device communicator tests.
//!
//! Runs the communicator against the loopback network:
//! - connect, fallback across alternatives, idempotence
//! - link loss with bounded reconnection
//! - strategy re-evaluation and the switching veto
//! - fail-fast sends and teardown

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use unilink_core::config::{CommunicatorConfig, ProtocolDefaults};
use unilink_core::connection::{BackoffPolicy, ConnectionParameters, ConnectionState};
use unilink_core::context::{CommunicationContext, PriorityFactor, UserPreferences};
use unilink_core::device::DeviceDescriptor;
use unilink_core::error::ConnectionError;
use unilink_core::event::ConnectivityEvent;
use unilink_core::eventbus::EventBus;
use unilink_core::protocol::ProtocolKind;
use unilink_devices::{
    AdapterFactory, AdapterMessage, DeviceCommunicator, LoopbackNetwork,
    LoopbackTransportProvider, StrategyEngine,
};

const WAIT: Duration = Duration::from_secs(5);

fn params(auto_reconnect: bool) -> ConnectionParameters {
    ConnectionParameters {
        connect_timeout_ms: 500,
        operation_timeout_ms: 500,
        auto_reconnect,
        max_reconnect_attempts: 3,
        backoff: BackoffPolicy {
            initial_delay_ms: 5,
            max_delay_ms: 20,
            multiplier: 2.0,
            jitter: 0.0,
        },
        ..ConnectionParameters::default()
    }
}

struct Harness {
    network: LoopbackNetwork,
    bus: EventBus,
    factory: Arc<AdapterFactory>,
    engine: Arc<StrategyEngine>,
}

impl Harness {
    fn new(auto_reconnect: bool) -> Self {
        let network = LoopbackNetwork::new();
        let provider = Arc::new(LoopbackTransportProvider::new(network.clone()));
        Self {
            network,
            bus: EventBus::new(),
            factory: Arc::new(AdapterFactory::new(provider, params(auto_reconnect))),
            engine: Arc::new(StrategyEngine::with_default_strategies(
                ProtocolDefaults::default(),
            )),
        }
    }

    fn communicator(&self, context: CommunicationContext, config: CommunicatorConfig) -> DeviceCommunicator {
        DeviceCommunicator::new(
            context,
            self.factory.clone(),
            self.engine.clone(),
            self.bus.clone(),
            config,
        )
    }
}

fn gateway(id: &str) -> CommunicationContext {
    CommunicationContext::new(DeviceDescriptor::new(id, "gateway").with_protocols([ProtocolKind::Mqtt]))
}

async fn wait_for(comm: &DeviceCommunicator, target: ConnectionState) {
    let mut rx = comm.watch_state();
    timeout(WAIT, rx.wait_for(|s| *s == target))
        .await
        .expect("state not reached in time")
        .expect("state channel closed");
}

#[tokio::test]
async fn test_connect_is_idempotent() {
    let h = Harness::new(false);
    h.network.add_device(ProtocolKind::Mqtt, "hub-1");
    let comm = h.communicator(gateway("hub-1"), CommunicatorConfig::default());

    comm.connect().await.unwrap();
    comm.connect().await.unwrap();

    assert_eq!(comm.state(), ConnectionState::Connected);
    assert_eq!(comm.protocol(), Some(ProtocolKind::Mqtt));
    assert_eq!(comm.current_strategy().as_deref(), Some("automatic"));
    assert_eq!(h.network.open_links(ProtocolKind::Mqtt, "hub-1"), 1);

    let info = comm.connection_info().unwrap();
    assert_eq!(info.state, ConnectionState::Connected);
    assert_eq!(comm.context().history.len(), 1);
}

#[tokio::test]
async fn test_falls_back_to_next_protocol() {
    let h = Harness::new(false);
    // Only the MQTT side of the device answers
    h.network.add_device(ProtocolKind::Mqtt, "bridge");
    let prefs = UserPreferences {
        priority: PriorityFactor::Reliability,
        ..UserPreferences::default()
    };
    let context = CommunicationContext::new(
        DeviceDescriptor::new("bridge", "bridge").with_protocols([ProtocolKind::Matter, ProtocolKind::Mqtt]),
    )
    .with_preferences(prefs);
    let comm = h.communicator(context, CommunicatorConfig::default());

    comm.connect().await.unwrap();
    assert_eq!(comm.current_strategy().as_deref(), Some("reliability_first"));
    assert_eq!(comm.protocol(), Some(ProtocolKind::Mqtt));

    let history = comm.context().history;
    assert_eq!(history.success_rate(Some(ProtocolKind::Matter)), Some(0.0));
    assert_eq!(history.success_rate(Some(ProtocolKind::Mqtt)), Some(1.0));
}

#[tokio::test]
async fn test_send_fails_fast_when_not_connected() {
    let h = Harness::new(false);
    let comm = h.communicator(gateway("hub-2"), CommunicatorConfig::default());
    let err = comm
        .send(AdapterMessage::new(serde_json::json!({"on": true})))
        .await
        .unwrap_err();
    assert_eq!(err, ConnectionError::NotConnected);
    assert_eq!(comm.subscribe("status").await, Err(ConnectionError::NotConnected));
}

#[tokio::test]
async fn test_send_reaches_device() {
    let h = Harness::new(false);
    h.network.add_device(ProtocolKind::Mqtt, "hub-3");
    let comm = h.communicator(gateway("hub-3"), CommunicatorConfig::default());
    comm.connect().await.unwrap();

    comm.send(AdapterMessage::new(serde_json::json!({"type": "switch", "on": true})))
        .await
        .unwrap();
    assert_eq!(h.network.written(ProtocolKind::Mqtt, "hub-3").len(), 1);
    assert_eq!(comm.statistics().unwrap().messages_sent, 1);
}

#[tokio::test]
async fn test_inbound_messages_are_published() {
    let h = Harness::new(false);
    h.network.add_device(ProtocolKind::Mqtt, "hub-4");
    let mut messages = h
        .bus
        .subscribe_filtered(|e| matches!(e, ConnectivityEvent::MessageReceived { .. }));
    let comm = h.communicator(gateway("hub-4"), CommunicatorConfig::default());
    comm.connect().await.unwrap();

    let delivered = h.network.push_message(
        ProtocolKind::Mqtt,
        "hub-4",
        Some("device/hub-4/uplink"),
        br#"{"temperature": 21.5}"#.to_vec(),
    );
    assert!(delivered >= 1);

    let (event, _) = timeout(WAIT, messages.recv()).await.unwrap().unwrap();
    match event {
        ConnectivityEvent::MessageReceived {
            device_id, protocol, ..
        } => {
            assert_eq!(device_id, "hub-4");
            assert_eq!(protocol, ProtocolKind::Mqtt);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_three_reconnect_failures_emit_one_connection_failed() {
    let h = Harness::new(true);
    h.network.add_device(ProtocolKind::Mqtt, "hub-5");
    let mut failures = h
        .bus
        .subscribe_filtered(|e| matches!(e, ConnectivityEvent::ConnectionFailed { .. }));
    let comm = h.communicator(gateway("hub-5"), CommunicatorConfig::default());
    comm.connect().await.unwrap();

    h.network.refuse_next_connects(ProtocolKind::Mqtt, "hub-5", 3);
    assert!(h.network.drop_link(ProtocolKind::Mqtt, "hub-5") >= 1);

    let (event, _) = timeout(WAIT, failures.recv()).await.unwrap().unwrap();
    match event {
        ConnectivityEvent::ConnectionFailed { attempts, .. } => assert_eq!(attempts, 3),
        other => panic!("unexpected event {:?}", other),
    }
    wait_for(&comm, ConnectionState::Disconnected).await;

    // Terminal: no second failure event follows
    assert!(timeout(Duration::from_millis(200), failures.recv()).await.is_err());
    assert!(comm.connection_info().is_none());
}

#[tokio::test]
async fn test_link_restored_after_transient_loss() {
    let h = Harness::new(true);
    h.network.add_device(ProtocolKind::Mqtt, "hub-6");
    let comm = h.communicator(gateway("hub-6"), CommunicatorConfig::default());
    comm.connect().await.unwrap();

    let mut restored = h.bus.subscribe_filtered(|e| {
        matches!(
            e,
            ConnectivityEvent::StateChanged {
                old_state: ConnectionState::Connecting,
                new_state: ConnectionState::Connected,
                ..
            }
        )
    });
    h.network.refuse_next_connects(ProtocolKind::Mqtt, "hub-6", 1);
    h.network.drop_link(ProtocolKind::Mqtt, "hub-6");

    timeout(WAIT, restored.recv()).await.unwrap().unwrap();
    assert_eq!(comm.state(), ConnectionState::Connected);
    assert_eq!(comm.protocol(), Some(ProtocolKind::Mqtt));
    assert_eq!(h.network.open_links(ProtocolKind::Mqtt, "hub-6"), 1);
}

#[tokio::test]
async fn test_failed_connect_without_auto_reconnect() {
    let h = Harness::new(false);
    let mut failures = h
        .bus
        .subscribe_filtered(|e| matches!(e, ConnectivityEvent::ConnectionFailed { .. }));
    let comm = h.communicator(gateway("absent"), CommunicatorConfig::default());

    assert!(comm.connect().await.is_err());
    assert_eq!(comm.state(), ConnectionState::Disconnected);

    let (event, _) = timeout(WAIT, failures.recv()).await.unwrap().unwrap();
    assert!(matches!(
        event,
        ConnectivityEvent::ConnectionFailed { attempts: 1, .. }
    ));
}

#[tokio::test]
async fn test_initial_failure_retries_in_background() {
    let h = Harness::new(true);
    h.network.add_device(ProtocolKind::Mqtt, "hub-7");
    h.network.refuse_next_connects(ProtocolKind::Mqtt, "hub-7", 1);
    let comm = h.communicator(gateway("hub-7"), CommunicatorConfig::default());

    assert!(comm.connect().await.is_err());
    wait_for(&comm, ConnectionState::Connected).await;
    assert_eq!(comm.reconnect_attempts(), 0);
}

#[tokio::test]
async fn test_low_score_switches_strategy() {
    let h = Harness::new(false);
    h.network.add_device(ProtocolKind::Mqtt, "hub-8");
    let mut changes = h
        .bus
        .subscribe_filtered(|e| matches!(e, ConnectivityEvent::StrategyChanged { .. }));
    let config = CommunicatorConfig {
        reevaluation_threshold: 70,
        ..CommunicatorConfig::default()
    };
    let comm = h.communicator(gateway("hub-8"), config);
    comm.connect().await.unwrap();
    assert_eq!(comm.current_strategy().as_deref(), Some("automatic"));

    let prefs = UserPreferences {
        priority: PriorityFactor::Reliability,
        ..UserPreferences::default()
    };
    // Same device: no out-of-band re-evaluation
    assert!(!comm.update_context(gateway("hub-8").with_preferences(prefs)));

    let switched = comm.reevaluate().await.unwrap();
    assert_eq!(switched.as_deref(), Some("reliability_first"));
    assert_eq!(comm.current_strategy().as_deref(), Some("reliability_first"));
    assert_eq!(comm.state(), ConnectionState::Connected);

    let (event, _) = timeout(WAIT, changes.recv()).await.unwrap().unwrap();
    match event {
        ConnectivityEvent::StrategyChanged { from, to, .. } => {
            assert_eq!(from.as_deref(), Some("automatic"));
            assert_eq!(to, "reliability_first");
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_switch_vetoed_by_preferences() {
    let h = Harness::new(false);
    h.network.add_device(ProtocolKind::Mqtt, "hub-9");
    let config = CommunicatorConfig {
        reevaluation_threshold: 70,
        ..CommunicatorConfig::default()
    };
    let comm = h.communicator(gateway("hub-9"), config);
    comm.connect().await.unwrap();

    let prefs = UserPreferences {
        priority: PriorityFactor::Reliability,
        allow_protocol_switching: false,
        ..UserPreferences::default()
    };
    comm.update_context(gateway("hub-9").with_preferences(prefs));

    assert_eq!(comm.reevaluate().await.unwrap(), None);
    assert_eq!(comm.current_strategy().as_deref(), Some("automatic"));
}

#[tokio::test]
async fn test_device_change_triggers_reevaluation() {
    let h = Harness::new(false);
    h.network.add_device(ProtocolKind::Mqtt, "hub-10");
    let comm = h.communicator(gateway("hub-10"), CommunicatorConfig::default());

    // Nothing to re-evaluate before the first connect
    assert!(!comm.update_context(gateway("hub-10")));
    comm.connect().await.unwrap();

    let refreshed = gateway("hub-10");
    assert!(!comm.update_context(refreshed));

    let changed = CommunicationContext::new(
        DeviceDescriptor::new("hub-10", "hub").with_protocols([ProtocolKind::Mqtt]),
    );
    assert!(comm.update_context(changed));
    assert_eq!(comm.context().device.device_type, "hub");
    // History survives a context refresh
    assert!(!comm.context().history.is_empty());
}

#[tokio::test]
async fn test_shutdown_is_final() {
    let h = Harness::new(true);
    h.network.add_device(ProtocolKind::Mqtt, "hub-11");
    let comm = h.communicator(gateway("hub-11"), CommunicatorConfig::default());
    comm.connect().await.unwrap();

    comm.shutdown().await;
    assert_eq!(comm.state(), ConnectionState::Disconnected);
    assert!(comm.is_shut_down());
    assert_eq!(h.network.open_links(ProtocolKind::Mqtt, "hub-11"), 0);
    assert!(matches!(
        comm.connect().await,
        Err(ConnectionError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_disconnect_fails_in_flight_send() {
    let h = Harness::new(false);
    h.network.add_device(ProtocolKind::Mqtt, "hub-12");
    let comm = h.communicator(gateway("hub-12"), CommunicatorConfig::default());
    comm.connect().await.unwrap();

    h.network
        .set_latency(ProtocolKind::Mqtt, "hub-12", Duration::from_secs(2));
    let sender = comm.clone();
    let pending = tokio::spawn(async move {
        sender
            .send(AdapterMessage::new(serde_json::json!({"type": "switch", "on": true})))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    comm.disconnect().await.unwrap();

    let result = timeout(WAIT, pending).await.unwrap().unwrap();
    assert_eq!(result, Err(ConnectionError::ConnectionLost));
    assert_eq!(comm.state(), ConnectionState::Disconnected);
    assert!(h.network.written(ProtocolKind::Mqtt, "hub-12").is_empty());
}

#[tokio::test]
async fn test_abandon_reports_pending_retries_once() {
    let h = Harness::new(true);
    let mut failures = h
        .bus
        .subscribe_filtered(|e| matches!(e, ConnectivityEvent::ConnectionFailed { .. }));
    let comm = h.communicator(gateway("absent-2"), CommunicatorConfig::default());

    let err = comm.connect().await.unwrap_err();
    comm.abandon(&err).await;

    let (event, _) = timeout(WAIT, failures.recv()).await.unwrap().unwrap();
    match event {
        ConnectivityEvent::ConnectionFailed {
            device_id, attempts, ..
        } => {
            assert_eq!(device_id, "absent-2");
            assert!(attempts >= 1);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(comm.state(), ConnectionState::Disconnected);
    assert!(comm.is_shut_down());
    assert!(timeout(Duration::from_millis(200), failures.recv()).await.is_err());
}

#[tokio::test]
async fn test_abandon_after_reported_failure_is_silent() {
    let h = Harness::new(false);
    let mut failures = h
        .bus
        .subscribe_filtered(|e| matches!(e, ConnectivityEvent::ConnectionFailed { .. }));
    let comm = h.communicator(gateway("absent-3"), CommunicatorConfig::default());

    let err = comm.connect().await.unwrap_err();
    comm.abandon(&err).await;

    timeout(WAIT, failures.recv()).await.unwrap().unwrap();
    assert!(timeout(Duration::from_millis(200), failures.recv()).await.is_err());
}
