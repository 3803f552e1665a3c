//! Data model and error taxonomy tests.

use std::time::Duration;

use chrono::Utc;
use unilink_core::prelude::*;
use unilink_core::{
    BackoffPolicy, ConnectionParameters, ConnectionStatistics, ConnectivityConfig,
    DeviceCapabilities,
};

#[test]
fn test_state_machine_edges() {
    use ConnectionState::*;

    let allowed = [
        (Disconnected, Connecting),
        (Connecting, Connected),
        (Connecting, Error),
        (Connected, Disconnecting),
        (Connected, Error),
        (Disconnecting, Disconnected),
        (Error, Connecting),
    ];
    for (from, to) in allowed {
        assert!(from.can_transition_to(to), "{} -> {} should be allowed", from, to);
    }

    let forbidden = [
        (Disconnected, Connected),
        (Connected, Connecting),
        (Disconnecting, Connected),
        (Error, Connected),
    ];
    for (from, to) in forbidden {
        assert!(!from.can_transition_to(to), "{} -> {} should be rejected", from, to);
    }
}

#[test]
fn test_statistics_rates() {
    let mut stats = ConnectionStatistics::default();
    assert_eq!(stats.success_rate(), 1.0);

    stats.record_attempt();
    stats.record_connected();
    stats.record_attempt();
    stats.record_connect_failure();
    stats.record_sent(10);
    stats.record_send_failure();
    assert_eq!(stats.success_rate(), 0.5);
    assert_eq!(stats.message_success_rate(), 0.5);
    assert_eq!(stats.bytes_sent, 10);

    stats.reset();
    assert_eq!(stats.connection_attempts, 0);
    assert_eq!(stats.messages_sent, 0);
}

#[test]
fn test_backoff_grows_and_caps() {
    let policy = BackoffPolicy {
        initial_delay_ms: 100,
        max_delay_ms: 350,
        multiplier: 2.0,
        jitter: 0.0,
    };
    assert_eq!(policy.delay_for(1), Duration::from_millis(100));
    assert_eq!(policy.delay_for(2), Duration::from_millis(200));
    assert_eq!(policy.delay_for(3), Duration::from_millis(350));
    assert_eq!(policy.jittered_delay_for(2), Duration::from_millis(200));
}

#[test]
fn test_backoff_jitter_bounds() {
    let policy = BackoffPolicy {
        initial_delay_ms: 1000,
        max_delay_ms: 10_000,
        multiplier: 2.0,
        jitter: 0.1,
    };
    for _ in 0..50 {
        let delay = policy.jittered_delay_for(1).as_millis();
        assert!((900..=1100).contains(&delay), "delay {} outside jitter", delay);
    }
}

#[test]
fn test_connection_info_inactivity() {
    let mut info = ConnectionInfo::new("lamp", ProtocolKind::Matter, ConnectionParameters::default());
    assert_eq!(info.state, ConnectionState::Connected);

    let later = Utc::now() + chrono::Duration::seconds(120);
    assert!(info.is_inactive(Duration::from_secs(60), later));
    assert!(!info.is_inactive(Duration::from_secs(600), later));

    info.touch();
    assert!(!info.is_inactive(Duration::from_secs(60), Utc::now()));
}

#[test]
fn test_control_error_mapping() {
    let err: ControlError = ConnectionError::Timeout(500).into();
    assert_eq!(err, ControlError::Timeout(500));

    let err: ControlError = ConnectionError::NotConnected.into();
    assert!(matches!(err, ControlError::ExecutionFailed(_)));
    assert!(err.is_retryable());

    let err: ControlError = ConnectionError::UnsupportedOperation("scene".into()).into();
    assert!(matches!(err, ControlError::CommandNotSupported(_)));
    assert!(!err.is_retryable());
}

#[test]
fn test_discovered_descriptor() {
    let found = DiscoveredDevice::new("tag-1", "sensor", ProtocolKind::Ble)
        .with_vendor_model(Some("Acme".into()), Some("T100".into()))
        .with_signal(-60);
    let descriptor = found.descriptor();
    assert_eq!(descriptor.protocol_hint, Some(ProtocolKind::Ble));
    assert!(descriptor.supports(ProtocolKind::Ble));
    assert_eq!(descriptor.model, "T100");
}

#[test]
fn test_capabilities_dedupe() {
    let caps = DeviceCapabilities::with_protocols([
        ProtocolKind::Ble,
        ProtocolKind::Mqtt,
        ProtocolKind::Ble,
    ]);
    assert_eq!(caps.supported_protocols, vec![ProtocolKind::Ble, ProtocolKind::Mqtt]);
}

#[test]
fn test_protocol_aliases() {
    assert_eq!("Zigbee".parse::<ProtocolKind>().unwrap(), ProtocolKind::Matter);
    assert_eq!("bluetooth".parse::<ProtocolKind>().unwrap(), ProtocolKind::Ble);
    assert_eq!("ws".parse::<ProtocolKind>().unwrap(), ProtocolKind::WebSocket);
    assert!("lora".parse::<ProtocolKind>().is_err());
}

#[test]
fn test_empty_config_file_is_default() {
    let config = ConnectivityConfig::from_toml_str("").unwrap();
    assert_eq!(config, ConnectivityConfig::default());
}
