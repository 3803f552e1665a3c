//! Strategy engine property tests.

use proptest::prelude::*;

use unilink_core::config::ProtocolDefaults;
use unilink_core::context::{
    CommunicationContext, NetworkEnvironment, PriorityFactor, SecurityLevel, UserPreferences,
};
use unilink_core::device::DeviceDescriptor;
use unilink_core::protocol::ProtocolKind;
use unilink_devices::StrategyEngine;

fn any_priority() -> impl Strategy<Value = PriorityFactor> {
    prop_oneof![
        Just(PriorityFactor::Speed),
        Just(PriorityFactor::Reliability),
        Just(PriorityFactor::Power),
        Just(PriorityFactor::Security),
        Just(PriorityFactor::Balanced),
    ]
}

fn any_security_level() -> impl Strategy<Value = SecurityLevel> {
    prop_oneof![
        Just(SecurityLevel::Low),
        Just(SecurityLevel::Standard),
        Just(SecurityLevel::High),
        Just(SecurityLevel::Critical),
    ]
}

prop_compose! {
    fn context()(
        protocols in proptest::sample::subsequence(ProtocolKind::ALL.to_vec(), 0..=ProtocolKind::ALL.len()),
        battery in any::<bool>(),
        wifi in any::<bool>(),
        bluetooth in any::<bool>(),
        wifi_signal in 0.0f64..=1.0,
        bluetooth_signal in 0.0f64..=1.0,
        priority in any_priority(),
        security_level in any_security_level(),
        power_saving_mode in any::<bool>(),
    ) -> CommunicationContext {
        let device = DeviceDescriptor::new("prop-device", "sensor")
            .with_protocols(protocols)
            .battery_powered(battery);
        let network = NetworkEnvironment {
            wifi_available: wifi,
            wifi_signal,
            bluetooth_available: bluetooth,
            bluetooth_signal,
            ..NetworkEnvironment::default()
        };
        let preferences = UserPreferences {
            priority,
            security_level,
            power_saving_mode,
            ..UserPreferences::default()
        };
        CommunicationContext::new(device)
            .with_network(network)
            .with_preferences(preferences)
    }
}

proptest! {
    #[test]
    fn best_strategy_is_stable_for_unchanged_context(ctx in context()) {
        let engine = StrategyEngine::with_default_strategies(ProtocolDefaults::default());

        let first = engine.best_strategy(&ctx).map(|(s, e)| (s.name().to_string(), e.suitability_score));
        for _ in 0..3 {
            let again = engine.best_strategy(&ctx).map(|(s, e)| (s.name().to_string(), e.suitability_score));
            prop_assert_eq!(&again, &first);
        }
    }

    #[test]
    fn selection_is_stable_for_unchanged_context(ctx in context()) {
        let engine = StrategyEngine::with_default_strategies(ProtocolDefaults::default());

        let first = engine.select(&ctx).ok().map(|(_, sel)| (sel.protocol, sel.alternatives));
        let again = engine.select(&ctx).ok().map(|(_, sel)| (sel.protocol, sel.alternatives));
        prop_assert_eq!(again, first);
    }

    #[test]
    fn scores_stay_in_range(ctx in context()) {
        let engine = StrategyEngine::with_default_strategies(ProtocolDefaults::default());
        for eval in engine.evaluate_all(&ctx) {
            prop_assert!(eval.suitability_score <= 100, "{} scored {}", eval.strategy, eval.suitability_score);
        }
    }
}
