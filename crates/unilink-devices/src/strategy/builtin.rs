//! Built-in strategies.

use std::cmp::Reverse;

use unilink_core::config::ProtocolDefaults;
use unilink_core::context::{CommunicationContext, PriorityFactor, SecurityLevel};
use unilink_core::protocol::{NetworkMedium, ProtocolKind};

use super::{
    clamp_score, rank_protocols, selection_from, ConnectionStrategy, ExpectedPerformance,
    ProtocolSelection, StrategyError, StrategyEvaluation,
};

/// Protocols at or under this nominal latency count as low-latency.
const LOW_LATENCY_MS: u32 = 50;

fn position(order: &[ProtocolKind], protocol: ProtocolKind) -> usize {
    order
        .iter()
        .position(|p| *p == protocol)
        .unwrap_or(order.len())
}

fn evaluation(
    name: &str,
    score: i32,
    reasons: Vec<String>,
    top: Option<ProtocolKind>,
    context: &CommunicationContext,
) -> StrategyEvaluation {
    let mut risks = Vec::new();
    match top {
        Some(p) if !context.network.supports_protocol(p) => {
            risks.push(format!("{} is not reachable on the current network", p));
        }
        Some(p) if context.device.capabilities.battery_powered && p.profile().power_cost >= 7 => {
            risks.push(format!("{} drains battery-powered devices", p));
        }
        _ => {}
    }
    if let Some(rate) = top.and_then(|p| context.history.success_rate(Some(p))) {
        if rate < 0.5 {
            risks.push(format!("recent success rate {:.0}%", rate * 100.0));
        }
    }
    StrategyEvaluation {
        strategy: name.to_string(),
        suitability_score: clamp_score(score),
        applicable: true,
        reasons,
        expected_performance: top.map(ExpectedPerformance::of),
        risks,
    }
}

/// Scores every supported protocol against the device and network and picks
/// the best one.
#[derive(Debug, Default)]
pub struct AutomaticStrategy;

impl AutomaticStrategy {
    pub const NAME: &'static str = "automatic";

    /// Per-protocol score used to rank candidates.
    pub fn protocol_score(context: &CommunicationContext, protocol: ProtocolKind) -> i32 {
        let profile = protocol.profile();
        let mut score = i32::from(profile.reliability) / 2;
        score += (40 - profile.nominal_latency_ms as i32 / 5).max(0);
        score += (context.network.signal_for(profile.medium) * 20.0).round() as i32;
        if context.device.capabilities.battery_powered {
            score -= i32::from(profile.power_cost) * 2;
        }
        if let Some(rate) = context.history.success_rate(Some(protocol)) {
            score += ((rate - 0.5) * 20.0).round() as i32;
        }
        score
    }
}

impl ConnectionStrategy for AutomaticStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn evaluate(&self, context: &CommunicationContext) -> StrategyEvaluation {
        let reachable = context.reachable_protocols();
        if reachable.is_empty() {
            return StrategyEvaluation::inapplicable(
                Self::NAME,
                "no supported protocol is reachable",
            );
        }
        let mut score = 60;
        let mut reasons = vec![format!("{} reachable protocol(s)", reachable.len())];
        if context.preferences.priority == PriorityFactor::Balanced {
            score += 10;
            reasons.push("balanced priority".to_string());
        }
        if reachable.len() > 1 {
            score += 5;
        }
        if context.history.success_rate(None).is_some_and(|r| r >= 0.8) {
            score += 5;
            reasons.push("recent connections succeeded".to_string());
        }
        let top = rank_protocols(context, |p| Reverse(Self::protocol_score(context, p)))
            .first()
            .copied();
        evaluation(Self::NAME, score, reasons, top, context)
    }

    fn select_protocol(
        &self,
        context: &CommunicationContext,
        defaults: &ProtocolDefaults,
    ) -> Result<ProtocolSelection, StrategyError> {
        let ranked = rank_protocols(context, |p| Reverse(Self::protocol_score(context, p)));
        let reason = match ranked.first() {
            Some(p) => format!(
                "{} scored highest ({})",
                p,
                Self::protocol_score(context, *p)
            ),
            None => String::new(),
        };
        selection_from(Self::NAME, ranked, reason, context, defaults)
    }
}

/// Prefers mesh and retained-session protocols.
#[derive(Debug, Default)]
pub struct ReliabilityFirstStrategy;

impl ReliabilityFirstStrategy {
    pub const NAME: &'static str = "reliability_first";
    const PREFERRED: [ProtocolKind; 2] = [ProtocolKind::Matter, ProtocolKind::Mqtt];
}

impl ConnectionStrategy for ReliabilityFirstStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn evaluate(&self, context: &CommunicationContext) -> StrategyEvaluation {
        let device = &context.device;
        if !Self::PREFERRED.iter().any(|p| device.supports(*p)) {
            return StrategyEvaluation::inapplicable(
                Self::NAME,
                "device supports neither matter nor mqtt",
            );
        }
        let mut score = 50;
        let mut reasons = Vec::new();
        if context.preferences.priority == PriorityFactor::Reliability {
            score += 35;
            reasons.push("reliability priority".to_string());
        }
        if device.supports(ProtocolKind::Matter) {
            score += 10;
            reasons.push("matter mesh available".to_string());
        }
        let top = rank_protocols(context, rank_key_reliability).first().copied();
        evaluation(Self::NAME, score, reasons, top, context)
    }

    fn select_protocol(
        &self,
        context: &CommunicationContext,
        defaults: &ProtocolDefaults,
    ) -> Result<ProtocolSelection, StrategyError> {
        let ranked = rank_protocols(context, rank_key_reliability);
        let reason = "most reliable session semantics".to_string();
        selection_from(Self::NAME, ranked, reason, context, defaults)
    }
}

fn rank_key_reliability(p: ProtocolKind) -> (usize, Reverse<u8>) {
    (
        position(&ReliabilityFirstStrategy::PREFERRED, p),
        Reverse(p.profile().reliability),
    )
}

/// Prefers low-latency duplex transports.
#[derive(Debug, Default)]
pub struct SpeedFirstStrategy;

impl SpeedFirstStrategy {
    pub const NAME: &'static str = "speed_first";
    const PREFERRED: [ProtocolKind; 3] =
        [ProtocolKind::WebSocket, ProtocolKind::Http, ProtocolKind::Mqtt];

    fn is_fast(protocol: ProtocolKind) -> bool {
        let profile = protocol.profile();
        profile.duplex || profile.nominal_latency_ms <= LOW_LATENCY_MS
    }
}

fn rank_key_speed(p: ProtocolKind) -> (usize, u32) {
    (
        position(&SpeedFirstStrategy::PREFERRED, p),
        p.profile().nominal_latency_ms,
    )
}

impl ConnectionStrategy for SpeedFirstStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn evaluate(&self, context: &CommunicationContext) -> StrategyEvaluation {
        let device = &context.device;
        if !ProtocolKind::ALL
            .iter()
            .any(|p| device.supports(*p) && Self::is_fast(*p))
        {
            return StrategyEvaluation::inapplicable(
                Self::NAME,
                "no duplex or low-latency protocol supported",
            );
        }
        let mut score = 45;
        let mut reasons = Vec::new();
        if context.preferences.priority == PriorityFactor::Speed {
            score += 35;
            reasons.push("speed priority".to_string());
        }
        if device.supports(ProtocolKind::WebSocket)
            && context.network.is_available(NetworkMedium::Wifi)
        {
            score += 10;
            reasons.push("websocket over wifi".to_string());
        }
        if device.capabilities.battery_powered && context.preferences.power_saving_requested() {
            score -= 20;
            reasons.push("power saving requested on a battery device".to_string());
        }
        let top = rank_protocols(context, rank_key_speed).first().copied();
        evaluation(Self::NAME, score, reasons, top, context)
    }

    fn select_protocol(
        &self,
        context: &CommunicationContext,
        defaults: &ProtocolDefaults,
    ) -> Result<ProtocolSelection, StrategyError> {
        let ranked = rank_protocols(context, rank_key_speed);
        let reason = "lowest latency transport".to_string();
        selection_from(Self::NAME, ranked, reason, context, defaults)
    }
}

/// Prefers BLE, then whatever costs the device the least power.
#[derive(Debug, Default)]
pub struct PowerSavingStrategy;

impl PowerSavingStrategy {
    pub const NAME: &'static str = "power_saving";
}

fn rank_key_power(p: ProtocolKind) -> (bool, u8) {
    (p != ProtocolKind::Ble, p.profile().power_cost)
}

impl ConnectionStrategy for PowerSavingStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn evaluate(&self, context: &CommunicationContext) -> StrategyEvaluation {
        let battery = context.device.capabilities.battery_powered;
        let requested = context.preferences.power_saving_requested();
        if !battery && !requested {
            return StrategyEvaluation::inapplicable(
                Self::NAME,
                "mains-powered device without a power saving request",
            );
        }
        let mut score = 30;
        let mut reasons = Vec::new();
        if battery {
            score += 35;
            reasons.push("battery powered".to_string());
        }
        if requested {
            score += 25;
            reasons.push("power saving requested".to_string());
        }
        if context.device.supports(ProtocolKind::Ble)
            && context.network.is_available(NetworkMedium::Bluetooth)
        {
            score += 10;
            reasons.push("ble reachable".to_string());
        }
        let top = rank_protocols(context, rank_key_power).first().copied();
        evaluation(Self::NAME, score, reasons, top, context)
    }

    fn select_protocol(
        &self,
        context: &CommunicationContext,
        defaults: &ProtocolDefaults,
    ) -> Result<ProtocolSelection, StrategyError> {
        let ranked = rank_protocols(context, rank_key_power);
        let reason = "lowest power cost".to_string();
        selection_from(Self::NAME, ranked, reason, context, defaults)
    }
}

/// Only ever uses one protocol. Devices without it are a hard miss.
#[derive(Debug)]
pub struct ProtocolExclusiveStrategy {
    protocol: ProtocolKind,
    name: String,
}

impl ProtocolExclusiveStrategy {
    pub fn new(protocol: ProtocolKind) -> Self {
        Self {
            protocol,
            name: format!("exclusive:{}", protocol),
        }
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.protocol
    }
}

impl ConnectionStrategy for ProtocolExclusiveStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, context: &CommunicationContext) -> StrategyEvaluation {
        if !context.device.supports(self.protocol) {
            return StrategyEvaluation::inapplicable(
                self.name.clone(),
                format!("device does not support {}", self.protocol),
            );
        }
        let mut score = 70;
        let mut reasons = vec![format!("device supports {}", self.protocol)];
        if context.network.supports_protocol(self.protocol) {
            score += 15;
            reasons.push(format!("{} medium available", self.protocol));
        }
        evaluation(&self.name, score, reasons, Some(self.protocol), context)
    }

    fn select_protocol(
        &self,
        context: &CommunicationContext,
        defaults: &ProtocolDefaults,
    ) -> Result<ProtocolSelection, StrategyError> {
        if !context.device.supports(self.protocol) {
            return Err(StrategyError::NotApplicable {
                strategy: self.name.clone(),
                reason: format!("device does not support {}", self.protocol),
            });
        }
        let reason = format!("pinned to {}", self.protocol);
        selection_from(&self.name, vec![self.protocol], reason, context, defaults)
    }
}

/// Prefers authenticated, encrypted sessions.
#[derive(Debug, Default)]
pub struct SecurityFirstStrategy;

impl SecurityFirstStrategy {
    pub const NAME: &'static str = "security_first";
    const PREFERRED: [ProtocolKind; 3] =
        [ProtocolKind::Matter, ProtocolKind::Cloud, ProtocolKind::Mqtt];
}

fn rank_key_security(p: ProtocolKind) -> usize {
    position(&SecurityFirstStrategy::PREFERRED, p)
}

impl ConnectionStrategy for SecurityFirstStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn evaluate(&self, context: &CommunicationContext) -> StrategyEvaluation {
        let prefs = &context.preferences;
        let security_priority = prefs.priority == PriorityFactor::Security;
        if prefs.security_level < SecurityLevel::High && !security_priority {
            return StrategyEvaluation::inapplicable(
                Self::NAME,
                "standard security requested",
            );
        }
        let mut score = 40;
        let mut reasons = vec![format!("security level {:?}", prefs.security_level)];
        if security_priority {
            score += 40;
            reasons.push("security priority".to_string());
        }
        if prefs.security_level == SecurityLevel::Critical {
            score += 10;
        }
        let top = rank_protocols(context, rank_key_security).first().copied();
        evaluation(Self::NAME, score, reasons, top, context)
    }

    fn select_protocol(
        &self,
        context: &CommunicationContext,
        defaults: &ProtocolDefaults,
    ) -> Result<ProtocolSelection, StrategyError> {
        let ranked = rank_protocols(context, rank_key_security);
        let reason = match ranked.first() {
            Some(ProtocolKind::Matter) => "matter CASE session".to_string(),
            Some(ProtocolKind::Cloud) => "cloud TLS session".to_string(),
            Some(ProtocolKind::Mqtt) => "mqtt over TLS".to_string(),
            _ => "no secure transport supported".to_string(),
        };
        selection_from(Self::NAME, ranked, reason, context, defaults)
    }
}
