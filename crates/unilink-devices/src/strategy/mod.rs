//! Connection strategies.
//!
//! A strategy scores its own fitness for a device context and, when chosen,
//! picks a concrete protocol plus configuration. Evaluation is a pure function
//! of the context so the communicator can re-run it as often as it likes.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use unilink_core::config::ProtocolDefaults;
use unilink_core::context::CommunicationContext;
use unilink_core::device::DeviceDescriptor;
use unilink_core::error::ConnectionError;
use unilink_core::protocol::ProtocolKind;
use unilink_core::protocol_config::ProtocolConfig;

mod builtin;
mod engine;

pub use builtin::{
    AutomaticStrategy, PowerSavingStrategy, ProtocolExclusiveStrategy, ReliabilityFirstStrategy,
    SecurityFirstStrategy, SpeedFirstStrategy,
};
pub use engine::StrategyEngine;

/// Strategy failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StrategyError {
    #[error("No applicable strategy for device {0}")]
    NoApplicableStrategy(String),

    #[error("Device {0} supports no protocol")]
    NoProtocol(String),

    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("Strategy {strategy} not applicable: {reason}")]
    NotApplicable { strategy: String, reason: String },
}

impl From<StrategyError> for ConnectionError {
    fn from(err: StrategyError) -> Self {
        match err {
            StrategyError::UnknownStrategy(name) => {
                ConnectionError::ConfigurationError(format!("unknown strategy {}", name))
            }
            other => ConnectionError::ResourceUnavailable(other.to_string()),
        }
    }
}

/// What a strategy expects the link to look like.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExpectedPerformance {
    pub protocol: ProtocolKind,
    pub latency_ms: u32,
    pub reliability: u8,
    pub power_cost: u8,
}

impl ExpectedPerformance {
    fn of(protocol: ProtocolKind) -> Self {
        let profile = protocol.profile();
        Self {
            protocol,
            latency_ms: profile.nominal_latency_ms,
            reliability: profile.reliability,
            power_cost: profile.power_cost,
        }
    }
}

/// A strategy's self-assessment for one context. Never cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyEvaluation {
    pub strategy: String,
    /// 0 to 100
    pub suitability_score: u8,
    pub applicable: bool,
    pub reasons: Vec<String>,
    pub expected_performance: Option<ExpectedPerformance>,
    pub risks: Vec<String>,
}

impl StrategyEvaluation {
    fn inapplicable(strategy: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            strategy: strategy.into(),
            suitability_score: 0,
            applicable: false,
            reasons: vec![reason.into()],
            expected_performance: None,
            risks: Vec::new(),
        }
    }
}

/// The protocol a strategy picked, with fallbacks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolSelection {
    pub strategy: String,
    pub protocol: ProtocolKind,
    /// Fallbacks in the order they should be tried
    pub alternatives: Vec<ProtocolKind>,
    pub reason: String,
    /// Configuration for `protocol`; `None` when no adapter exists for it
    pub config: Option<ProtocolConfig>,
    /// Configurations for the alternatives that have an adapter
    pub alternative_configs: HashMap<ProtocolKind, ProtocolConfig>,
    pub expected_connect_time: Duration,
}

impl ProtocolSelection {
    /// Protocols in attempt order with their configuration.
    pub fn attempts(&self) -> Vec<(ProtocolKind, Option<ProtocolConfig>)> {
        std::iter::once((self.protocol, self.config.clone()))
            .chain(
                self.alternatives
                    .iter()
                    .map(|p| (*p, self.alternative_configs.get(p).cloned())),
            )
            .collect()
    }
}

/// Policy that scores its own fitness and picks a protocol.
pub trait ConnectionStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(&self, context: &CommunicationContext) -> StrategyEvaluation;

    fn select_protocol(
        &self,
        context: &CommunicationContext,
        defaults: &ProtocolDefaults,
    ) -> Result<ProtocolSelection, StrategyError>;
}

/// Default configuration for `protocol`, filled in for `device`.
pub fn specialize(
    defaults: &ProtocolDefaults,
    protocol: ProtocolKind,
    device: &DeviceDescriptor,
) -> Option<ProtocolConfig> {
    let mut config = defaults.config_for(protocol)?;
    match &mut config {
        ProtocolConfig::Mqtt(c) if c.client_id.is_empty() => {
            c.client_id = format!("unilink-{}", device.device_id);
        }
        ProtocolConfig::Ble(c) if c.peripheral.is_empty() => {
            c.peripheral = device.device_id.clone();
        }
        ProtocolConfig::Cloud(c) if c.device_name.is_empty() => {
            c.device_name = device.device_id.clone();
        }
        _ => {}
    }
    Some(config)
}

/// Order the device's protocols by `key` (lower first), reachable ones ahead
/// of unreachable ones. Ties keep declaration order.
pub(crate) fn rank_protocols<K, F>(context: &CommunicationContext, key: F) -> Vec<ProtocolKind>
where
    K: Ord,
    F: Fn(ProtocolKind) -> K,
{
    let mut supported: Vec<ProtocolKind> = ProtocolKind::ALL
        .iter()
        .copied()
        .filter(|p| context.device.supports(*p))
        .collect();
    supported.sort_by_key(|p| (!context.network.supports_protocol(*p), key(*p)));
    supported
}

/// Build a selection from a ranked protocol list.
pub(crate) fn selection_from(
    strategy: &str,
    ranked: Vec<ProtocolKind>,
    reason: String,
    context: &CommunicationContext,
    defaults: &ProtocolDefaults,
) -> Result<ProtocolSelection, StrategyError> {
    let mut iter = ranked.into_iter();
    let protocol = iter
        .next()
        .ok_or_else(|| StrategyError::NoProtocol(context.device.device_id.clone()))?;
    let alternatives: Vec<ProtocolKind> = iter.collect();
    let alternative_configs = alternatives
        .iter()
        .filter_map(|p| specialize(defaults, *p, &context.device).map(|c| (*p, c)))
        .collect();
    Ok(ProtocolSelection {
        strategy: strategy.to_string(),
        protocol,
        alternatives,
        reason,
        config: specialize(defaults, protocol, &context.device),
        alternative_configs,
        expected_connect_time: Duration::from_millis(protocol.profile().expected_connect_ms),
    })
}

pub(crate) fn clamp_score(score: i32) -> u8 {
    score.clamp(0, 100) as u8
}
