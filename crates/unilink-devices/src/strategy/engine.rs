//! Strategy registry and selection.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use unilink_core::config::ProtocolDefaults;
use unilink_core::context::CommunicationContext;
use unilink_core::protocol::ProtocolKind;

use super::builtin::{
    AutomaticStrategy, PowerSavingStrategy, ProtocolExclusiveStrategy, ReliabilityFirstStrategy,
    SecurityFirstStrategy, SpeedFirstStrategy,
};
use super::{ConnectionStrategy, ProtocolSelection, StrategyError, StrategyEvaluation};

/// Ordered set of strategies plus the protocol defaults they build configs from.
///
/// Registration order is the tie-break order: when two strategies score the
/// same, the one registered first wins.
pub struct StrategyEngine {
    strategies: RwLock<Vec<Arc<dyn ConnectionStrategy>>>,
    defaults: ProtocolDefaults,
}

impl StrategyEngine {
    /// Engine with no strategies registered.
    pub fn new(defaults: ProtocolDefaults) -> Self {
        Self {
            strategies: RwLock::new(Vec::new()),
            defaults,
        }
    }

    /// Engine with the built-in strategies.
    pub fn with_default_strategies(defaults: ProtocolDefaults) -> Self {
        let engine = Self::new(defaults);
        engine.register(Arc::new(AutomaticStrategy));
        engine.register(Arc::new(ReliabilityFirstStrategy));
        engine.register(Arc::new(SpeedFirstStrategy));
        engine.register(Arc::new(PowerSavingStrategy));
        engine.register(Arc::new(SecurityFirstStrategy));
        engine
    }

    /// Engine that only ever picks `protocol`.
    pub fn exclusive(protocol: ProtocolKind, defaults: ProtocolDefaults) -> Self {
        let engine = Self::new(defaults);
        engine.register(Arc::new(ProtocolExclusiveStrategy::new(protocol)));
        engine
    }

    /// Add a strategy; a strategy with the same name is replaced in place.
    pub fn register(&self, strategy: Arc<dyn ConnectionStrategy>) {
        let mut strategies = self.strategies.write();
        match strategies.iter().position(|s| s.name() == strategy.name()) {
            Some(idx) => strategies[idx] = strategy,
            None => strategies.push(strategy),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ConnectionStrategy>> {
        self.strategies
            .read()
            .iter()
            .find(|s| s.name() == name)
            .cloned()
    }

    pub fn strategy_names(&self) -> Vec<String> {
        self.strategies
            .read()
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    pub fn defaults(&self) -> &ProtocolDefaults {
        &self.defaults
    }

    /// Evaluate every strategy, in registration order.
    pub fn evaluate_all(&self, context: &CommunicationContext) -> Vec<StrategyEvaluation> {
        self.snapshot()
            .iter()
            .map(|s| s.evaluate(context))
            .collect()
    }

    /// Re-score one strategy.
    pub fn evaluate(
        &self,
        name: &str,
        context: &CommunicationContext,
    ) -> Result<StrategyEvaluation, StrategyError> {
        self.get(name)
            .map(|s| s.evaluate(context))
            .ok_or_else(|| StrategyError::UnknownStrategy(name.to_string()))
    }

    /// The applicable strategy with the strictly highest score.
    pub fn best_strategy(
        &self,
        context: &CommunicationContext,
    ) -> Option<(Arc<dyn ConnectionStrategy>, StrategyEvaluation)> {
        let mut best: Option<(Arc<dyn ConnectionStrategy>, StrategyEvaluation)> = None;
        for strategy in self.snapshot() {
            let eval = strategy.evaluate(context);
            if !eval.applicable {
                continue;
            }
            let better = best
                .as_ref()
                .map_or(true, |(_, b)| eval.suitability_score > b.suitability_score);
            if better {
                best = Some((strategy, eval));
            }
        }
        best
    }

    /// Pick the best strategy and let it select a protocol.
    pub fn select(
        &self,
        context: &CommunicationContext,
    ) -> Result<(StrategyEvaluation, ProtocolSelection), StrategyError> {
        let (strategy, eval) = self.best_strategy(context).ok_or_else(|| {
            StrategyError::NoApplicableStrategy(context.device.device_id.clone())
        })?;
        let selection = strategy.select_protocol(context, &self.defaults)?;
        debug!(
            device_id = %context.device.device_id,
            strategy = %eval.strategy,
            score = eval.suitability_score,
            protocol = %selection.protocol,
            "Strategy selected"
        );
        Ok((eval, selection))
    }

    /// Let a named strategy select a protocol.
    pub fn select_with(
        &self,
        name: &str,
        context: &CommunicationContext,
    ) -> Result<ProtocolSelection, StrategyError> {
        let strategy = self
            .get(name)
            .ok_or_else(|| StrategyError::UnknownStrategy(name.to_string()))?;
        strategy.select_protocol(context, &self.defaults)
    }

    fn snapshot(&self) -> Vec<Arc<dyn ConnectionStrategy>> {
        self.strategies.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unilink_core::device::DeviceDescriptor;

    #[test]
    fn test_default_registration_order() {
        let engine = StrategyEngine::with_default_strategies(ProtocolDefaults::default());
        assert_eq!(
            engine.strategy_names(),
            vec![
                "automatic",
                "reliability_first",
                "speed_first",
                "power_saving",
                "security_first"
            ]
        );
    }

    #[test]
    fn test_no_applicable_strategy() {
        let engine = StrategyEngine::exclusive(ProtocolKind::Ble, ProtocolDefaults::default());
        let ctx = CommunicationContext::new(
            DeviceDescriptor::new("bulb", "light").with_protocols([ProtocolKind::Matter]),
        );
        assert!(matches!(
            engine.select(&ctx),
            Err(StrategyError::NoApplicableStrategy(_))
        ));
    }

    #[test]
    fn test_register_replaces_by_name() {
        let engine = StrategyEngine::new(ProtocolDefaults::default());
        engine.register(Arc::new(AutomaticStrategy));
        engine.register(Arc::new(AutomaticStrategy));
        assert_eq!(engine.strategy_names().len(), 1);
        assert!(engine.evaluate("nope", &CommunicationContext::new(DeviceDescriptor::new("d", "x"))).is_err());
    }
}
