//! Strategy catalog and selection.

use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;

use super::learner::{PatternLearner, Recommendation};
use super::types::{
    ActionKind, ExecutionMode, HealthClass, RecoveryAction, RecoveryContext, RecoveryStrategy,
    StrategyConditions, StrategyStats, TriggerKind,
};
use crate::component::ComponentRegistry;

/// Success-rate gap within which strategies count as equally reliable.
const SUCCESS_RATE_BAND: f64 = 0.1;
/// Average-time gap that breaks a success-rate tie.
const TIME_GAP_MS: f64 = 1000.0;

/// The built-in strategies, seeded with prior statistics.
pub fn default_strategies() -> Vec<RecoveryStrategy> {
    use ActionKind::*;

    let not_failed = StrategyConditions {
        target_states: vec![HealthClass::Healthy, HealthClass::Degraded],
        ..Default::default()
    };

    vec![
        RecoveryStrategy::new(
            "component_restart",
            &[TriggerKind::ComponentFailure, TriggerKind::Manual],
            vec![
                RecoveryAction::new(Restart),
                RecoveryAction::new(ValidateData).non_critical(),
            ],
        )
        .described("Restart the component and check its data")
        .with_rollback()
        .with_stats(StrategyStats::seeded(0.85, 5_000.0)),
        RecoveryStrategy::new(
            "connection_reset",
            &[TriggerKind::NetworkIssues],
            vec![
                RecoveryAction::new(ResetConnections),
                RecoveryAction::new(ResetCircuitBreaker).non_critical(),
            ],
        )
        .described("Drop and re-establish connections")
        .with_stats(StrategyStats::seeded(0.8, 2_000.0)),
        RecoveryStrategy::new(
            "memory_relief",
            &[TriggerKind::MemoryPressure, TriggerKind::ResourceExhaustion],
            vec![
                RecoveryAction::new(ClearCache).in_group(0),
                RecoveryAction::new(ForceGc).non_critical().in_group(0),
                RecoveryAction::new(IncreaseResources).non_critical().in_group(1),
            ],
        )
        .described("Release memory, then rebalance resources")
        .with_mode(ExecutionMode::ParallelGroups)
        .with_conditions(StrategyConditions {
            triggers: vec![TriggerKind::MemoryPressure, TriggerKind::ResourceExhaustion],
            ..not_failed.clone()
        })
        .with_stats(StrategyStats::seeded(0.75, 3_000.0)),
        RecoveryStrategy::new(
            "performance_tuning",
            &[TriggerKind::PerformanceDegradation],
            vec![
                RecoveryAction::new(ClearCache).non_critical(),
                RecoveryAction::new(IncreaseResources).non_critical(),
                RecoveryAction::new(ResetCircuitBreaker).non_critical(),
            ],
        )
        .described("Apply every tuning action at once")
        .with_mode(ExecutionMode::FullParallel)
        .with_stats(StrategyStats::seeded(0.7, 4_000.0)),
        RecoveryStrategy::new(
            "data_repair",
            &[TriggerKind::DataCorruption],
            vec![
                RecoveryAction::new(RepairCorruption),
                RecoveryAction::new(ValidateData),
            ],
        )
        .described("Repair corrupted data in place")
        .with_rollback()
        .validating_each()
        .with_stats(StrategyStats::seeded(0.8, 30_000.0)),
        RecoveryStrategy::new(
            "data_restore",
            &[TriggerKind::DataCorruption, TriggerKind::Scheduled],
            vec![
                RecoveryAction::new(RestoreBackup),
                RecoveryAction::new(ValidateData),
            ],
        )
        .described("Restore the latest verified backup")
        .validating_each()
        .with_stats(StrategyStats::seeded(0.9, 60_000.0)),
        RecoveryStrategy::new(
            "dependency_cascade",
            &[TriggerKind::DependencyFailure],
            vec![
                RecoveryAction::new(RestartDependencies),
                RecoveryAction::new(Restart),
            ],
        )
        .described("Restart dependencies, then the component")
        .with_rollback()
        .with_stats(StrategyStats::seeded(0.7, 15_000.0)),
        RecoveryStrategy::new(
            "emergency_shutdown",
            &[TriggerKind::ResourceExhaustion],
            vec![RecoveryAction::new(EmergencyShutdown)],
        )
        .described("Stop a failed component before it takes others down")
        .with_conditions(StrategyConditions {
            triggers: vec![TriggerKind::ResourceExhaustion],
            target_states: vec![HealthClass::Failed],
            ..Default::default()
        })
        .with_stats(StrategyStats::seeded(0.6, 1_000.0)),
    ]
}

/// Whether `strategy` may run for `ctx` given what is registered.
pub fn is_applicable(
    strategy: &RecoveryStrategy,
    ctx: &RecoveryContext,
    is_registered: impl Fn(&str) -> bool,
) -> bool {
    let c = &strategy.conditions;
    let state = &ctx.system_state;

    if !c.triggers.contains(&ctx.trigger) {
        return false;
    }
    let states_match = c.required_states.iter().all(|(name, required)| {
        state.health_of(name).unwrap_or(HealthClass::Healthy) == *required
    });
    if !states_match {
        return false;
    }
    if !c.target_states.is_empty() && !c.target_states.contains(&ctx.target_health()) {
        return false;
    }
    if let Some(min) = c.min_available_memory_percent {
        if 100.0 - state.memory_percent < min {
            return false;
        }
    }
    if let Some(max) = c.max_cpu_percent {
        if state.cpu_percent > max {
            return false;
        }
    }
    c.required_components.iter().all(|name| is_registered(name))
}

/// Ordering of two candidates, best first.
///
/// Success rate decides unless the rates are within 0.1 of each other; then a
/// gap of more than a second in average time decides; otherwise the strategy
/// with more executions wins.
pub fn rank(a: &RecoveryStrategy, b: &RecoveryStrategy) -> Ordering {
    let (sa, sb) = (&a.stats, &b.stats);
    if (sa.success_rate - sb.success_rate).abs() > SUCCESS_RATE_BAND {
        return sb
            .success_rate
            .partial_cmp(&sa.success_rate)
            .unwrap_or(Ordering::Equal);
    }
    if (sa.avg_execution_ms - sb.avg_execution_ms).abs() > TIME_GAP_MS {
        return sa
            .avg_execution_ms
            .partial_cmp(&sb.avg_execution_ms)
            .unwrap_or(Ordering::Equal);
    }
    sb.total_executions.cmp(&sa.total_executions)
}

/// Where a selected strategy came from.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectionSource {
    Pattern(Recommendation),
    Catalog { candidates: usize },
    Explicit,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub strategy: RecoveryStrategy,
    pub source: SelectionSource,
}

/// Named set of strategies. Statistics are updated after every execution.
pub struct StrategyCatalog {
    strategies: RwLock<HashMap<String, RecoveryStrategy>>,
}

impl Default for StrategyCatalog {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl StrategyCatalog {
    pub fn empty() -> Self {
        Self {
            strategies: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        let catalog = Self::empty();
        for strategy in default_strategies() {
            catalog.insert(strategy);
        }
        catalog
    }

    /// Add or replace a strategy by id.
    pub fn insert(&self, strategy: RecoveryStrategy) -> Option<RecoveryStrategy> {
        self.strategies.write().insert(strategy.id.clone(), strategy)
    }

    pub fn remove(&self, id: &str) -> Option<RecoveryStrategy> {
        self.strategies.write().remove(id)
    }

    pub fn get(&self, id: &str) -> Option<RecoveryStrategy> {
        self.strategies.read().get(id).cloned()
    }

    pub fn list(&self) -> Vec<RecoveryStrategy> {
        let mut all: Vec<RecoveryStrategy> = self.strategies.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn len(&self) -> usize {
        self.strategies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.read().is_empty()
    }

    /// Fold one execution into the strategy's running statistics.
    pub fn record_outcome(&self, id: &str, success: bool, elapsed_ms: u64) {
        if let Some(strategy) = self.strategies.write().get_mut(id) {
            strategy.stats.record(success, elapsed_ms as f64);
        }
    }

    /// Best applicable catalog strategy for `ctx`.
    pub fn best_for(&self, ctx: &RecoveryContext, registry: &ComponentRegistry) -> Option<(RecoveryStrategy, usize)> {
        let mut candidates: Vec<RecoveryStrategy> = self
            .strategies
            .read()
            .values()
            .filter(|s| is_applicable(s, ctx, |name| registry.contains(name)))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        let count = candidates.len();

        // `rank` is not a total order, so pick the winner pairwise.
        let best = candidates.into_iter().reduce(|best, candidate| {
            if rank(&candidate, &best) == Ordering::Less {
                candidate
            } else {
                best
            }
        })?;
        Some((best, count))
    }

    /// Choose a strategy: a confident learned pattern first, else the best
    /// applicable catalog entry.
    pub fn select(
        &self,
        ctx: &RecoveryContext,
        registry: &ComponentRegistry,
        learner: Option<&PatternLearner>,
    ) -> Option<Selection> {
        if let Some(rec) = learner.and_then(|l| l.recommend(ctx)) {
            if let Some(strategy) = self.get(&rec.strategy_id) {
                debug!(
                    attempt_id = %ctx.id,
                    strategy = %strategy.id,
                    pattern = %rec.pattern_id,
                    "Selected strategy from learned pattern"
                );
                return Some(Selection {
                    strategy,
                    source: SelectionSource::Pattern(rec),
                });
            }
            debug!(strategy = %rec.strategy_id, "Learned strategy no longer in catalog");
        }

        let (strategy, candidates) = self.best_for(ctx, registry)?;
        debug!(
            attempt_id = %ctx.id,
            strategy = %strategy.id,
            candidates,
            "Selected strategy from catalog"
        );
        Some(Selection {
            strategy,
            source: SelectionSource::Catalog { candidates },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PatternLearningConfig;
    use crate::recovery::types::{Constraints, FailureDetails, Severity, SystemState};
    use chrono::Utc;

    fn ctx(trigger: TriggerKind, health: HealthClass) -> RecoveryContext {
        let mut state = SystemState::fallback();
        state.component_health.insert("db".into(), health);
        RecoveryContext {
            id: "a1".into(),
            timestamp: Utc::now(),
            trigger,
            component: "db".into(),
            failure: FailureDetails {
                error: "boom".into(),
                error_class: "generic".into(),
                severity: Severity::High,
                occurrences: 1,
            },
            system_state: state,
            constraints: Constraints {
                max_duration_ms: 1000,
                allowed_actions: None,
                preserve_data: false,
            },
        }
    }

    fn strategy(id: &str, rate: f64, ms: f64, executions: u64) -> RecoveryStrategy {
        let mut stats = StrategyStats::seeded(rate, ms);
        stats.total_executions = executions;
        RecoveryStrategy::new(
            id,
            &[TriggerKind::ComponentFailure],
            vec![RecoveryAction::new(ActionKind::Restart)],
        )
        .with_stats(stats)
    }

    fn catalog_of(strategies: Vec<RecoveryStrategy>) -> StrategyCatalog {
        let catalog = StrategyCatalog::empty();
        for s in strategies {
            catalog.insert(s);
        }
        catalog
    }

    #[test]
    fn test_faster_strategy_wins_within_success_band() {
        // 0.05 apart: within the band, and 4s apart in average time.
        let catalog = catalog_of(vec![
            strategy("a", 0.9, 5_000.0, 50),
            strategy("b", 0.85, 1_000.0, 10),
        ]);
        let (best, n) = catalog
            .best_for(&ctx(TriggerKind::ComponentFailure, HealthClass::Failed), &ComponentRegistry::new())
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(best.id, "b");
    }

    #[test]
    fn test_success_rate_beyond_band_dominates() {
        let catalog = catalog_of(vec![
            strategy("reliable", 0.95, 9_000.0, 5),
            strategy("quick", 0.7, 500.0, 100),
        ]);
        let (best, _) = catalog
            .best_for(&ctx(TriggerKind::ComponentFailure, HealthClass::Failed), &ComponentRegistry::new())
            .unwrap();
        assert_eq!(best.id, "reliable");
    }

    #[test]
    fn test_executions_break_remaining_ties() {
        let catalog = catalog_of(vec![
            strategy("new", 0.8, 2_000.0, 3),
            strategy("proven", 0.85, 2_500.0, 40),
        ]);
        let (best, _) = catalog
            .best_for(&ctx(TriggerKind::ComponentFailure, HealthClass::Failed), &ComponentRegistry::new())
            .unwrap();
        assert_eq!(best.id, "proven");
    }

    #[test]
    fn test_conditions_filter_candidates() {
        let mut needs_cache = strategy("needs_cache", 0.99, 100.0, 0);
        needs_cache.conditions.required_components = vec!["cache".into()];
        let mut low_mem = strategy("low_mem", 0.99, 100.0, 0);
        low_mem.conditions.min_available_memory_percent = Some(80.0);
        let mut only_degraded = strategy("only_degraded", 0.99, 100.0, 0);
        only_degraded.conditions.target_states = vec![HealthClass::Degraded];
        let fallback = strategy("fallback", 0.1, 100.0, 0);
        let catalog = catalog_of(vec![needs_cache, low_mem, only_degraded, fallback]);

        let (best, n) = catalog
            .best_for(&ctx(TriggerKind::ComponentFailure, HealthClass::Failed), &ComponentRegistry::new())
            .unwrap();
        assert_eq!((best.id.as_str(), n), ("fallback", 1));
        assert!(catalog
            .best_for(&ctx(TriggerKind::NetworkIssues, HealthClass::Failed), &ComponentRegistry::new())
            .is_none());
    }

    #[test]
    fn test_default_catalog_routing() {
        let catalog = StrategyCatalog::with_defaults();
        let registry = ComponentRegistry::new();
        let pick = |t, h| catalog.best_for(&ctx(t, h), &registry).map(|(s, _)| s.id);
        assert_eq!(catalog.len(), 8);
        assert_eq!(
            pick(TriggerKind::ComponentFailure, HealthClass::Failed).as_deref(),
            Some("component_restart")
        );
        assert_eq!(
            pick(TriggerKind::ResourceExhaustion, HealthClass::Failed).as_deref(),
            Some("emergency_shutdown")
        );
        assert_eq!(
            pick(TriggerKind::ResourceExhaustion, HealthClass::Degraded).as_deref(),
            Some("memory_relief")
        );
        assert_eq!(
            pick(TriggerKind::DataCorruption, HealthClass::Healthy).as_deref(),
            Some("data_repair")
        );
    }

    #[test]
    fn test_confident_pattern_overrides_catalog() {
        let catalog = StrategyCatalog::with_defaults();
        let registry = ComponentRegistry::new();
        let learner = PatternLearner::new(PatternLearningConfig::default());
        let c = ctx(TriggerKind::DataCorruption, HealthClass::Healthy);
        for _ in 0..3 {
            learner.record(&c, "data_restore", true, 100);
        }
        let selection = catalog.select(&c, &registry, Some(&learner)).unwrap();
        assert_eq!(selection.strategy.id, "data_restore");
        assert!(matches!(selection.source, SelectionSource::Pattern(_)));

        let selection = catalog.select(&c, &registry, None).unwrap();
        assert_eq!(selection.strategy.id, "data_repair");
    }

    #[test]
    fn test_record_outcome_updates_stats() {
        let catalog = StrategyCatalog::with_defaults();
        catalog.record_outcome("connection_reset", false, 4_000);
        let s = catalog.get("connection_reset").unwrap();
        assert_eq!(s.stats.total_executions, 1);
        assert_eq!(s.stats.success_rate, 0.0);
        assert!(s.stats.last_used.is_some());
    }
}
