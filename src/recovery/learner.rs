//! Failure-signature patterns and their confidence scores.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use super::types::{HealthClass, RecoveryContext, TriggerKind};
use crate::config::PatternLearningConfig;
use crate::errors::RecoveryError;
use crate::persist;

pub const PATTERNS_FILE: &str = "patterns.json";

const INITIAL_CONFIDENCE: f64 = 0.5;

/// Outcomes of one strategy under one pattern.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub attempts: u64,
    pub successes: u64,
}

impl StrategyRecord {
    pub fn ratio(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f64 / self.attempts as f64
        }
    }
}

/// A learned association between a failure signature and a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPattern {
    /// `trigger:component:error_class`
    pub id: String,
    pub trigger: TriggerKind,
    pub component: String,
    pub error_class: String,
    pub occurrences: u64,
    pub success_rate: f64,
    pub avg_recovery_ms: f64,
    /// 0.0 to 1.0
    pub confidence: f64,
    pub recommended_strategy: Option<String>,
    /// Target health classes seen when this signature fired
    pub observed_health: Vec<HealthClass>,
    #[serde(default)]
    pub strategies: HashMap<String, StrategyRecord>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl RecoveryPattern {
    fn new(id: String, ctx: &RecoveryContext) -> Self {
        let now = Utc::now();
        Self {
            id,
            trigger: ctx.trigger,
            component: ctx.component.clone(),
            error_class: ctx.failure.error_class.clone(),
            occurrences: 0,
            success_rate: 0.0,
            avg_recovery_ms: 0.0,
            confidence: INITIAL_CONFIDENCE,
            recommended_strategy: None,
            observed_health: Vec::new(),
            strategies: HashMap::new(),
            first_seen: now,
            last_seen: now,
        }
    }

    /// Best strategy by success ratio, then attempts; needs one success.
    fn best_strategy(&self) -> Option<String> {
        self.strategies
            .iter()
            .filter(|(_, r)| r.successes > 0)
            .max_by(|(a_id, a), (b_id, b)| {
                a.ratio()
                    .partial_cmp(&b.ratio())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.attempts.cmp(&b.attempts))
                    .then(b_id.cmp(a_id))
            })
            .map(|(id, _)| id.clone())
    }
}

/// A pattern-backed strategy recommendation.
#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    pub pattern_id: String,
    pub strategy_id: String,
    pub confidence: f64,
}

#[derive(Debug, Default)]
pub struct LearnerStats {
    pub outcomes_recorded: AtomicU64,
    pub patterns_created: AtomicU64,
    pub recommendations: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnerSummary {
    pub outcomes_recorded: u64,
    pub patterns_created: u64,
    pub recommendations: u64,
    pub active_patterns: usize,
    pub confident_patterns: usize,
}

#[derive(Serialize, Deserialize)]
struct PatternFile {
    version: u32,
    patterns: Vec<RecoveryPattern>,
}

pub struct PatternLearner {
    config: PatternLearningConfig,
    patterns: RwLock<HashMap<String, RecoveryPattern>>,
    path: Option<PathBuf>,
    /// Serializes snapshot-and-write so an older snapshot never lands last.
    persist_lock: Mutex<()>,
    stats: LearnerStats,
}

impl PatternLearner {
    pub fn new(config: PatternLearningConfig) -> Self {
        Self {
            config,
            patterns: RwLock::new(HashMap::new()),
            path: None,
            persist_lock: Mutex::new(()),
            stats: LearnerStats::default(),
        }
    }

    /// Learner backed by `<root>/patterns.json`, loading what is already there.
    pub fn persistent(config: PatternLearningConfig, root: &Path) -> Result<Self, RecoveryError> {
        let path = root.join(PATTERNS_FILE);
        let loaded: Option<PatternFile> = persist::read_json(&path)
            .map_err(|e| RecoveryError::Persistence(format!("{}: {}", path.display(), e)))?;
        let patterns: HashMap<String, RecoveryPattern> = loaded
            .map(|f| f.patterns.into_iter().map(|p| (p.id.clone(), p)).collect())
            .unwrap_or_default();
        if !patterns.is_empty() {
            info!(count = patterns.len(), path = %path.display(), "Loaded learned patterns");
        }
        Ok(Self {
            config,
            patterns: RwLock::new(patterns),
            path: Some(path),
            persist_lock: Mutex::new(()),
            stats: LearnerStats::default(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn signature(ctx: &RecoveryContext) -> String {
        format!(
            "{}:{}:{}",
            ctx.trigger, ctx.component, ctx.failure.error_class
        )
    }

    /// The pattern for this context's signature, if the target's current
    /// health has been seen with it before.
    pub fn find_match(&self, ctx: &RecoveryContext) -> Option<RecoveryPattern> {
        let patterns = self.patterns.read();
        let pattern = patterns.get(&Self::signature(ctx))?;
        pattern
            .observed_health
            .contains(&ctx.target_health())
            .then(|| pattern.clone())
    }

    /// Strategy recommended by a matching pattern at or above the confidence threshold.
    pub fn recommend(&self, ctx: &RecoveryContext) -> Option<Recommendation> {
        if !self.config.enabled {
            return None;
        }
        let pattern = self.find_match(ctx)?;
        if pattern.confidence < self.config.confidence_threshold {
            return None;
        }
        let strategy_id = pattern.recommended_strategy?;
        self.stats.recommendations.fetch_add(1, Ordering::Relaxed);
        debug!(
            pattern = %pattern.id,
            strategy = %strategy_id,
            confidence = pattern.confidence,
            "Pattern recommends strategy"
        );
        Some(Recommendation {
            pattern_id: pattern.id,
            strategy_id,
            confidence: pattern.confidence,
        })
    }

    /// Fold one execution outcome into its pattern. Returns the updated
    /// pattern, or `None` when learning is disabled.
    pub fn record(
        &self,
        ctx: &RecoveryContext,
        strategy_id: &str,
        success: bool,
        recovery_ms: u64,
    ) -> Option<RecoveryPattern> {
        if !self.config.enabled {
            return None;
        }
        self.stats.outcomes_recorded.fetch_add(1, Ordering::Relaxed);

        let id = Self::signature(ctx);
        let rate = self.config.adaptation_rate;
        let updated = {
            let mut patterns = self.patterns.write();
            let pattern = patterns.entry(id.clone()).or_insert_with(|| {
                self.stats.patterns_created.fetch_add(1, Ordering::Relaxed);
                RecoveryPattern::new(id.clone(), ctx)
            });

            let n = pattern.occurrences as f64;
            let outcome = if success { 1.0 } else { 0.0 };
            pattern.success_rate = (pattern.success_rate * n + outcome) / (n + 1.0);
            pattern.avg_recovery_ms = (pattern.avg_recovery_ms * n + recovery_ms as f64) / (n + 1.0);
            pattern.occurrences += 1;
            pattern.confidence = adjust_confidence(pattern.confidence, success, rate);
            pattern.last_seen = Utc::now();

            let health = ctx.target_health();
            if !pattern.observed_health.contains(&health) {
                pattern.observed_health.push(health);
                pattern.observed_health.sort();
            }

            let record = pattern.strategies.entry(strategy_id.to_string()).or_default();
            record.attempts += 1;
            if success {
                record.successes += 1;
            }
            pattern.recommended_strategy = pattern.best_strategy();
            pattern.clone()
        };

        if updated.occurrences >= u64::from(self.config.min_occurrences) {
            if let Err(e) = self.persist() {
                warn!(error = %e, "Failed to persist learned patterns");
            }
        }
        Some(updated)
    }

    /// Write every pattern at or above the minimum occurrence count.
    pub fn persist(&self) -> Result<usize, RecoveryError> {
        let Some(path) = &self.path else {
            return Ok(0);
        };
        let _writing = self.persist_lock.lock();
        let min = u64::from(self.config.min_occurrences);
        let mut patterns: Vec<RecoveryPattern> = self
            .patterns
            .read()
            .values()
            .filter(|p| p.occurrences >= min)
            .cloned()
            .collect();
        if patterns.is_empty() {
            return Ok(0);
        }
        patterns.sort_by(|a, b| a.id.cmp(&b.id));
        let count = patterns.len();
        persist::write_json_atomic(
            path,
            &PatternFile {
                version: 1,
                patterns,
            },
        )
        .map_err(|e| RecoveryError::Persistence(format!("{}: {}", path.display(), e)))?;
        debug!(count, "Persisted learned patterns");
        Ok(count)
    }

    pub fn patterns(&self) -> Vec<RecoveryPattern> {
        let mut patterns: Vec<RecoveryPattern> = self.patterns.read().values().cloned().collect();
        patterns.sort_by(|a, b| a.id.cmp(&b.id));
        patterns
    }

    pub fn get(&self, id: &str) -> Option<RecoveryPattern> {
        self.patterns.read().get(id).cloned()
    }

    pub fn summary(&self) -> LearnerSummary {
        let patterns = self.patterns.read();
        LearnerSummary {
            outcomes_recorded: self.stats.outcomes_recorded.load(Ordering::Relaxed),
            patterns_created: self.stats.patterns_created.load(Ordering::Relaxed),
            recommendations: self.stats.recommendations.load(Ordering::Relaxed),
            active_patterns: patterns.len(),
            confident_patterns: patterns
                .values()
                .filter(|p| p.confidence >= self.config.confidence_threshold)
                .count(),
        }
    }

    pub fn clear(&self) {
        self.patterns.write().clear();
    }
}

/// Move `confidence` by `rate` toward 1.0 on success or 0.0 on failure.
pub fn adjust_confidence(confidence: f64, success: bool, rate: f64) -> f64 {
    let delta = if success { rate } else { -rate };
    (confidence + delta).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::types::{Constraints, FailureDetails, Severity, SystemState};

    fn ctx(component: &str, error_class: &str, health: HealthClass) -> RecoveryContext {
        let mut state = SystemState::fallback();
        state.component_health.insert(component.to_string(), health);
        RecoveryContext {
            id: "a".into(),
            timestamp: Utc::now(),
            trigger: TriggerKind::ComponentFailure,
            component: component.to_string(),
            failure: FailureDetails {
                error: "boom".into(),
                error_class: error_class.to_string(),
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

    fn learner() -> PatternLearner {
        PatternLearner::new(PatternLearningConfig::default())
    }

    #[test]
    fn test_confidence_converges_and_clamps() {
        let learner = learner();
        let c = ctx("db", "timeout", HealthClass::Failed);
        let mut last = INITIAL_CONFIDENCE;
        for _ in 0..10 {
            let p = learner.record(&c, "component_restart", true, 100).unwrap();
            assert!(p.confidence >= last && p.confidence <= 1.0);
            last = p.confidence;
        }
        assert!((last - 1.0).abs() < 1e-9);

        let c = ctx("db", "network", HealthClass::Failed);
        let mut last = INITIAL_CONFIDENCE;
        for _ in 0..10 {
            let p = learner.record(&c, "component_restart", false, 100).unwrap();
            assert!(p.confidence <= last && p.confidence >= 0.0);
            last = p.confidence;
        }
        assert_eq!(last, 0.0);
    }

    #[test]
    fn test_running_averages() {
        let learner = learner();
        let c = ctx("db", "timeout", HealthClass::Failed);
        learner.record(&c, "s", true, 100);
        let p = learner.record(&c, "s", false, 300).unwrap();
        assert_eq!(p.occurrences, 2);
        assert!((p.success_rate - 0.5).abs() < 1e-9);
        assert!((p.avg_recovery_ms - 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_recommendation_requires_threshold_and_health_match() {
        let learner = learner();
        let failed = ctx("db", "timeout", HealthClass::Failed);
        learner.record(&failed, "data_restore", true, 100);
        // 0.6 < 0.7 threshold
        assert!(learner.recommend(&failed).is_none());
        learner.record(&failed, "data_restore", true, 100);
        learner.record(&failed, "data_restore", true, 100);
        let rec = learner.recommend(&failed).unwrap();
        assert_eq!(rec.strategy_id, "data_restore");
        assert_eq!(rec.pattern_id, "component_failure:db:timeout");

        let degraded = ctx("db", "timeout", HealthClass::Degraded);
        assert!(learner.recommend(&degraded).is_none());
    }

    #[test]
    fn test_best_strategy_prefers_success_ratio() {
        let learner = learner();
        let c = ctx("db", "timeout", HealthClass::Failed);
        learner.record(&c, "a", false, 10);
        learner.record(&c, "b", true, 10);
        learner.record(&c, "a", true, 10);
        let p = learner.get("component_failure:db:timeout").unwrap();
        assert_eq!(p.recommended_strategy.as_deref(), Some("b"));
    }

    #[test]
    fn test_persists_only_frequent_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let config = PatternLearningConfig {
            min_occurrences: 2,
            ..Default::default()
        };
        let learner = PatternLearner::persistent(config.clone(), dir.path()).unwrap();
        let frequent = ctx("db", "timeout", HealthClass::Failed);
        let rare = ctx("cache", "memory", HealthClass::Degraded);
        learner.record(&rare, "s", true, 10);
        learner.record(&frequent, "s", true, 10);
        assert!(!dir.path().join(PATTERNS_FILE).exists());
        learner.record(&frequent, "s", true, 10);
        assert!(dir.path().join(PATTERNS_FILE).exists());

        let reloaded = PatternLearner::persistent(config, dir.path()).unwrap();
        let ids: Vec<String> = reloaded.patterns().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec!["component_failure:db:timeout".to_string()]);
    }

    #[test]
    fn test_concurrent_records_persist_latest_counts() {
        let dir = tempfile::tempdir().unwrap();
        let config = PatternLearningConfig {
            min_occurrences: 1,
            ..Default::default()
        };
        let learner = PatternLearner::persistent(config.clone(), dir.path()).unwrap();
        let contexts = [
            ctx("db", "timeout", HealthClass::Failed),
            ctx("cache", "memory", HealthClass::Degraded),
        ];
        std::thread::scope(|scope| {
            for i in 0..8 {
                let learner = &learner;
                let c = &contexts[i % 2];
                scope.spawn(move || {
                    for _ in 0..25 {
                        learner.record(c, "s", true, 10);
                    }
                });
            }
        });

        let reloaded = PatternLearner::persistent(config, dir.path()).unwrap();
        let on_disk: Vec<(String, u64)> = reloaded
            .patterns()
            .into_iter()
            .map(|p| (p.id, p.occurrences))
            .collect();
        assert_eq!(
            on_disk,
            vec![
                ("component_failure:cache:memory".to_string(), 100),
                ("component_failure:db:timeout".to_string(), 100),
            ]
        );
    }

    #[test]
    fn test_disabled_learner_records_nothing() {
        let learner = PatternLearner::new(PatternLearningConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(learner
            .record(&ctx("db", "timeout", HealthClass::Failed), "s", true, 1)
            .is_none());
        assert_eq!(learner.summary().active_patterns, 0);
    }
}
