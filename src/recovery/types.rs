//! Recovery data model shared by the gate, selector, executor and learner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Actions
// ============================================================================

/// One remediation step kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Restart,
    ClearCache,
    ResetConnections,
    Rollback,
    RestoreBackup,
    IncreaseResources,
    RestartDependencies,
    ValidateData,
    RepairCorruption,
    ForceGc,
    ResetCircuitBreaker,
    EmergencyShutdown,
    Custom,
}

impl ActionKind {
    pub const ALL: [ActionKind; 13] = [
        Self::Restart,
        Self::ClearCache,
        Self::ResetConnections,
        Self::Rollback,
        Self::RestoreBackup,
        Self::IncreaseResources,
        Self::RestartDependencies,
        Self::ValidateData,
        Self::RepairCorruption,
        Self::ForceGc,
        Self::ResetCircuitBreaker,
        Self::EmergencyShutdown,
        Self::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::ClearCache => "clear_cache",
            Self::ResetConnections => "reset_connections",
            Self::Rollback => "rollback",
            Self::RestoreBackup => "restore_backup",
            Self::IncreaseResources => "increase_resources",
            Self::RestartDependencies => "restart_dependencies",
            Self::ValidateData => "validate_data",
            Self::RepairCorruption => "repair_corruption",
            Self::ForceGc => "force_gc",
            Self::ResetCircuitBreaker => "reset_circuit_breaker",
            Self::EmergencyShutdown => "emergency_shutdown",
            Self::Custom => "custom",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| format!("unknown action kind '{}'", s))
    }
}

/// Per-kind execution settings, resolved from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    pub enabled: bool,
    /// 1 (lowest) to 10 (highest); decides which action wins a conflict
    pub priority: u8,
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub prerequisites: Vec<ActionKind>,
    pub conflicts_with: Vec<ActionKind>,
    /// 1 (cheap) to 10 (expensive)
    pub resource_cost: u8,
}

impl ActionConfig {
    pub fn defaults_for(kind: ActionKind) -> Self {
        let (priority, timeout_secs, max_attempts, resource_cost) = match kind {
            ActionKind::Restart => (7, 30, 2, 5),
            ActionKind::ClearCache => (5, 10, 1, 2),
            ActionKind::ResetConnections => (6, 15, 2, 3),
            ActionKind::Rollback => (8, 60, 1, 6),
            ActionKind::RestoreBackup => (8, 120, 1, 7),
            ActionKind::IncreaseResources => (4, 10, 1, 8),
            ActionKind::RestartDependencies => (6, 60, 1, 7),
            ActionKind::ValidateData => (5, 30, 1, 3),
            ActionKind::RepairCorruption => (7, 120, 2, 6),
            ActionKind::ForceGc => (3, 5, 1, 1),
            ActionKind::ResetCircuitBreaker => (4, 5, 1, 1),
            ActionKind::EmergencyShutdown => (10, 30, 1, 10),
            ActionKind::Custom => (5, 30, 1, 5),
        };
        let conflicts_with = match kind {
            ActionKind::Restart => vec![ActionKind::EmergencyShutdown],
            ActionKind::EmergencyShutdown => vec![ActionKind::Restart],
            ActionKind::Rollback => vec![ActionKind::RestoreBackup],
            ActionKind::RestoreBackup => vec![ActionKind::Rollback],
            _ => Vec::new(),
        };
        Self {
            enabled: true,
            priority,
            timeout_ms: timeout_secs * 1000,
            max_attempts,
            prerequisites: Vec::new(),
            conflicts_with,
            resource_cost,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// An action as it appears inside a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAction {
    pub kind: ActionKind,
    /// Name of the registered handler for `custom` actions
    #[serde(default)]
    pub handler: Option<String>,
    /// A critical failure aborts the remaining actions of the attempt
    #[serde(default = "default_true")]
    pub critical: bool,
    /// Group index, only meaningful in `ParallelGroups` mode
    #[serde(default)]
    pub group: u32,
}

fn default_true() -> bool {
    true
}

impl RecoveryAction {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            handler: None,
            critical: true,
            group: 0,
        }
    }

    pub fn custom(handler: &str) -> Self {
        Self {
            handler: Some(handler.to_string()),
            ..Self::new(ActionKind::Custom)
        }
    }

    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }

    pub fn in_group(mut self, group: u32) -> Self {
        self.group = group;
        self
    }

    /// Display label: the handler name for custom actions, otherwise the kind.
    pub fn label(&self) -> &str {
        match (&self.kind, &self.handler) {
            (ActionKind::Custom, Some(name)) => name.as_str(),
            _ => self.kind.as_str(),
        }
    }
}

// ============================================================================
// Triggers
// ============================================================================

/// Classified cause of a recovery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    ComponentFailure,
    MemoryPressure,
    PerformanceDegradation,
    DataCorruption,
    NetworkIssues,
    DependencyFailure,
    ResourceExhaustion,
    Manual,
    Scheduled,
}

impl TriggerKind {
    pub const ALL: [TriggerKind; 9] = [
        Self::ComponentFailure,
        Self::MemoryPressure,
        Self::PerformanceDegradation,
        Self::DataCorruption,
        Self::NetworkIssues,
        Self::DependencyFailure,
        Self::ResourceExhaustion,
        Self::Manual,
        Self::Scheduled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ComponentFailure => "component_failure",
            Self::MemoryPressure => "memory_pressure",
            Self::PerformanceDegradation => "performance_degradation",
            Self::DataCorruption => "data_corruption",
            Self::NetworkIssues => "network_issues",
            Self::DependencyFailure => "dependency_failure",
            Self::ResourceExhaustion => "resource_exhaustion",
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| format!("unknown trigger kind '{}'", s))
    }
}

/// Per-trigger gate settings. Read-only at runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub enabled: bool,
    /// Trigger-specific threshold (consecutive failed probes, memory %, ...)
    pub threshold: f64,
    pub cooldown_ms: u64,
    pub max_triggers_per_hour: u32,
}

impl TriggerConfig {
    pub fn defaults_for(kind: TriggerKind) -> Self {
        let (threshold, cooldown_secs, max_triggers_per_hour) = match kind {
            TriggerKind::ComponentFailure => (1.0, 30, 10),
            TriggerKind::MemoryPressure => (85.0, 60, 6),
            TriggerKind::PerformanceDegradation => (2000.0, 120, 4),
            TriggerKind::DataCorruption => (1.0, 0, 5),
            TriggerKind::NetworkIssues => (3.0, 30, 10),
            TriggerKind::DependencyFailure => (1.0, 60, 6),
            TriggerKind::ResourceExhaustion => (90.0, 120, 3),
            TriggerKind::Manual => (0.0, 0, 100),
            TriggerKind::Scheduled => (0.0, 0, 24),
        };
        Self {
            enabled: true,
            threshold,
            cooldown_ms: cooldown_secs * 1000,
            max_triggers_per_hour,
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

// ============================================================================
// Context
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Severity of a failure report, escalated one level for repeat offenders.
    pub fn for_failure(trigger: TriggerKind, occurrences: u32) -> Self {
        let base = match trigger {
            TriggerKind::DataCorruption
            | TriggerKind::ResourceExhaustion
            | TriggerKind::ComponentFailure => Severity::High,
            TriggerKind::MemoryPressure
            | TriggerKind::DependencyFailure
            | TriggerKind::NetworkIssues => Severity::Medium,
            TriggerKind::PerformanceDegradation
            | TriggerKind::Manual
            | TriggerKind::Scheduled => Severity::Low,
        };
        if occurrences >= 5 {
            base.escalate()
        } else {
            base
        }
    }

    pub fn escalate(self) -> Self {
        match self {
            Severity::None => Severity::Low,
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High | Severity::Critical => Severity::Critical,
        }
    }
}

/// Coarse health classification of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthClass {
    Healthy,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetails {
    pub error: String,
    /// Keyword class of the error message, part of the pattern signature
    pub error_class: String,
    pub severity: Severity,
    pub occurrences: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    pub memory_percent: f64,
    pub cpu_percent: f64,
    pub component_health: HashMap<String, HealthClass>,
    pub captured_at: DateTime<Utc>,
}

impl SystemState {
    /// Substitute used when resource sampling fails.
    pub fn fallback() -> Self {
        Self {
            memory_percent: 50.0,
            cpu_percent: 50.0,
            component_health: HashMap::new(),
            captured_at: Utc::now(),
        }
    }

    pub fn health_of(&self, component: &str) -> Option<HealthClass> {
        self.component_health.get(component).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    pub max_duration_ms: u64,
    /// When set, only these action kinds may run
    pub allowed_actions: Option<Vec<ActionKind>>,
    pub preserve_data: bool,
}

impl Constraints {
    pub fn allows(&self, kind: ActionKind) -> bool {
        self.allowed_actions
            .as_ref()
            .map(|allowed| allowed.contains(&kind))
            .unwrap_or(true)
    }
}

/// Immutable snapshot taken once per recovery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryContext {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub trigger: TriggerKind,
    pub component: String,
    pub failure: FailureDetails,
    pub system_state: SystemState,
    pub constraints: Constraints,
}

impl RecoveryContext {
    /// Health of the target component; an unprobed component counts as healthy.
    pub fn target_health(&self) -> HealthClass {
        self.system_state
            .health_of(&self.component)
            .unwrap_or(HealthClass::Healthy)
    }
}

/// Keyword classification of an error message.
pub fn classify_error(message: &str) -> &'static str {
    let lower = message.to_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));

    if has(&["timeout", "timed out", "deadline"]) {
        "timeout"
    } else if has(&["out of memory", "oom", "memory", "alloc"]) {
        "memory"
    } else if has(&["corrupt", "checksum", "integrity"]) {
        "corruption"
    } else if has(&["connection", "connect", "network", "socket", "refused", "unreachable"]) {
        "network"
    } else if has(&["permission", "denied", "forbidden", "unauthorized"]) {
        "permission"
    } else if has(&["not found", "missing", "no such"]) {
        "missing"
    } else {
        "generic"
    }
}

// ============================================================================
// Strategies
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Sequential,
    ParallelGroups,
    FullParallel,
}

/// When a strategy may be chosen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyConditions {
    pub triggers: Vec<TriggerKind>,
    /// Health each named component must currently have
    #[serde(default)]
    pub required_states: HashMap<String, HealthClass>,
    /// Allowed health of the target component; empty means any
    #[serde(default)]
    pub target_states: Vec<HealthClass>,
    #[serde(default)]
    pub min_available_memory_percent: Option<f64>,
    #[serde(default)]
    pub max_cpu_percent: Option<f64>,
    /// Components that must be registered for the strategy to work
    #[serde(default)]
    pub required_components: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyStats {
    pub success_rate: f64,
    pub avg_execution_ms: f64,
    pub total_executions: u64,
    pub last_used: Option<DateTime<Utc>>,
}

impl StrategyStats {
    pub fn seeded(success_rate: f64, avg_execution_ms: f64) -> Self {
        Self {
            success_rate,
            avg_execution_ms,
            total_executions: 0,
            last_used: None,
        }
    }

    /// Running weighted-average update: `(old * n + new) / (n + 1)`.
    pub fn record(&mut self, success: bool, elapsed_ms: f64) {
        let n = self.total_executions as f64;
        let outcome = if success { 1.0 } else { 0.0 };
        self.success_rate = (self.success_rate * n + outcome) / (n + 1.0);
        self.avg_execution_ms = (self.avg_execution_ms * n + elapsed_ms) / (n + 1.0);
        self.total_executions += 1;
        self.last_used = Some(Utc::now());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStrategy {
    pub id: String,
    pub name: String,
    pub description: String,
    pub conditions: StrategyConditions,
    pub actions: Vec<RecoveryAction>,
    pub mode: ExecutionMode,
    pub rollback_on_failure: bool,
    pub validate_after_each: bool,
    #[serde(default)]
    pub stats: StrategyStats,
}

impl RecoveryStrategy {
    pub fn new(id: &str, triggers: &[TriggerKind], actions: Vec<RecoveryAction>) -> Self {
        Self {
            id: id.to_string(),
            name: id.replace('_', " "),
            description: String::new(),
            conditions: StrategyConditions {
                triggers: triggers.to_vec(),
                ..Default::default()
            },
            actions,
            mode: ExecutionMode::Sequential,
            rollback_on_failure: false,
            validate_after_each: false,
            stats: StrategyStats::default(),
        }
    }

    pub fn described(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_rollback(mut self) -> Self {
        self.rollback_on_failure = true;
        self
    }

    pub fn validating_each(mut self) -> Self {
        self.validate_after_each = true;
        self
    }

    pub fn with_stats(mut self, stats: StrategyStats) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_conditions(mut self, conditions: StrategyConditions) -> Self {
        self.conditions = conditions;
        self
    }
}

// ============================================================================
// Executions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Aborted,
}

/// Classification of why an attempt did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Rejected,
    NoApplicableStrategy,
    ActionTimeout,
    ActionFailed,
    PostActionValidationFailed,
    RecoveryValidationFailed,
    BackupCreationFailed,
    DeadlineExceeded,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub kind: ActionKind,
    pub label: String,
    pub critical: bool,
    pub status: ActionStatus,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

impl ActionRecord {
    pub fn pending(action: &RecoveryAction) -> Self {
        Self {
            kind: action.kind,
            label: action.label().to_string(),
            critical: action.critical,
            status: ActionStatus::Pending,
            attempts: 0,
            started_at: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn skip(&mut self, reason: impl Into<String>) {
        self.status = ActionStatus::Skipped;
        self.error = Some(reason.into());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub success: bool,
    pub recovery_time_ms: u64,
    pub actions_executed: u32,
    pub post_state: Option<SystemState>,
}

/// The record of one recovery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryExecution {
    pub id: String,
    pub strategy_id: Option<String>,
    pub context: RecoveryContext,
    pub actions: Vec<ActionRecord>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outcome: Option<RecoveryOutcome>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
    pub pre_recovery_backup: Option<String>,
    pub rolled_back: bool,
    pub forced: bool,
}

impl RecoveryExecution {
    pub fn new(id: String, context: RecoveryContext) -> Self {
        Self {
            id,
            strategy_id: None,
            context,
            actions: Vec::new(),
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            outcome: None,
            error: None,
            failure: None,
            pre_recovery_backup: None,
            rolled_back: false,
            forced: false,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Completed
            && self.outcome.as_ref().map(|o| o.success).unwrap_or(false)
    }

    pub fn elapsed_ms(&self) -> u64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }

    /// Close the record with a failure classification.
    pub fn fail(&mut self, status: ExecutionStatus, error: &crate::errors::RecoveryError) {
        self.status = status;
        self.failure = Some(error.failure_kind());
        self.error = Some(error.to_string());
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_kind_parse_accepts_dashes() {
        assert_eq!(
            "reset-circuit-breaker".parse::<ActionKind>().unwrap(),
            ActionKind::ResetCircuitBreaker
        );
        assert!("reboot".parse::<ActionKind>().is_err());
    }

    #[test]
    fn test_trigger_kind_round_trips_through_str() {
        for kind in TriggerKind::ALL {
            assert_eq!(kind.as_str().parse::<TriggerKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_default_conflicts_are_symmetric() {
        for kind in ActionKind::ALL {
            for other in ActionConfig::defaults_for(kind).conflicts_with {
                assert!(
                    ActionConfig::defaults_for(other).conflicts_with.contains(&kind),
                    "{} conflicts with {} but not vice versa",
                    kind,
                    other
                );
            }
        }
    }

    #[test]
    fn test_classify_error() {
        assert_eq!(classify_error("request timed out after 5s"), "timeout");
        assert_eq!(classify_error("Connection refused"), "network");
        assert_eq!(classify_error("checksum mismatch in segment 4"), "corruption");
        assert_eq!(classify_error("OOM killer invoked"), "memory");
        assert_eq!(classify_error("permission denied"), "permission");
        assert_eq!(classify_error("widget exploded"), "generic");
    }

    #[test]
    fn test_severity_escalates_on_repeats() {
        assert_eq!(
            Severity::for_failure(TriggerKind::NetworkIssues, 1),
            Severity::Medium
        );
        assert_eq!(
            Severity::for_failure(TriggerKind::NetworkIssues, 5),
            Severity::High
        );
        assert_eq!(
            Severity::for_failure(TriggerKind::ComponentFailure, 9),
            Severity::Critical
        );
    }

    #[test]
    fn test_stats_weighted_average() {
        let mut stats = StrategyStats::seeded(0.8, 1000.0);
        stats.record(true, 500.0);
        assert_eq!(stats.total_executions, 1);
        assert!((stats.success_rate - 1.0).abs() < f64::EPSILON);
        stats.record(false, 1500.0);
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
        assert!((stats.avg_execution_ms - 1000.0).abs() < f64::EPSILON);
        assert!(stats.last_used.is_some());
    }

    #[test]
    fn test_constraints_allow_list() {
        let constraints = Constraints {
            max_duration_ms: 1000,
            allowed_actions: Some(vec![ActionKind::Restart]),
            preserve_data: false,
        };
        assert!(constraints.allows(ActionKind::Restart));
        assert!(!constraints.allows(ActionKind::ClearCache));
    }

    #[test]
    fn test_custom_action_label() {
        let action = RecoveryAction::custom("drain_queue").non_critical();
        assert_eq!(action.label(), "drain_queue");
        assert!(!action.critical);
        assert_eq!(RecoveryAction::new(ActionKind::ForceGc).label(), "force_gc");
    }
}
