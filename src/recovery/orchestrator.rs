//! Recovery orchestrator
//!
//! The public façade: admits failure reports through the capacity ceiling and
//! the trigger gate, snapshots context, selects and executes a strategy,
//! then feeds the outcome back into strategy statistics and the pattern
//! learner. Also owns the backup store, the monitoring loop and shutdown.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use super::catalog::{Selection, SelectionSource, StrategyCatalog};
use super::context::{ContextBuilder, FailureReport, ResourceSampler, SysinfoSampler};
use super::events::{EventBus, RecoveryEvent};
use super::executor::{cancel_remaining, RecoveryExecutor};
use super::learner::{LearnerSummary, PatternLearner, RecoveryPattern};
use super::monitor::{self, MonitorHandle, MonitorTick};
use super::types::{
    ActionRecord, Constraints, ExecutionStatus, HealthClass, RecoveryContext, RecoveryExecution,
    RecoveryStrategy, TriggerKind,
};
use super::gate::TriggerGate;
use crate::backup::encryption::KeySource;
use crate::backup::{
    BackupOptions, BackupStore, BlobStore, DataBackup, IntegrityReport, RecoveryPlan,
    RestoreOptions, ScanOptions, COMPONENT_STATE,
};
use crate::component::{Capability, Component, ComponentRegistry, CustomActionHandler};
use crate::config::ResilienceConfig;
use crate::errors::{BackupError, ComponentError, RecoveryError, ResilienceError};
use crate::observability::telemetry::{recovery_span, scrub};

/// Finished executions kept in memory.
pub const HISTORY_CAPACITY: usize = 1000;
const ALERT_WINDOW: usize = 20;
const ALERT_MIN_SAMPLES: usize = 5;

/// An attempt currently holding a capacity slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveRecovery {
    pub attempt_id: String,
    pub trigger: TriggerKind,
    pub component: String,
    pub strategy_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub forced: bool,
}

struct ActiveSlot {
    info: ActiveRecovery,
    cancel: watch::Sender<bool>,
    context: Option<RecoveryContext>,
    actions: Vec<ActionRecord>,
    recorded: Arc<AtomicBool>,
}

#[derive(Debug, Default)]
struct MetricsCounters {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejected_rate_limited: AtomicU64,
    rejected_capacity: AtomicU64,
    rejected_other: AtomicU64,
    total_recovery_ms: AtomicU64,
}

/// Point-in-time view of the engine counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryMetrics {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejected_rate_limited: u64,
    pub rejected_capacity: u64,
    pub rejected_other: u64,
    pub active: usize,
    pub avg_recovery_ms: f64,
}

impl RecoveryMetrics {
    pub fn success_rate(&self) -> f64 {
        let finished = self.successes + self.failures;
        if finished == 0 {
            0.0
        } else {
            self.successes as f64 / finished as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Attempts that were asked to cancel
    pub cancelled: usize,
    /// Attempts still running after the grace period, recorded as aborted
    pub forced: usize,
    pub patterns_persisted: usize,
}

/// Releases the capacity slot when the attempt ends, however it ends.
struct SlotGuard {
    inner: Arc<Inner>,
    id: String,
    cancel: watch::Receiver<bool>,
    recorded: Arc<AtomicBool>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.inner.active.lock().remove(&self.id);
        self.inner.idle.notify_waiters();
    }
}

struct Inner {
    config: Arc<ResilienceConfig>,
    registry: Arc<ComponentRegistry>,
    gate: TriggerGate,
    catalog: StrategyCatalog,
    learner: PatternLearner,
    backups: Arc<BackupStore>,
    contexts: Arc<ContextBuilder>,
    executor: RecoveryExecutor,
    active: Mutex<HashMap<String, ActiveSlot>>,
    history: Mutex<VecDeque<RecoveryExecution>>,
    last_health: Mutex<HashMap<String, HealthClass>>,
    last_report: Mutex<Option<IntegrityReport>>,
    events: EventBus,
    metrics: MetricsCounters,
    shutting_down: AtomicBool,
    idle: Notify,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl Inner {
    fn reserve(
        self: &Arc<Self>,
        id: &str,
        report: &FailureReport,
        forced: bool,
    ) -> Result<SlotGuard, RecoveryError> {
        let mut active = self.active.lock();
        // Checked under the lock so shutdown never misses a late arrival.
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RecoveryError::ShuttingDown);
        }
        let limit = self.config.max_concurrent_recoveries;
        if active.len() >= limit {
            return Err(RecoveryError::AtCapacity {
                active: active.len(),
                limit,
            });
        }

        let (cancel, rx) = watch::channel(false);
        let recorded = Arc::new(AtomicBool::new(false));
        active.insert(
            id.to_string(),
            ActiveSlot {
                info: ActiveRecovery {
                    attempt_id: id.to_string(),
                    trigger: report.trigger,
                    component: report.component.clone(),
                    strategy_id: None,
                    started_at: Utc::now(),
                    forced,
                },
                cancel,
                context: None,
                actions: Vec::new(),
                recorded: Arc::clone(&recorded),
            },
        );
        Ok(SlotGuard {
            inner: Arc::clone(self),
            id: id.to_string(),
            cancel: rx,
            recorded,
        })
    }

    fn push_history(&self, execution: RecoveryExecution) {
        let mut history = self.history.lock();
        history.push_back(execution);
        while history.len() > HISTORY_CAPACITY {
            history.pop_front();
        }
    }

    /// Failure ratio over the most recent attempts, once enough have finished.
    fn recent_failure_rate(&self) -> Option<(f64, usize)> {
        let history = self.history.lock();
        let window: Vec<&RecoveryExecution> = history.iter().rev().take(ALERT_WINDOW).collect();
        if window.len() < ALERT_MIN_SAMPLES {
            return None;
        }
        let failed = window.iter().filter(|e| !e.succeeded()).count();
        Some((failed as f64 / window.len() as f64, window.len()))
    }
}

/// Builder for [`RecoveryOrchestrator`]; everything but the config is optional.
pub struct OrchestratorBuilder {
    config: ResilienceConfig,
    sampler: Option<Arc<dyn ResourceSampler>>,
    blobs: Option<Arc<dyn BlobStore>>,
    key_source: Option<KeySource>,
    catalog: Option<StrategyCatalog>,
}

impl OrchestratorBuilder {
    pub fn sampler(mut self, sampler: Arc<dyn ResourceSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = Some(blobs);
        self
    }

    pub fn key_source(mut self, source: KeySource) -> Self {
        self.key_source = Some(source);
        self
    }

    /// Replace the default strategy catalog.
    pub fn catalog(mut self, catalog: StrategyCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn build(self) -> Result<RecoveryOrchestrator, ResilienceError> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let store = match self.blobs {
            Some(blobs) => BackupStore::with_blob_store(config.backup.clone(), blobs)?,
            None => BackupStore::open(config.backup.clone())?,
        };
        let store = match self.key_source {
            Some(source) => store.with_key_source(source),
            None => store,
        };
        let backups = Arc::new(store);
        let learner = PatternLearner::persistent(config.pattern_learning.clone(), &backups.root())?;

        let sampler = self
            .sampler
            .unwrap_or_else(|| Arc::new(SysinfoSampler) as Arc<dyn ResourceSampler>);
        let contexts = Arc::new(ContextBuilder::new(sampler, config.monitoring.probe_timeout()));
        let registry = Arc::new(ComponentRegistry::new());
        let executor = RecoveryExecutor::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            Some(Arc::clone(&backups)),
            Arc::clone(&contexts),
        );

        info!(
            enabled = config.enabled,
            max_concurrent = config.max_concurrent_recoveries,
            storage = %backups.root().display(),
            "Recovery orchestrator ready"
        );

        Ok(RecoveryOrchestrator {
            inner: Arc::new(Inner {
                gate: TriggerGate::new(config.triggers.clone()),
                catalog: self.catalog.unwrap_or_default(),
                learner,
                backups,
                contexts,
                executor,
                registry,
                active: Mutex::new(HashMap::new()),
                history: Mutex::new(VecDeque::new()),
                last_health: Mutex::new(HashMap::new()),
                last_report: Mutex::new(None),
                events: EventBus::default(),
                metrics: MetricsCounters::default(),
                shutting_down: AtomicBool::new(false),
                idle: Notify::new(),
                monitor: Mutex::new(None),
                config,
            }),
        })
    }
}

/// Cheap to clone; every clone drives the same engine.
#[derive(Clone)]
pub struct RecoveryOrchestrator {
    inner: Arc<Inner>,
}

impl RecoveryOrchestrator {
    pub fn builder(config: ResilienceConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            sampler: None,
            blobs: None,
            key_source: None,
            catalog: None,
        }
    }

    /// Orchestrator with the filesystem backup store and host sampling.
    pub fn new(config: ResilienceConfig) -> Result<Self, ResilienceError> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.inner.config
    }

    // ------------------------------------------------------------------
    // Components
    // ------------------------------------------------------------------

    pub fn register_component(&self, component: Arc<dyn Component>) {
        self.inner.registry.register(component);
    }

    pub fn unregister_component(&self, name: &str) -> bool {
        self.inner.last_health.lock().remove(name);
        self.inner.registry.unregister(name)
    }

    pub fn register_handler(&self, name: &str, handler: Arc<dyn CustomActionHandler>) {
        self.inner.registry.register_handler(name, handler);
    }

    pub fn components(&self) -> Vec<String> {
        self.inner.registry.names()
    }

    /// Add or replace a catalog strategy.
    pub fn add_strategy(&self, strategy: RecoveryStrategy) {
        self.inner.catalog.insert(strategy);
    }

    pub fn strategies(&self) -> Vec<RecoveryStrategy> {
        self.inner.catalog.list()
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Run one gated recovery attempt.
    ///
    /// Rejections (disabled, shutting down, unknown component, capacity,
    /// gate) and a missing strategy are errors. An attempt that ran returns
    /// its execution record; check [`RecoveryExecution::succeeded`].
    pub async fn trigger_recovery(
        &self,
        report: FailureReport,
    ) -> Result<RecoveryExecution, RecoveryError> {
        self.attempt(report, None, None, false).await
    }

    pub async fn trigger_with_constraints(
        &self,
        report: FailureReport,
        constraints: Constraints,
    ) -> Result<RecoveryExecution, RecoveryError> {
        self.attempt(report, Some(constraints), None, false).await
    }

    /// Bypass the trigger gate (not the capacity ceiling), optionally
    /// naming the strategy to run.
    pub async fn force_recovery(
        &self,
        report: FailureReport,
        strategy_id: Option<&str>,
    ) -> Result<RecoveryExecution, RecoveryError> {
        self.attempt(report, None, strategy_id.map(str::to_string), true)
            .await
    }

    /// Run [`trigger_recovery`](Self::trigger_recovery) as its own task.
    pub fn spawn_recovery(
        &self,
        report: FailureReport,
    ) -> JoinHandle<Result<RecoveryExecution, RecoveryError>> {
        let this = self.clone();
        tokio::spawn(async move { this.trigger_recovery(report).await })
    }

    fn default_constraints(&self) -> Constraints {
        Constraints {
            max_duration_ms: self.inner.config.recovery_timeout.as_millis() as u64,
            allowed_actions: None,
            preserve_data: false,
        }
    }

    async fn attempt(
        &self,
        report: FailureReport,
        constraints: Option<Constraints>,
        strategy_id: Option<String>,
        forced: bool,
    ) -> Result<RecoveryExecution, RecoveryError> {
        let inner = &self.inner;
        if !inner.config.enabled {
            return Err(self.reject(&report, RecoveryError::Disabled));
        }
        if inner.shutting_down.load(Ordering::SeqCst) {
            return Err(self.reject(&report, RecoveryError::ShuttingDown));
        }
        if !inner.registry.contains(&report.component) {
            return Err(self.reject(
                &report,
                RecoveryError::ComponentNotFound(report.component.clone()),
            ));
        }
        let explicit = match strategy_id {
            Some(id) => match inner.catalog.get(&id) {
                Some(strategy) => Some(strategy),
                None => return Err(self.reject(&report, RecoveryError::UnknownStrategy(id))),
            },
            None => None,
        };

        let attempt_id = Uuid::new_v4().to_string();
        let slot = match inner.reserve(&attempt_id, &report, forced) {
            Ok(slot) => slot,
            Err(e) => return Err(self.reject(&report, e)),
        };
        if !forced {
            if let Err(denial) = inner.gate.should_admit(report.trigger, &report.component) {
                let e = RecoveryError::RateLimited {
                    trigger: report.trigger,
                    component: report.component.clone(),
                    denial,
                };
                return Err(self.reject(&report, e));
            }
        }

        let constraints = constraints.unwrap_or_else(|| self.default_constraints());
        let span = recovery_span(&attempt_id, report.trigger.as_str(), &report.component);
        self.run(slot, report, constraints, explicit, forced)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        slot: SlotGuard,
        report: FailureReport,
        constraints: Constraints,
        explicit: Option<RecoveryStrategy>,
        forced: bool,
    ) -> Result<RecoveryExecution, RecoveryError> {
        let inner = &self.inner;
        inner.metrics.attempts.fetch_add(1, Ordering::Relaxed);

        let ctx = inner
            .contexts
            .build(slot.id.clone(), &report, constraints, &inner.registry)
            .await;
        let mut execution = RecoveryExecution::new(slot.id.clone(), ctx.clone());
        execution.forced = forced;
        if let Some(active) = inner.active.lock().get_mut(&slot.id) {
            active.context = Some(ctx.clone());
        }

        let selection = match explicit {
            Some(strategy) => Some(Selection {
                strategy,
                source: SelectionSource::Explicit,
            }),
            None => inner.catalog.select(&ctx, &inner.registry, Some(&inner.learner)),
        };
        let Some(Selection { strategy, source }) = selection else {
            let e = RecoveryError::NoApplicableStrategy {
                trigger: ctx.trigger,
                component: ctx.component.clone(),
                attempt_id: ctx.id.clone(),
            };
            warn!(error = %e, "No strategy to run");
            execution.fail(ExecutionStatus::Failed, &e);
            self.finish(&slot, execution);
            return Err(e);
        };

        if let Some(active) = inner.active.lock().get_mut(&slot.id) {
            active.info.strategy_id = Some(strategy.id.clone());
            active.actions = strategy.actions.iter().map(ActionRecord::pending).collect();
        }
        info!(strategy = %strategy.id, source = ?source, "Starting recovery");
        inner.events.emit(RecoveryEvent::RecoveryStarted {
            attempt_id: ctx.id.clone(),
            trigger: ctx.trigger,
            component: ctx.component.clone(),
            strategy_id: strategy.id.clone(),
            forced,
        });

        let result = inner
            .executor
            .execute(&mut execution, &strategy, slot.cancel.clone())
            .await;
        let success = result.is_ok();
        let elapsed = execution.elapsed_ms();

        inner.catalog.record_outcome(&strategy.id, success, elapsed);
        if let Some(pattern) = inner.learner.record(&ctx, &strategy.id, success, elapsed) {
            inner.events.emit(RecoveryEvent::PatternUpdated {
                pattern_id: pattern.id,
                confidence: pattern.confidence,
                occurrences: pattern.occurrences,
            });
        }

        let span = tracing::Span::current();
        span.record("status", format!("{:?}", execution.status).as_str());
        span.record("duration_ms", elapsed);
        match &result {
            Ok(()) => info!(duration_ms = elapsed, "Recovery completed"),
            Err(e) => warn!(
                duration_ms = elapsed,
                error = %scrub(&e.to_string()),
                rolled_back = execution.rolled_back,
                "Recovery failed"
            ),
        }

        self.finish(&slot, execution.clone());
        Ok(execution)
    }

    /// Record a finished attempt unless shutdown already force-recorded it.
    fn finish(&self, slot: &SlotGuard, execution: RecoveryExecution) {
        if slot.recorded.swap(true, Ordering::SeqCst) {
            debug!(attempt_id = %slot.id, "Attempt already recorded as aborted");
            return;
        }
        self.record_finished(execution);
    }

    fn record_finished(&self, execution: RecoveryExecution) {
        let inner = &self.inner;
        let elapsed = execution.elapsed_ms();
        inner
            .metrics
            .total_recovery_ms
            .fetch_add(elapsed, Ordering::Relaxed);

        if execution.succeeded() {
            inner.metrics.successes.fetch_add(1, Ordering::Relaxed);
            inner.events.emit(RecoveryEvent::RecoveryCompleted {
                attempt_id: execution.id.clone(),
                component: execution.context.component.clone(),
                strategy_id: execution.strategy_id.clone().unwrap_or_default(),
                duration_ms: elapsed,
            });
        } else {
            inner.metrics.failures.fetch_add(1, Ordering::Relaxed);
            inner.events.emit(RecoveryEvent::RecoveryFailed {
                attempt_id: execution.id.clone(),
                component: execution.context.component.clone(),
                failure: execution.failure,
                error: execution.error.clone().unwrap_or_default(),
            });
        }
        inner.push_history(execution);

        if let Some((rate, window)) = inner.recent_failure_rate() {
            if rate >= inner.config.monitoring.alert_threshold {
                warn!(failure_rate = rate, window, "Recovery failure rate above threshold");
                inner.events.emit(RecoveryEvent::FailureRateAlert {
                    failure_rate: rate,
                    window,
                });
            }
        }
    }

    fn reject(&self, report: &FailureReport, error: RecoveryError) -> RecoveryError {
        let metrics = &self.inner.metrics;
        match &error {
            RecoveryError::RateLimited { .. } => {
                metrics.rejected_rate_limited.fetch_add(1, Ordering::Relaxed)
            }
            RecoveryError::AtCapacity { .. } => {
                metrics.rejected_capacity.fetch_add(1, Ordering::Relaxed)
            }
            _ => metrics.rejected_other.fetch_add(1, Ordering::Relaxed),
        };
        warn!(
            trigger = %report.trigger,
            component = %scrub(&report.component),
            reason = %error,
            "Recovery rejected"
        );
        self.inner.events.emit(RecoveryEvent::RecoveryRejected {
            trigger: report.trigger,
            component: report.component.clone(),
            reason: error.to_string(),
        });
        error
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn active_recoveries(&self) -> Vec<ActiveRecovery> {
        let mut active: Vec<ActiveRecovery> = self
            .inner
            .active
            .lock()
            .values()
            .map(|slot| slot.info.clone())
            .collect();
        active.sort_by_key(|a| a.started_at);
        active
    }

    /// Finished executions, newest first.
    pub fn history(&self, limit: Option<usize>) -> Vec<RecoveryExecution> {
        let history = self.inner.history.lock();
        history
            .iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn execution(&self, attempt_id: &str) -> Option<RecoveryExecution> {
        self.inner
            .history
            .lock()
            .iter()
            .find(|e| e.id == attempt_id)
            .cloned()
    }

    /// Drop history entries older than `monitoring.metrics_retention`.
    pub fn prune_history(&self) -> usize {
        let retention = chrono::Duration::from_std(self.inner.config.monitoring.metrics_retention())
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let cutoff = Utc::now().checked_sub_signed(retention);
        let Some(cutoff) = cutoff else { return 0 };
        let mut history = self.inner.history.lock();
        let before = history.len();
        history.retain(|e| e.completed_at.unwrap_or(e.started_at) >= cutoff);
        before - history.len()
    }

    pub fn patterns(&self) -> Vec<RecoveryPattern> {
        self.inner.learner.patterns()
    }

    pub fn learner_summary(&self) -> LearnerSummary {
        self.inner.learner.summary()
    }

    pub fn metrics(&self) -> RecoveryMetrics {
        let m = &self.inner.metrics;
        let successes = m.successes.load(Ordering::Relaxed);
        let failures = m.failures.load(Ordering::Relaxed);
        let finished = successes + failures;
        RecoveryMetrics {
            attempts: m.attempts.load(Ordering::Relaxed),
            successes,
            failures,
            rejected_rate_limited: m.rejected_rate_limited.load(Ordering::Relaxed),
            rejected_capacity: m.rejected_capacity.load(Ordering::Relaxed),
            rejected_other: m.rejected_other.load(Ordering::Relaxed),
            active: self.inner.active.lock().len(),
            avg_recovery_ms: if finished == 0 {
                0.0
            } else {
                m.total_recovery_ms.load(Ordering::Relaxed) as f64 / finished as f64
            },
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecoveryEvent> {
        self.inner.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Backups
    // ------------------------------------------------------------------

    pub fn backup_store(&self) -> &Arc<BackupStore> {
        &self.inner.backups
    }

    pub fn backups(&self, component: Option<&str>) -> Vec<DataBackup> {
        self.inner.backups.list(component)
    }

    pub fn last_integrity_report(&self) -> Option<IntegrityReport> {
        self.inner.last_report.lock().clone()
    }

    /// Plan for the most recent integrity report.
    pub fn recovery_plan(&self) -> Option<RecoveryPlan> {
        let report = self.last_integrity_report()?;
        Some(self.inner.backups.plan_for_report(&report))
    }

    /// Back up a component's state; fails when backups are disabled.
    pub async fn create_backup(&self, component: &str) -> Result<DataBackup, ResilienceError> {
        if !self.inner.config.backup.enabled {
            return Err(BackupError::Disabled.into());
        }
        self.force_backup(component).await
    }

    /// Back up a component's state even when backups are disabled.
    pub async fn force_backup(&self, component: &str) -> Result<DataBackup, ResilienceError> {
        let entry = self
            .inner
            .registry
            .get(component)
            .ok_or_else(|| ComponentError::NotRegistered(component.to_string()))?;
        if !entry.supports(Capability::CreateBackup) {
            return Err(ComponentError::Unsupported {
                component: component.to_string(),
                capability: Capability::CreateBackup.to_string(),
            }
            .into());
        }
        let payload = entry
            .component
            .create_backup()
            .await
            .map_err(|e| ComponentError::from_capability(component, "create_backup", e))?;

        let store = Arc::clone(&self.inner.backups);
        let name = component.to_string();
        let backup = tokio::task::spawn_blocking(move || {
            store.create_backup(&name, COMPONENT_STATE, &payload, BackupOptions::default())
        })
        .await
        .map_err(|e| ResilienceError::Internal(format!("backup task failed: {}", e)))??;

        info!(component = %component, backup_id = %backup.id, "Backup created");
        self.inner.events.emit(RecoveryEvent::BackupCreated {
            backup_id: backup.id.clone(),
            component: component.to_string(),
        });
        Ok(backup)
    }

    /// Restore a component from its latest verified backup, or the one
    /// nearest `target` when given. Bypasses the gate and strategies.
    pub async fn emergency_restore(
        &self,
        component: &str,
        target: Option<DateTime<Utc>>,
    ) -> Result<DataBackup, ResilienceError> {
        let entry = self
            .inner
            .registry
            .get(component)
            .ok_or_else(|| ComponentError::NotRegistered(component.to_string()))?;
        if !entry.supports(Capability::RestoreBackup) {
            return Err(ComponentError::Unsupported {
                component: component.to_string(),
                capability: Capability::RestoreBackup.to_string(),
            }
            .into());
        }

        let store = &self.inner.backups;
        let backup = match target {
            Some(at) => store.nearest_restorable(component, Some(COMPONENT_STATE), at),
            None => store.latest_restorable(component, Some(COMPONENT_STATE), None),
        }
        .ok_or_else(|| BackupError::NoBackupAvailable {
            component: component.to_string(),
            data_type: COMPONENT_STATE.to_string(),
        })?;

        warn!(component = %component, backup_id = %backup.id, "Emergency restore");
        let store = Arc::clone(store);
        let id = backup.id.clone();
        let payload = tokio::task::spawn_blocking(move || store.restore(&id, RestoreOptions::default()))
            .await
            .map_err(|e| ResilienceError::Internal(format!("restore task failed: {}", e)))??;

        entry
            .component
            .restore_backup(&payload)
            .await
            .map_err(|e| ComponentError::from_capability(component, "restore_backup", e))?;

        self.inner.events.emit(RecoveryEvent::BackupRestored {
            backup_id: backup.id.clone(),
            component: component.to_string(),
        });
        Ok(backup)
    }

    /// Check stored backups, write the report and remember it for planning.
    pub async fn integrity_scan(
        &self,
        options: ScanOptions,
    ) -> Result<IntegrityReport, ResilienceError> {
        let store = Arc::clone(&self.inner.backups);
        let (report, written) = tokio::task::spawn_blocking(move || {
            let report = store.scan(&options);
            let written = store.write_report(&report);
            (report, written)
        })
        .await
        .map_err(|e| ResilienceError::Internal(format!("integrity scan task failed: {}", e)))?;

        match written {
            Ok(path) => debug!(path = %path.display(), "Integrity report written"),
            Err(e) => warn!(error = %e, "Could not write integrity report"),
        }
        if !report.is_clean() {
            warn!(
                corrupted = report.corrupted,
                missing = report.missing,
                corruption_percentage = report.corruption_percentage,
                "Integrity scan found damaged backups"
            );
        }
        self.inner.events.emit(RecoveryEvent::IntegrityScanned {
            total: report.total,
            corrupted: report.corrupted,
            missing: report.missing,
            corruption_percentage: report.corruption_percentage,
        });
        *self.inner.last_report.lock() = Some(report.clone());
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Monitoring
    // ------------------------------------------------------------------

    /// Start the monitoring loop. Returns false if disabled or already running.
    pub fn start_monitoring(&self) -> bool {
        let monitoring = &self.inner.config.monitoring;
        if !monitoring.enabled || self.inner.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        let mut slot = self.inner.monitor.lock();
        if slot.as_ref().map(|m| m.is_running()).unwrap_or(false) {
            return false;
        }

        let weak = Arc::downgrade(&self.inner);
        let handle = monitor::spawn(
            monitoring.health_check_interval(),
            monitoring.integrity_scan_interval(),
            move |tick| {
                let inner = weak.upgrade()?;
                let orchestrator = RecoveryOrchestrator { inner };
                Some(async move { orchestrator.monitor_tick(tick).await })
            },
        );
        *slot = Some(handle);
        info!(
            interval_ms = monitoring.health_check_interval_ms,
            "Monitoring loop started"
        );
        true
    }

    async fn monitor_tick(&self, tick: MonitorTick) {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let pruned = self.prune_history();
        if pruned > 0 {
            debug!(pruned, "Pruned recovery history");
        }
        if tick.health {
            self.check_health().await;
        }
        if tick.integrity {
            self.scheduled_maintenance().await;
        }
    }

    /// Probe every component; a component that newly reports failed gets
    /// a recovery attempt through the gate.
    pub async fn check_health(&self) -> HashMap<String, HealthClass> {
        let inner = &self.inner;
        let state = inner.contexts.capture_state(&inner.registry).await;

        let changes: Vec<(String, Option<HealthClass>, HealthClass)> = {
            let mut last = inner.last_health.lock();
            state
                .component_health
                .iter()
                .filter_map(|(name, health)| {
                    let previous = last.insert(name.clone(), *health);
                    (previous != Some(*health)).then(|| (name.clone(), previous, *health))
                })
                .collect()
        };

        for (component, from, to) in changes {
            if from.is_some() || to != HealthClass::Healthy {
                info!(component = %component, from = ?from, to = ?to, "Component health changed");
            }
            inner.events.emit(RecoveryEvent::HealthChanged {
                component: component.clone(),
                from,
                to,
            });
            if to == HealthClass::Failed {
                let report = FailureReport::new(
                    TriggerKind::ComponentFailure,
                    &component,
                    "health probe reported failed",
                );
                let this = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = this.trigger_recovery(report).await {
                        debug!(component = %component, error = %e, "Health-triggered recovery not run");
                    }
                });
            }
        }
        state.component_health
    }

    async fn scheduled_maintenance(&self) {
        let options = ScanOptions {
            repair: true,
            ..ScanOptions::default()
        };
        if let Err(e) = self.integrity_scan(options).await {
            error!(error = %e, "Scheduled integrity scan failed");
        }

        let store = Arc::clone(&self.inner.backups);
        match tokio::task::spawn_blocking(move || store.enforce_all_retention()).await {
            Ok(evicted) if evicted > 0 => info!(evicted, "Retention enforced"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Retention task failed"),
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Stop accepting work, cancel active attempts, wait up to
    /// `shutdown_grace`, then record stragglers as aborted.
    pub async fn shutdown(&self) -> ShutdownReport {
        let inner = &self.inner;
        if inner.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already in progress");
            return ShutdownReport::default();
        }
        info!("Shutting down recovery orchestrator");
        inner.events.emit(RecoveryEvent::ShutdownStarted);

        let monitor = inner.monitor.lock().take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }

        let cancelled = {
            let active = inner.active.lock();
            for slot in active.values() {
                let _ = slot.cancel.send(true);
            }
            active.len()
        };

        let deadline = tokio::time::Instant::now() + inner.config.shutdown_grace;
        loop {
            let notified = inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if inner.active.lock().is_empty() {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        let stragglers: Vec<ActiveSlot> = inner.active.lock().drain().map(|(_, s)| s).collect();
        let forced = stragglers.len();
        for slot in stragglers {
            self.force_abort(slot);
        }
        if forced > 0 {
            warn!(forced, "Recoveries still running after grace period were aborted");
        }

        let patterns_persisted = match inner.learner.persist() {
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "Failed to persist patterns on shutdown");
                0
            }
        };
        inner.events.emit(RecoveryEvent::ShutdownCompleted { forced });
        info!(cancelled, forced, "Recovery orchestrator stopped");
        ShutdownReport {
            cancelled,
            forced,
            patterns_persisted,
        }
    }

    fn force_abort(&self, slot: ActiveSlot) {
        if slot.recorded.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(context) = slot.context else {
            debug!(attempt_id = %slot.info.attempt_id, "Aborted before context was built");
            return;
        };
        let mut execution = RecoveryExecution::new(slot.info.attempt_id.clone(), context);
        execution.started_at = slot.info.started_at;
        execution.strategy_id = slot.info.strategy_id.clone();
        execution.forced = slot.info.forced;
        execution.actions = slot.actions;
        cancel_remaining(&mut execution.actions, "engine shutting down");
        execution.fail(ExecutionStatus::Aborted, &RecoveryError::Cancelled);
        self.record_finished(execution);
    }
}
