//! Runs a strategy's actions against a component.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::context::ContextBuilder;
use super::types::{
    ActionKind, ActionRecord, ActionStatus, ExecutionMode, ExecutionStatus, HealthClass,
    RecoveryAction, RecoveryContext, RecoveryExecution, RecoveryOutcome, RecoveryStrategy,
    SystemState,
};
use crate::backup::{BackupOptions, BackupStore, RestoreOptions, COMPONENT_STATE};
use crate::component::{Capability, ComponentRegistry, RegisteredComponent};
use crate::config::ResilienceConfig;
use crate::errors::{BackupError, CapabilityError, RecoveryError};
use crate::observability::telemetry::track_action;

/// Allowed growth of memory usage across an attempt, in percentage points.
const MEMORY_REGRESSION_LIMIT: f64 = 10.0;

struct ActionRun {
    attempts: u32,
    started_at: DateTime<Utc>,
    duration_ms: u64,
    result: Result<(), RecoveryError>,
}

enum Interrupt {
    Deadline,
    Cancelled,
}

pub struct RecoveryExecutor {
    config: Arc<ResilienceConfig>,
    registry: Arc<ComponentRegistry>,
    backups: Option<Arc<BackupStore>>,
    contexts: Arc<ContextBuilder>,
}

impl RecoveryExecutor {
    pub fn new(
        config: Arc<ResilienceConfig>,
        registry: Arc<ComponentRegistry>,
        backups: Option<Arc<BackupStore>>,
        contexts: Arc<ContextBuilder>,
    ) -> Self {
        Self {
            config,
            registry,
            backups,
            contexts,
        }
    }

    /// Deadline for a whole attempt.
    pub fn deadline(&self, ctx: &RecoveryContext) -> Duration {
        self.config
            .recovery_timeout
            .min(Duration::from_millis(ctx.constraints.max_duration_ms))
    }

    /// Run `strategy` and close `execution`. The record is always completed,
    /// whatever the result.
    pub async fn execute(
        &self,
        execution: &mut RecoveryExecution,
        strategy: &RecoveryStrategy,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), RecoveryError> {
        let ctx = execution.context.clone();
        execution.strategy_id = Some(strategy.id.clone());
        execution.status = ExecutionStatus::Running;
        execution.actions = strategy.actions.iter().map(ActionRecord::pending).collect();
        let entry = self.registry.get(&ctx.component);

        match self.pre_recovery_backup(&ctx, entry.as_ref()).await {
            Ok(id) => execution.pre_recovery_backup = id,
            Err(e) if ctx.constraints.preserve_data => {
                execution.fail(ExecutionStatus::Failed, &e);
                return Err(e);
            }
            Err(e) => warn!(attempt_id = %ctx.id, error = %e, "Continuing without pre-recovery backup"),
        }

        let runnable = self.schedule(strategy, &ctx, &mut execution.actions);
        let deadline = self.deadline(&ctx);
        let pre_backup = execution.pre_recovery_backup.clone();

        let interrupted = {
            let run = self.run_mode(
                strategy,
                &ctx,
                entry.as_ref(),
                &runnable,
                &mut execution.actions,
                pre_backup.as_deref(),
            );
            tokio::select! {
                result = run => Ok(result),
                _ = tokio::time::sleep(deadline) => Err(Interrupt::Deadline),
                _ = cancelled(&mut cancel) => Err(Interrupt::Cancelled),
            }
        };

        let (status, result, post_state) = match interrupted {
            Ok(Ok(())) => {
                let (post, verdict) = self.final_validation(&ctx, &execution.actions).await;
                match verdict {
                    Ok(()) => (ExecutionStatus::Completed, Ok(()), Some(post)),
                    Err(e) => (ExecutionStatus::Failed, Err(e), Some(post)),
                }
            }
            Ok(Err(e)) => (ExecutionStatus::Failed, Err(e), None),
            Err(Interrupt::Deadline) => {
                cancel_remaining(&mut execution.actions, "recovery deadline exceeded");
                let e = RecoveryError::DeadlineExceeded {
                    deadline_ms: deadline.as_millis() as u64,
                };
                (ExecutionStatus::Aborted, Err(e), None)
            }
            Err(Interrupt::Cancelled) => {
                cancel_remaining(&mut execution.actions, "recovery cancelled");
                (ExecutionStatus::Aborted, Err(RecoveryError::Cancelled), None)
            }
        };

        if status == ExecutionStatus::Failed && strategy.rollback_on_failure {
            self.rollback(&ctx, entry.as_ref(), &execution.actions, pre_backup.as_deref())
                .await;
            execution.rolled_back = true;
        }

        let actions_executed = execution
            .actions
            .iter()
            .filter(|a| a.status == ActionStatus::Completed)
            .count() as u32;
        execution.outcome = Some(RecoveryOutcome {
            success: result.is_ok(),
            recovery_time_ms: execution.elapsed_ms(),
            actions_executed,
            post_state,
        });
        match &result {
            Ok(()) => {
                execution.status = ExecutionStatus::Completed;
                execution.completed_at = Some(Utc::now());
            }
            Err(e) => execution.fail(status, e),
        }
        result
    }

    async fn pre_recovery_backup(
        &self,
        ctx: &RecoveryContext,
        entry: Option<&RegisteredComponent>,
    ) -> Result<Option<String>, RecoveryError> {
        let backup = &self.config.backup;
        if !(backup.enabled && backup.before_recovery) {
            return Ok(None);
        }
        let (Some(store), Some(entry)) = (&self.backups, entry) else {
            return Ok(None);
        };
        if !entry.supports(Capability::CreateBackup) {
            debug!(component = %ctx.component, "Component exposes no backup payload");
            return Ok(None);
        }

        let timeout = self.config.action(ActionKind::RestoreBackup).timeout();
        let payload = match tokio::time::timeout(timeout, entry.component.create_backup()).await {
            Ok(Ok(payload)) => payload,
            Ok(Err(e)) => return Err(RecoveryError::BackupCreationFailed(e.to_string())),
            Err(_) => {
                return Err(RecoveryError::BackupCreationFailed(format!(
                    "component did not produce a payload within {}ms",
                    timeout.as_millis()
                )))
            }
        };

        let store = Arc::clone(store);
        let component = ctx.component.clone();
        let created = tokio::task::spawn_blocking(move || {
            store.create_backup(&component, COMPONENT_STATE, &payload, BackupOptions::default())
        })
        .await
        .map_err(|e| RecoveryError::BackupCreationFailed(e.to_string()))?
        .map_err(|e| RecoveryError::BackupCreationFailed(e.to_string()))?;

        info!(attempt_id = %ctx.id, backup_id = %created.id, "Created pre-recovery backup");
        Ok(Some(created.id))
    }

    /// Decide which actions may run. Conflicts are resolved in priority
    /// order; the returned indices keep strategy order.
    fn schedule(
        &self,
        strategy: &RecoveryStrategy,
        ctx: &RecoveryContext,
        records: &mut [ActionRecord],
    ) -> Vec<usize> {
        let mut order: Vec<usize> = (0..strategy.actions.len()).collect();
        order.sort_by_key(|&i| Reverse(self.config.action(strategy.actions[i].kind).priority));

        let mut scheduled: Vec<usize> = Vec::new();
        for i in order {
            let kind = strategy.actions[i].kind;
            let config = self.config.action(kind);

            let unavailable = config.prerequisites.iter().find(|p| {
                !strategy.actions.iter().any(|a| a.kind == **p) || !self.config.action(**p).enabled
            });
            let conflict = scheduled.iter().map(|&j| strategy.actions[j].kind).find(|other| {
                config.conflicts_with.contains(other)
                    || self.config.action(*other).conflicts_with.contains(&kind)
            });

            if !config.enabled {
                records[i].skip("disabled by configuration");
            } else if !ctx.constraints.allows(kind) {
                records[i].skip("not in allowed actions");
            } else if let Some(p) = unavailable {
                records[i].skip(format!("prerequisite {} unavailable", p));
            } else if let Some(other) = conflict {
                records[i].skip(format!("conflicts with {}", other));
            } else {
                scheduled.push(i);
            }
        }
        for i in (0..records.len()).filter(|i| records[*i].status == ActionStatus::Skipped) {
            debug!(
                attempt_id = %ctx.id,
                action = %records[i].label,
                reason = records[i].error.as_deref().unwrap_or_default(),
                "Action skipped"
            );
        }
        scheduled.sort_unstable();
        scheduled
    }

    async fn run_mode(
        &self,
        strategy: &RecoveryStrategy,
        ctx: &RecoveryContext,
        entry: Option<&RegisteredComponent>,
        runnable: &[usize],
        records: &mut [ActionRecord],
        pre_backup: Option<&str>,
    ) -> Result<(), RecoveryError> {
        let validate = strategy.validate_after_each;
        match strategy.mode {
            ExecutionMode::Sequential => {
                for &idx in runnable {
                    let action = &strategy.actions[idx];
                    if let Some(reason) = self.unmet_prerequisite(action, records) {
                        records[idx].skip(reason);
                        continue;
                    }
                    records[idx].status = ActionStatus::Running;
                    let run = self.run_action(ctx, action, entry, validate, pre_backup).await;
                    if let Some(e) = apply(&mut records[idx], run) {
                        if action.critical {
                            cancel_remaining(records, "aborted after critical failure");
                            return Err(e);
                        }
                    }
                }
                Ok(())
            }
            ExecutionMode::ParallelGroups => {
                let mut groups: BTreeMap<u32, Vec<usize>> = BTreeMap::new();
                for &idx in runnable {
                    groups.entry(strategy.actions[idx].group).or_default().push(idx);
                }
                for (group, members) in groups {
                    let mut ready = Vec::new();
                    for idx in members {
                        match self.unmet_prerequisite(&strategy.actions[idx], records) {
                            Some(reason) => records[idx].skip(reason),
                            None => {
                                records[idx].status = ActionStatus::Running;
                                ready.push(idx);
                            }
                        }
                    }
                    let runs = join_all(ready.iter().map(|&idx| {
                        self.run_action(ctx, &strategy.actions[idx], entry, validate, pre_backup)
                    }))
                    .await;

                    let mut critical = None;
                    for (idx, run) in ready.into_iter().zip(runs) {
                        if let Some(e) = apply(&mut records[idx], run) {
                            if strategy.actions[idx].critical && critical.is_none() {
                                critical = Some(e);
                            }
                        }
                    }
                    if let Some(e) = critical {
                        warn!(attempt_id = %ctx.id, group, "Critical failure in action group");
                        cancel_remaining(records, "aborted after critical failure");
                        return Err(e);
                    }
                }
                Ok(())
            }
            ExecutionMode::FullParallel => {
                for &idx in runnable {
                    records[idx].status = ActionStatus::Running;
                }
                let runs = join_all(runnable.iter().map(|&idx| {
                    self.run_action(ctx, &strategy.actions[idx], entry, validate, pre_backup)
                }))
                .await;

                let mut critical = None;
                for (&idx, run) in runnable.iter().zip(runs) {
                    if let Some(e) = apply(&mut records[idx], run) {
                        if strategy.actions[idx].critical && critical.is_none() {
                            critical = Some(e);
                        }
                    }
                }
                critical.map_or(Ok(()), Err)
            }
        }
    }

    fn unmet_prerequisite(&self, action: &RecoveryAction, records: &[ActionRecord]) -> Option<String> {
        self.config
            .action(action.kind)
            .prerequisites
            .iter()
            .find(|p| {
                !records
                    .iter()
                    .any(|r| r.kind == **p && r.status == ActionStatus::Completed)
            })
            .map(|p| format!("prerequisite {} did not complete", p))
    }

    /// One action with retries, each attempt time-boxed, plus the optional
    /// post-action check.
    async fn run_action(
        &self,
        ctx: &RecoveryContext,
        action: &RecoveryAction,
        entry: Option<&RegisteredComponent>,
        validate: bool,
        pre_backup: Option<&str>,
    ) -> ActionRun {
        let config = self.config.action(action.kind);
        let started_at = Utc::now();
        let start = Instant::now();
        let label = action.label();

        let mut attempts = 0;
        let mut result = Ok(());
        for attempt in 1..=config.max_attempts.max(1) {
            attempts = attempt;
            result = track_action(label, attempt, async {
                match tokio::time::timeout(config.timeout(), self.perform(ctx, action, entry, pre_backup))
                    .await
                {
                    Ok(r) => r,
                    Err(_) => Err(RecoveryError::ActionTimeout {
                        action: label.to_string(),
                        timeout_ms: config.timeout_ms,
                    }),
                }
            })
            .await;
            if result.is_ok() {
                break;
            }
        }

        if result.is_ok() && validate && action.kind != ActionKind::EmergencyShutdown {
            result = self.post_action_check(action, entry, config.timeout()).await;
        }

        ActionRun {
            attempts,
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
            result,
        }
    }

    async fn perform(
        &self,
        ctx: &RecoveryContext,
        action: &RecoveryAction,
        entry: Option<&RegisteredComponent>,
        pre_backup: Option<&str>,
    ) -> Result<(), RecoveryError> {
        let fail = |message: String| {
            RecoveryError::action_failed(action.kind, action.label(), action.critical, message)
        };
        let cap = |e: CapabilityError| fail(e.to_string());

        if action.kind == ActionKind::Custom {
            let name = action.handler.as_deref().unwrap_or_default();
            let handler = self
                .registry
                .handler(name)
                .ok_or_else(|| fail(format!("no handler registered as '{}'", name)))?;
            return handler
                .execute(ctx, entry.map(|e| Arc::clone(&e.component)))
                .await
                .map_err(cap);
        }

        let entry = entry.ok_or_else(|| fail(format!("component '{}' is not registered", ctx.component)))?;
        let component = &entry.component;
        let noop = |what: &str| -> Result<(), RecoveryError> {
            warn!(component = %ctx.component, action = %action.kind, "Component has no {}, nothing to do", what);
            Ok(())
        };

        match action.kind {
            ActionKind::Restart => restart(entry).await.map_err(cap),
            ActionKind::ClearCache if entry.supports(Capability::ClearCache) => {
                component.clear_cache().await.map_err(cap)
            }
            ActionKind::ClearCache => noop("cache"),
            ActionKind::ResetConnections if entry.supports(Capability::ResetConnections) => {
                component.reset_connections().await.map_err(cap)
            }
            ActionKind::ResetConnections if entry.supports(Capability::Reconnect) => {
                component.disconnect().await.map_err(cap)?;
                component.connect().await.map_err(cap)
            }
            ActionKind::ResetConnections => noop("connections"),
            ActionKind::IncreaseResources if entry.supports(Capability::OptimizeResources) => {
                component.optimize_resources().await.map_err(cap)
            }
            ActionKind::IncreaseResources => noop("resource controls"),
            ActionKind::ResetCircuitBreaker if entry.supports(Capability::ResetCircuitBreaker) => {
                component.reset_circuit_breaker().await.map_err(cap)
            }
            ActionKind::ResetCircuitBreaker => noop("circuit breaker"),
            ActionKind::Rollback if entry.supports(Capability::Rollback) => {
                component.rollback().await.map_err(cap)
            }
            ActionKind::RepairCorruption if entry.supports(Capability::RepairCorruption) => {
                component.repair_corruption().await.map_err(cap)
            }
            ActionKind::Rollback | ActionKind::RepairCorruption => {
                Err(fail(format!("'{}' does not support {}", ctx.component, action.kind)))
            }
            ActionKind::ValidateData if entry.supports(Capability::ValidateData) => {
                let validation = component.validate_data().await.map_err(cap)?;
                if validation.valid {
                    Ok(())
                } else {
                    Err(fail(validation.error.unwrap_or_else(|| "data invalid".into())))
                }
            }
            ActionKind::ValidateData => noop("data validation"),
            ActionKind::RestoreBackup => {
                if !entry.supports(Capability::RestoreBackup) {
                    return Err(fail(format!("'{}' cannot load a backup", ctx.component)));
                }
                let payload = self
                    .load_latest_backup(&ctx.component, pre_backup)
                    .await
                    .map_err(&fail)?;
                component.restore_backup(&payload).await.map_err(cap)
            }
            ActionKind::RestartDependencies => {
                if !entry.supports(Capability::Dependencies) {
                    return noop("dependencies");
                }
                for name in component.dependencies().await.map_err(cap)? {
                    match self.registry.get(&name) {
                        Some(dep) => restart(&dep)
                            .await
                            .map_err(|e| fail(format!("dependency '{}': {}", name, e)))?,
                        None => warn!(dependency = %name, "Dependency is not registered"),
                    }
                }
                Ok(())
            }
            ActionKind::ForceGc => {
                info!(component = %ctx.component, "Memory release requested");
                Ok(())
            }
            ActionKind::EmergencyShutdown if entry.supports(Capability::EmergencyStop) => {
                component.emergency_stop().await.map_err(cap)
            }
            ActionKind::EmergencyShutdown if entry.supports(Capability::StopStart) => {
                component.stop().await.map_err(cap)
            }
            ActionKind::EmergencyShutdown => {
                Err(fail(format!("'{}' cannot be stopped", ctx.component)))
            }
            ActionKind::Custom => Ok(()),
        }
    }

    /// Newest verified backup of `component` other than `exclude`.
    async fn load_latest_backup(
        &self,
        component: &str,
        exclude: Option<&str>,
    ) -> Result<serde_json::Value, String> {
        let store = self
            .backups
            .clone()
            .ok_or_else(|| BackupError::Disabled.to_string())?;
        let component = component.to_string();
        let exclude = exclude.map(str::to_string);
        tokio::task::spawn_blocking(move || {
            let backup = store
                .latest_restorable(&component, Some(COMPONENT_STATE), exclude.as_deref())
                .ok_or_else(|| BackupError::NoBackupAvailable {
                    component: component.clone(),
                    data_type: COMPONENT_STATE.to_string(),
                })?;
            store.restore(&backup.id, RestoreOptions::default())
        })
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())
    }

    async fn post_action_check(
        &self,
        action: &RecoveryAction,
        entry: Option<&RegisteredComponent>,
        timeout: Duration,
    ) -> Result<(), RecoveryError> {
        let Some(entry) = entry else {
            return Ok(());
        };
        let failed = |message: String| RecoveryError::PostActionValidationFailed {
            action: action.label().to_string(),
            message,
        };

        if entry.supports(Capability::ValidateData) {
            match tokio::time::timeout(timeout, entry.component.validate_data()).await {
                Ok(Ok(v)) if v.valid => Ok(()),
                Ok(Ok(v)) => Err(failed(v.error.unwrap_or_else(|| "data invalid".into()))),
                Ok(Err(e)) => Err(failed(e.to_string())),
                Err(_) => Err(failed("validation timed out".into())),
            }
        } else if entry.supports(Capability::Health) {
            match tokio::time::timeout(timeout, entry.component.health()).await {
                Ok(Ok(report)) if report.status != HealthClass::Failed => Ok(()),
                Ok(Ok(report)) => Err(failed(
                    report.message.unwrap_or_else(|| "component reports failed".into()),
                )),
                Ok(Err(e)) => Err(failed(e.to_string())),
                Err(_) => Err(failed("health probe timed out".into())),
            }
        } else {
            Ok(())
        }
    }

    /// Capture the post-attempt state and decide whether the attempt worked.
    async fn final_validation(
        &self,
        ctx: &RecoveryContext,
        records: &[ActionRecord],
    ) -> (SystemState, Result<(), RecoveryError>) {
        let post = self.contexts.capture_state(&self.registry).await;
        let shut_down = records
            .iter()
            .any(|r| r.kind == ActionKind::EmergencyShutdown && r.status == ActionStatus::Completed);

        if !shut_down && post.health_of(&ctx.component) == Some(HealthClass::Failed) {
            let e = RecoveryError::RecoveryValidationFailed(format!(
                "component '{}' is still failed",
                ctx.component
            ));
            return (post, Err(e));
        }
        let before = ctx.system_state.memory_percent;
        if post.memory_percent > before + MEMORY_REGRESSION_LIMIT {
            let e = RecoveryError::RecoveryValidationFailed(format!(
                "memory regressed from {:.1}% to {:.1}%",
                before, post.memory_percent
            ));
            return (post, Err(e));
        }
        (post, Ok(()))
    }

    /// Undo completed actions newest first, then reload the pre-recovery
    /// backup. Failures are logged only.
    async fn rollback(
        &self,
        ctx: &RecoveryContext,
        entry: Option<&RegisteredComponent>,
        records: &[ActionRecord],
        pre_backup: Option<&str>,
    ) {
        let Some(entry) = entry else {
            return;
        };
        warn!(attempt_id = %ctx.id, component = %ctx.component, "Rolling back recovery attempt");

        if entry.supports(Capability::Undo) {
            for record in records
                .iter()
                .rev()
                .filter(|r| r.status == ActionStatus::Completed)
            {
                let timeout = self.config.action(record.kind).timeout();
                match tokio::time::timeout(timeout, entry.component.undo(record.kind)).await {
                    Ok(Ok(())) | Ok(Err(CapabilityError::Unsupported)) => {}
                    Ok(Err(e)) => {
                        warn!(attempt_id = %ctx.id, action = %record.label, error = %e, "Undo failed")
                    }
                    Err(_) => warn!(attempt_id = %ctx.id, action = %record.label, "Undo timed out"),
                }
            }
        }

        let (Some(backup_id), Some(store)) = (pre_backup, &self.backups) else {
            return;
        };
        if !entry.supports(Capability::RestoreBackup) {
            return;
        }
        let store = Arc::clone(store);
        let id = backup_id.to_string();
        let payload = tokio::task::spawn_blocking(move || store.restore(&id, RestoreOptions::default())).await;
        let restored = match payload {
            Ok(Ok(payload)) => entry
                .component
                .restore_backup(&payload)
                .await
                .map_err(|e| e.to_string()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match restored {
            Ok(()) => info!(attempt_id = %ctx.id, backup_id, "Restored pre-recovery backup"),
            Err(e) => warn!(attempt_id = %ctx.id, backup_id, error = %e, "Failed to restore pre-recovery backup"),
        }
    }
}

async fn restart(entry: &RegisteredComponent) -> Result<(), CapabilityError> {
    if entry.supports(Capability::Restart) {
        entry.component.restart().await
    } else if entry.supports(Capability::StopStart) {
        entry.component.stop().await?;
        entry.component.start().await
    } else {
        Err(CapabilityError::Unsupported)
    }
}

/// Record an action run; returns the error if it failed.
fn apply(record: &mut ActionRecord, run: ActionRun) -> Option<RecoveryError> {
    record.attempts = run.attempts;
    record.started_at = Some(run.started_at);
    record.duration_ms = Some(run.duration_ms);
    match run.result {
        Ok(()) => {
            record.status = ActionStatus::Completed;
            None
        }
        Err(e) => {
            record.status = ActionStatus::Failed;
            record.error = Some(e.to_string());
            Some(e)
        }
    }
}

pub(crate) fn cancel_remaining(records: &mut [ActionRecord], reason: &str) {
    for record in records
        .iter_mut()
        .filter(|r| matches!(r.status, ActionStatus::Pending | ActionStatus::Running))
    {
        record.status = ActionStatus::Cancelled;
        record.error = Some(reason.to_string());
    }
}

/// Resolves once `rx` reads true. A dropped sender never cancels.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}
