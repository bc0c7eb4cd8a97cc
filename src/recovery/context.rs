//! Per-attempt context snapshots.

use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::types::{
    classify_error, Constraints, FailureDetails, HealthClass, RecoveryContext, Severity,
    SystemState, TriggerKind,
};
use crate::component::{Capability, ComponentRegistry, RegisteredComponent};

/// Source of host resource usage, as percentages.
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> Result<ResourceUsage, String>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    pub memory_percent: f64,
    pub cpu_percent: f64,
}

/// Samples the local host through `sysinfo`.
#[derive(Debug, Default)]
pub struct SysinfoSampler;

impl ResourceSampler for SysinfoSampler {
    fn sample(&self) -> Result<ResourceUsage, String> {
        use sysinfo::System;

        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu_usage();

        let total = system.total_memory();
        if total == 0 {
            return Err("total memory reported as zero".into());
        }
        Ok(ResourceUsage {
            memory_percent: system.used_memory() as f64 / total as f64 * 100.0,
            cpu_percent: f64::from(system.global_cpu_usage()),
        })
    }
}

/// What the caller knows about the failure being recovered.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub trigger: TriggerKind,
    pub component: String,
    pub error: String,
    pub occurrences: u32,
}

impl FailureReport {
    pub fn new(trigger: TriggerKind, component: &str, error: &str) -> Self {
        Self {
            trigger,
            component: component.to_string(),
            error: error.to_string(),
            occurrences: 1,
        }
    }

    pub fn occurred(mut self, occurrences: u32) -> Self {
        self.occurrences = occurrences.max(1);
        self
    }
}

pub struct ContextBuilder {
    sampler: Arc<dyn ResourceSampler>,
    probe_timeout: Duration,
}

impl ContextBuilder {
    pub fn new(sampler: Arc<dyn ResourceSampler>, probe_timeout: Duration) -> Self {
        Self {
            sampler,
            probe_timeout,
        }
    }

    /// Snapshot host resources and component health. Never fails: sampling
    /// errors fall back to [`SystemState::fallback`].
    pub async fn capture_state(&self, registry: &ComponentRegistry) -> SystemState {
        let usage = match self.sampler.sample() {
            Ok(usage) => usage,
            Err(e) => {
                warn!(error = %e, "Resource sampling failed, using fallback state");
                return SystemState::fallback();
            }
        };

        let components = registry.snapshot();
        let probes = components.iter().map(|c| self.probe(c));
        let component_health: HashMap<String, HealthClass> = join_all(probes)
            .await
            .into_iter()
            .collect();

        SystemState {
            memory_percent: usage.memory_percent,
            cpu_percent: usage.cpu_percent,
            component_health,
            captured_at: Utc::now(),
        }
    }

    async fn probe(&self, entry: &RegisteredComponent) -> (String, HealthClass) {
        let name = entry.name().to_string();
        let component = &entry.component;

        let health = if entry.supports(Capability::Health) {
            match tokio::time::timeout(self.probe_timeout, component.health()).await {
                Ok(Ok(report)) => report.status,
                Ok(Err(e)) => {
                    debug!(component = %name, error = %e, "Health probe failed");
                    HealthClass::Failed
                }
                Err(_) => {
                    debug!(component = %name, "Health probe timed out");
                    HealthClass::Failed
                }
            }
        } else if entry.supports(Capability::HealthFlag) {
            match tokio::time::timeout(self.probe_timeout, component.is_healthy()).await {
                Ok(Ok(true)) => HealthClass::Healthy,
                _ => HealthClass::Failed,
            }
        } else {
            HealthClass::Healthy
        };
        (name, health)
    }

    /// Build the immutable context for one attempt.
    pub async fn build(
        &self,
        id: String,
        report: &FailureReport,
        constraints: Constraints,
        registry: &ComponentRegistry,
    ) -> RecoveryContext {
        let system_state = self.capture_state(registry).await;
        RecoveryContext {
            id,
            timestamp: Utc::now(),
            trigger: report.trigger,
            component: report.component.clone(),
            failure: FailureDetails {
                error: report.error.clone(),
                error_class: classify_error(&report.error).to_string(),
                severity: Severity::for_failure(report.trigger, report.occurrences),
                occurrences: report.occurrences,
            },
            system_state,
            constraints,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FixedSampler;
    use super::*;
    use crate::component::testing::FakeComponent;
    use crate::component::{Component, HealthReport};
    use crate::errors::CapabilityError;
    use async_trait::async_trait;

    struct Hanging;

    #[async_trait]
    impl Component for Hanging {
        fn name(&self) -> &str {
            "hanging"
        }
        fn capabilities(&self) -> crate::component::CapabilitySet {
            crate::component::CapabilitySet::of(&[Capability::Health])
        }
        async fn health(&self) -> Result<HealthReport, CapabilityError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(HealthReport::healthy())
        }
    }

    fn constraints() -> Constraints {
        Constraints {
            max_duration_ms: 60_000,
            allowed_actions: None,
            preserve_data: false,
        }
    }

    #[tokio::test]
    async fn test_health_classification() {
        let registry = ComponentRegistry::new();
        registry.register(Arc::new(FakeComponent::new("plain", &[])));
        registry.register(Arc::new(
            FakeComponent::new("broken", &[Capability::Health]).fail_on("health"),
        ));
        registry.register(Arc::new(Hanging));
        let degraded = FakeComponent::new("slow", &[Capability::Health]);
        *degraded.health.lock() = HealthClass::Degraded;
        registry.register(Arc::new(degraded));

        let builder = ContextBuilder::new(
            Arc::new(FixedSampler::new(40.0, 20.0)),
            Duration::from_millis(50),
        );
        let state = builder.capture_state(&registry).await;
        assert_eq!(state.memory_percent, 40.0);
        assert_eq!(state.health_of("plain"), Some(HealthClass::Healthy));
        assert_eq!(state.health_of("broken"), Some(HealthClass::Failed));
        assert_eq!(state.health_of("hanging"), Some(HealthClass::Failed));
        assert_eq!(state.health_of("slow"), Some(HealthClass::Degraded));
    }

    #[tokio::test]
    async fn test_sampler_failure_uses_fallback() {
        let registry = ComponentRegistry::new();
        registry.register(Arc::new(FakeComponent::new("db", &[])));
        let builder = ContextBuilder::new(Arc::new(FixedSampler::failing()), Duration::from_secs(1));
        let report = FailureReport::new(TriggerKind::ComponentFailure, "db", "connection refused");
        let ctx = builder
            .build("a1".into(), &report, constraints(), &registry)
            .await;
        assert_eq!(ctx.system_state.memory_percent, 50.0);
        assert_eq!(ctx.system_state.cpu_percent, 50.0);
        assert!(ctx.system_state.component_health.is_empty());
        assert_eq!(ctx.failure.error_class, "network");
        assert_eq!(ctx.failure.severity, Severity::High);
    }
}
