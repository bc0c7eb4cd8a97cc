//! Shared helpers for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use resilience::component::{Capability, CapabilityResult, CapabilitySet, Component, HealthReport};
use resilience::errors::CapabilityError;
use resilience::recovery::{HealthClass, RecoveryOrchestrator, ResourceSampler, ResourceUsage};
use resilience::ResilienceConfig;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Sampler that always reports the same usage.
pub struct SteadySampler(pub f64);

impl ResourceSampler for SteadySampler {
    fn sample(&self) -> Result<ResourceUsage, String> {
        Ok(ResourceUsage {
            memory_percent: self.0,
            cpu_percent: 20.0,
        })
    }
}

/// A component whose behaviour each test scripts.
pub struct Service {
    name: String,
    caps: CapabilitySet,
    pub calls: Mutex<Vec<String>>,
    pub health: Mutex<HealthClass>,
    pub state: Mutex<serde_json::Value>,
    pub restart_delay: Mutex<Duration>,
    pub restart_fails: Mutex<bool>,
}

impl Service {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            caps: CapabilitySet::of(&[
                Capability::Restart,
                Capability::Health,
                Capability::CreateBackup,
                Capability::RestoreBackup,
            ]),
            calls: Mutex::new(Vec::new()),
            health: Mutex::new(HealthClass::Healthy),
            state: Mutex::new(serde_json::json!({ "rows": [1, 2, 3], "version": 1 })),
            restart_delay: Mutex::new(Duration::ZERO),
            restart_fails: Mutex::new(false),
        }
    }

    pub fn slow_restart(self, delay: Duration) -> Self {
        *self.restart_delay.lock() = delay;
        self
    }

    pub fn failing_restart(self) -> Self {
        *self.restart_fails.lock() = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn note(&self, call: &str) {
        self.calls.lock().push(call.to_string());
    }
}

#[async_trait]
impl Component for Service {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> CapabilitySet {
        self.caps
    }

    async fn restart(&self) -> CapabilityResult<()> {
        self.note("restart");
        let delay = *self.restart_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if *self.restart_fails.lock() {
            return Err(CapabilityError::Failed("restart refused".into()));
        }
        *self.health.lock() = HealthClass::Healthy;
        Ok(())
    }

    async fn health(&self) -> CapabilityResult<HealthReport> {
        Ok(HealthReport {
            status: *self.health.lock(),
            message: None,
        })
    }

    async fn create_backup(&self) -> CapabilityResult<serde_json::Value> {
        self.note("create_backup");
        Ok(self.state.lock().clone())
    }

    async fn restore_backup(&self, payload: &serde_json::Value) -> CapabilityResult<()> {
        self.note("restore_backup");
        *self.state.lock() = payload.clone();
        Ok(())
    }
}

/// Config rooted in `dir` with fast, unencrypted backups and no monitoring.
pub fn config(dir: &Path) -> ResilienceConfig {
    let mut config = ResilienceConfig::default().with_storage(dir);
    config.backup.encryption = false;
    config.monitoring.enabled = false;
    config.shutdown_grace = Duration::from_millis(200);
    config
}

pub fn engine(config: ResilienceConfig) -> RecoveryOrchestrator {
    RecoveryOrchestrator::builder(config)
        .sampler(Arc::new(SteadySampler(40.0)))
        .build()
        .expect("engine builds")
}
