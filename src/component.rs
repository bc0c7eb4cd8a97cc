//! Component capability interface
//!
//! Components opt into remediation by implementing [`Component`] and
//! declaring which capabilities they support. The declaration is captured
//! once at registration; the executor consults it instead of probing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::errors::CapabilityError;
use crate::recovery::types::{ActionKind, HealthClass, RecoveryContext};

pub type CapabilityResult<T> = std::result::Result<T, CapabilityError>;

/// An optional operation a component may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Restart,
    /// `stop` + `start`, used when `restart` is absent
    StopStart,
    ClearCache,
    ResetConnections,
    /// `disconnect` + `connect`, used when `reset_connections` is absent
    Reconnect,
    Rollback,
    RestoreBackup,
    CreateBackup,
    ValidateData,
    RepairCorruption,
    Health,
    HealthFlag,
    OptimizeResources,
    Dependencies,
    EmergencyStop,
    ResetCircuitBreaker,
    Undo,
}

impl Capability {
    pub const ALL: [Capability; 17] = [
        Self::Restart,
        Self::StopStart,
        Self::ClearCache,
        Self::ResetConnections,
        Self::Reconnect,
        Self::Rollback,
        Self::RestoreBackup,
        Self::CreateBackup,
        Self::ValidateData,
        Self::RepairCorruption,
        Self::Health,
        Self::HealthFlag,
        Self::OptimizeResources,
        Self::Dependencies,
        Self::EmergencyStop,
        Self::ResetCircuitBreaker,
        Self::Undo,
    ];

    fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Restart => "restart",
            Self::StopStart => "stop/start",
            Self::ClearCache => "clear_cache",
            Self::ResetConnections => "reset_connections",
            Self::Reconnect => "disconnect/connect",
            Self::Rollback => "rollback",
            Self::RestoreBackup => "restore_backup",
            Self::CreateBackup => "create_backup",
            Self::ValidateData => "validate_data",
            Self::RepairCorruption => "repair_corruption",
            Self::Health => "health",
            Self::HealthFlag => "is_healthy",
            Self::OptimizeResources => "optimize_resources",
            Self::Dependencies => "dependencies",
            Self::EmergencyStop => "emergency_stop",
            Self::ResetCircuitBreaker => "reset_circuit_breaker",
            Self::Undo => "undo",
        };
        f.write_str(s)
    }
}

/// Set of declared capabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CapabilitySet(u32);

impl CapabilitySet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn of(caps: &[Capability]) -> Self {
        caps.iter().fold(Self::empty(), |set, c| set.with(*c))
    }

    pub fn with(self, cap: Capability) -> Self {
        Self(self.0 | cap.bit())
    }

    pub fn contains(&self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|c| self.contains(*c))
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), |set, c| set.with(c))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthClass,
    #[serde(default)]
    pub message: Option<String>,
}

impl HealthReport {
    pub fn healthy() -> Self {
        Self {
            status: HealthClass::Healthy,
            message: None,
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: HealthClass::Degraded,
            message: Some(message.into()),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: HealthClass::Failed,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataValidation {
    pub valid: bool,
    #[serde(default)]
    pub error: Option<String>,
}

impl DataValidation {
    pub fn valid() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
        }
    }
}

/// A managed component. Every capability defaults to `Unsupported`;
/// implementors override what they declare in [`Component::capabilities`].
#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> CapabilitySet;

    async fn restart(&self) -> CapabilityResult<()> {
        Err(CapabilityError::Unsupported)
    }

    async fn stop(&self) -> CapabilityResult<()> {
        Err(CapabilityError::Unsupported)
    }

    async fn start(&self) -> CapabilityResult<()> {
        Err(CapabilityError::Unsupported)
    }

    async fn clear_cache(&self) -> CapabilityResult<()> {
        Err(CapabilityError::Unsupported)
    }

    async fn reset_connections(&self) -> CapabilityResult<()> {
        Err(CapabilityError::Unsupported)
    }

    async fn disconnect(&self) -> CapabilityResult<()> {
        Err(CapabilityError::Unsupported)
    }

    async fn connect(&self) -> CapabilityResult<()> {
        Err(CapabilityError::Unsupported)
    }

    async fn rollback(&self) -> CapabilityResult<()> {
        Err(CapabilityError::Unsupported)
    }

    async fn restore_backup(&self, _payload: &serde_json::Value) -> CapabilityResult<()> {
        Err(CapabilityError::Unsupported)
    }

    async fn create_backup(&self) -> CapabilityResult<serde_json::Value> {
        Err(CapabilityError::Unsupported)
    }

    async fn validate_data(&self) -> CapabilityResult<DataValidation> {
        Err(CapabilityError::Unsupported)
    }

    async fn repair_corruption(&self) -> CapabilityResult<()> {
        Err(CapabilityError::Unsupported)
    }

    async fn health(&self) -> CapabilityResult<HealthReport> {
        Err(CapabilityError::Unsupported)
    }

    async fn is_healthy(&self) -> CapabilityResult<bool> {
        Err(CapabilityError::Unsupported)
    }

    async fn optimize_resources(&self) -> CapabilityResult<()> {
        Err(CapabilityError::Unsupported)
    }

    async fn dependencies(&self) -> CapabilityResult<Vec<String>> {
        Err(CapabilityError::Unsupported)
    }

    async fn emergency_stop(&self) -> CapabilityResult<()> {
        Err(CapabilityError::Unsupported)
    }

    async fn reset_circuit_breaker(&self) -> CapabilityResult<()> {
        Err(CapabilityError::Unsupported)
    }

    /// Revert the effect of a previously completed action.
    async fn undo(&self, _action: ActionKind) -> CapabilityResult<()> {
        Err(CapabilityError::Unsupported)
    }
}

/// Handler for `custom` strategy actions, registered by name.
#[async_trait]
pub trait CustomActionHandler: Send + Sync {
    async fn execute(
        &self,
        context: &RecoveryContext,
        component: Option<Arc<dyn Component>>,
    ) -> CapabilityResult<()>;
}

/// A component together with the capabilities it declared at registration.
#[derive(Clone)]
pub struct RegisteredComponent {
    pub component: Arc<dyn Component>,
    pub capabilities: CapabilitySet,
    pub registered_at: DateTime<Utc>,
}

impl RegisteredComponent {
    pub fn name(&self) -> &str {
        self.component.name()
    }

    pub fn supports(&self, cap: Capability) -> bool {
        self.capabilities.contains(cap)
    }
}

impl fmt::Debug for RegisteredComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredComponent")
            .field("name", &self.component.name())
            .field("capabilities", &self.capabilities)
            .field("registered_at", &self.registered_at)
            .finish()
    }
}

/// Name-indexed registry of components and custom action handlers.
#[derive(Default)]
pub struct ComponentRegistry {
    components: RwLock<HashMap<String, RegisteredComponent>>,
    handlers: RwLock<HashMap<String, Arc<dyn CustomActionHandler>>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component, replacing any previous one with the same name.
    pub fn register(&self, component: Arc<dyn Component>) {
        let name = component.name().to_string();
        let capabilities = component.capabilities();
        let entry = RegisteredComponent {
            component,
            capabilities,
            registered_at: Utc::now(),
        };
        if self.components.write().insert(name.clone(), entry).is_some() {
            warn!(component = %name, "Replacing previously registered component");
        } else {
            info!(component = %name, capabilities = ?capabilities.iter().collect::<Vec<_>>(), "Registered component");
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        let removed = self.components.write().remove(name).is_some();
        if removed {
            info!(component = %name, "Unregistered component");
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<RegisteredComponent> {
        self.components.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.components.read().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.components.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn snapshot(&self) -> Vec<RegisteredComponent> {
        self.components.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.components.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.read().is_empty()
    }

    pub fn register_handler(&self, name: &str, handler: Arc<dyn CustomActionHandler>) {
        if self
            .handlers
            .write()
            .insert(name.to_string(), handler)
            .is_some()
        {
            warn!(handler = %name, "Replacing custom action handler");
        }
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn CustomActionHandler>> {
        self.handlers.read().get(name).cloned()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable component used by unit tests across the crate.

    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    pub struct FakeComponent {
        pub name: String,
        pub caps: CapabilitySet,
        pub calls: Mutex<Vec<String>>,
        pub failing: Mutex<Vec<String>>,
        pub delay: Mutex<HashMap<String, Duration>>,
        pub health: Mutex<HealthClass>,
        pub state: Mutex<serde_json::Value>,
        pub deps: Vec<String>,
    }

    impl FakeComponent {
        pub fn new(name: &str, caps: &[Capability]) -> Self {
            Self {
                name: name.to_string(),
                caps: CapabilitySet::of(caps),
                calls: Mutex::new(Vec::new()),
                failing: Mutex::new(Vec::new()),
                delay: Mutex::new(HashMap::new()),
                health: Mutex::new(HealthClass::Healthy),
                state: Mutex::new(serde_json::json!({"version": 1})),
                deps: Vec::new(),
            }
        }

        pub fn fail_on(self, op: &str) -> Self {
            self.failing.lock().push(op.to_string());
            self
        }

        pub fn slow(self, op: &str, delay: Duration) -> Self {
            self.delay.lock().insert(op.to_string(), delay);
            self
        }

        pub fn with_deps(mut self, deps: &[&str]) -> Self {
            self.deps = deps.iter().map(|d| d.to_string()).collect();
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        async fn op(&self, op: &str) -> CapabilityResult<()> {
            self.calls.lock().push(op.to_string());
            let delay = self.delay.lock().get(op).copied();
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            if self.failing.lock().iter().any(|f| f == op) {
                return Err(CapabilityError::Failed(format!("{} failed", op)));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Component for FakeComponent {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> CapabilitySet {
            self.caps
        }

        async fn restart(&self) -> CapabilityResult<()> {
            self.op("restart").await?;
            *self.health.lock() = HealthClass::Healthy;
            Ok(())
        }

        async fn stop(&self) -> CapabilityResult<()> {
            self.op("stop").await
        }

        async fn start(&self) -> CapabilityResult<()> {
            self.op("start").await
        }

        async fn clear_cache(&self) -> CapabilityResult<()> {
            self.op("clear_cache").await
        }

        async fn reset_connections(&self) -> CapabilityResult<()> {
            self.op("reset_connections").await
        }

        async fn restore_backup(&self, payload: &serde_json::Value) -> CapabilityResult<()> {
            self.op("restore_backup").await?;
            *self.state.lock() = payload.clone();
            Ok(())
        }

        async fn create_backup(&self) -> CapabilityResult<serde_json::Value> {
            self.op("create_backup").await?;
            Ok(self.state.lock().clone())
        }

        async fn validate_data(&self) -> CapabilityResult<DataValidation> {
            if self.failing.lock().iter().any(|f| f == "validate_data") {
                self.calls.lock().push("validate_data".into());
                return Ok(DataValidation::invalid("rows out of order"));
            }
            self.op("validate_data").await?;
            Ok(DataValidation::valid())
        }

        async fn repair_corruption(&self) -> CapabilityResult<()> {
            self.op("repair_corruption").await
        }

        async fn health(&self) -> CapabilityResult<HealthReport> {
            self.op("health").await?;
            Ok(HealthReport {
                status: *self.health.lock(),
                message: None,
            })
        }

        async fn dependencies(&self) -> CapabilityResult<Vec<String>> {
            Ok(self.deps.clone())
        }

        async fn emergency_stop(&self) -> CapabilityResult<()> {
            self.op("emergency_stop").await?;
            *self.health.lock() = HealthClass::Failed;
            Ok(())
        }

        async fn undo(&self, action: ActionKind) -> CapabilityResult<()> {
            self.op(&format!("undo:{}", action)).await
        }
    }
}
