//! Recovery Engine
//!
//! Turns failure reports into remediation:
//! - Admission control per (trigger, component) with cooldowns and hourly caps
//! - Strategy selection from learned patterns or a ranked catalog
//! - Action execution with retries, time boxes, validation and rollback
//! - Pattern learning from every outcome
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   Recovery Orchestrator                       │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐        │
//! │  │ Trigger      │→ │ Context      │→ │ Strategy     │        │
//! │  │ Gate         │  │ Builder      │  │ Catalog      │        │
//! │  └──────────────┘  └──────────────┘  └──────────────┘        │
//! │                                             │                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐        │
//! │  │ Pattern      │← │ Recovery     │← │ Backup       │        │
//! │  │ Learner      │  │ Executor     │  │ Store        │        │
//! │  └──────────────┘  └──────────────┘  └──────────────┘        │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod catalog;
pub mod context;
pub mod events;
pub mod executor;
pub mod gate;
pub mod learner;
pub mod monitor;
pub mod orchestrator;
pub mod types;

pub use catalog::{default_strategies, Selection, SelectionSource, StrategyCatalog};
pub use context::{ContextBuilder, FailureReport, ResourceSampler, ResourceUsage, SysinfoSampler};
pub use events::{EventBus, RecoveryEvent};
pub use executor::RecoveryExecutor;
pub use gate::TriggerGate;
pub use learner::{LearnerSummary, PatternLearner, Recommendation, RecoveryPattern};
pub use orchestrator::{
    ActiveRecovery, OrchestratorBuilder, RecoveryMetrics, RecoveryOrchestrator, ShutdownReport,
};
pub use types::{
    ActionKind, Constraints, ExecutionMode, ExecutionStatus, HealthClass, RecoveryAction,
    RecoveryContext, RecoveryExecution, RecoveryStrategy, TriggerKind,
};
