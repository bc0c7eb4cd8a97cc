//! Resilience - automated recovery for long-running services
//!
//! Turns failure reports from components into gated, time-boxed remediation
//! and keeps verified backups to restore from when remediation is not enough.
//!
//! - **Recovery**: trigger gate, strategy selection, action execution, rollback
//! - **Learning**: failure signatures mapped to the strategies that fixed them
//! - **Backups**: checksummed, compressed, encrypted, atomically written
//! - **Integrity**: scans, sibling repair and severity-based recovery plans
//!
//! # Quick Start
//!
//! ```ignore
//! use resilience::{FailureReport, RecoveryOrchestrator, ResilienceConfig, TriggerKind};
//!
//! let engine = RecoveryOrchestrator::new(ResilienceConfig::load(None)?)?;
//! engine.register_component(my_service);
//! engine.start_monitoring();
//! let execution = engine
//!     .trigger_recovery(FailureReport::new(TriggerKind::ComponentFailure, "db", "exited"))
//!     .await?;
//! ```

pub mod backup;
pub mod cli;
pub mod component;
pub mod config;
pub mod errors;
pub mod observability;
pub mod persist;
pub mod recovery;

pub use backup::{BackupStore, DataBackup, IntegrityReport, RecoveryPlan};
pub use component::{Capability, CapabilitySet, Component, ComponentRegistry, CustomActionHandler};
pub use config::ResilienceConfig;
pub use errors::{BackupError, RecoveryError, ResilienceError};
pub use recovery::{
    FailureReport, RecoveryEvent, RecoveryExecution, RecoveryOrchestrator, RecoveryStrategy,
    TriggerKind,
};
