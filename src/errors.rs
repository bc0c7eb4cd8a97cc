use std::path::PathBuf;
use thiserror::Error;

use crate::recovery::types::{ActionKind, FailureKind, TriggerKind};

/// The central error type for the resilience core.
///
/// Every subsystem has its own typed error; this wrapper lets the binary and
/// embedding services handle them uniformly.
#[derive(Error, Debug)]
pub enum ResilienceError {
    #[error("Recovery error: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Component error: {0}")]
    Component(#[from] ComponentError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Why the trigger gate refused an attempt.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum GateDenial {
    TriggerDisabled,
    CoolingDown { remaining_ms: u64 },
    HourlyLimit { limit: u32 },
}

impl std::fmt::Display for GateDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TriggerDisabled => write!(f, "trigger disabled"),
            Self::CoolingDown { remaining_ms } => {
                write!(f, "cooling down for another {}ms", remaining_ms)
            }
            Self::HourlyLimit { limit } => write!(f, "hourly limit of {} reached", limit),
        }
    }
}

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Automated recovery is disabled")]
    Disabled,

    #[error("Recovery engine is shutting down")]
    ShuttingDown,

    #[error("Trigger {trigger} for '{component}' rate limited: {denial}")]
    RateLimited {
        trigger: TriggerKind,
        component: String,
        denial: GateDenial,
    },

    #[error("At capacity: {active} of {limit} concurrent recoveries running")]
    AtCapacity { active: usize, limit: usize },

    #[error("No applicable strategy for {trigger} on '{component}' (attempt {attempt_id})")]
    NoApplicableStrategy {
        trigger: TriggerKind,
        component: String,
        attempt_id: String,
    },

    #[error("Unknown strategy '{0}'")]
    UnknownStrategy(String),

    #[error("Component '{0}' is not registered")]
    ComponentNotFound(String),

    #[error("Action {action} timed out after {timeout_ms}ms")]
    ActionTimeout { action: String, timeout_ms: u64 },

    #[error("Action {action} failed{}: {message}", critical_suffix(.critical))]
    ActionFailed {
        action: String,
        critical: bool,
        message: String,
    },

    #[error("Post-action validation failed after {action}: {message}")]
    PostActionValidationFailed { action: String, message: String },

    #[error("Recovery validation failed: {0}")]
    RecoveryValidationFailed(String),

    #[error("Pre-recovery backup failed: {0}")]
    BackupCreationFailed(String),

    #[error("Recovery exceeded its deadline of {deadline_ms}ms")]
    DeadlineExceeded { deadline_ms: u64 },

    #[error("Recovery cancelled")]
    Cancelled,

    #[error("Failed to persist learned patterns: {0}")]
    Persistence(String),
}

fn critical_suffix(critical: &bool) -> &'static str {
    if *critical {
        " (critical)"
    } else {
        ""
    }
}

impl RecoveryError {
    /// Classification stored on execution records for the query surface.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::NoApplicableStrategy { .. } => FailureKind::NoApplicableStrategy,
            Self::ActionTimeout { .. } => FailureKind::ActionTimeout,
            Self::ActionFailed { .. } => FailureKind::ActionFailed,
            Self::PostActionValidationFailed { .. } => FailureKind::PostActionValidationFailed,
            Self::RecoveryValidationFailed(_) => FailureKind::RecoveryValidationFailed,
            Self::BackupCreationFailed(_) => FailureKind::BackupCreationFailed,
            Self::DeadlineExceeded { .. } => FailureKind::DeadlineExceeded,
            Self::Cancelled | Self::ShuttingDown => FailureKind::Cancelled,
            _ => FailureKind::Rejected,
        }
    }

    /// True for errors produced before any action ran (gate, capacity, config).
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Disabled
                | Self::ShuttingDown
                | Self::RateLimited { .. }
                | Self::AtCapacity { .. }
                | Self::ComponentNotFound(_)
                | Self::UnknownStrategy(_)
        )
    }

    pub(crate) fn action_failed(kind: ActionKind, label: &str, critical: bool, message: impl Into<String>) -> Self {
        let action = if label == kind.as_str() {
            label.to_string()
        } else {
            format!("{}:{}", kind, label)
        };
        Self::ActionFailed {
            action,
            critical,
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Backups are disabled")]
    Disabled,

    #[error("Failed to create backup for {component}/{data_type}: {message}")]
    CreationFailed {
        component: String,
        data_type: String,
        message: String,
    },

    #[error("Backup {backup_id} failed post-write verification: {message}")]
    VerificationFailed { backup_id: String, message: String },

    #[error("Checksum mismatch for backup {backup_id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        backup_id: String,
        expected: String,
        actual: String,
    },

    #[error("Backup {0} not found in registry")]
    NotFound(String),

    #[error("Backup file for {backup_id} missing at {path:?}")]
    FileMissing { backup_id: String, path: PathBuf },

    #[error("No restorable backup for {component}/{data_type}")]
    NoBackupAvailable { component: String, data_type: String },

    #[error("No verified sibling backup available to repair {backup_id}")]
    NoRepairSource { backup_id: String },

    #[error("Backup {backup_id} has dependent incremental backups: {dependents:?}")]
    HasDependents {
        backup_id: String,
        dependents: Vec<String>,
    },

    #[error("Backup {backup_id} was encrypted with key {key_id}, which is not available")]
    KeyUnavailable { backup_id: String, key_id: String },

    #[error(
        "Key rotation incomplete: {} backup(s) still use key {key_id}; repair or delete them and rotate again",
        .pending.len()
    )]
    RotationIncomplete { key_id: String, pending: Vec<String> },

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Payload of backup {backup_id} failed structural validation: {message}")]
    StructureInvalid { backup_id: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error at {path:?}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BackupError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source,
        }
    }

    /// Whether this failure means the stored bytes cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::ChecksumMismatch { .. }
                | Self::Encryption(_)
                | Self::Compression(_)
                | Self::Serialization(_)
        )
    }
}

/// Failure returned by an individual component capability.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("capability not supported")]
    Unsupported,

    #[error("{0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum ComponentError {
    #[error("Component '{0}' is not registered")]
    NotRegistered(String),

    #[error("Component '{component}' does not support {capability}")]
    Unsupported {
        component: String,
        capability: String,
    },

    #[error("Component '{component}' failed during {capability}: {message}")]
    Failed {
        component: String,
        capability: String,
        message: String,
    },
}

impl ComponentError {
    pub(crate) fn from_capability(component: &str, capability: &str, err: CapabilityError) -> Self {
        match err {
            CapabilityError::Unsupported => Self::Unsupported {
                component: component.to_string(),
                capability: capability.to_string(),
            },
            CapabilityError::Failed(message) => Self::Failed {
                component: component.to_string(),
                capability: capability.to_string(),
                message,
            },
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("Unknown {section} key '{key}'")]
    UnknownKey { section: &'static str, key: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ResilienceError>;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_ERROR: u8 = 1;
pub const EXIT_CONFIG_ERROR: u8 = 2;
pub const EXIT_BACKUP_ERROR: u8 = 3;
pub const EXIT_INTEGRITY_FAILURE: u8 = 4;

/// Determine the appropriate process exit code for an error.
pub fn exit_code(e: &anyhow::Error) -> u8 {
    if let Some(err) = e.downcast_ref::<ResilienceError>() {
        return match err {
            ResilienceError::Config(_) => EXIT_CONFIG_ERROR,
            ResilienceError::Backup(_) => EXIT_BACKUP_ERROR,
            _ => EXIT_ERROR,
        };
    }

    if e.downcast_ref::<ConfigError>().is_some() {
        return EXIT_CONFIG_ERROR;
    }
    if e.downcast_ref::<BackupError>().is_some() {
        return EXIT_BACKUP_ERROR;
    }

    EXIT_ERROR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_config_error_wrapped() {
        let err: anyhow::Error =
            ResilienceError::Config(ConfigError::Invalid("bad priority".to_string())).into();
        assert_eq!(exit_code(&err), EXIT_CONFIG_ERROR);
    }

    #[test]
    fn test_exit_code_backup_error_direct() {
        let err: anyhow::Error = BackupError::NotFound("b1".to_string()).into();
        assert_eq!(exit_code(&err), EXIT_BACKUP_ERROR);
    }

    #[test]
    fn test_exit_code_plain_anyhow_default() {
        let err = anyhow::anyhow!("something completely unexpected happened");
        assert_eq!(exit_code(&err), EXIT_ERROR);
    }

    #[test]
    fn test_rate_limited_message_names_trigger_and_component() {
        let err = RecoveryError::RateLimited {
            trigger: TriggerKind::MemoryPressure,
            component: "cache".to_string(),
            denial: GateDenial::HourlyLimit { limit: 3 },
        };
        let msg = err.to_string();
        assert!(msg.contains("memory_pressure"));
        assert!(msg.contains("cache"));
        assert!(msg.contains("hourly limit of 3"));
        assert!(err.is_rejection());
    }

    #[test]
    fn test_action_failed_marks_critical() {
        let err = RecoveryError::action_failed(ActionKind::Restart, "restart", true, "boom");
        assert_eq!(err.to_string(), "Action restart failed (critical): boom");
        assert_eq!(err.failure_kind(), FailureKind::ActionFailed);
    }

    #[test]
    fn test_custom_action_label_includes_handler() {
        let err = RecoveryError::action_failed(ActionKind::Custom, "flush_queue", false, "nope");
        assert!(err.to_string().contains("custom:flush_queue"));
    }

    #[test]
    fn test_corruption_classification() {
        assert!(BackupError::ChecksumMismatch {
            backup_id: "b".into(),
            expected: "a".into(),
            actual: "c".into()
        }
        .is_corruption());
        assert!(!BackupError::NotFound("b".into()).is_corruption());
    }
}
