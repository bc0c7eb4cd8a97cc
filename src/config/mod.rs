//! Configuration Management
//!
//! Loads the recovery engine configuration from TOML. The file format is
//! permissive (every field has a default, per-kind sections are partial
//! overrides); [`ResilienceConfig::load`] resolves it exactly once into an
//! immutable value that the rest of the crate reads without further merging.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::errors::ConfigError;
use crate::recovery::types::{ActionConfig, ActionKind, TriggerConfig, TriggerKind};

pub const CONFIG_FILE_NAME: &str = "resilience.toml";

// ============================================================================
// File format
// ============================================================================

/// Raw configuration as written on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_recoveries: usize,
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    #[serde(default)]
    pub pattern_learning: PatternLearningConfig,

    /// Per-action-kind overrides, keyed by kind name (`restart`, `clear_cache`, ...)
    #[serde(default)]
    pub strategies: HashMap<String, ActionOverride>,

    /// Per-trigger-kind overrides, keyed by kind name (`memory_pressure`, ...)
    #[serde(default)]
    pub triggers: HashMap<String, TriggerOverride>,

    #[serde(default)]
    pub monitoring: MonitoringConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionOverride {
    pub enabled: Option<bool>,
    pub priority: Option<u8>,
    pub timeout_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub prerequisites: Option<Vec<ActionKind>>,
    pub conflicts_with: Option<Vec<ActionKind>>,
    pub resource_cost: Option<u8>,
}

impl ActionOverride {
    fn apply(&self, base: &mut ActionConfig) {
        if let Some(v) = self.enabled {
            base.enabled = v;
        }
        if let Some(v) = self.priority {
            base.priority = v;
        }
        if let Some(v) = self.timeout_ms {
            base.timeout_ms = v;
        }
        if let Some(v) = self.max_attempts {
            base.max_attempts = v;
        }
        if let Some(v) = &self.prerequisites {
            base.prerequisites = v.clone();
        }
        if let Some(v) = &self.conflicts_with {
            base.conflicts_with = v.clone();
        }
        if let Some(v) = self.resource_cost {
            base.resource_cost = v;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerOverride {
    pub enabled: Option<bool>,
    pub threshold: Option<f64>,
    pub cooldown_ms: Option<u64>,
    pub max_triggers_per_hour: Option<u32>,
}

impl TriggerOverride {
    fn apply(&self, base: &mut TriggerConfig) {
        if let Some(v) = self.enabled {
            base.enabled = v;
        }
        if let Some(v) = self.threshold {
            base.threshold = v;
        }
        if let Some(v) = self.cooldown_ms {
            base.cooldown_ms = v;
        }
        if let Some(v) = self.max_triggers_per_hour {
            base.max_triggers_per_hour = v;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternLearningConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Occurrences before a pattern is persisted
    #[serde(default = "default_min_occurrences")]
    pub min_occurrences: u32,
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_adaptation_rate")]
    pub adaptation_rate: f64,
}

impl Default for PatternLearningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_occurrences: default_min_occurrences(),
            confidence_threshold: default_confidence_threshold(),
            adaptation_rate: default_adaptation_rate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_integrity_scan_interval_secs")]
    pub integrity_scan_interval_secs: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// How long finished executions stay in history
    #[serde(default = "default_metrics_retention_secs")]
    pub metrics_retention_secs: u64,
    /// Failure ratio over recent attempts that raises an alert event
    #[serde(default = "default_alert_threshold")]
    pub alert_threshold: f64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            health_check_interval_ms: default_health_check_interval_ms(),
            integrity_scan_interval_secs: default_integrity_scan_interval_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            metrics_retention_secs: default_metrics_retention_secs(),
            alert_threshold: default_alert_threshold(),
        }
    }
}

impl MonitoringConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn integrity_scan_interval(&self) -> Duration {
        Duration::from_secs(self.integrity_scan_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn metrics_retention(&self) -> Duration {
        Duration::from_secs(self.metrics_retention_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Snapshot the target component before running a strategy
    #[serde(default = "default_true")]
    pub before_recovery: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_storage_location")]
    pub storage_location: PathBuf,
    #[serde(default = "default_true")]
    pub compression: bool,
    #[serde(default = "default_true")]
    pub encryption: bool,
    /// Name of the environment variable holding a key passphrase. When unset a
    /// random key file is generated under `<storage>/keys/`.
    #[serde(default)]
    pub passphrase_env: Option<String>,
    #[serde(default)]
    pub replicas: Vec<PathBuf>,
    #[serde(default = "default_true")]
    pub verify_on_restore: bool,
    #[serde(default = "default_realtime_limit")]
    pub realtime_limit: usize,
    #[serde(default = "default_hourly_limit")]
    pub hourly_limit: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            before_recovery: true,
            retention_days: default_retention_days(),
            storage_location: default_storage_location(),
            compression: true,
            encryption: true,
            passphrase_env: None,
            replicas: Vec::new(),
            verify_on_restore: true,
            realtime_limit: default_realtime_limit(),
            hourly_limit: default_hourly_limit(),
        }
    }
}

impl BackupConfig {
    /// Settings for a store rooted at `root`, otherwise default.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            storage_location: root.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of compact text
    #[serde(default)]
    pub json: bool,
    /// Default filter directive when no env filter is set
    #[serde(default)]
    pub level: Option<String>,
}

fn default_true() -> bool {
    true
}
fn default_max_concurrent() -> usize {
    3
}
fn default_recovery_timeout_ms() -> u64 {
    300_000
}
fn default_shutdown_grace_ms() -> u64 {
    10_000
}
fn default_min_occurrences() -> u32 {
    3
}
fn default_confidence_threshold() -> f64 {
    0.7
}
fn default_adaptation_rate() -> f64 {
    0.1
}
fn default_health_check_interval_ms() -> u64 {
    30_000
}
fn default_integrity_scan_interval_secs() -> u64 {
    3600
}
fn default_probe_timeout_ms() -> u64 {
    5_000
}
fn default_metrics_retention_secs() -> u64 {
    7 * 24 * 3600
}
fn default_alert_threshold() -> f64 {
    0.5
}
fn default_retention_days() -> u32 {
    7
}
fn default_realtime_limit() -> usize {
    10
}
fn default_hourly_limit() -> usize {
    24
}
fn default_storage_location() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("resilience"))
        .unwrap_or_else(|| PathBuf::from(".resilience"))
}

// ============================================================================
// Resolved configuration
// ============================================================================

/// Fully resolved, immutable engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ResilienceConfig {
    pub enabled: bool,
    pub max_concurrent_recoveries: usize,
    pub recovery_timeout: Duration,
    pub shutdown_grace: Duration,
    pub pattern_learning: PatternLearningConfig,
    pub actions: HashMap<ActionKind, ActionConfig>,
    pub triggers: HashMap<TriggerKind, TriggerConfig>,
    pub monitoring: MonitoringConfig,
    pub backup: BackupConfig,
    pub logging: LoggingConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_recoveries: default_max_concurrent(),
            recovery_timeout: Duration::from_millis(default_recovery_timeout_ms()),
            shutdown_grace: Duration::from_millis(default_shutdown_grace_ms()),
            pattern_learning: PatternLearningConfig::default(),
            actions: default_actions(),
            triggers: default_triggers(),
            monitoring: MonitoringConfig::default(),
            backup: BackupConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_actions() -> HashMap<ActionKind, ActionConfig> {
    ActionKind::ALL
        .iter()
        .map(|k| (*k, ActionConfig::defaults_for(*k)))
        .collect()
}

fn default_triggers() -> HashMap<TriggerKind, TriggerConfig> {
    TriggerKind::ALL
        .iter()
        .map(|k| (*k, TriggerConfig::defaults_for(*k)))
        .collect()
}

impl ResilienceConfig {
    /// Merge per-kind overrides into the built-in defaults.
    pub fn resolve(file: ConfigFile) -> Result<Self, ConfigError> {
        let mut actions = default_actions();
        for (name, over) in &file.strategies {
            let kind: ActionKind = name.parse().map_err(|_| ConfigError::UnknownKey {
                section: "strategies",
                key: name.clone(),
            })?;
            if let Some(base) = actions.get_mut(&kind) {
                over.apply(base);
            }
        }

        let mut triggers = default_triggers();
        for (name, over) in &file.triggers {
            let kind: TriggerKind = name.parse().map_err(|_| ConfigError::UnknownKey {
                section: "triggers",
                key: name.clone(),
            })?;
            if let Some(base) = triggers.get_mut(&kind) {
                over.apply(base);
            }
        }

        Ok(Self {
            enabled: file.enabled,
            max_concurrent_recoveries: file.max_concurrent_recoveries,
            recovery_timeout: Duration::from_millis(file.recovery_timeout_ms),
            shutdown_grace: Duration::from_millis(file.shutdown_grace_ms),
            pattern_learning: file.pattern_learning,
            actions,
            triggers,
            monitoring: file.monitoring,
            backup: file.backup,
            logging: file.logging,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::resolve(file)
    }

    /// Load from `path`, or the first default location that exists, then
    /// apply environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::read(p)?,
            None => {
                let mut candidates = vec![PathBuf::from(CONFIG_FILE_NAME)];
                if let Some(home) = dirs::home_dir() {
                    candidates.push(home.join(".config/resilience/config.toml"));
                }
                match candidates.iter().find(|p| p.is_file()) {
                    Some(p) => Self::read(p)?,
                    None => {
                        debug!("No config file found, using defaults");
                        Self::default()
                    }
                }
            }
        };

        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        info!(path = %path.display(), "Loaded configuration");
        Self::from_toml_str(&content)
    }

    /// Apply `RESILIENCE_*` overrides using `lookup` to read variables.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("RESILIENCE_ENABLED") {
            match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.enabled = true,
                "0" | "false" | "no" | "off" => self.enabled = false,
                _ => {}
            }
        }
        if let Some(n) = lookup("RESILIENCE_MAX_CONCURRENT").and_then(|v| v.parse().ok()) {
            self.max_concurrent_recoveries = n;
        }
        if let Some(dir) = lookup("RESILIENCE_STORAGE") {
            if !dir.is_empty() {
                self.backup.storage_location = PathBuf::from(dir);
            }
        }
        if let Some(name) = lookup("RESILIENCE_BACKUP_PASSPHRASE_ENV") {
            if !name.is_empty() {
                self.backup.passphrase_env = Some(name);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_recoveries == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_recoveries must be at least 1".into(),
            ));
        }
        if self.recovery_timeout.is_zero() {
            return Err(ConfigError::Invalid("recovery_timeout_ms must be > 0".into()));
        }
        let pl = &self.pattern_learning;
        if !(0.0..=1.0).contains(&pl.confidence_threshold) {
            return Err(ConfigError::Invalid(format!(
                "pattern_learning.confidence_threshold {} outside [0, 1]",
                pl.confidence_threshold
            )));
        }
        if !(0.0..=1.0).contains(&pl.adaptation_rate) {
            return Err(ConfigError::Invalid(format!(
                "pattern_learning.adaptation_rate {} outside [0, 1]",
                pl.adaptation_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.monitoring.alert_threshold) {
            return Err(ConfigError::Invalid(format!(
                "monitoring.alert_threshold {} outside [0, 1]",
                self.monitoring.alert_threshold
            )));
        }
        if self.monitoring.health_check_interval_ms == 0 || self.monitoring.probe_timeout_ms == 0
        {
            return Err(ConfigError::Invalid(
                "monitoring intervals must be > 0".into(),
            ));
        }

        for (kind, action) in &self.actions {
            if !(1..=10).contains(&action.priority) {
                return Err(ConfigError::Invalid(format!(
                    "strategies.{}.priority {} outside 1..=10",
                    kind, action.priority
                )));
            }
            if !(1..=10).contains(&action.resource_cost) {
                return Err(ConfigError::Invalid(format!(
                    "strategies.{}.resource_cost {} outside 1..=10",
                    kind, action.resource_cost
                )));
            }
            if action.timeout_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "strategies.{}.timeout_ms must be > 0",
                    kind
                )));
            }
            if action.max_attempts == 0 {
                return Err(ConfigError::Invalid(format!(
                    "strategies.{}.max_attempts must be > 0",
                    kind
                )));
            }
            if action.prerequisites.contains(kind) {
                return Err(ConfigError::Invalid(format!(
                    "strategies.{} lists itself as a prerequisite",
                    kind
                )));
            }
        }
        Ok(())
    }

    pub fn action(&self, kind: ActionKind) -> ActionConfig {
        self.actions
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| ActionConfig::defaults_for(kind))
    }

    pub fn trigger(&self, kind: TriggerKind) -> TriggerConfig {
        self.triggers
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| TriggerConfig::defaults_for(kind))
    }

    /// Builder-style override of the storage root.
    pub fn with_storage(mut self, root: impl Into<PathBuf>) -> Self {
        self.backup.storage_location = root.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ResilienceConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_concurrent_recoveries, 3);
        assert_eq!(config.recovery_timeout, Duration::from_secs(300));
        assert_eq!(config.actions.len(), ActionKind::ALL.len());
        assert_eq!(config.triggers.len(), TriggerKind::ALL.len());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_file_matches_defaults() {
        let config = ResilienceConfig::from_toml_str("").unwrap();
        assert_eq!(config, ResilienceConfig::default());
    }

    #[test]
    fn test_example_config_parses() {
        let config =
            ResilienceConfig::from_toml_str(include_str!("../../resilience.example.toml")).unwrap();
        assert!(config.validate().is_ok());
        assert!(!config.action(ActionKind::EmergencyShutdown).enabled);
        assert_eq!(
            config.backup.storage_location,
            PathBuf::from("/var/lib/resilience")
        );
    }

    #[test]
    fn test_partial_action_override_keeps_other_fields() {
        let config = ResilienceConfig::from_toml_str(
            r#"
            [strategies.restart]
            timeout_ms = 500

            [strategies.clear-cache]
            enabled = false
        "#,
        )
        .unwrap();
        let restart = config.action(ActionKind::Restart);
        assert_eq!(restart.timeout_ms, 500);
        assert_eq!(
            restart.priority,
            ActionConfig::defaults_for(ActionKind::Restart).priority
        );
        assert!(!config.action(ActionKind::ClearCache).enabled);
    }

    #[test]
    fn test_trigger_override() {
        let config = ResilienceConfig::from_toml_str(
            r#"
            [triggers.memory_pressure]
            max_triggers_per_hour = 3
            cooldown_ms = 0
        "#,
        )
        .unwrap();
        let trigger = config.trigger(TriggerKind::MemoryPressure);
        assert_eq!(trigger.max_triggers_per_hour, 3);
        assert_eq!(trigger.cooldown_ms, 0);
        assert!(trigger.enabled);
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = ResilienceConfig::from_toml_str("[strategies.reboot]\nenabled = true").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnknownKey {
                section: "strategies",
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_toml() {
        let err = ResilienceConfig::from_toml_str("max_concurrent_recoveries = \"lots\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_validate_rejects_bad_priority() {
        let config = ResilienceConfig::from_toml_str("[strategies.restart]\npriority = 11").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = ResilienceConfig::from_toml_str("max_concurrent_recoveries = 0").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_rate() {
        let config = ResilienceConfig::from_toml_str(
            "[pattern_learning]\nadaptation_rate = 1.5",
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ResilienceConfig::default();
        let env: HashMap<&str, &str> = [
            ("RESILIENCE_ENABLED", "false"),
            ("RESILIENCE_MAX_CONCURRENT", "7"),
            ("RESILIENCE_STORAGE", "/var/lib/resilience"),
            ("RESILIENCE_BACKUP_PASSPHRASE_ENV", "BACKUP_PASS"),
        ]
        .into_iter()
        .collect();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert!(!config.enabled);
        assert_eq!(config.max_concurrent_recoveries, 7);
        assert_eq!(
            config.backup.storage_location,
            PathBuf::from("/var/lib/resilience")
        );
        assert_eq!(config.backup.passphrase_env.as_deref(), Some("BACKUP_PASS"));
    }

    #[test]
    fn test_env_override_ignores_garbage() {
        let mut config = ResilienceConfig::default();
        config.apply_env_overrides(|k| match k {
            "RESILIENCE_MAX_CONCURRENT" => Some("many".into()),
            "RESILIENCE_ENABLED" => Some("maybe".into()),
            _ => None,
        });
        assert_eq!(config.max_concurrent_recoveries, 3);
        assert!(config.enabled);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = ResilienceConfig::load(Some(Path::new("/nonexistent/resilience.toml")));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resilience.toml");
        std::fs::write(
            &path,
            r#"
            max_concurrent_recoveries = 2

            [backup]
            retention_days = 3
            encryption = false
        "#,
        )
        .unwrap();
        let config = ResilienceConfig::load(Some(&path)).unwrap();
        assert_eq!(config.max_concurrent_recoveries, 2);
        assert_eq!(config.backup.retention_days, 3);
        assert!(!config.backup.encryption);
        assert!(config.backup.compression);
    }
}
