//! Integrity checking and sibling-based repair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::codec;
use super::store::{validate_structure, BackupStore};
use super::{BackupOptions, BackupType, DataBackup};
use crate::errors::BackupError;
use crate::recovery::types::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityStatus {
    Valid,
    Corrupted,
    Missing,
    /// Could not be decided (key unavailable, storage error)
    Unknown,
}

/// Result of checking one backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityCheck {
    pub backup_id: String,
    pub component: String,
    pub data_type: String,
    pub status: IntegrityStatus,
    pub severity: Severity,
    pub expected_checksum: String,
    pub actual_checksum: Option<String>,
    pub message: Option<String>,
    /// Another verified, restorable backup of the same series exists
    pub auto_repairable: bool,
    pub repair_attempted: bool,
    pub repair_succeeded: Option<bool>,
    pub replacement_id: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl IntegrityCheck {
    fn new(backup: &DataBackup, status: IntegrityStatus, severity: Severity) -> Self {
        Self {
            backup_id: backup.id.clone(),
            component: backup.component.clone(),
            data_type: backup.data_type.clone(),
            status,
            severity,
            expected_checksum: backup.checksum.clone(),
            actual_checksum: None,
            message: None,
            auto_repairable: false,
            repair_attempted: false,
            repair_succeeded: None,
            replacement_id: None,
            checked_at: Utc::now(),
        }
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn is_damaged(&self) -> bool {
        matches!(
            self.status,
            IntegrityStatus::Corrupted | IntegrityStatus::Missing
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub generated_at: DateTime<Utc>,
    pub checks: Vec<IntegrityCheck>,
    pub total: usize,
    pub valid: usize,
    pub corrupted: usize,
    pub missing: usize,
    pub unknown: usize,
    /// Share of checked backups that are corrupted or missing, 0 to 100
    pub corruption_percentage: f64,
}

impl IntegrityReport {
    pub fn from_checks(checks: Vec<IntegrityCheck>) -> Self {
        let count = |s: IntegrityStatus| checks.iter().filter(|c| c.status == s).count();
        let total = checks.len();
        let (valid, corrupted, missing, unknown) = (
            count(IntegrityStatus::Valid),
            count(IntegrityStatus::Corrupted),
            count(IntegrityStatus::Missing),
            count(IntegrityStatus::Unknown),
        );
        let corruption_percentage = if total == 0 {
            0.0
        } else {
            (corrupted + missing) as f64 / total as f64 * 100.0
        };
        Self {
            generated_at: Utc::now(),
            checks,
            total,
            valid,
            corrupted,
            missing,
            unknown,
            corruption_percentage,
        }
    }

    /// `component/data_type` of every damaged backup, deduplicated.
    pub fn affected(&self) -> Vec<String> {
        let mut affected: Vec<String> = self
            .checks
            .iter()
            .filter(|c| c.is_damaged())
            .map(|c| format!("{}/{}", c.component, c.data_type))
            .collect();
        affected.sort();
        affected.dedup();
        affected
    }

    pub fn is_clean(&self) -> bool {
        self.corrupted == 0 && self.missing == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOptions {
    pub component: Option<String>,
    /// Also rebuild and structurally validate every payload
    pub deep: bool,
    /// Repair damaged backups from a sibling where possible
    pub repair: bool,
}

impl BackupStore {
    /// Check one backup against its recorded checksum.
    pub fn check_backup(&self, id: &str, deep: bool) -> Result<IntegrityCheck, BackupError> {
        let backup = self
            .get(id)
            .ok_or_else(|| BackupError::NotFound(id.to_string()))?;
        let mut check = self.check_entry(&backup, deep);
        if check.is_damaged() {
            check.auto_repairable = self.repair_source(&backup).is_some();
        }
        Ok(check)
    }

    fn check_entry(&self, backup: &DataBackup, deep: bool) -> IntegrityCheck {
        let _guard = self.locks.acquire(&[backup.id.as_str()]);

        match self.read_plain(backup) {
            Ok(_) if deep => self.deep_check(backup),
            Ok(_) => IntegrityCheck::new(backup, IntegrityStatus::Valid, Severity::None),
            Err(e) => classify_failure(backup, e),
        }
    }

    /// Rebuild the full payload and validate its shape. The entry's own lock
    /// is already held; ancestors are read without further locking.
    fn deep_check(&self, backup: &DataBackup) -> IntegrityCheck {
        let result = self
            .chain(&backup.id)
            .and_then(|chain| self.materialize(&chain))
            .and_then(|payload| validate_structure(backup, &payload));
        match result {
            Ok(()) => IntegrityCheck::new(backup, IntegrityStatus::Valid, Severity::None),
            Err(e @ BackupError::StructureInvalid { .. }) => {
                IntegrityCheck::new(backup, IntegrityStatus::Corrupted, Severity::Medium)
                    .with_message(e.to_string())
            }
            Err(e) => {
                let mut check = classify_failure(backup, e);
                check.message = check
                    .message
                    .map(|m| format!("chain of {}: {}", backup.id, m));
                check
            }
        }
    }

    /// Newest verified sibling whose chain does not pass through `backup`.
    fn repair_candidates(&self, backup: &DataBackup) -> Vec<DataBackup> {
        self.restorable_candidates(&backup.component, Some(&backup.data_type), Some(&backup.id))
            .into_iter()
            .filter(|candidate| {
                self.chain(&candidate.id)
                    .map(|chain| chain.iter().all(|b| b.id != backup.id))
                    .unwrap_or(false)
            })
            .collect()
    }

    fn repair_source(&self, backup: &DataBackup) -> Option<DataBackup> {
        self.repair_candidates(backup).into_iter().next()
    }

    /// Replace a damaged backup with a full copy of its best sibling under a
    /// new id. Backups chained on the damaged one become unrestorable.
    pub fn repair(&self, id: &str) -> Result<DataBackup, BackupError> {
        let damaged = self
            .get(id)
            .ok_or_else(|| BackupError::NotFound(id.to_string()))?;

        for sibling in self.repair_candidates(&damaged) {
            let chain = self.chain(&sibling.id)?;
            let mut lock_ids: Vec<&str> = chain.iter().map(|b| b.id.as_str()).collect();
            lock_ids.push(id);
            let _guards = self.locks.acquire(&lock_ids);

            let Some(current) = self.get(id) else {
                return Err(BackupError::NotFound(id.to_string()));
            };
            let payload = match self.materialize(&chain) {
                Ok(p) => p,
                Err(e) => {
                    warn!(backup_id = %sibling.id, error = %e, "Repair source unreadable, trying next");
                    self.mark_unverified(&sibling.id);
                    continue;
                }
            };

            let options = BackupOptions::default();
            let (mut replacement, stored) = self.write_verified(
                &current.component,
                &current.data_type,
                BackupType::Full,
                None,
                &payload,
                codec::top_level_keys(&payload),
                current.timestamp,
                &options,
            )?;
            replacement.replicas = self.replicate(&replacement.location, &stored);

            let orphaned = self.update_registry(|registry| {
                registry.remove(id);
                let mut orphaned = Vec::new();
                for entry in registry.values_mut() {
                    if entry.parent_id.as_deref() == Some(id) {
                        entry.restorable = false;
                        orphaned.push(entry.id.clone());
                    }
                }
                registry.insert(replacement.id.clone(), replacement.clone());
                orphaned
            })?;

            if let Err(e) = self.blobs().remove(&current.location) {
                warn!(backup_id = %id, error = %e, "Failed to remove damaged backup file");
            }
            if !orphaned.is_empty() {
                warn!(backup_id = %id, orphaned = ?orphaned, "Dependent backups marked unrestorable");
            }
            info!(
                damaged = %id,
                replacement = %replacement.id,
                source = %sibling.id,
                "Backup repaired from sibling"
            );
            return Ok(replacement);
        }

        Err(BackupError::NoRepairSource {
            backup_id: id.to_string(),
        })
    }

    /// Check every backup (or one component's), record the outcome in the
    /// registry, and optionally repair what is damaged.
    pub fn scan(&self, options: &ScanOptions) -> IntegrityReport {
        let targets = self.list(options.component.as_deref());
        let mut checks: Vec<IntegrityCheck> = targets
            .iter()
            .map(|b| self.check_entry(b, options.deep))
            .collect();

        let recorded = self.update_registry(|registry| {
            for check in &checks {
                if let Some(entry) = registry.get_mut(&check.backup_id) {
                    match check.status {
                        IntegrityStatus::Valid => entry.verified = true,
                        IntegrityStatus::Corrupted | IntegrityStatus::Missing => {
                            entry.verified = false
                        }
                        IntegrityStatus::Unknown => {}
                    }
                }
            }
        });
        if let Err(e) = recorded {
            warn!(error = %e, "Failed to record integrity results");
        }

        for check in checks.iter_mut().filter(|c| c.is_damaged()) {
            let Some(backup) = targets.iter().find(|b| b.id == check.backup_id) else {
                continue;
            };
            check.auto_repairable = self.repair_source(backup).is_some();
            if !(options.repair && check.auto_repairable) {
                continue;
            }
            check.repair_attempted = true;
            match self.repair(&check.backup_id) {
                Ok(replacement) => {
                    check.repair_succeeded = Some(true);
                    check.replacement_id = Some(replacement.id);
                }
                Err(e) => {
                    check.repair_succeeded = Some(false);
                    check.message = Some(e.to_string());
                }
            }
        }

        let report = IntegrityReport::from_checks(checks);
        info!(
            total = report.total,
            corrupted = report.corrupted,
            missing = report.missing,
            unknown = report.unknown,
            corruption_percentage = report.corruption_percentage,
            "Integrity scan finished"
        );
        report
    }

    /// Persist a report under `reports/`. Returns its location.
    pub fn write_report(&self, report: &IntegrityReport) -> Result<PathBuf, BackupError> {
        let rel = Path::new("reports").join(format!(
            "integrity-{}.json",
            report.generated_at.format("%Y%m%dT%H%M%S%.3fZ")
        ));
        let json = serde_json::to_vec_pretty(report)?;
        self.blobs()
            .write_atomic(&rel, &json)
            .map_err(|e| BackupError::storage(self.blobs().locate(&rel), e))?;
        Ok(self.blobs().locate(&rel))
    }
}

fn classify_failure(backup: &DataBackup, err: BackupError) -> IntegrityCheck {
    match err {
        BackupError::FileMissing { .. } => {
            IntegrityCheck::new(backup, IntegrityStatus::Missing, Severity::Critical)
                .with_message(err.to_string())
        }
        BackupError::ChecksumMismatch { ref actual, .. } => {
            let mut check =
                IntegrityCheck::new(backup, IntegrityStatus::Corrupted, Severity::High);
            check.actual_checksum = Some(actual.clone());
            check.with_message(err.to_string())
        }
        e if e.is_corruption() => {
            IntegrityCheck::new(backup, IntegrityStatus::Corrupted, Severity::High)
                .with_message(e.to_string())
        }
        e => IntegrityCheck::new(backup, IntegrityStatus::Unknown, Severity::Medium)
            .with_message(e.to_string()),
    }
}
