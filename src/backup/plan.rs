//! Staged recovery plans driven by corruption level.

use serde::{Deserialize, Serialize};

use super::integrity::IntegrityReport;
use super::store::BackupStore;
use super::BackupType;

const MINOR_CORRUPTION: f64 = 10.0;
const SEVERE_CORRUPTION: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    IntegrityRepair,
    BackupRestore,
    DataRebuild,
    Verification,
    Cleanup,
}

impl StepKind {
    /// Estimated duration in seconds.
    pub fn estimate_secs(self) -> u64 {
        match self {
            StepKind::IntegrityRepair => 30,
            StepKind::BackupRestore => 120,
            StepKind::DataRebuild => 600,
            StepKind::Verification => 60,
            StepKind::Cleanup => 15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataLossRisk {
    None,
    Minimal,
    Moderate,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStep {
    pub order: usize,
    pub kind: StepKind,
    pub description: String,
    pub estimated_secs: u64,
    /// Affected `component/data_type` entries
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub steps: Vec<RecoveryStep>,
    pub total_estimated_secs: u64,
    pub data_loss_risk: DataLossRisk,
    pub approval_required: bool,
    pub corruption_percentage: f64,
}

impl RecoveryPlan {
    pub fn first_step(&self) -> Option<StepKind> {
        self.steps.first().map(|s| s.kind)
    }
}

/// Build a plan for `corruption_percentage` (0 to 100) over `affected` data.
pub fn generate_plan(
    corruption_percentage: f64,
    affected: &[String],
    has_verified_backup: bool,
    has_full_backup: bool,
) -> RecoveryPlan {
    let mut staged: Vec<(StepKind, &str)> = Vec::new();
    let mut approval_required = false;

    let risk = if corruption_percentage < MINOR_CORRUPTION {
        staged.push((StepKind::IntegrityRepair, "Repair corrupted entries in place"));
        DataLossRisk::None
    } else if corruption_percentage < SEVERE_CORRUPTION {
        if has_verified_backup {
            staged.push((StepKind::BackupRestore, "Restore from the best verified backup"));
            DataLossRisk::Minimal
        } else {
            staged.push((StepKind::DataRebuild, "Rebuild data from scratch"));
            DataLossRisk::Moderate
        }
    } else {
        approval_required = true;
        if has_full_backup {
            staged.push((StepKind::BackupRestore, "Restore from the latest full backup"));
        } else {
            staged.push((StepKind::DataRebuild, "Rebuild all data from scratch"));
        }
        DataLossRisk::High
    };

    staged.push((StepKind::Verification, "Verify restored data integrity"));
    staged.push((StepKind::Cleanup, "Remove corrupted artifacts"));

    let steps: Vec<RecoveryStep> = staged
        .into_iter()
        .enumerate()
        .map(|(i, (kind, description))| RecoveryStep {
            order: i + 1,
            kind,
            description: description.to_string(),
            estimated_secs: kind.estimate_secs(),
            targets: affected.to_vec(),
        })
        .collect();

    RecoveryPlan {
        total_estimated_secs: steps.iter().map(|s| s.estimated_secs).sum(),
        steps,
        data_loss_risk: risk,
        approval_required,
        corruption_percentage,
    }
}

impl BackupStore {
    /// Plan recovery of the damage found by `report`, given the backups on hand.
    pub fn plan_for_report(&self, report: &IntegrityReport) -> RecoveryPlan {
        let damaged: Vec<&str> = report
            .checks
            .iter()
            .filter(|c| c.is_damaged())
            .map(|c| c.backup_id.as_str())
            .collect();
        let healthy: Vec<_> = self
            .list(None)
            .into_iter()
            .filter(|b| b.verified && b.restorable && !damaged.contains(&b.id.as_str()))
            .collect();
        let has_full = healthy.iter().any(|b| b.backup_type == BackupType::Full);
        generate_plan(
            report.corruption_percentage,
            &report.affected(),
            !healthy.is_empty(),
            has_full,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn affected() -> Vec<String> {
        vec!["db/state".to_string()]
    }

    #[test]
    fn test_minor_corruption_repairs_in_place() {
        let plan = generate_plan(5.0, &affected(), false, false);
        assert_eq!(plan.first_step(), Some(StepKind::IntegrityRepair));
        assert_eq!(plan.data_loss_risk, DataLossRisk::None);
        assert!(!plan.approval_required);
        assert_eq!(plan.total_estimated_secs, 30 + 60 + 15);
    }

    #[test]
    fn test_moderate_corruption_prefers_backup() {
        let plan = generate_plan(30.0, &affected(), true, false);
        assert_eq!(plan.first_step(), Some(StepKind::BackupRestore));
        assert_eq!(plan.data_loss_risk, DataLossRisk::Minimal);

        let plan = generate_plan(30.0, &affected(), false, false);
        assert_eq!(plan.first_step(), Some(StepKind::DataRebuild));
        assert_eq!(plan.data_loss_risk, DataLossRisk::Moderate);
    }

    #[test]
    fn test_severe_corruption_needs_approval() {
        let plan = generate_plan(70.0, &affected(), true, true);
        assert!(plan.approval_required);
        assert_eq!(plan.data_loss_risk, DataLossRisk::High);
        assert_eq!(plan.first_step(), Some(StepKind::BackupRestore));

        let plan = generate_plan(70.0, &affected(), true, false);
        assert_eq!(plan.first_step(), Some(StepKind::DataRebuild));
    }

    #[test]
    fn test_boundaries() {
        assert_eq!(
            generate_plan(10.0, &[], true, true).first_step(),
            Some(StepKind::BackupRestore)
        );
        assert!(generate_plan(50.0, &[], true, true).approval_required);
        assert!(!generate_plan(49.9, &[], true, true).approval_required);
    }

    #[test]
    fn test_always_ends_with_verification_and_cleanup() {
        for pct in [0.0, 25.0, 90.0] {
            let plan = generate_plan(pct, &affected(), false, false);
            let kinds: Vec<StepKind> = plan.steps.iter().map(|s| s.kind).collect();
            assert_eq!(&kinds[kinds.len() - 2..], &[StepKind::Verification, StepKind::Cleanup]);
            assert_eq!(
                plan.total_estimated_secs,
                plan.steps.iter().map(|s| s.estimated_secs).sum::<u64>()
            );
            assert_eq!(plan.steps[0].order, 1);
        }
    }
}
