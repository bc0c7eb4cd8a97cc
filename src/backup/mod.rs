//! Verified backups
//!
//! Payloads are serialized, checksummed, optionally compressed and
//! encrypted, written atomically, then read back and verified before they
//! are registered. Only verified backups are ever restorable.
//!
//! Layout under the storage root:
//! - `registry.json`: every registered [`DataBackup`]
//! - `data/<component>/<YYYY-MM-DD>/<id>.bak`: payload files
//! - `reports/integrity-<ts>.json`: integrity scan reports
//! - `keys/`: encryption key material

pub mod blob;
pub mod codec;
pub mod encryption;
pub mod integrity;
pub mod plan;
pub mod retention;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use blob::{BlobStore, FsBlobStore};
pub use integrity::{IntegrityCheck, IntegrityReport, IntegrityStatus, ScanOptions};
pub use plan::{DataLossRisk, RecoveryPlan, RecoveryStep, StepKind};
pub use retention::{RetentionPolicy, RetentionTier};
pub use store::{BackupStore, KeyRotation};

/// Data type used for whole-component state snapshots.
pub const COMPONENT_STATE: &str = "state";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Full,
    /// Delta against the latest backup of the series
    Incremental,
    /// Delta against the latest full backup of the series
    Differential,
}

/// One registered backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataBackup {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub backup_type: BackupType,
    pub component: String,
    pub data_type: String,
    /// Payload file, relative to the storage root
    pub location: PathBuf,
    /// Bytes on disk
    pub size: u64,
    /// SHA-256 of the serialized document before compression/encryption
    pub checksum: String,
    pub compressed: bool,
    pub encrypted: bool,
    #[serde(default)]
    pub key_id: Option<String>,
    pub verified: bool,
    pub restorable: bool,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Top-level keys of the full payload, for structural validation
    #[serde(default)]
    pub payload_keys: Option<Vec<String>>,
    #[serde(default)]
    pub replicas: Vec<PathBuf>,
}

impl DataBackup {
    pub fn is_delta(&self) -> bool {
        self.backup_type != BackupType::Full
    }

    pub fn same_series(&self, component: &str, data_type: &str) -> bool {
        self.component == component && self.data_type == data_type
    }

    #[cfg(test)]
    pub(crate) fn test_entry(id: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            timestamp,
            backup_type: BackupType::Full,
            component: "db".to_string(),
            data_type: "state".to_string(),
            location: PathBuf::from(format!("data/db/{}.bak", id)),
            size: 0,
            checksum: String::new(),
            compressed: false,
            encrypted: false,
            key_id: None,
            verified: true,
            restorable: true,
            parent_id: None,
            payload_keys: None,
            replicas: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackupOptions {
    pub backup_type: BackupType,
    /// Overrides `backup.compression`
    pub compress: Option<bool>,
    /// Overrides `backup.encryption`
    pub encrypt: Option<bool>,
    pub replicate: bool,
    /// Skip retention enforcement after the write
    pub skip_retention: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            backup_type: BackupType::Full,
            compress: None,
            encrypt: None,
            replicate: true,
            skip_retention: false,
        }
    }
}

impl BackupOptions {
    pub fn of_type(backup_type: BackupType) -> Self {
        Self {
            backup_type,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Re-run the integrity check on every backup in the chain first
    pub verify: bool,
    /// Require the payload to have the recorded top-level shape
    pub validate_structure: bool,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            verify: true,
            validate_structure: true,
        }
    }
}
