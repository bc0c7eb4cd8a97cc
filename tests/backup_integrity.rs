//! Backup store durability: verified writes, checksum-guarded restores,
//! integrity scans, sibling repair and plan routing.

use resilience::backup::blob::{BlobStore, FsBlobStore};
use resilience::backup::encryption::KeySource;
use resilience::backup::integrity::IntegrityStatus;
use resilience::backup::plan::{generate_plan, DataLossRisk, StepKind};
use resilience::backup::{BackupOptions, BackupType, RestoreOptions, ScanOptions};
use resilience::config::BackupConfig;
use resilience::{BackupError, BackupStore};
use serde_json::json;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Flips every byte of payload files on the way to disk.
struct BitRot(FsBlobStore);

impl BlobStore for BitRot {
    fn write_atomic(&self, rel: &Path, data: &[u8]) -> io::Result<()> {
        if rel.extension().is_some_and(|e| e == "bak") {
            let rotten: Vec<u8> = data.iter().map(|b| !b).collect();
            self.0.write_atomic(rel, &rotten)
        } else {
            self.0.write_atomic(rel, data)
        }
    }

    fn read(&self, rel: &Path) -> io::Result<Vec<u8>> {
        self.0.read(rel)
    }

    fn exists(&self, rel: &Path) -> bool {
        self.0.exists(rel)
    }

    fn remove(&self, rel: &Path) -> io::Result<()> {
        self.0.remove(rel)
    }

    fn locate(&self, rel: &Path) -> PathBuf {
        self.0.locate(rel)
    }
}

/// Fails payload or registry writes on demand, like a full disk.
#[derive(Default)]
struct Flaky {
    inner: Option<FsBlobStore>,
    fail_payloads: AtomicBool,
    fail_registry: AtomicBool,
}

impl Flaky {
    fn at(dir: &Path) -> Arc<Self> {
        Arc::new(Self {
            inner: Some(FsBlobStore::new(dir)),
            ..Self::default()
        })
    }

    fn fs(&self) -> &FsBlobStore {
        self.inner.as_ref().unwrap()
    }

    fn heal(&self) {
        self.fail_payloads.store(false, Ordering::SeqCst);
        self.fail_registry.store(false, Ordering::SeqCst);
    }
}

impl BlobStore for Flaky {
    fn write_atomic(&self, rel: &Path, data: &[u8]) -> io::Result<()> {
        let is_payload = rel.extension().is_some_and(|e| e == "bak");
        let is_registry = rel == Path::new("registry.json");
        if (is_payload && self.fail_payloads.load(Ordering::SeqCst))
            || (is_registry && self.fail_registry.load(Ordering::SeqCst))
        {
            return Err(io::Error::other("disk full"));
        }
        self.fs().write_atomic(rel, data)
    }

    fn read(&self, rel: &Path) -> io::Result<Vec<u8>> {
        self.fs().read(rel)
    }

    fn exists(&self, rel: &Path) -> bool {
        self.fs().exists(rel)
    }

    fn remove(&self, rel: &Path) -> io::Result<()> {
        self.fs().remove(rel)
    }

    fn locate(&self, rel: &Path) -> PathBuf {
        self.fs().locate(rel)
    }
}

fn store(dir: &Path) -> BackupStore {
    BackupStore::open(BackupConfig::at(dir)).unwrap()
}

fn state(version: u64) -> serde_json::Value {
    json!({
        "version": version,
        "rows": [{ "id": 1, "name": "alpha" }, { "id": 2, "name": "beta" }],
        "token": "s3cret-marker",
    })
}

fn corrupt_on_disk(store: &BackupStore, id: &str) {
    let backup = store.get(id).unwrap();
    std::fs::write(store.root().join(&backup.location), b"not a backup").unwrap();
}

#[test]
fn test_encrypted_round_trip_hides_plaintext() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());

    let backup = store
        .create_backup("db", "state", &state(1), BackupOptions::default())
        .unwrap();
    assert!(backup.verified && backup.restorable);
    assert!(backup.encrypted && backup.compressed);

    let on_disk = std::fs::read(store.root().join(&backup.location)).unwrap();
    let needle = b"s3cret-marker";
    assert!(!on_disk.windows(needle.len()).any(|w| w == needle));

    let restored = store.restore(&backup.id, RestoreOptions::default()).unwrap();
    assert_eq!(restored, state(1));
}

#[test]
fn test_registry_reloads_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let id = {
        let store = store(dir.path());
        store
            .create_backup("db", "state", &state(1), BackupOptions::default())
            .unwrap()
            .id
    };

    let reopened = store(dir.path());
    assert_eq!(reopened.len(), 1);
    assert_eq!(
        reopened.restore(&id, RestoreOptions::default()).unwrap(),
        state(1)
    );
}

#[test]
fn test_incremental_chain_restores_latest_state() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    store
        .create_backup("db", "state", &state(1), BackupOptions::default())
        .unwrap();
    let delta = store
        .create_backup(
            "db",
            "state",
            &state(2),
            BackupOptions::of_type(BackupType::Incremental),
        )
        .unwrap();

    assert_eq!(delta.backup_type, BackupType::Incremental);
    assert!(delta.parent_id.is_some());
    assert_eq!(
        store.restore(&delta.id, RestoreOptions::default()).unwrap(),
        state(2)
    );
}

#[test]
fn test_write_that_fails_verification_is_never_registered() {
    let dir = tempfile::tempdir().unwrap();
    let blobs = Arc::new(BitRot(FsBlobStore::new(dir.path())));
    let store = BackupStore::with_blob_store(BackupConfig::at(dir.path()), blobs).unwrap();

    let err = store
        .create_backup("db", "state", &state(1), BackupOptions::default())
        .unwrap_err();
    assert!(matches!(err, BackupError::VerificationFailed { .. }), "{err}");
    assert!(store.is_empty());
    assert!(store.latest_restorable("db", Some("state"), None).is_none());
}

#[test]
fn test_corrupted_file_refuses_restore() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let backup = store
        .create_backup("db", "state", &state(1), BackupOptions::default())
        .unwrap();
    corrupt_on_disk(&store, &backup.id);

    let err = store
        .restore(&backup.id, RestoreOptions::default())
        .unwrap_err();
    assert!(matches!(err, BackupError::ChecksumMismatch { .. }), "{err}");
    assert!(!store.get(&backup.id).unwrap().verified);
}

#[test]
fn test_scan_repairs_from_sibling() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let older = store
        .create_backup("db", "state", &state(1), BackupOptions::default())
        .unwrap();
    let newer = store
        .create_backup("db", "state", &state(2), BackupOptions::default())
        .unwrap();
    corrupt_on_disk(&store, &newer.id);

    let report = store.scan(&ScanOptions::default());
    assert_eq!(report.total, 2);
    assert_eq!(report.corrupted, 1);
    assert_eq!(report.corruption_percentage, 50.0);
    assert_eq!(report.affected(), vec!["db/state"]);
    let damaged = report.checks.iter().find(|c| c.is_damaged()).unwrap();
    assert_eq!(damaged.backup_id, newer.id);
    assert!(damaged.auto_repairable);

    let report = store.scan(&ScanOptions {
        repair: true,
        ..ScanOptions::default()
    });
    let repaired = report
        .checks
        .iter()
        .find(|c| c.backup_id == newer.id)
        .unwrap();
    assert_eq!(repaired.repair_succeeded, Some(true));
    let replacement = repaired.replacement_id.clone().unwrap();

    assert!(store.get(&newer.id).is_none());
    assert_eq!(
        store.restore(&replacement, RestoreOptions::default()).unwrap(),
        state(1)
    );
    assert!(store.get(&older.id).unwrap().verified);
    assert!(store.scan(&ScanOptions::default()).is_clean());
}

#[test]
fn test_missing_file_without_sibling_is_not_repairable() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let backup = store
        .create_backup("cache", "index", &json!({ "keys": 10 }), BackupOptions::default())
        .unwrap();
    std::fs::remove_file(store.root().join(&backup.location)).unwrap();

    let report = store.scan(&ScanOptions {
        repair: true,
        ..ScanOptions::default()
    });
    assert_eq!(report.missing, 1);
    let check = &report.checks[0];
    assert_eq!(check.status, IntegrityStatus::Missing);
    assert!(!check.auto_repairable);
    assert_ne!(check.repair_succeeded, Some(true));
}

#[test]
fn test_plan_routes_by_corruption_level() {
    let affected = vec!["db/state".to_string()];

    let minor = generate_plan(5.0, &affected, true, true);
    assert_eq!(minor.first_step(), Some(StepKind::IntegrityRepair));
    assert_eq!(minor.data_loss_risk, DataLossRisk::None);
    assert!(!minor.approval_required);

    let moderate = generate_plan(30.0, &affected, true, true);
    assert_eq!(moderate.first_step(), Some(StepKind::BackupRestore));
    assert_eq!(moderate.data_loss_risk, DataLossRisk::Minimal);

    let rebuild = generate_plan(30.0, &affected, false, false);
    assert_eq!(rebuild.first_step(), Some(StepKind::DataRebuild));
    assert_eq!(rebuild.data_loss_risk, DataLossRisk::Moderate);

    let severe = generate_plan(70.0, &affected, true, true);
    assert_eq!(severe.first_step(), Some(StepKind::BackupRestore));
    assert_eq!(severe.data_loss_risk, DataLossRisk::High);
    assert!(severe.approval_required);

    for plan in [&minor, &moderate, &rebuild, &severe] {
        let kinds: Vec<StepKind> = plan.steps.iter().map(|s| s.kind).collect();
        assert_eq!(&kinds[1..], &[StepKind::Verification, StepKind::Cleanup]);
        assert_eq!(
            plan.total_estimated_secs,
            plan.steps.iter().map(|s| s.estimated_secs).sum::<u64>()
        );
    }
}

#[test]
fn test_plan_for_report_ignores_damaged_backups() {
    let dir = tempfile::tempdir().unwrap();
    let store = store(dir.path());
    let only = store
        .create_backup("db", "state", &state(1), BackupOptions::default())
        .unwrap();
    corrupt_on_disk(&store, &only.id);

    let report = store.scan(&ScanOptions::default());
    let plan = store.plan_for_report(&report);
    assert_eq!(plan.corruption_percentage, 100.0);
    assert_eq!(plan.first_step(), Some(StepKind::DataRebuild));
    assert!(plan.approval_required);
    assert_eq!(plan.steps[0].targets, vec!["db/state"]);
}

#[test]
fn test_partial_rotation_keeps_old_key_until_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let blobs = Flaky::at(dir.path());
    let store = BackupStore::with_blob_store(BackupConfig::at(dir.path()), blobs.clone()).unwrap();
    let backup = store
        .create_backup("db", "state", &state(1), BackupOptions::default())
        .unwrap();
    let old_key = backup.key_id.clone().unwrap();

    blobs.fail_payloads.store(true, Ordering::SeqCst);
    let err = store.rotate_key().unwrap_err();
    match &err {
        BackupError::RotationIncomplete { key_id, pending } => {
            assert_eq!(key_id, &old_key);
            assert_eq!(pending, &vec![backup.id.clone()]);
        }
        other => panic!("expected an incomplete rotation, got {other}"),
    }
    assert!(dir.path().join("keys/backup.key.prev").is_file());
    assert_eq!(store.restore(&backup.id, RestoreOptions::default()).unwrap(), state(1));

    // A second attempt finishes the first rotation rather than replacing the
    // key that the backup still depends on.
    blobs.heal();
    let rotation = store.rotate_key().unwrap();
    assert!(rotation.resumed);
    assert_eq!(rotation.rewritten, 1);
    assert!(!dir.path().join("keys/backup.key.prev").exists());

    let reopened = self::store(dir.path());
    let entry = reopened.get(&backup.id).unwrap();
    assert_eq!(entry.key_id.as_deref(), Some(rotation.key_id.as_str()));
    assert_eq!(reopened.restore(&backup.id, RestoreOptions::default()).unwrap(), state(1));
}

#[test]
fn test_rotation_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let blobs = Flaky::at(dir.path());
    let store = BackupStore::with_blob_store(BackupConfig::at(dir.path()), blobs.clone()).unwrap();
    let backup = store
        .create_backup("db", "state", &state(2), BackupOptions::default())
        .unwrap();

    blobs.fail_payloads.store(true, Ordering::SeqCst);
    assert!(matches!(
        store.rotate_key(),
        Err(BackupError::RotationIncomplete { .. })
    ));
    drop(store);

    let restarted = self::store(dir.path());
    assert_eq!(restarted.restore(&backup.id, RestoreOptions::default()).unwrap(), state(2));
    let rotation = restarted.rotate_key().unwrap();
    assert!(rotation.resumed);
    assert_eq!(rotation.rewritten, 1);
    assert_eq!(restarted.restore(&backup.id, RestoreOptions::default()).unwrap(), state(2));
}

#[test]
fn test_registry_failure_during_rotation_leaves_backup_readable() {
    let dir = tempfile::tempdir().unwrap();
    let blobs = Flaky::at(dir.path());
    let store = BackupStore::with_blob_store(BackupConfig::at(dir.path()), blobs.clone()).unwrap();
    let backup = store
        .create_backup("db", "state", &state(3), BackupOptions::default())
        .unwrap();

    blobs.fail_registry.store(true, Ordering::SeqCst);
    let err = store.rotate_key().unwrap_err();
    assert!(matches!(err, BackupError::Storage { .. }), "{err}");

    // Memory agrees with disk: still the old key and the old file.
    let entry = store.get(&backup.id).unwrap();
    assert_eq!(entry.key_id, backup.key_id);
    assert_eq!(entry.location, backup.location);
    assert_eq!(store.restore(&backup.id, RestoreOptions::default()).unwrap(), state(3));

    blobs.heal();
    let reopened = self::store(dir.path());
    assert_eq!(reopened.restore(&backup.id, RestoreOptions::default()).unwrap(), state(3));
    let report = reopened.scan(&ScanOptions::default());
    assert_eq!(report.checks[0].status, IntegrityStatus::Valid);

    let rotation = reopened.rotate_key().unwrap();
    assert!(rotation.resumed);
    assert_eq!(reopened.restore(&backup.id, RestoreOptions::default()).unwrap(), state(3));
}

#[test]
fn test_repeated_rotation_with_passphrase() {
    let dir = tempfile::tempdir().unwrap();
    let open = || {
        BackupStore::open(BackupConfig::at(dir.path()))
            .unwrap()
            .with_key_source(KeySource::Passphrase("correct horse".into()))
    };
    let store = open();
    let backup = store
        .create_backup("db", "state", &state(4), BackupOptions::default())
        .unwrap();

    let first = store.rotate_key().unwrap();
    let second = store.rotate_key().unwrap();
    assert_ne!(first.key_id, second.key_id);
    assert_eq!(second.rewritten, 1);
    assert!(dir.path().join("keys/backup.salt").is_file());
    assert!(!dir.path().join("keys/backup.salt.prev").exists());

    let reopened = open();
    assert_eq!(reopened.restore(&backup.id, RestoreOptions::default()).unwrap(), state(4));
}
