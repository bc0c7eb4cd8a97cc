//! Backup store: create, verify, restore, delete, retention, key rotation.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::blob::{BlobStore, FsBlobStore};
use super::codec::{self, ObjectDelta};
use super::encryption::{BackupCipher, KeyRing, KeySource};
use super::retention::RetentionPolicy;
use super::{BackupOptions, BackupType, DataBackup, RestoreOptions};
use crate::config::BackupConfig;
use crate::errors::BackupError;

const REGISTRY_FILE: &str = "registry.json";
const REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    backups: Vec<DataBackup>,
}

/// Per-backup-id mutexes. Multi-id acquisition happens in sorted order.
#[derive(Default)]
pub(crate) struct IdLocks {
    map: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl IdLocks {
    /// Hold the returned value for the length of the critical section.
    pub(crate) fn acquire<S: AsRef<str>>(&self, ids: &[S]) -> impl Sized {
        let sorted: BTreeSet<&str> = ids.iter().map(|s| s.as_ref()).collect();
        let handles: Vec<Arc<Mutex<()>>> = {
            let mut map = self.map.lock();
            sorted
                .iter()
                .map(|id| map.entry(id.to_string()).or_default().clone())
                .collect()
        };
        handles.iter().map(|m| m.lock_arc()).collect::<Vec<_>>()
    }

    fn forget(&self, id: &str) {
        self.map.lock().remove(id);
    }
}

pub struct BackupStore {
    config: BackupConfig,
    blobs: Arc<dyn BlobStore>,
    replicas: Vec<FsBlobStore>,
    registry: RwLock<HashMap<String, DataBackup>>,
    keys: RwLock<Option<KeyRing>>,
    key_source: Option<KeySource>,
    pub(crate) locks: IdLocks,
}

impl BackupStore {
    /// Open the filesystem store at `config.storage_location`.
    pub fn open(config: BackupConfig) -> Result<Self, BackupError> {
        let blobs = Arc::new(FsBlobStore::new(config.storage_location.clone()));
        Self::with_blob_store(config, blobs)
    }

    pub fn with_blob_store(
        config: BackupConfig,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Self, BackupError> {
        let registry = load_registry(blobs.as_ref())?;
        let replicas = config.replicas.iter().map(FsBlobStore::new).collect();
        info!(
            root = %blobs.locate(Path::new("")).display(),
            backups = registry.len(),
            "Opened backup store"
        );
        Ok(Self {
            config,
            blobs,
            replicas,
            registry: RwLock::new(registry),
            keys: RwLock::new(None),
            key_source: None,
            locks: IdLocks::default(),
        })
    }

    /// Use an explicit key source instead of `backup.passphrase_env`.
    pub fn with_key_source(mut self, source: KeySource) -> Self {
        self.key_source = Some(source);
        self
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn root(&self) -> PathBuf {
        self.blobs.locate(Path::new(""))
    }

    pub(crate) fn blobs(&self) -> &dyn BlobStore {
        self.blobs.as_ref()
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn get(&self, id: &str) -> Option<DataBackup> {
        self.registry.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.registry.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.read().is_empty()
    }

    /// Registered backups, newest first.
    pub fn list(&self, component: Option<&str>) -> Vec<DataBackup> {
        let mut backups: Vec<DataBackup> = self
            .registry
            .read()
            .values()
            .filter(|b| component.map(|c| b.component == c).unwrap_or(true))
            .cloned()
            .collect();
        backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        backups
    }

    pub(crate) fn restorable_candidates(
        &self,
        component: &str,
        data_type: Option<&str>,
        exclude: Option<&str>,
    ) -> Vec<DataBackup> {
        self.list(Some(component))
            .into_iter()
            .filter(|b| b.restorable && b.verified)
            .filter(|b| data_type.map(|t| b.data_type == t).unwrap_or(true))
            .filter(|b| Some(b.id.as_str()) != exclude)
            .collect()
    }

    /// Newest verified, restorable backup of a component.
    pub fn latest_restorable(
        &self,
        component: &str,
        data_type: Option<&str>,
        exclude: Option<&str>,
    ) -> Option<DataBackup> {
        self.restorable_candidates(component, data_type, exclude)
            .into_iter()
            .next()
    }

    /// Restorable backup whose timestamp is closest to `target`.
    pub fn nearest_restorable(
        &self,
        component: &str,
        data_type: Option<&str>,
        target: DateTime<Utc>,
    ) -> Option<DataBackup> {
        self.restorable_candidates(component, data_type, None)
            .into_iter()
            .min_by_key(|b| (b.timestamp - target).num_milliseconds().abs())
    }

    /// Ids of backups whose parent is `id`.
    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        self.registry
            .read()
            .values()
            .filter(|b| b.parent_id.as_deref() == Some(id))
            .map(|b| b.id.clone())
            .collect()
    }

    /// The chain from the root full backup down to `id`.
    pub(crate) fn chain(&self, id: &str) -> Result<Vec<DataBackup>, BackupError> {
        let registry = self.registry.read();
        let mut chain = Vec::new();
        let mut cursor = Some(id.to_string());
        while let Some(current) = cursor {
            let entry = registry
                .get(&current)
                .ok_or_else(|| BackupError::NotFound(current.clone()))?;
            if chain.iter().any(|b: &DataBackup| b.id == entry.id) {
                return Err(BackupError::StructureInvalid {
                    backup_id: id.to_string(),
                    message: "cycle in backup chain".into(),
                });
            }
            cursor = entry.parent_id.clone();
            chain.push(entry.clone());
        }
        chain.reverse();
        Ok(chain)
    }

    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Serialize, checksum, encode and atomically write `payload`, verify the
    /// written file, then register it. A backup that fails verification is
    /// removed and never registered.
    pub fn create_backup(
        &self,
        component: &str,
        data_type: &str,
        payload: &Value,
        options: BackupOptions,
    ) -> Result<DataBackup, BackupError> {
        let (backup_type, parent, document) =
            self.prepare_document(component, data_type, payload, options.backup_type)?;

        let (mut entry, stored) = self
            .write_verified(
                component,
                data_type,
                backup_type,
                parent,
                &document,
                codec::top_level_keys(payload),
                Utc::now(),
                &options,
            )
            .map_err(|e| match e {
                e @ BackupError::VerificationFailed { .. } => e,
                other => BackupError::CreationFailed {
                    component: component.to_string(),
                    data_type: data_type.to_string(),
                    message: other.to_string(),
                },
            })?;

        if options.replicate {
            entry.replicas = self.replicate(&entry.location, &stored);
        }
        self.register(entry.clone())?;
        info!(
            backup_id = %entry.id,
            component = %component,
            data_type = %data_type,
            backup_type = ?entry.backup_type,
            size = entry.size,
            "Backup created"
        );

        if !options.skip_retention {
            if let Err(e) = self.enforce_retention(component, data_type) {
                warn!(component = %component, data_type = %data_type, error = %e, "Retention enforcement failed");
            }
        }
        Ok(entry)
    }

    fn prepare_document(
        &self,
        component: &str,
        data_type: &str,
        payload: &Value,
        requested: BackupType,
    ) -> Result<(BackupType, Option<String>, Value), BackupError> {
        if requested == BackupType::Full || !payload.is_object() {
            return Ok((BackupType::Full, None, payload.clone()));
        }

        let base = match requested {
            BackupType::Differential => self
                .restorable_candidates(component, Some(data_type), None)
                .into_iter()
                .find(|b| b.backup_type == BackupType::Full),
            _ => self.latest_restorable(component, Some(data_type), None),
        };
        let Some(base) = base else {
            debug!(component = %component, "No base backup, writing a full backup instead");
            return Ok((BackupType::Full, None, payload.clone()));
        };

        let base_payload = self.restore(
            &base.id,
            RestoreOptions {
                verify: false,
                validate_structure: false,
            },
        )?;
        match ObjectDelta::between(&base_payload, payload) {
            Some(delta) => Ok((requested, Some(base.id), serde_json::to_value(delta)?)),
            None => Ok((BackupType::Full, None, payload.clone())),
        }
    }

    /// Write one document and verify it by reading it back. Not registered.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn write_verified(
        &self,
        component: &str,
        data_type: &str,
        backup_type: BackupType,
        parent_id: Option<String>,
        document: &Value,
        payload_keys: Option<Vec<String>>,
        timestamp: DateTime<Utc>,
        options: &BackupOptions,
    ) -> Result<(DataBackup, Vec<u8>), BackupError> {
        let bytes = serde_json::to_vec(document)?;
        let checksum = codec::checksum(&bytes);
        let compressed = options.compress.unwrap_or(self.config.compression);
        let encrypted = options.encrypt.unwrap_or(self.config.encryption);
        let ring = if encrypted { Some(self.keyring()?) } else { None };
        let cipher = ring.as_ref().map(|r| r.current());
        let stored = codec::encode(&bytes, compressed, cipher)?;

        let id = Uuid::new_v4().to_string();
        let location = PathBuf::from("data")
            .join(path_segment(component))
            .join(timestamp.format("%Y-%m-%d").to_string())
            .join(format!("{}.bak", id));
        self.blobs
            .write_atomic(&location, &stored)
            .map_err(|e| BackupError::storage(self.blobs.locate(&location), e))?;

        if let Err(e) = self.verify_written(&location, compressed, cipher, &checksum) {
            warn!(backup_id = %id, error = %e, "Post-write verification failed, discarding backup");
            if let Err(rm) = self.blobs.remove(&location) {
                warn!(backup_id = %id, error = %rm, "Failed to remove unverified backup file");
            }
            return Err(BackupError::VerificationFailed {
                backup_id: id,
                message: e.to_string(),
            });
        }

        let entry = DataBackup {
            id,
            timestamp,
            backup_type,
            component: component.to_string(),
            data_type: data_type.to_string(),
            location,
            size: stored.len() as u64,
            checksum,
            compressed,
            encrypted,
            key_id: cipher.map(|c| c.key_id().to_string()),
            verified: true,
            restorable: true,
            parent_id,
            payload_keys,
            replicas: Vec::new(),
        };
        Ok((entry, stored))
    }

    fn verify_written(
        &self,
        location: &Path,
        compressed: bool,
        cipher: Option<&BackupCipher>,
        expected: &str,
    ) -> Result<(), BackupError> {
        let read_back = self
            .blobs
            .read(location)
            .map_err(|e| BackupError::storage(self.blobs.locate(location), e))?;
        let plain = codec::decode(&read_back, compressed, cipher)?;
        let actual = codec::checksum(&plain);
        if actual != expected {
            return Err(BackupError::ChecksumMismatch {
                backup_id: location.display().to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }

    pub(crate) fn replicate(&self, location: &Path, stored: &[u8]) -> Vec<PathBuf> {
        let mut written = Vec::new();
        for replica in &self.replicas {
            match replica.write_atomic(location, stored) {
                Ok(()) => written.push(replica.root().to_path_buf()),
                Err(e) => warn!(
                    replica = %replica.root().display(),
                    error = %e,
                    "Replica write failed"
                ),
            }
        }
        written
    }

    pub(crate) fn register(&self, entry: DataBackup) -> Result<(), BackupError> {
        self.update_registry(|registry| {
            registry.insert(entry.id.clone(), entry);
        })
    }

    /// Apply `f` to the registry and persist the result. If the registry
    /// file cannot be written the in-memory change is undone, so memory never
    /// runs ahead of disk.
    pub(crate) fn update_registry<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, DataBackup>) -> T,
    ) -> Result<T, BackupError> {
        let mut registry = self.registry.write();
        let before = registry.clone();
        let out = f(&mut registry);
        if let Err(e) = self.save_registry(&registry) {
            *registry = before;
            return Err(e);
        }
        Ok(out)
    }

    fn save_registry(&self, registry: &HashMap<String, DataBackup>) -> Result<(), BackupError> {
        let mut backups: Vec<DataBackup> = registry.values().cloned().collect();
        backups.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        let json = serde_json::to_vec_pretty(&RegistryFile {
            version: REGISTRY_VERSION,
            backups,
        })?;
        let rel = Path::new(REGISTRY_FILE);
        self.blobs
            .write_atomic(rel, &json)
            .map_err(|e| BackupError::storage(self.blobs.locate(rel), e))
    }

    // ------------------------------------------------------------------
    // Restore
    // ------------------------------------------------------------------

    /// Read back a payload. A checksum mismatch anywhere in the chain is a
    /// hard failure; partially trusted data is never returned.
    pub fn restore(&self, id: &str, options: RestoreOptions) -> Result<Value, BackupError> {
        let ids: Vec<String> = self.chain(id)?.into_iter().map(|b| b.id).collect();
        let _guards = self.locks.acquire(&ids);

        // Re-read under the locks; a concurrent repair may have replaced entries.
        let chain = self.chain(id)?;
        let Some(target) = chain.last() else {
            return Err(BackupError::NotFound(id.to_string()));
        };
        if !target.restorable {
            return Err(BackupError::VerificationFailed {
                backup_id: id.to_string(),
                message: "backup is marked unrestorable".into(),
            });
        }

        let payload = match self.materialize(&chain) {
            Ok(p) => p,
            Err(e) => {
                if options.verify {
                    if let BackupError::ChecksumMismatch { backup_id, .. } = &e {
                        self.mark_unverified(backup_id);
                    }
                }
                return Err(e);
            }
        };

        if options.validate_structure {
            validate_structure(target, &payload)?;
        }
        debug!(backup_id = %id, chain_len = chain.len(), "Backup restored");
        Ok(payload)
    }

    /// Rebuild the full payload of the last element of `chain`.
    /// Callers hold the id locks for the chain.
    pub(crate) fn materialize(&self, chain: &[DataBackup]) -> Result<Value, BackupError> {
        let mut iter = chain.iter();
        let root = iter
            .next()
            .ok_or_else(|| BackupError::NotFound("empty chain".into()))?;
        let mut value = self.read_document(root)?;
        for link in iter {
            let delta: ObjectDelta = serde_json::from_value(self.read_document(link)?)?;
            value = delta
                .apply(&value)
                .map_err(|message| BackupError::StructureInvalid {
                    backup_id: link.id.clone(),
                    message,
                })?;
        }
        Ok(value)
    }

    /// Read, decode and checksum one stored document.
    pub(crate) fn read_document(&self, backup: &DataBackup) -> Result<Value, BackupError> {
        let plain = self.read_plain(backup)?;
        Ok(serde_json::from_slice(&plain)?)
    }

    pub(crate) fn read_plain(&self, backup: &DataBackup) -> Result<Vec<u8>, BackupError> {
        if !self.blobs.exists(&backup.location) {
            return Err(BackupError::FileMissing {
                backup_id: backup.id.clone(),
                path: self.blobs.locate(&backup.location),
            });
        }
        let stored = self
            .blobs
            .read(&backup.location)
            .map_err(|e| BackupError::storage(self.blobs.locate(&backup.location), e))?;

        let ring = if backup.encrypted {
            Some(self.keyring()?)
        } else {
            None
        };
        let cipher = match (&ring, &backup.key_id) {
            (Some(ring), Some(key_id)) => {
                Some(ring.cipher_for(key_id).ok_or_else(|| BackupError::KeyUnavailable {
                    backup_id: backup.id.clone(),
                    key_id: key_id.clone(),
                })?)
            }
            (Some(ring), None) => Some(ring.current()),
            (None, _) => None,
        };

        let plain = codec::decode(&stored, backup.compressed, cipher).map_err(|e| {
            BackupError::ChecksumMismatch {
                backup_id: backup.id.clone(),
                expected: backup.checksum.clone(),
                actual: format!("undecodable ({})", e),
            }
        })?;
        let actual = codec::checksum(&plain);
        if actual != backup.checksum {
            return Err(BackupError::ChecksumMismatch {
                backup_id: backup.id.clone(),
                expected: backup.checksum.clone(),
                actual,
            });
        }
        Ok(plain)
    }

    pub(crate) fn mark_unverified(&self, id: &str) {
        let result = self.update_registry(|registry| {
            if let Some(entry) = registry.get_mut(id) {
                entry.verified = false;
            }
        });
        if let Err(e) = result {
            warn!(backup_id = %id, error = %e, "Failed to record verification failure");
        }
    }

    // ------------------------------------------------------------------
    // Delete & retention
    // ------------------------------------------------------------------

    /// Remove a backup and its files. Refuses while incremental backups
    /// still depend on it.
    pub fn delete_backup(&self, id: &str) -> Result<DataBackup, BackupError> {
        let _guard = self.locks.acquire(&[id]);
        let removed = {
            let mut registry = self.registry.write();
            let entry = registry
                .get(id)
                .cloned()
                .ok_or_else(|| BackupError::NotFound(id.to_string()))?;
            let dependents: Vec<String> = registry
                .values()
                .filter(|b| b.parent_id.as_deref() == Some(id))
                .map(|b| b.id.clone())
                .collect();
            if !dependents.is_empty() {
                return Err(BackupError::HasDependents {
                    backup_id: id.to_string(),
                    dependents,
                });
            }
            self.blobs
                .remove(&entry.location)
                .map_err(|e| BackupError::storage(self.blobs.locate(&entry.location), e))?;
            registry.remove(id);
            self.save_registry(&registry)?;
            entry
        };

        for replica in &self.replicas {
            if let Err(e) = replica.remove(&removed.location) {
                warn!(replica = %replica.root().display(), error = %e, "Failed to remove replica copy");
            }
        }
        self.locks.forget(id);
        debug!(backup_id = %id, "Backup deleted");
        Ok(removed)
    }

    /// Apply the retention policy to one series. Returns evicted ids.
    pub fn enforce_retention(
        &self,
        component: &str,
        data_type: &str,
    ) -> Result<Vec<String>, BackupError> {
        let series: Vec<DataBackup> = self
            .list(Some(component))
            .into_iter()
            .filter(|b| b.data_type == data_type)
            .collect();
        let policy = RetentionPolicy::from_config(&self.config);
        let evictions = policy.evictions(&series, Utc::now());

        let mut evicted = Vec::new();
        // Newest first so children go before their parents.
        for id in evictions.iter().rev() {
            match self.delete_backup(id) {
                Ok(_) => evicted.push(id.clone()),
                Err(e) => warn!(backup_id = %id, error = %e, "Could not evict backup"),
            }
        }
        if !evicted.is_empty() {
            info!(
                component = %component,
                data_type = %data_type,
                evicted = evicted.len(),
                "Retention evicted backups"
            );
        }
        Ok(evicted)
    }

    /// Retention over every series. Returns the number of evicted backups.
    pub fn enforce_all_retention(&self) -> usize {
        let series: BTreeSet<(String, String)> = self
            .registry
            .read()
            .values()
            .map(|b| (b.component.clone(), b.data_type.clone()))
            .collect();
        series
            .iter()
            .map(|(component, data_type)| {
                self.enforce_retention(component, data_type)
                    .map(|v| v.len())
                    .unwrap_or(0)
            })
            .sum()
    }

    // ------------------------------------------------------------------
    // Keys
    // ------------------------------------------------------------------

    fn keyring(&self) -> Result<KeyRing, BackupError> {
        if let Some(ring) = self.keys.read().as_ref() {
            return Ok(ring.clone());
        }
        let mut slot = self.keys.write();
        if let Some(ring) = slot.as_ref() {
            return Ok(ring.clone());
        }
        let source = match &self.key_source {
            Some(source) => source.clone(),
            None => KeySource::from_env(self.config.passphrase_env.as_deref())?,
        };
        let ring = KeyRing::load_or_create(self.blobs.as_ref(), source)?;
        *slot = Some(ring.clone());
        Ok(ring)
    }

    /// Generate a new key and re-encrypt every encrypted backup with it.
    ///
    /// The previous key is retained until no registered backup uses it. If
    /// some backups could not be rewritten the call fails with
    /// [`BackupError::RotationIncomplete`]; calling it again retries those
    /// backups under the same new key instead of generating another one.
    pub fn rotate_key(&self) -> Result<KeyRotation, BackupError> {
        let ring = self.keyring()?;
        let (mut ring, outgoing, resumed) = match ring.previous_key_id() {
            Some(prev) => {
                let prev = prev.to_string();
                info!(key_id = %prev, "Resuming unfinished key rotation");
                (ring, prev, true)
            }
            None => {
                let outgoing = ring.current().key_id().to_string();
                let next = ring.begin_rotation(self.blobs.as_ref())?;
                *self.keys.write() = Some(next.clone());
                (next, outgoing, false)
            }
        };

        let rewritten = self.rewrite_key(&outgoing, ring.current())?;

        let pending: Vec<String> = self
            .list(None)
            .into_iter()
            .filter(|b| b.encrypted && b.key_id.as_deref() == Some(outgoing.as_str()))
            .map(|b| b.id)
            .collect();
        if !pending.is_empty() {
            warn!(
                key_id = %outgoing,
                pending = pending.len(),
                rewritten,
                "Some backups still use the previous key; keeping it"
            );
            return Err(BackupError::RotationIncomplete {
                key_id: outgoing,
                pending,
            });
        }

        ring.finish_rotation(self.blobs.as_ref())?;
        *self.keys.write() = Some(ring.clone());
        let key_id = ring.current().key_id().to_string();
        info!(rewritten, new_key_id = %key_id, resumed, "Key rotation finished");
        Ok(KeyRotation {
            key_id,
            rewritten,
            resumed,
        })
    }

    /// Re-encrypt every backup still under `outgoing`. Per-backup failures
    /// are logged and leave that backup on the old key; a registry write
    /// failure aborts.
    fn rewrite_key(&self, outgoing: &str, cipher: &BackupCipher) -> Result<usize, BackupError> {
        let stale: Vec<String> = self
            .list(None)
            .into_iter()
            .filter(|b| b.encrypted && b.key_id.as_deref() == Some(outgoing))
            .map(|b| b.id)
            .collect();

        let mut rewritten = 0;
        for id in &stale {
            let _guard = self.locks.acquire(&[id.as_str()]);
            let Some(entry) = self.get(id) else { continue };
            if entry.key_id.as_deref() != Some(outgoing) {
                continue;
            }
            let (updated, stored) = match self.reencrypt(&entry, cipher) {
                Ok(done) => done,
                Err(e) => {
                    warn!(backup_id = %id, error = %e, "Could not re-encrypt backup");
                    continue;
                }
            };

            let committed = self.update_registry(|registry| {
                registry.insert(updated.id.clone(), updated.clone());
            });
            if let Err(e) = committed {
                if let Err(rm) = self.blobs.remove(&updated.location) {
                    debug!(error = %rm, "Could not remove uncommitted re-encrypted copy");
                }
                return Err(e);
            }

            for replica in &self.replicas {
                if let Err(e) = replica.write_atomic(&updated.location, &stored) {
                    warn!(replica = %replica.root().display(), error = %e, "Replica re-encryption failed");
                }
                if let Err(e) = replica.remove(&entry.location) {
                    debug!(replica = %replica.root().display(), error = %e, "Old replica copy not removed");
                }
            }
            if let Err(e) = self.blobs.remove(&entry.location) {
                warn!(backup_id = %id, error = %e, "Failed to remove backup file under the previous key");
            }
            rewritten += 1;
        }
        Ok(rewritten)
    }

    /// Write `entry` re-encrypted under `cipher` next to the original. The
    /// original stays in place until the registry points at the new file.
    fn reencrypt(
        &self,
        entry: &DataBackup,
        cipher: &BackupCipher,
    ) -> Result<(DataBackup, Vec<u8>), BackupError> {
        let plain = self.read_plain(entry)?;
        let stored = codec::encode(&plain, entry.compressed, Some(cipher))?;
        let location = entry
            .location
            .with_file_name(format!("{}.{}.bak", entry.id, cipher.key_id()));
        self.blobs
            .write_atomic(&location, &stored)
            .map_err(|e| BackupError::storage(self.blobs.locate(&location), e))?;
        if let Err(e) = self.verify_written(&location, entry.compressed, Some(cipher), &entry.checksum) {
            if let Err(rm) = self.blobs.remove(&location) {
                debug!(error = %rm, "Could not remove unverified re-encrypted copy");
            }
            return Err(e);
        }
        let updated = DataBackup {
            location,
            key_id: Some(cipher.key_id().to_string()),
            size: stored.len() as u64,
            ..entry.clone()
        };
        Ok((updated, stored))
    }
}

/// Outcome of a completed [`BackupStore::rotate_key`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KeyRotation {
    pub key_id: String,
    pub rewritten: usize,
    /// Finished a rotation an earlier call left incomplete.
    pub resumed: bool,
}

fn load_registry(blobs: &dyn BlobStore) -> Result<HashMap<String, DataBackup>, BackupError> {
    let rel = Path::new(REGISTRY_FILE);
    if !blobs.exists(rel) {
        return Ok(HashMap::new());
    }
    let raw = blobs
        .read(rel)
        .map_err(|e| BackupError::storage(blobs.locate(rel), e))?;
    let file: RegistryFile = serde_json::from_slice(&raw)?;
    Ok(file
        .backups
        .into_iter()
        .map(|b| (b.id.clone(), b))
        .collect())
}

/// Require a non-null payload with the recorded top-level shape.
pub(crate) fn validate_structure(backup: &DataBackup, payload: &Value) -> Result<(), BackupError> {
    if payload.is_null() {
        return Err(BackupError::StructureInvalid {
            backup_id: backup.id.clone(),
            message: "payload is null".into(),
        });
    }
    if let Some(expected) = &backup.payload_keys {
        let actual = codec::top_level_keys(payload).unwrap_or_default();
        if &actual != expected {
            return Err(BackupError::StructureInvalid {
                backup_id: backup.id.clone(),
                message: format!("top-level keys {:?}, expected {:?}", actual, expected),
            });
        }
    }
    Ok(())
}

/// Component names become directory names; keep them to a safe alphabet.
fn path_segment(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
