//! At-rest encryption for backup payloads and the key files behind it.
//!
//! Keys live under `<root>/keys/`. Either a random 256-bit key file
//! (`backup.key`) is generated on first use, or the key is derived from a
//! passphrase (PBKDF2-HMAC-SHA256) with a persisted random salt
//! (`backup.salt`). During rotation the outgoing material is kept as
//! `*.prev` so backups written under either key stay readable.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

use super::blob::BlobStore;
use crate::errors::BackupError;

const NONCE_LEN: usize = 12;
const SALT_LEN: usize = 16;
pub const PBKDF2_ROUNDS: u32 = 100_000;

const KEY_FILE: &str = "keys/backup.key";
const SALT_FILE: &str = "keys/backup.salt";

/// AES-256-GCM cipher bound to one key.
#[derive(Clone)]
pub struct BackupCipher {
    key: [u8; 32],
    id: String,
}

impl fmt::Debug for BackupCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupCipher").field("id", &self.id).finish()
    }
}

impl BackupCipher {
    pub fn from_key(key: [u8; 32]) -> Self {
        let id = hex::encode(Sha256::digest(key))[..16].to_string();
        Self { key, id }
    }

    pub fn from_passphrase(passphrase: &str, salt: &[u8]) -> Self {
        let mut key = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
        Self::from_key(key)
    }

    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::rng().fill_bytes(&mut key);
        Self::from_key(key)
    }

    /// Short identifier recorded on every backup written with this key.
    pub fn key_id(&self) -> &str {
        &self.id
    }

    /// Encrypt with a fresh random nonce, prepended to the ciphertext.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, BackupError> {
        let cipher = Aes256Gcm::new(&self.key.into());

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| BackupError::Encryption(format!("encryption failed: {}", e)))?;

        let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, BackupError> {
        if data.len() < NONCE_LEN {
            return Err(BackupError::Encryption("encrypted data too short".into()));
        }
        let cipher = Aes256Gcm::new(&self.key.into());
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| BackupError::Encryption(format!("decryption failed: {}", e)))
    }
}

/// Where key material comes from.
#[derive(Clone)]
pub enum KeySource {
    KeyFile,
    Passphrase(String),
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyFile => f.write_str("KeyFile"),
            Self::Passphrase(_) => f.write_str("Passphrase(..)"),
        }
    }
}

impl KeySource {
    /// Passphrase from the named environment variable, else a key file.
    pub fn from_env(var: Option<&str>) -> Result<Self, BackupError> {
        match var {
            None => Ok(Self::KeyFile),
            Some(name) => std::env::var(name)
                .ok()
                .filter(|v| !v.is_empty())
                .map(Self::Passphrase)
                .ok_or_else(|| {
                    BackupError::Encryption(format!(
                        "passphrase variable {} is not set",
                        name
                    ))
                }),
        }
    }

    fn material_file(&self) -> &'static str {
        match self {
            Self::KeyFile => KEY_FILE,
            Self::Passphrase(_) => SALT_FILE,
        }
    }

    fn material_len(&self) -> usize {
        match self {
            Self::KeyFile => 32,
            Self::Passphrase(_) => SALT_LEN,
        }
    }

    fn cipher_from(&self, material: &[u8]) -> Result<BackupCipher, BackupError> {
        match self {
            Self::KeyFile => {
                let key: [u8; 32] = material
                    .try_into()
                    .map_err(|_| BackupError::Encryption("key file has wrong length".into()))?;
                Ok(BackupCipher::from_key(key))
            }
            Self::Passphrase(pass) => Ok(BackupCipher::from_passphrase(pass, material)),
        }
    }
}

/// Current key plus, mid-rotation, the previous one.
#[derive(Debug, Clone)]
pub struct KeyRing {
    source: KeySource,
    current: BackupCipher,
    previous: Option<BackupCipher>,
}

impl KeyRing {
    /// Load key material from `blobs`, creating it on first use.
    pub fn load_or_create(blobs: &dyn BlobStore, source: KeySource) -> Result<Self, BackupError> {
        let rel = PathBuf::from(source.material_file());
        let current = match read_material(blobs, &rel, source.material_len())? {
            Some(material) => source.cipher_from(&material)?,
            None => {
                let material = random_bytes(source.material_len());
                write_material(blobs, &rel, &material)?;
                let cipher = source.cipher_from(&material)?;
                info!(key_id = %cipher.key_id(), "Created backup encryption key");
                cipher
            }
        };

        let prev_rel = prev_path(&rel);
        // A crash between saving `.prev` and writing new material leaves two
        // copies of the same key; that is not a rotation in progress.
        let previous = read_material(blobs, &prev_rel, source.material_len())?
            .map(|m| source.cipher_from(&m))
            .transpose()?
            .filter(|prev| prev.key_id() != current.key_id());

        Ok(Self {
            source,
            current,
            previous,
        })
    }

    pub fn current(&self) -> &BackupCipher {
        &self.current
    }

    pub fn cipher_for(&self, key_id: &str) -> Option<&BackupCipher> {
        if self.current.key_id() == key_id {
            return Some(&self.current);
        }
        self.previous.as_ref().filter(|c| c.key_id() == key_id)
    }

    /// Key id of an unfinished rotation's outgoing key.
    pub fn previous_key_id(&self) -> Option<&str> {
        self.previous.as_ref().map(|c| c.key_id())
    }

    /// Persist fresh key material, keeping the outgoing material as `.prev`.
    /// Returns the ring to re-encrypt with; call [`KeyRing::finish_rotation`]
    /// once every backup has been rewritten.
    ///
    /// Fails while a previous rotation is unfinished, since `.prev` can only
    /// hold one key.
    pub fn begin_rotation(&self, blobs: &dyn BlobStore) -> Result<KeyRing, BackupError> {
        if let Some(prev) = self.previous_key_id() {
            return Err(BackupError::Encryption(format!(
                "key {} from an unfinished rotation is still held",
                prev
            )));
        }
        let rel = PathBuf::from(self.source.material_file());
        let old = blobs
            .read(&rel)
            .map_err(|e| BackupError::storage(blobs.locate(&rel), e))?;
        write_material_raw(blobs, &prev_path(&rel), &old)?;

        let material = random_bytes(self.source.material_len());
        write_material(blobs, &rel, &material)?;
        let current = self.source.cipher_from(&material)?;
        info!(
            old_key_id = %self.current.key_id(),
            new_key_id = %current.key_id(),
            "Rotating backup encryption key"
        );
        Ok(KeyRing {
            source: self.source.clone(),
            current,
            previous: Some(self.current.clone()),
        })
    }

    pub fn finish_rotation(&mut self, blobs: &dyn BlobStore) -> Result<(), BackupError> {
        let prev = prev_path(Path::new(self.source.material_file()));
        blobs
            .remove(&prev)
            .map_err(|e| BackupError::storage(blobs.locate(&prev), e))?;
        self.previous = None;
        Ok(())
    }
}

fn prev_path(rel: &Path) -> PathBuf {
    let mut s = rel.as_os_str().to_owned();
    s.push(".prev");
    PathBuf::from(s)
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::rng().fill_bytes(&mut buf);
    buf
}

fn read_material(
    blobs: &dyn BlobStore,
    rel: &Path,
    len: usize,
) -> Result<Option<Vec<u8>>, BackupError> {
    if !blobs.exists(rel) {
        return Ok(None);
    }
    let raw = blobs
        .read(rel)
        .map_err(|e| BackupError::storage(blobs.locate(rel), e))?;
    let text = String::from_utf8_lossy(&raw);
    let material = hex::decode(text.trim())
        .map_err(|e| BackupError::Encryption(format!("unreadable key material: {}", e)))?;
    if material.len() != len {
        return Err(BackupError::Encryption(format!(
            "key material at {:?} has wrong length",
            blobs.locate(rel)
        )));
    }
    Ok(Some(material))
}

fn write_material(blobs: &dyn BlobStore, rel: &Path, material: &[u8]) -> Result<(), BackupError> {
    write_material_raw(blobs, rel, hex::encode(material).as_bytes())
}

fn write_material_raw(blobs: &dyn BlobStore, rel: &Path, raw: &[u8]) -> Result<(), BackupError> {
    blobs
        .write_private(rel, raw)
        .map_err(|e| BackupError::storage(blobs.locate(rel), e))
}
