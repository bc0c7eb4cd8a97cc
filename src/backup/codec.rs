//! Payload pipeline: checksum, zstd compression, encryption, and
//! top-level object deltas for incremental chains.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use super::encryption::BackupCipher;
use crate::errors::BackupError;

const ZSTD_LEVEL: i32 = 3;

/// SHA-256 of `bytes`, lowercase hex.
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Compress then encrypt, each step optional.
pub fn encode(
    plain: &[u8],
    compress: bool,
    cipher: Option<&BackupCipher>,
) -> Result<Vec<u8>, BackupError> {
    let stage = if compress {
        zstd::encode_all(plain, ZSTD_LEVEL).map_err(|e| BackupError::Compression(e.to_string()))?
    } else {
        plain.to_vec()
    };
    match cipher {
        Some(c) => c.encrypt(&stage),
        None => Ok(stage),
    }
}

/// Inverse of [`encode`].
pub fn decode(
    stored: &[u8],
    compressed: bool,
    cipher: Option<&BackupCipher>,
) -> Result<Vec<u8>, BackupError> {
    let stage = match cipher {
        Some(c) => c.decrypt(stored)?,
        None => stored.to_vec(),
    };
    if compressed {
        zstd::decode_all(stage.as_slice()).map_err(|e| BackupError::Compression(e.to_string()))
    } else {
        Ok(stage)
    }
}

/// Top-level keys of an object payload, sorted.
pub fn top_level_keys(payload: &Value) -> Option<Vec<String>> {
    payload.as_object().map(|m| {
        let keys: BTreeSet<&String> = m.keys().collect();
        keys.into_iter().cloned().collect()
    })
}

/// Changes between two object payloads at the top level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectDelta {
    pub set: Map<String, Value>,
    pub removed: Vec<String>,
}

impl ObjectDelta {
    /// Delta from `base` to `target`; `None` unless both are objects.
    pub fn between(base: &Value, target: &Value) -> Option<Self> {
        let (base, target) = (base.as_object()?, target.as_object()?);
        let set = target
            .iter()
            .filter(|(k, v)| base.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let removed = base
            .keys()
            .filter(|k| !target.contains_key(*k))
            .cloned()
            .collect();
        Some(Self { set, removed })
    }

    pub fn apply(&self, base: &Value) -> Result<Value, String> {
        let mut obj = base
            .as_object()
            .cloned()
            .ok_or_else(|| "delta base is not an object".to_string())?;
        for key in &self.removed {
            obj.remove(key);
        }
        for (k, v) in &self.set {
            obj.insert(k.clone(), v.clone());
        }
        Ok(Value::Object(obj))
    }
}
