//! Checkpoint persistence: atomic JSON snapshots plus a manifest.

use crate::error::{RecipeError, Result};
use crate::model::Optimizer;
use crate::module::Module;
use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

const MANIFEST: &str = "checkpoints.json";

/// Anything that can contribute a serializable snapshot to a checkpoint.
pub trait Checkpointable: Send {
    fn state_dict(&self) -> Result<Value>;
}

impl<M: Module + ?Sized> Checkpointable for Arc<Mutex<M>> {
    fn state_dict(&self) -> Result<Value> {
        let guard = self
            .lock()
            .map_err(|e| RecipeError::poisoned("module", e))?;
        Ok(guard.state_dict())
    }
}

/// Shared optimizer handle, as held by classifier recipes.
pub struct OptimizerHandle(pub Arc<Mutex<Box<dyn Optimizer>>>);

impl Checkpointable for OptimizerHandle {
    fn state_dict(&self) -> Result<Value> {
        let guard = self
            .0
            .lock()
            .map_err(|e| RecipeError::poisoned("optimizer", e))?;
        Ok(guard.state_dict())
    }
}

impl Checkpointable for Value {
    fn state_dict(&self) -> Result<Value> {
        Ok(self.clone())
    }
}

/// One saved snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: String,
    pub name: String,
    pub epoch: i64,
    pub iters: i64,
    pub path: PathBuf,
    pub hash: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Writes snapshots under `base_dir` and keeps at most `max_checkpoints`.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    base_dir: PathBuf,
    max_checkpoints: usize,
}

impl CheckpointManager {
    pub fn new(base_dir: impl Into<PathBuf>, max_checkpoints: usize) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_checkpoints: max_checkpoints.max(1),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// All records, oldest first.
    pub fn list(&self) -> Result<Vec<CheckpointRecord>> {
        Ok(load_json(&self.base_dir.join(MANIFEST))?.unwrap_or_default())
    }

    pub fn latest(&self) -> Result<Option<CheckpointRecord>> {
        Ok(self.list()?.pop())
    }

    /// Write `payload` to `base_dir/name` and record it in the manifest.
    ///
    /// Records beyond `max_checkpoints` are dropped oldest-first together
    /// with their files.
    pub fn save(&self, name: &str, epoch: i64, iters: i64, payload: &Value) -> Result<CheckpointRecord> {
        let path = self.base_dir.join(name);
        let bytes = serde_json::to_vec_pretty(payload)?;
        atomic_write(&path, &bytes)?;

        let hash = format!("{:x}", Sha256::digest(&bytes));
        let record = CheckpointRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            epoch,
            iters,
            path: path.clone(),
            hash,
            size_bytes: bytes.len() as u64,
            created_at: Utc::now(),
        };

        let mut records = self.list()?;
        // Saving under an existing name replaces that record.
        records.retain(|r| r.path != path);
        records.push(record.clone());
        while records.len() > self.max_checkpoints {
            let evicted = records.remove(0);
            if evicted.path.exists() {
                std::fs::remove_file(&evicted.path)?;
            }
            debug!(path = %evicted.path.display(), "Evicted checkpoint");
        }
        atomic_write_json(&self.base_dir.join(MANIFEST), &records)?;

        info!(path = %path.display(), epoch, iters, "Checkpoint saved");
        Ok(record)
    }

    /// Read back a snapshot by file name.
    pub fn load(&self, name: &str) -> Result<Value> {
        let path = self.base_dir.join(name);
        load_json(&path)?.ok_or_else(|| RecipeError::not_found(format!("checkpoint {}", path.display())))
    }
}

/// Atomically write JSON data to a file (tmp sibling, then rename).
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    atomic_write(path, json.as_bytes())
}

/// Atomically write raw bytes, creating parent directories as needed.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load JSON from `path`; `Ok(None)` if the file does not exist.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}
