//! Checkpoint store.

use crate::error::StorageError;
use parking_lot::RwLock;
use rstchart_core::Checkpoint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// When a running session writes checkpoints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointPolicy {
    /// Never checkpoint automatically.
    Never,
    /// Only when the session shuts down.
    OnShutdown,
    /// After every N non-empty macrosteps, and on shutdown.
    EveryNSteps(u64),
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        Self::OnShutdown
    }
}

impl CheckpointPolicy {
    /// Whether a checkpoint is due after `steps` macrosteps since the last one.
    pub fn is_due(&self, steps: u64) -> bool {
        match self {
            Self::EveryNSteps(n) => *n > 0 && steps >= *n,
            _ => false,
        }
    }

    pub fn on_shutdown(&self) -> bool {
        !matches!(self, Self::Never)
    }
}

/// Metadata kept in the index for every stored checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub checkpoint_id: String,
    pub session: String,
    pub model: String,
    pub model_checksum: String,
    /// Simulated time of the checkpoint.
    pub time: f64,
    pub created_at: i64,
    pub size_bytes: u64,
    /// CRC32C of the checkpoint file.
    pub checksum: String,
}

/// Persists interpreter checkpoints, grouped by session.
pub struct CheckpointStore {
    dir: PathBuf,
    /// Session -> checkpoints, oldest first.
    index: RwLock<BTreeMap<String, Vec<CheckpointMeta>>>,
}

impl CheckpointStore {
    /// Opens or creates a checkpoint store at the given directory.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let store = Self {
            dir,
            index: RwLock::new(BTreeMap::new()),
        };
        store.load_index()?;

        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn load_index(&self) -> Result<(), StorageError> {
        let index_path = self.dir.join("index.json");
        if !index_path.exists() {
            return Ok(());
        }

        let file = File::open(&index_path)?;
        let reader = BufReader::new(file);
        let index: BTreeMap<String, Vec<CheckpointMeta>> = serde_json::from_reader(reader)?;
        *self.index.write() = index;

        Ok(())
    }

    fn save_index(&self) -> Result<(), StorageError> {
        let index_path = self.dir.join("index.json");
        let file = File::create(&index_path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &*self.index.read())?;
        Ok(())
    }

    /// Stores a checkpoint as the newest one of `session`.
    pub fn save(&self, session: &str, checkpoint: &Checkpoint) -> Result<CheckpointMeta, StorageError> {
        let data = serde_json::to_vec_pretty(checkpoint)?;
        let checksum = format!("{:08x}", crc32c::crc32c(&data));

        let path = self.checkpoint_path(&checkpoint.id);
        let mut file = File::create(&path)?;
        file.write_all(&data)?;
        file.sync_all()?;

        let meta = CheckpointMeta {
            checkpoint_id: checkpoint.id.clone(),
            session: session.to_string(),
            model: checkpoint.model.clone(),
            model_checksum: checkpoint.checksum.clone(),
            time: checkpoint.time,
            created_at: checkpoint.created_at,
            size_bytes: data.len() as u64,
            checksum,
        };

        self.index
            .write()
            .entry(session.to_string())
            .or_default()
            .push(meta.clone());
        self.save_index()?;

        tracing::info!(
            "Saved checkpoint {} for session {} at t={}",
            checkpoint.id,
            session,
            checkpoint.time
        );

        Ok(meta)
    }

    /// Loads a checkpoint by ID, verifying its checksum when it is indexed.
    pub fn load(&self, checkpoint_id: &str) -> Result<Checkpoint, StorageError> {
        let path = self.checkpoint_path(checkpoint_id);
        if !path.exists() {
            return Err(StorageError::CheckpointNotFound(checkpoint_id.to_string()));
        }

        let mut file = File::open(&path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        if let Some(meta) = self.find(checkpoint_id) {
            let actual = format!("{:08x}", crc32c::crc32c(&data));
            if actual != meta.checksum {
                return Err(StorageError::Corruption(format!(
                    "checkpoint {} checksum mismatch",
                    checkpoint_id
                )));
            }
        }

        Ok(serde_json::from_slice(&data)?)
    }

    /// Newest checkpoint of a session.
    pub fn latest(&self, session: &str) -> Result<Option<Checkpoint>, StorageError> {
        let checkpoint_id = self
            .index
            .read()
            .get(session)
            .and_then(|metas| metas.last())
            .map(|m| m.checkpoint_id.clone());

        match checkpoint_id {
            Some(id) => Ok(Some(self.load(&id)?)),
            None => Ok(None),
        }
    }

    pub fn latest_meta(&self, session: &str) -> Option<CheckpointMeta> {
        self.index
            .read()
            .get(session)
            .and_then(|metas| metas.last().cloned())
    }

    /// Checkpoints of one session, oldest first.
    pub fn history(&self, session: &str) -> Vec<CheckpointMeta> {
        self.index.read().get(session).cloned().unwrap_or_default()
    }

    pub fn sessions(&self) -> Vec<String> {
        self.index.read().keys().cloned().collect()
    }

    pub fn list(&self) -> Vec<CheckpointMeta> {
        self.index.read().values().flatten().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.index.read().values().map(Vec::len).sum()
    }

    pub fn delete(&self, checkpoint_id: &str) -> Result<(), StorageError> {
        let path = self.checkpoint_path(checkpoint_id);
        if path.exists() {
            fs::remove_file(&path)?;
        }

        {
            let mut index = self.index.write();
            for metas in index.values_mut() {
                metas.retain(|m| m.checkpoint_id != checkpoint_id);
            }
            index.retain(|_, metas| !metas.is_empty());
        }
        self.save_index()?;

        Ok(())
    }

    /// Keeps the newest `keep` checkpoints of a session. Returns how many
    /// were deleted.
    pub fn prune(&self, session: &str, keep: usize) -> Result<usize, StorageError> {
        let stale: Vec<String> = {
            let index = self.index.read();
            let metas = index.get(session).map(Vec::as_slice).unwrap_or_default();
            let excess = metas.len().saturating_sub(keep);
            metas[..excess]
                .iter()
                .map(|m| m.checkpoint_id.clone())
                .collect()
        };

        for id in &stale {
            self.delete(id)?;
        }
        if !stale.is_empty() {
            tracing::debug!("Pruned {} checkpoints of session {}", stale.len(), session);
        }

        Ok(stale.len())
    }

    fn find(&self, checkpoint_id: &str) -> Option<CheckpointMeta> {
        self.index
            .read()
            .values()
            .flatten()
            .find(|m| m.checkpoint_id == checkpoint_id)
            .cloned()
    }

    fn checkpoint_path(&self, checkpoint_id: &str) -> PathBuf {
        self.dir.join(format!("{}.ckpt.json", checkpoint_id))
    }
}
