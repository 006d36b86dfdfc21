// JSON snapshot storage for shared memory and the message audit trail.
// Storage is a trait so the store can be swapped without touching callers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info};

use crate::messaging::Message;

/// Errors that can occur during persistence operations
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// On-disk form of the shared memory store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub data: HashMap<String, Value>,
    pub versions: HashMap<String, u64>,
    pub updated_at: DateTime<Utc>,
}

impl Default for MemorySnapshot {
    fn default() -> Self {
        Self {
            data: HashMap::new(),
            versions: HashMap::new(),
            updated_at: Utc::now(),
        }
    }
}

/// Pluggable snapshot storage
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Load the last saved snapshot, if any
    async fn load(&self) -> Result<Option<MemorySnapshot>, PersistenceError>;

    /// Replace the stored snapshot
    async fn save(&self, snapshot: &MemorySnapshot) -> Result<(), PersistenceError>;
}

/// Keeps nothing; used when shared memory runs purely in process
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStore;

#[async_trait]
impl SnapshotStore for NoopStore {
    async fn load(&self) -> Result<Option<MemorySnapshot>, PersistenceError> {
        Ok(None)
    }

    async fn save(&self, _snapshot: &MemorySnapshot) -> Result<(), PersistenceError> {
        Ok(())
    }
}

/// Single JSON file, rewritten atomically on every save
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn load(&self) -> Result<Option<MemorySnapshot>, PersistenceError> {
        if !fs::try_exists(&self.path).await? {
            info!(file = ?self.path, "No existing shared memory snapshot found");
            return Ok(None);
        }

        let contents = fs::read_to_string(&self.path).await?;
        let snapshot: MemorySnapshot = serde_json::from_str(&contents)?;

        info!(
            file = ?self.path,
            keys = snapshot.data.len(),
            updated_at = %snapshot.updated_at,
            "Shared memory snapshot loaded"
        );
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &MemorySnapshot) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let serialized = serde_json::to_vec_pretty(snapshot)?;

        // Write to temporary file first, then rename (atomic operation)
        let temp_file = format!("{}.tmp", self.path.display());
        fs::write(&temp_file, serialized).await?;
        fs::rename(&temp_file, &self.path).await?;

        debug!(file = ?self.path, keys = snapshot.data.len(), "Shared memory snapshot saved");
        Ok(())
    }
}

/// Writes one JSON file per message for audit and debugging
#[derive(Debug, Clone)]
pub struct MessageArchive {
    directory: PathBuf,
}

impl MessageArchive {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn file_path(&self, message: &Message) -> PathBuf {
        self.directory.join(format!(
            "{}_{}.json",
            message.timestamp.timestamp_millis(),
            message.id
        ))
    }

    pub async fn store(&self, message: &Message) -> Result<PathBuf, PersistenceError> {
        fs::create_dir_all(&self.directory).await?;
        let path = self.file_path(message);
        fs::write(&path, serde_json::to_vec_pretty(message)?).await?;
        Ok(path)
    }
}
