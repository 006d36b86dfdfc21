//! Versioned key/value store shared by the orchestrator and its workers.
//!
//! Every successful write bumps the key's version by one. Writers that pass
//! an `expected_version` get compare-and-swap semantics: a stale version is
//! rejected without touching the stored value.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::persistence::{JsonFileStore, MemorySnapshot, NoopStore, PersistenceError, SnapshotStore};

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Failed to load shared memory snapshot: {0}")]
    Load(#[from] PersistenceError),

    #[error("Gave up updating '{key}' after {attempts} conflicting writes")]
    Contention { key: String, attempts: u32 },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Snapshot file; `None` keeps the store purely in memory
    pub snapshot_path: Option<PathBuf>,
}

pub struct SharedMemory {
    state: Mutex<MemorySnapshot>,
    store: Arc<dyn SnapshotStore>,
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemory").finish_non_exhaustive()
    }
}

impl SharedMemory {
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(MemorySnapshot::default()),
            store: Arc::new(NoopStore),
        }
    }

    /// Build a store backed by `store`, loading its snapshot once
    pub async fn with_store(store: Arc<dyn SnapshotStore>) -> Result<Self, MemoryError> {
        let snapshot = store.load().await?.unwrap_or_default();
        Ok(Self {
            state: Mutex::new(snapshot),
            store,
        })
    }

    pub async fn open(config: &MemoryConfig) -> Result<Self, MemoryError> {
        match &config.snapshot_path {
            Some(path) => Self::with_store(Arc::new(JsonFileStore::new(path))).await,
            None => Ok(Self::in_memory()),
        }
    }

    async fn persist(&self, snapshot: &mut MemorySnapshot) {
        snapshot.updated_at = Utc::now();
        if let Err(e) = self.store.save(snapshot).await {
            warn!(error = %e, "Failed to persist shared memory snapshot");
        }
    }

    /// Store `value` under `key`. With `expected_version`, the write only
    /// happens if the key is still at that version.
    pub async fn set(&self, key: &str, value: Value, expected_version: Option<u64>) -> bool {
        let mut state = self.state.lock().await;
        let current = state.versions.get(key).copied().unwrap_or(0);

        if let Some(expected) = expected_version {
            if expected != current {
                debug!(
                    key = %key,
                    expected_version = expected,
                    current_version = current,
                    "Rejected stale shared memory write"
                );
                return false;
            }
        }

        state.data.insert(key.to_string(), value);
        state.versions.insert(key.to_string(), current + 1);
        self.persist(&mut state).await;
        true
    }

    /// Current value and version; `(default, version)` when the key is absent
    pub async fn get(&self, key: &str, default: Value) -> (Value, u64) {
        let state = self.state.lock().await;
        let version = state.versions.get(key).copied().unwrap_or(0);
        let value = state.data.get(key).cloned().unwrap_or(default);
        (value, version)
    }

    pub async fn version(&self, key: &str) -> u64 {
        self.state.lock().await.versions.get(key).copied().unwrap_or(0)
    }

    /// Remove the value. Deleting counts as a write, so the version moves on
    /// and compare-and-swap against a pre-delete read fails.
    pub async fn delete(&self, key: &str) -> bool {
        let mut state = self.state.lock().await;
        if state.data.remove(key).is_none() {
            return false;
        }
        *state.versions.entry(key.to_string()).or_insert(0) += 1;
        self.persist(&mut state).await;
        true
    }

    pub async fn keys(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut keys: Vec<String> = state.data.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Drop all values and versions
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.data.clear();
        state.versions.clear();
        self.persist(&mut state).await;
    }

    /// Read-modify-write loop on top of `set` with `expected_version`
    pub async fn update<F>(
        &self,
        key: &str,
        default: Value,
        mut f: F,
        max_attempts: u32,
    ) -> Result<(Value, u64), MemoryError>
    where
        F: FnMut(&Value) -> Value,
    {
        for _ in 0..max_attempts {
            let (current, version) = self.get(key, default.clone()).await;
            let next = f(&current);
            if self.set(key, next.clone(), Some(version)).await {
                return Ok((next, version + 1));
            }
        }

        Err(MemoryError::Contention {
            key: key.to_string(),
            attempts: max_attempts,
        })
    }
}
