//! Durable subscription positions

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::{Result, StoreError};

/// Last acknowledged sequence number per subscription key
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get_checkpoint(&self, key: &str) -> Result<Option<u64>>;
    async fn save_checkpoint(&self, key: &str, sequence: u64) -> Result<()>;
    async fn clear_checkpoint(&self, key: &str) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryCheckpointStore {
    entries: Mutex<HashMap<String, u64>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn get_checkpoint(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.entries.lock().get(key).copied())
    }

    async fn save_checkpoint(&self, key: &str, sequence: u64) -> Result<()> {
        self.entries.lock().insert(key.to_string(), sequence);
        Ok(())
    }

    async fn clear_checkpoint(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

/// JSON map of key to sequence, rewritten atomically on every save
pub struct FileCheckpointStore {
    path: PathBuf,
    entries: tokio::sync::Mutex<HashMap<String, u64>>,
}

impl FileCheckpointStore {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let entries = match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .map_err(|e| StoreError::Checkpoint(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            entries: tokio::sync::Mutex::new(entries),
        })
    }

    async fn persist(&self, entries: &HashMap<String, u64>) -> Result<()> {
        let raw = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn get_checkpoint(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.entries.lock().await.get(key).copied())
    }

    async fn save_checkpoint(&self, key: &str, sequence: u64) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_string(), sequence);
        self.persist(&entries).await?;
        debug!(key = %key, sequence = sequence, "Checkpoint saved");
        Ok(())
    }

    async fn clear_checkpoint(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().await;
        if entries.remove(key).is_some() {
            self.persist(&entries).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_checkpoints_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.checkpoints.json");

        let store = FileCheckpointStore::open(&path).await.unwrap();
        store.save_checkpoint("subscription:campaign", 41).await.unwrap();
        store.save_checkpoint("subscription:image", 7).await.unwrap();
        store.clear_checkpoint("subscription:image").await.unwrap();
        drop(store);

        let reopened = FileCheckpointStore::open(&path).await.unwrap();
        assert_eq!(reopened.get_checkpoint("subscription:campaign").await.unwrap(), Some(41));
        assert_eq!(reopened.get_checkpoint("subscription:image").await.unwrap(), None);
    }
}
