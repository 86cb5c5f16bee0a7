use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::types::{PipelineId, RunId};

use super::model::Cursor;

/// Resume point persisted between batches.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub pipeline_id: PipelineId,
    pub run_id: RunId,
    pub cursor: Option<Cursor>,
    pub batches_completed: u64,
    pub records_loaded: u64,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    async fn latest(&self, pipeline_id: &PipelineId) -> Result<Option<Checkpoint>>;

    async fn clear(&self, pipeline_id: &PipelineId) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: DashMap<PipelineId, Checkpoint>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.checkpoints
            .insert(checkpoint.pipeline_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn latest(&self, pipeline_id: &PipelineId) -> Result<Option<Checkpoint>> {
        Ok(self
            .checkpoints
            .get(pipeline_id)
            .map(|entry| entry.value().clone()))
    }

    async fn clear(&self, pipeline_id: &PipelineId) -> Result<()> {
        self.checkpoints.remove(pipeline_id);
        Ok(())
    }
}

/// One JSON document per pipeline under `root`. Writes go to a temporary file
/// that is renamed over the previous checkpoint.
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl fmt::Debug for FileCheckpointStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileCheckpointStore")
            .field("root", &self.root.display())
            .finish()
    }
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Letters, digits, `-` and `.` are kept; every other byte becomes `_xx`
    /// so distinct ids never share a file.
    fn path_for(&self, pipeline_id: &PipelineId) -> PathBuf {
        let mut file_name = String::with_capacity(pipeline_id.as_str().len());
        for byte in pipeline_id.as_str().bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.') {
                file_name.push(char::from(byte));
            } else {
                file_name.push_str(&format!("_{byte:02x}"));
            }
        }
        self.root.join(format!("{file_name}.checkpoint.json"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        let target = self.path_for(&checkpoint.pipeline_id);
        let temp = target.with_extension(format!("json.{}.tmp", checkpoint.run_id));

        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        fs::write(&temp, bytes).await?;
        if let Err(err) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(err.into());
        }
        debug!(
            pipeline = %checkpoint.pipeline_id,
            batches = checkpoint.batches_completed,
            path = %target.display(),
            "checkpoint written"
        );
        Ok(())
    }

    async fn latest(&self, pipeline_id: &PipelineId) -> Result<Option<Checkpoint>> {
        match fs::read(self.path_for(pipeline_id)).await {
            Ok(bytes) => {
                let checkpoint: Checkpoint = serde_json::from_slice(&bytes)?;
                if &checkpoint.pipeline_id != pipeline_id {
                    return Err(CoreError::Conflict(format!(
                        "checkpoint file for '{pipeline_id}' belongs to '{}'",
                        checkpoint.pipeline_id
                    )));
                }
                Ok(Some(checkpoint))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn clear(&self, pipeline_id: &PipelineId) -> Result<()> {
        match fs::remove_file(self.path_for(pipeline_id)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn checkpoint(pipeline: &str, batches: u64) -> Checkpoint {
        Checkpoint {
            pipeline_id: PipelineId::new(pipeline),
            run_id: RunId::new(),
            cursor: Some(Cursor::from_offset(batches * 100)),
            batches_completed: batches,
            records_loaded: batches * 100,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn file_store_overwrites_and_clears() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("checkpoints"));
        let id = PipelineId::new("vendor/orders sync");

        assert!(store.latest(&id).await.unwrap().is_none());

        store.save(&checkpoint(id.as_str(), 1)).await.unwrap();
        store.save(&checkpoint(id.as_str(), 2)).await.unwrap();
        let latest = store.latest(&id).await.unwrap().unwrap();
        assert_eq!(latest.batches_completed, 2);
        assert_eq!(latest.cursor, Some(Cursor::from_offset(200)));

        let leftovers = std::fs::read_dir(store.root())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);

        store.clear(&id).await.unwrap();
        assert!(store.latest(&id).await.unwrap().is_none());
        store.clear(&id).await.unwrap();
    }

    #[tokio::test]
    async fn similar_ids_get_separate_files() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let spaced = PipelineId::new("menu export");
        let underscored = PipelineId::new("menu_export");
        assert_ne!(store.path_for(&spaced), store.path_for(&underscored));

        store.save(&checkpoint(spaced.as_str(), 5)).await.unwrap();
        assert!(store.latest(&underscored).await.unwrap().is_none());

        store.save(&checkpoint(underscored.as_str(), 1)).await.unwrap();
        assert_eq!(store.latest(&spaced).await.unwrap().unwrap().batches_completed, 5);
        assert_eq!(
            store.latest(&underscored).await.unwrap().unwrap().batches_completed,
            1
        );
    }

    #[tokio::test]
    async fn memory_store_keeps_latest_per_pipeline() {
        let store = InMemoryCheckpointStore::new();
        store.save(&checkpoint("a", 1)).await.unwrap();
        store.save(&checkpoint("b", 4)).await.unwrap();
        store.save(&checkpoint("a", 3)).await.unwrap();

        let a = store.latest(&PipelineId::new("a")).await.unwrap().unwrap();
        assert_eq!(a.batches_completed, 3);
        store.clear(&PipelineId::new("a")).await.unwrap();
        assert!(store.latest(&PipelineId::new("a")).await.unwrap().is_none());
        assert!(store.latest(&PipelineId::new("b")).await.unwrap().is_some());
    }
}
