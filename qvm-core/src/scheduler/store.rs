//! Persistence of registered snapshot jobs.

use super::ScheduledSnapshotJob;
use crate::error::{QvmError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

/// Storage for scheduled jobs. The scheduler rewrites the full set on change.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn load(&self) -> Result<Vec<ScheduledSnapshotJob>>;

    async fn save(&self, jobs: &[ScheduledSnapshotJob]) -> Result<()>;
}

/// Jobs stored as a JSON array in one file.
#[derive(Debug, Clone)]
pub struct JsonJobStore {
    path: PathBuf,
}

impl JsonJobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl JobStore for JsonJobStore {
    async fn load(&self) -> Result<Vec<ScheduledSnapshotJob>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(QvmError::IoError { path: self.path.clone(), source: e }),
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    async fn save(&self, jobs: &[ScheduledSnapshotJob]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| QvmError::IoError { path: parent.to_path_buf(), source: e })?;
        }

        // Write then rename so a crash never leaves a truncated file.
        let tmp = self.path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(jobs)?;
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| QvmError::IoError { path: tmp.clone(), source: e })?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| QvmError::IoError { path: self.path.clone(), source: e })?;

        debug!(path = %self.path.display(), jobs = jobs.len(), "Saved snapshot schedules");
        Ok(())
    }
}

/// Jobs kept in memory only.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<Vec<ScheduledSnapshotJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_jobs(jobs: Vec<ScheduledSnapshotJob>) -> Self {
        Self { jobs: Mutex::new(jobs) }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn load(&self) -> Result<Vec<ScheduledSnapshotJob>> {
        Ok(self.jobs.lock().await.clone())
    }

    async fn save(&self, jobs: &[ScheduledSnapshotJob]) -> Result<()> {
        *self.jobs.lock().await = jobs.to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn job(id: &str) -> ScheduledSnapshotJob {
        ScheduledSnapshotJob {
            id: id.to_string(),
            vm_name: "web".to_string(),
            snapshot_name: "nightly".to_string(),
            day: "*".to_string(),
            interval: "*/5".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_json_store_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonJobStore::new(dir.path().join("schedules.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_store_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("schedules.json");
        let jobs = vec![job("a"), job("b")];

        JsonJobStore::new(&path).save(&jobs).await.unwrap();
        let loaded = JsonJobStore::new(&path).load().await.unwrap();
        assert_eq!(loaded, jobs);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_json_store_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("schedules.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(JsonJobStore::new(&path).load().await, Err(QvmError::Json(_))));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryJobStore::with_jobs(vec![job("a")]);
        assert_eq!(store.load().await.unwrap().len(), 1);
        store.save(&[]).await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }
}
