//! Persistence port for fetched issues and the last-update timestamp.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itq_core::Issue;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid json at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[async_trait]
pub trait IssueStore: Send + Sync {
    /// Insert or replace issues, keyed by issue id.
    async fn put_issues(&self, issues: &[Issue]) -> Result<(), StoreError>;

    /// Every stored issue, ordered by id.
    async fn all_issues(&self) -> Result<Vec<Issue>, StoreError>;

    async fn issues_with_label(&self, label: &str) -> Result<Vec<Issue>, StoreError> {
        let issues = self.all_issues().await?;
        Ok(issues
            .into_iter()
            .filter(|issue| issue.labels.iter().any(|l| l.eq_ignore_ascii_case(label)))
            .collect())
    }

    async fn delete_all_issues(&self) -> Result<(), StoreError>;

    async fn set_last_update(&self, at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn last_update(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn delete_last_update(&self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LastUpdate {
    updated: DateTime<Utc>,
}

/// One JSON file per issue under `<root>/issues/`, plus `<root>/last_update.json`.
#[derive(Debug, Clone)]
pub struct FsIssueStore {
    root: PathBuf,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn json_error(path: &Path) -> impl FnOnce(serde_json::Error) -> StoreError + '_ {
    move |source| StoreError::Json {
        path: path.to_path_buf(),
        source,
    }
}

impl FsIssueStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn issues_dir(&self) -> PathBuf {
        self.root.join("issues")
    }

    fn issue_path(&self, id: u64) -> PathBuf {
        self.issues_dir().join(format!("{id}.json"))
    }

    fn last_update_path(&self) -> PathBuf {
        self.root.join("last_update.json")
    }

    /// Write via a temp file in the target directory and an atomic rename.
    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        let parent = path.parent().unwrap_or(self.root.as_path());
        fs::create_dir_all(parent).await.map_err(io_error(parent))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(io_error(&temp_path))?;
        file.write_all(bytes).await.map_err(io_error(&temp_path))?;
        file.flush().await.map_err(io_error(&temp_path))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(io_error(path)(err));
        }
        Ok(())
    }

    async fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
        match fs::remove_file(path).await {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(io_error(path)(err)),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl IssueStore for FsIssueStore {
    async fn put_issues(&self, issues: &[Issue]) -> Result<(), StoreError> {
        for issue in issues {
            let path = self.issue_path(issue.id);
            let bytes = serde_json::to_vec(issue).map_err(json_error(&path))?;
            self.write_atomic(&path, &bytes).await?;
        }
        debug!(count = issues.len(), root = %self.root.display(), "stored issues");
        Ok(())
    }

    async fn all_issues(&self) -> Result<Vec<Issue>, StoreError> {
        let dir = self.issues_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error(&dir)(err)),
        };

        let mut issues = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io_error(&dir))? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).await.map_err(io_error(&path))?;
            let issue: Issue = serde_json::from_slice(&bytes).map_err(json_error(&path))?;
            issues.push(issue);
        }
        issues.sort_by_key(|issue| issue.id);
        Ok(issues)
    }

    async fn delete_all_issues(&self) -> Result<(), StoreError> {
        let dir = self.issues_dir();
        match fs::remove_dir_all(&dir).await {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(io_error(&dir)(err)),
            _ => Ok(()),
        }
    }

    async fn set_last_update(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        let path = self.last_update_path();
        let bytes = serde_json::to_vec_pretty(&LastUpdate { updated: at }).map_err(json_error(&path))?;
        self.write_atomic(&path, &bytes).await
    }

    async fn last_update(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let path = self.last_update_path();
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(io_error(&path)(err)),
        };
        let entry: LastUpdate = serde_json::from_slice(&bytes).map_err(json_error(&path))?;
        Ok(Some(entry.updated))
    }

    async fn delete_last_update(&self) -> Result<(), StoreError> {
        Self::remove_if_exists(&self.last_update_path()).await
    }
}

/// Process-local store, handy for dry runs and tests.
#[derive(Debug, Default)]
pub struct MemoryIssueStore {
    issues: Mutex<BTreeMap<u64, Issue>>,
    last_update: Mutex<Option<DateTime<Utc>>>,
}

impl MemoryIssueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IssueStore for MemoryIssueStore {
    async fn put_issues(&self, issues: &[Issue]) -> Result<(), StoreError> {
        let mut map = self.issues.lock().await;
        for issue in issues {
            map.insert(issue.id, issue.clone());
        }
        Ok(())
    }

    async fn all_issues(&self) -> Result<Vec<Issue>, StoreError> {
        Ok(self.issues.lock().await.values().cloned().collect())
    }

    async fn delete_all_issues(&self) -> Result<(), StoreError> {
        self.issues.lock().await.clear();
        Ok(())
    }

    async fn set_last_update(&self, at: DateTime<Utc>) -> Result<(), StoreError> {
        *self.last_update.lock().await = Some(at);
        Ok(())
    }

    async fn last_update(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(*self.last_update.lock().await)
    }

    async fn delete_last_update(&self) -> Result<(), StoreError> {
        *self.last_update.lock().await = None;
        Ok(())
    }
}
