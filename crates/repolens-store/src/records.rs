use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RecordStoreError;
use crate::vector_store::BoxFuture;

/// Lifecycle of a repository indexing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexingStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl IndexingStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for IndexingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexingStatus {
    type Err = RecordStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(RecordStoreError::InvalidValue {
                field: "indexing_status",
                value: other.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryRecord {
    pub id: String,
    pub path: String,
    pub collection_name: String,
    pub embedding_provider: Option<String>,
    pub embedding_model: Option<String>,
    pub embedding_dimension: Option<usize>,
    pub indexing_status: IndexingStatus,
    pub total_chunks: u64,
    pub total_files: u64,
    pub last_commit_hash: Option<String>,
    pub last_indexed_at: Option<String>,
    pub last_index_seconds: Option<f64>,
    pub last_chunks_per_second: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct NewRepository {
    pub id: String,
    pub path: String,
    pub collection_name: String,
}

/// Partial update; `None` fields keep their stored value.
#[derive(Debug, Clone, Default)]
pub struct RepositoryUpdate {
    pub status: Option<IndexingStatus>,
    pub total_chunks: Option<u64>,
    pub total_files: Option<u64>,
    pub last_commit_hash: Option<String>,
    pub embedding_provider: Option<String>,
    pub embedding_model: Option<String>,
    pub embedding_dimension: Option<usize>,
    pub last_index_seconds: Option<f64>,
    pub last_chunks_per_second: Option<f64>,
}

impl RepositoryUpdate {
    #[must_use]
    pub fn status(status: IndexingStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub repo_id: String,
    pub file_path: String,
    pub file_hash: String,
    pub chunk_count: u64,
    pub language: String,
    /// Indexed from the working tree rather than a commit.
    pub is_uncommitted: bool,
    pub last_indexed_at: String,
}

/// Bookkeeping for repositories and their indexed files.
pub trait RecordStore: Send + Sync {
    /// # Errors
    ///
    /// Returns [`RecordStoreError::Duplicate`] if the id is taken.
    fn create_repository(
        &self,
        repo: NewRepository,
    ) -> BoxFuture<'_, Result<RepositoryRecord, RecordStoreError>>;

    fn get_repository(
        &self,
        repo_id: &str,
    ) -> BoxFuture<'_, Result<Option<RepositoryRecord>, RecordStoreError>>;

    fn list_repositories(&self) -> BoxFuture<'_, Result<Vec<RepositoryRecord>, RecordStoreError>>;

    /// # Errors
    ///
    /// Returns [`RecordStoreError::NotFound`] for an unknown repository.
    fn update_repository(
        &self,
        repo_id: &str,
        update: RepositoryUpdate,
    ) -> BoxFuture<'_, Result<(), RecordStoreError>>;

    /// Atomically move a repository into `in_progress`.
    ///
    /// Returns `false` when another run already holds it.
    ///
    /// # Errors
    ///
    /// Returns [`RecordStoreError::NotFound`] for an unknown repository.
    fn begin_indexing(&self, repo_id: &str) -> BoxFuture<'_, Result<bool, RecordStoreError>>;

    /// Release a run left `in_progress` by a process that never finished, marking it failed.
    ///
    /// Returns `false` when no run was in progress.
    ///
    /// # Errors
    ///
    /// Returns [`RecordStoreError::NotFound`] for an unknown repository.
    fn reset_indexing(&self, repo_id: &str) -> BoxFuture<'_, Result<bool, RecordStoreError>>;

    fn upsert_file_record(
        &self,
        repo_id: &str,
        file_path: &str,
        file_hash: &str,
        chunk_count: u64,
        language: &str,
        is_uncommitted: bool,
    ) -> BoxFuture<'_, Result<(), RecordStoreError>>;

    fn get_file_record(
        &self,
        repo_id: &str,
        file_path: &str,
    ) -> BoxFuture<'_, Result<Option<FileRecord>, RecordStoreError>>;

    /// Returns whether a record was removed.
    fn delete_file_record(
        &self,
        repo_id: &str,
        file_path: &str,
    ) -> BoxFuture<'_, Result<bool, RecordStoreError>>;

    fn list_file_records(
        &self,
        repo_id: &str,
    ) -> BoxFuture<'_, Result<Vec<FileRecord>, RecordStoreError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_its_own_output() {
        for s in [
            IndexingStatus::Pending,
            IndexingStatus::InProgress,
            IndexingStatus::Completed,
            IndexingStatus::Failed,
        ] {
            assert_eq!(s.as_str().parse::<IndexingStatus>().unwrap(), s);
        }
    }

    #[test]
    fn unknown_status_rejected() {
        let err = "running".parse::<IndexingStatus>().unwrap_err();
        assert!(matches!(err, RecordStoreError::InvalidValue { .. }));
    }

    #[test]
    fn status_update_sets_only_status() {
        let u = RepositoryUpdate::status(IndexingStatus::Failed);
        assert_eq!(u.status, Some(IndexingStatus::Failed));
        assert!(u.total_chunks.is_none());
        assert!(u.last_commit_hash.is_none());
    }
}
