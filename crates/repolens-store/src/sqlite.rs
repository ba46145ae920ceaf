use std::str::FromStr;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::error::RecordStoreError;
use crate::records::{
    FileRecord, IndexingStatus, NewRepository, RecordStore, RepositoryRecord, RepositoryUpdate,
};
use crate::vector_store::BoxFuture;

type RepositoryRow = (
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<i64>,
    String,
    i64,
    i64,
    Option<String>,
    Option<String>,
    Option<f64>,
    Option<f64>,
);

type FileRow = (String, String, String, i64, String, bool, String);

const REPOSITORY_COLUMNS: &str = "id, path, collection_name, embedding_provider, embedding_model, \
     embedding_dimension, indexing_status, total_chunks, total_files, last_commit_hash, \
     last_indexed_at, last_index_seconds, last_chunks_per_second";

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

fn repository_from_row(row: RepositoryRow) -> Result<RepositoryRecord, RecordStoreError> {
    let (
        id,
        path,
        collection_name,
        embedding_provider,
        embedding_model,
        embedding_dimension,
        status,
        total_chunks,
        total_files,
        last_commit_hash,
        last_indexed_at,
        last_index_seconds,
        last_chunks_per_second,
    ) = row;
    Ok(RepositoryRecord {
        id,
        path,
        collection_name,
        embedding_provider,
        embedding_model,
        embedding_dimension: embedding_dimension.and_then(|d| usize::try_from(d).ok()),
        indexing_status: IndexingStatus::from_str(&status)?,
        total_chunks: to_u64(total_chunks),
        total_files: to_u64(total_files),
        last_commit_hash,
        last_indexed_at,
        last_index_seconds,
        last_chunks_per_second,
    })
}

fn file_from_row(row: FileRow) -> FileRecord {
    let (repo_id, file_path, file_hash, chunk_count, language, is_uncommitted, last_indexed_at) =
        row;
    FileRecord {
        repo_id,
        file_path,
        file_hash,
        chunk_count: to_u64(chunk_count),
        language,
        is_uncommitted,
        last_indexed_at,
    }
}

/// `SQLite`-backed [`RecordStore`].
#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    pool: SqlitePool,
}

impl SqliteRecordStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (or create) the database at `path` and create the tables.
    ///
    /// `":memory:"` opens a private in-memory database on a single connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialised.
    pub async fn open(path: &str) -> Result<Self, RecordStoreError> {
        let in_memory = path == ":memory:";
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .connect_with(opts)
            .await?;

        let store = Self::new(pool);
        store.init().await?;
        Ok(store)
    }

    /// Create the `repositories` and `indexed_files` tables.
    ///
    /// # Errors
    ///
    /// Returns an error if the SQL statement fails.
    pub async fn init(&self) -> Result<(), RecordStoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS repositories (
                id TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                collection_name TEXT NOT NULL UNIQUE,
                embedding_provider TEXT,
                embedding_model TEXT,
                embedding_dimension INTEGER,
                indexing_status TEXT NOT NULL DEFAULT 'pending',
                total_chunks INTEGER NOT NULL DEFAULT 0,
                total_files INTEGER NOT NULL DEFAULT 0,
                last_commit_hash TEXT,
                last_indexed_at TEXT,
                last_index_seconds REAL,
                last_chunks_per_second REAL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS indexed_files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                repo_id TEXT NOT NULL REFERENCES repositories(id) ON DELETE CASCADE,
                file_path TEXT NOT NULL,
                file_hash TEXT NOT NULL,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                language TEXT NOT NULL,
                is_uncommitted INTEGER NOT NULL DEFAULT 0,
                last_indexed_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(repo_id, file_path)
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn fetch_repository(
        &self,
        repo_id: &str,
    ) -> Result<Option<RepositoryRecord>, RecordStoreError> {
        let row: Option<RepositoryRow> = sqlx::query_as(&format!(
            "SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE id = ?"
        ))
        .bind(repo_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(repository_from_row).transpose()
    }

    async fn repository_exists(&self, repo_id: &str) -> Result<bool, RecordStoreError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM repositories WHERE id = ?")
            .bind(repo_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 > 0)
    }
}

impl RecordStore for SqliteRecordStore {
    fn create_repository(
        &self,
        repo: NewRepository,
    ) -> BoxFuture<'_, Result<RepositoryRecord, RecordStoreError>> {
        Box::pin(async move {
            let inserted = sqlx::query(
                "INSERT INTO repositories (id, path, collection_name) VALUES (?, ?, ?)",
            )
            .bind(&repo.id)
            .bind(&repo.path)
            .bind(&repo.collection_name)
            .execute(&self.pool)
            .await;

            match inserted {
                Ok(_) => {}
                Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                    return Err(RecordStoreError::Duplicate(repo.id));
                }
                Err(e) => return Err(e.into()),
            }
            tracing::debug!(repo_id = %repo.id, path = %repo.path, "repository registered");

            self.fetch_repository(&repo.id)
                .await?
                .ok_or(RecordStoreError::NotFound(repo.id))
        })
    }

    fn get_repository(
        &self,
        repo_id: &str,
    ) -> BoxFuture<'_, Result<Option<RepositoryRecord>, RecordStoreError>> {
        let repo_id = repo_id.to_owned();
        Box::pin(async move { self.fetch_repository(&repo_id).await })
    }

    fn list_repositories(&self) -> BoxFuture<'_, Result<Vec<RepositoryRecord>, RecordStoreError>> {
        Box::pin(async move {
            let rows: Vec<RepositoryRow> = sqlx::query_as(&format!(
                "SELECT {REPOSITORY_COLUMNS} FROM repositories ORDER BY id"
            ))
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter().map(repository_from_row).collect()
        })
    }

    fn update_repository(
        &self,
        repo_id: &str,
        update: RepositoryUpdate,
    ) -> BoxFuture<'_, Result<(), RecordStoreError>> {
        let repo_id = repo_id.to_owned();
        Box::pin(async move {
            let status = update.status.map(IndexingStatus::as_str);
            let dimension = update
                .embedding_dimension
                .map(|d| i64::try_from(d).unwrap_or(i64::MAX));
            let result = sqlx::query(
                "UPDATE repositories SET
                    indexing_status = COALESCE(?, indexing_status),
                    total_chunks = COALESCE(?, total_chunks),
                    total_files = COALESCE(?, total_files),
                    last_commit_hash = COALESCE(?, last_commit_hash),
                    embedding_provider = COALESCE(?, embedding_provider),
                    embedding_model = COALESCE(?, embedding_model),
                    embedding_dimension = COALESCE(?, embedding_dimension),
                    last_index_seconds = COALESCE(?, last_index_seconds),
                    last_chunks_per_second = COALESCE(?, last_chunks_per_second),
                    last_indexed_at = CASE WHEN ? = 'completed' THEN datetime('now') ELSE last_indexed_at END
                 WHERE id = ?",
            )
            .bind(status)
            .bind(update.total_chunks.map(to_i64))
            .bind(update.total_files.map(to_i64))
            .bind(update.last_commit_hash)
            .bind(update.embedding_provider)
            .bind(update.embedding_model)
            .bind(dimension)
            .bind(update.last_index_seconds)
            .bind(update.last_chunks_per_second)
            .bind(status)
            .bind(&repo_id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(RecordStoreError::NotFound(repo_id));
            }
            Ok(())
        })
    }

    fn begin_indexing(&self, repo_id: &str) -> BoxFuture<'_, Result<bool, RecordStoreError>> {
        let repo_id = repo_id.to_owned();
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE repositories SET indexing_status = 'in_progress'
                 WHERE id = ? AND indexing_status != 'in_progress'",
            )
            .bind(&repo_id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() > 0 {
                return Ok(true);
            }
            if self.repository_exists(&repo_id).await? {
                Ok(false)
            } else {
                Err(RecordStoreError::NotFound(repo_id))
            }
        })
    }

    fn reset_indexing(&self, repo_id: &str) -> BoxFuture<'_, Result<bool, RecordStoreError>> {
        let repo_id = repo_id.to_owned();
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE repositories SET indexing_status = 'failed'
                 WHERE id = ? AND indexing_status = 'in_progress'",
            )
            .bind(&repo_id)
            .execute(&self.pool)
            .await?;

            if result.rows_affected() > 0 {
                tracing::warn!(repo_id = %repo_id, "stale indexing run released");
                return Ok(true);
            }
            if self.repository_exists(&repo_id).await? {
                Ok(false)
            } else {
                Err(RecordStoreError::NotFound(repo_id))
            }
        })
    }

    fn upsert_file_record(
        &self,
        repo_id: &str,
        file_path: &str,
        file_hash: &str,
        chunk_count: u64,
        language: &str,
        is_uncommitted: bool,
    ) -> BoxFuture<'_, Result<(), RecordStoreError>> {
        let repo_id = repo_id.to_owned();
        let file_path = file_path.to_owned();
        let file_hash = file_hash.to_owned();
        let language = language.to_owned();
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO indexed_files
                    (repo_id, file_path, file_hash, chunk_count, language, is_uncommitted)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(repo_id, file_path) DO UPDATE SET
                    file_hash = excluded.file_hash,
                    chunk_count = excluded.chunk_count,
                    language = excluded.language,
                    is_uncommitted = excluded.is_uncommitted,
                    last_indexed_at = datetime('now')",
            )
            .bind(&repo_id)
            .bind(&file_path)
            .bind(&file_hash)
            .bind(to_i64(chunk_count))
            .bind(&language)
            .bind(is_uncommitted)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn get_file_record(
        &self,
        repo_id: &str,
        file_path: &str,
    ) -> BoxFuture<'_, Result<Option<FileRecord>, RecordStoreError>> {
        let repo_id = repo_id.to_owned();
        let file_path = file_path.to_owned();
        Box::pin(async move {
            let row: Option<FileRow> = sqlx::query_as(
                "SELECT repo_id, file_path, file_hash, chunk_count, language, is_uncommitted, last_indexed_at
                 FROM indexed_files WHERE repo_id = ? AND file_path = ?",
            )
            .bind(&repo_id)
            .bind(&file_path)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row.map(file_from_row))
        })
    }

    fn delete_file_record(
        &self,
        repo_id: &str,
        file_path: &str,
    ) -> BoxFuture<'_, Result<bool, RecordStoreError>> {
        let repo_id = repo_id.to_owned();
        let file_path = file_path.to_owned();
        Box::pin(async move {
            let result =
                sqlx::query("DELETE FROM indexed_files WHERE repo_id = ? AND file_path = ?")
                    .bind(&repo_id)
                    .bind(&file_path)
                    .execute(&self.pool)
                    .await?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn list_file_records(
        &self,
        repo_id: &str,
    ) -> BoxFuture<'_, Result<Vec<FileRecord>, RecordStoreError>> {
        let repo_id = repo_id.to_owned();
        Box::pin(async move {
            let rows: Vec<FileRow> = sqlx::query_as(
                "SELECT repo_id, file_path, file_hash, chunk_count, language, is_uncommitted, last_indexed_at
                 FROM indexed_files WHERE repo_id = ? ORDER BY file_path",
            )
            .bind(&repo_id)
            .fetch_all(&self.pool)
            .await?;
            Ok(rows.into_iter().map(file_from_row).collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> SqliteRecordStore {
        SqliteRecordStore::open(":memory:").await.unwrap()
    }

    fn new_repo(id: &str) -> NewRepository {
        NewRepository {
            id: id.into(),
            path: format!("/tmp/{id}"),
            collection_name: format!("repo_{id}"),
        }
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let store = test_store().await;
        assert!(store.init().await.is_ok());
    }

    #[tokio::test]
    async fn create_and_get_repository() {
        let store = test_store().await;
        let created = store.create_repository(new_repo("r1")).await.unwrap();
        assert_eq!(created.indexing_status, IndexingStatus::Pending);
        assert_eq!(created.total_chunks, 0);
        assert!(created.embedding_model.is_none());

        let fetched = store.get_repository("r1").await.unwrap().unwrap();
        assert_eq!(fetched, created);
        assert!(store.get_repository("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_repository_rejected() {
        let store = test_store().await;
        store.create_repository(new_repo("r1")).await.unwrap();
        let err = store.create_repository(new_repo("r1")).await.unwrap_err();
        assert!(matches!(err, RecordStoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn partial_update_keeps_other_fields() {
        let store = test_store().await;
        store.create_repository(new_repo("r1")).await.unwrap();
        store
            .update_repository(
                "r1",
                RepositoryUpdate {
                    status: Some(IndexingStatus::Completed),
                    total_chunks: Some(42),
                    total_files: Some(7),
                    last_commit_hash: Some("abc123".into()),
                    embedding_provider: Some("openai".into()),
                    embedding_model: Some("text-embedding-3-small".into()),
                    embedding_dimension: Some(1536),
                    last_index_seconds: Some(2.5),
                    last_chunks_per_second: Some(16.8),
                },
            )
            .await
            .unwrap();
        store
            .update_repository("r1", RepositoryUpdate::status(IndexingStatus::Failed))
            .await
            .unwrap();

        let repo = store.get_repository("r1").await.unwrap().unwrap();
        assert_eq!(repo.indexing_status, IndexingStatus::Failed);
        assert_eq!(repo.total_chunks, 42);
        assert_eq!(repo.total_files, 7);
        assert_eq!(repo.last_commit_hash.as_deref(), Some("abc123"));
        assert_eq!(repo.embedding_dimension, Some(1536));
        assert!(repo.last_indexed_at.is_some());
    }

    #[tokio::test]
    async fn update_unknown_repository() {
        let store = test_store().await;
        let err = store
            .update_repository("nope", RepositoryUpdate::status(IndexingStatus::Failed))
            .await
            .unwrap_err();
        assert!(matches!(err, RecordStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn begin_indexing_is_exclusive() {
        let store = test_store().await;
        store.create_repository(new_repo("r1")).await.unwrap();
        assert!(store.begin_indexing("r1").await.unwrap());
        assert!(!store.begin_indexing("r1").await.unwrap());

        store
            .update_repository("r1", RepositoryUpdate::status(IndexingStatus::Completed))
            .await
            .unwrap();
        assert!(store.begin_indexing("r1").await.unwrap());
    }

    #[tokio::test]
    async fn reset_releases_stale_run() {
        let store = test_store().await;
        store.create_repository(new_repo("r1")).await.unwrap();
        assert!(!store.reset_indexing("r1").await.unwrap());

        assert!(store.begin_indexing("r1").await.unwrap());
        assert!(store.reset_indexing("r1").await.unwrap());
        let repo = store.get_repository("r1").await.unwrap().unwrap();
        assert_eq!(repo.indexing_status, IndexingStatus::Failed);
        assert!(store.begin_indexing("r1").await.unwrap());

        assert!(matches!(
            store.reset_indexing("nope").await,
            Err(RecordStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn begin_indexing_unknown_repository() {
        let store = test_store().await;
        assert!(matches!(
            store.begin_indexing("nope").await,
            Err(RecordStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn file_record_upsert_overwrites() {
        let store = test_store().await;
        store.create_repository(new_repo("r1")).await.unwrap();
        store
            .upsert_file_record("r1", "a.py", "h1", 3, "python", false)
            .await
            .unwrap();
        store
            .upsert_file_record("r1", "a.py", "h2", 2, "python", true)
            .await
            .unwrap();

        let rec = store.get_file_record("r1", "a.py").await.unwrap().unwrap();
        assert_eq!(rec.file_hash, "h2");
        assert_eq!(rec.chunk_count, 2);
        assert!(rec.is_uncommitted);
        assert_eq!(store.list_file_records("r1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_records_scoped_by_repository() {
        let store = test_store().await;
        store.create_repository(new_repo("r1")).await.unwrap();
        store.create_repository(new_repo("r2")).await.unwrap();
        store
            .upsert_file_record("r1", "a.py", "h1", 1, "python", false)
            .await
            .unwrap();
        assert!(store.get_file_record("r2", "a.py").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_file_record_reports_removal() {
        let store = test_store().await;
        store.create_repository(new_repo("r1")).await.unwrap();
        store
            .upsert_file_record("r1", "a.py", "h1", 1, "python", false)
            .await
            .unwrap();
        assert!(store.delete_file_record("r1", "a.py").await.unwrap());
        assert!(!store.delete_file_record("r1", "a.py").await.unwrap());
    }

    #[tokio::test]
    async fn file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");
        let path = path.to_str().unwrap();
        {
            let store = SqliteRecordStore::open(path).await.unwrap();
            store.create_repository(new_repo("r1")).await.unwrap();
            store.pool().close().await;
        }
        let store = SqliteRecordStore::open(path).await.unwrap();
        assert_eq!(store.list_repositories().await.unwrap().len(), 1);
    }
}
