//! Repository indexing orchestrator: list → read → parse/chunk/hash → embed → store.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use repolens_llm::{EmbeddingProvider, ModelInfo};
use repolens_store::{
    FileRecord, IndexingStatus, NewRepository, RecordStore, RepositoryRecord, RepositoryUpdate,
    VectorFilter, VectorPoint, VectorStore,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::chunker::{Chunk, ChunkerConfig, chunk_id, chunk_text, chunk_units, embedding_text};
use crate::error::{IndexError, Result};
use crate::languages::{detect_language, should_index};
use crate::parser::parse;
use crate::pool::WorkerPool;
use crate::vcs::VersionControl;

/// Payload key identifying the `write_files` call that stored a point.
const RUN_FIELD: &str = "index_run";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Concurrent per-file parse/chunk/hash jobs.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Chunks per embed + upsert round trip.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Batch size requested from the embedding provider.
    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,
}

fn default_max_workers() -> usize {
    4
}

fn default_batch_size() -> usize {
    50
}

fn default_embed_batch_size() -> usize {
    100
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            batch_size: default_batch_size(),
            embed_batch_size: default_embed_batch_size(),
        }
    }
}

/// Summary of a completed indexing run.
#[derive(Debug, Clone)]
pub struct IndexReport {
    pub repo_id: String,
    pub collection: String,
    /// Eligible files considered by this run.
    pub total_files: usize,
    pub indexed_files: usize,
    pub skipped_files: usize,
    pub failed_files: usize,
    /// Files whose chunks and record were dropped because they no longer exist.
    pub removed_files: usize,
    /// Chunks in the collection after the run, from file records.
    pub total_chunks: u64,
    pub chunks_written: usize,
    pub latest_commit: Option<String>,
    pub elapsed: Duration,
    pub chunks_per_second: f64,
    pub status: IndexingStatus,
}

#[derive(Debug, Clone)]
pub struct IndexingStats {
    pub repository: RepositoryRecord,
    pub indexed_files: u64,
    /// Live point count of the collection; 0 when it does not exist yet.
    pub collection_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Full { force: bool },
    Incremental,
}

impl RunMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Full { force: false } => "full",
            Self::Full { force: true } => "forced",
            Self::Incremental => "incremental",
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct FileCounters {
    indexed: usize,
    skipped: usize,
    failed: usize,
}

struct FileJob {
    path: String,
    /// Stored hash; a file whose content still hashes to this is skipped.
    known_hash: Option<String>,
}

struct PreparedFile {
    path: String,
    hash: String,
    language: &'static str,
    chunks: Vec<Chunk>,
}

enum FileOutcome {
    Prepared(PreparedFile),
    Missing(String),
    Unchanged,
    Skipped,
    Failed,
}

#[derive(Debug)]
enum Prepared {
    Unchanged,
    Binary,
    Chunks {
        hash: String,
        language: &'static str,
        chunks: Vec<Chunk>,
    },
}

struct Provenance {
    commit_hash: String,
    is_uncommitted: bool,
}

/// Hex digest of a file's bytes.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

fn prepare_file(
    path: &str,
    bytes: &[u8],
    known_hash: Option<&str>,
    chunker: &ChunkerConfig,
) -> Prepared {
    let hash = content_hash(bytes);
    if known_hash == Some(hash.as_str()) {
        return Prepared::Unchanged;
    }
    let Ok(text) = std::str::from_utf8(bytes) else {
        return Prepared::Binary;
    };

    let units = parse(path, text);
    let chunks = if units.is_empty() {
        chunk_text(text, path, chunker)
    } else {
        chunk_units(units, chunker)
    };
    Prepared::Chunks {
        hash,
        language: detect_language(Path::new(path)).id(),
        chunks,
    }
}

async fn process_file(
    vcs: Arc<dyn VersionControl>,
    chunker: ChunkerConfig,
    counters: Arc<Mutex<FileCounters>>,
    job: FileJob,
) -> FileOutcome {
    let bytes = match vcs.read_file_at(&job.path, None).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return FileOutcome::Missing(job.path),
        Err(e) => {
            tracing::warn!(file = %job.path, error = %e, "failed to read file");
            counters.lock().await.failed += 1;
            return FileOutcome::Failed;
        }
    };

    let FileJob { path, known_hash } = job;
    let task_path = path.clone();
    let prepared = tokio::task::spawn_blocking(move || {
        prepare_file(&task_path, &bytes, known_hash.as_deref(), &chunker)
    })
    .await;

    match prepared {
        Ok(Prepared::Unchanged) => {
            counters.lock().await.skipped += 1;
            FileOutcome::Unchanged
        }
        Ok(Prepared::Binary) => {
            tracing::warn!(file = %path, "skipping undecodable file");
            counters.lock().await.skipped += 1;
            FileOutcome::Skipped
        }
        Ok(Prepared::Chunks {
            hash,
            language,
            chunks,
        }) => {
            tracing::debug!(file = %path, chunks = chunks.len(), "file chunked");
            counters.lock().await.indexed += 1;
            FileOutcome::Prepared(PreparedFile {
                path,
                hash,
                language,
                chunks,
            })
        }
        Err(e) => {
            tracing::warn!(file = %path, error = %e, "chunking task failed");
            counters.lock().await.failed += 1;
            FileOutcome::Failed
        }
    }
}

/// Fail when `info` differs from the embedding identity recorded for `repo`.
///
/// A repository that has never completed an index has no identity and accepts any model.
///
/// # Errors
///
/// Returns `IndexError::EmbeddingMismatch` on any difference in provider, model or dimension.
pub fn check_embedding_identity(repo: &RepositoryRecord, info: &ModelInfo) -> Result<()> {
    let (Some(provider), Some(model), Some(dimension)) = (
        repo.embedding_provider.as_deref(),
        repo.embedding_model.as_deref(),
        repo.embedding_dimension,
    ) else {
        return Ok(());
    };

    if provider == info.provider && model == info.model && dimension == info.dimension {
        return Ok(());
    }
    Err(IndexError::EmbeddingMismatch {
        expected: format!("{provider}/{model} ({dimension}d)"),
        actual: format!("{}/{} ({}d)", info.provider, info.model, info.dimension),
    })
}

#[allow(clippy::cast_precision_loss)]
fn throughput(chunks: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { chunks as f64 / secs } else { 0.0 }
}

/// Orchestrates full, incremental and single-file indexing of one repository.
pub struct RepositoryIndexer<E> {
    embedder: Arc<E>,
    vectors: Arc<dyn VectorStore>,
    records: Arc<dyn RecordStore>,
    vcs: Arc<dyn VersionControl>,
    chunker: ChunkerConfig,
    config: IndexerConfig,
}

impl<E> std::fmt::Debug for RepositoryIndexer<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryIndexer")
            .field("root", &self.vcs.root())
            .field("chunker", &self.chunker)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<E: EmbeddingProvider> RepositoryIndexer<E> {
    #[must_use]
    pub fn new(
        embedder: Arc<E>,
        vectors: Arc<dyn VectorStore>,
        records: Arc<dyn RecordStore>,
        vcs: Arc<dyn VersionControl>,
        chunker: ChunkerConfig,
        config: IndexerConfig,
    ) -> Self {
        Self {
            embedder,
            vectors,
            records,
            vcs,
            chunker,
            config,
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        self.vcs.root()
    }

    /// Fetch the repository record, creating a pending one for this root if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the record store fails.
    pub async fn ensure_repository(
        &self,
        repo_id: &str,
        collection: &str,
    ) -> Result<RepositoryRecord> {
        if let Some(repo) = self.records.get_repository(repo_id).await? {
            return Ok(repo);
        }
        let repo = self
            .records
            .create_repository(NewRepository {
                id: repo_id.to_owned(),
                path: self.vcs.root().display().to_string(),
                collection_name: collection.to_owned(),
            })
            .await?;
        tracing::info!(repo = repo_id, collection, "repository registered");
        Ok(repo)
    }

    async fn repository(&self, repo_id: &str) -> Result<RepositoryRecord> {
        self.records
            .get_repository(repo_id)
            .await?
            .ok_or_else(|| IndexError::NotFound(format!("repository {repo_id}")))
    }

    /// Index every tracked file, skipping files whose content hash is unchanged
    /// unless `force` is set. Files no longer tracked are removed.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown repository, `EmbeddingMismatch` if the
    /// embedder differs from the collection's, `AlreadyIndexing` if another run
    /// holds the repository, `Cancelled` if `cancel` fires, or any embedding and
    /// store failure. On any error after the run started the status becomes failed.
    pub async fn index_repository(
        &self,
        repo_id: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<IndexReport> {
        self.guarded_run(repo_id, RunMode::Full { force }, cancel)
            .await
    }

    /// Re-index only files with uncommitted changes, tagging their chunks as uncommitted.
    /// Modified files that no longer exist have their chunks and record removed.
    ///
    /// # Errors
    ///
    /// Same as [`Self::index_repository`].
    pub async fn incremental_index(
        &self,
        repo_id: &str,
        cancel: &CancellationToken,
    ) -> Result<IndexReport> {
        self.guarded_run(repo_id, RunMode::Incremental, cancel).await
    }

    async fn guarded_run(
        &self,
        repo_id: &str,
        mode: RunMode,
        cancel: &CancellationToken,
    ) -> Result<IndexReport> {
        let repo = self.repository(repo_id).await?;
        check_embedding_identity(&repo, &self.embedder.model_info())?;

        if !self.records.begin_indexing(repo_id).await? {
            return Err(IndexError::AlreadyIndexing(repo_id.to_owned()));
        }

        match self.run(&repo, mode, cancel).await {
            Ok(report) => {
                tracing::info!(
                    repo = repo_id,
                    mode = mode.as_str(),
                    indexed = report.indexed_files,
                    skipped = report.skipped_files,
                    failed = report.failed_files,
                    removed = report.removed_files,
                    chunks = report.total_chunks,
                    elapsed_ms = u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
                    "indexing completed"
                );
                Ok(report)
            }
            Err(e) => {
                tracing::error!(repo = repo_id, mode = mode.as_str(), error = %e, "indexing failed");
                if let Err(mark) = self
                    .records
                    .update_repository(repo_id, RepositoryUpdate::status(IndexingStatus::Failed))
                    .await
                {
                    tracing::warn!(repo = repo_id, error = %mark, "failed to mark run as failed");
                }
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        repo: &RepositoryRecord,
        mode: RunMode,
        cancel: &CancellationToken,
    ) -> Result<IndexReport> {
        let start = Instant::now();
        let collection = repo.collection_name.as_str();

        let fresh = !self.vectors.collection_exists(collection).await?;
        self.vectors
            .ensure_collection(collection, self.embedder.dimension() as u64)
            .await?;

        let latest_commit = self.vcs.latest_commit_hash().await?;
        let stored: HashMap<String, FileRecord> = self
            .records
            .list_file_records(&repo.id)
            .await?
            .into_iter()
            .map(|r| (r.file_path.clone(), r))
            .collect();

        let listed = match mode {
            RunMode::Full { .. } => self.vcs.list_tracked_files().await?,
            RunMode::Incremental => self.vcs.list_modified_files().await?,
        };
        let paths: Vec<String> = listed
            .into_iter()
            .filter(|p| should_index(Path::new(p)))
            .collect();

        // An empty or recreated collection must be rebuilt whatever the records say.
        let skip_unchanged = mode == RunMode::Full { force: false } && !fresh;
        let jobs: Vec<FileJob> = paths
            .iter()
            .map(|p| FileJob {
                path: p.clone(),
                // Working-tree records are refreshed once their change is committed.
                known_hash: skip_unchanged
                    .then(|| stored.get(p).filter(|r| !r.is_uncommitted))
                    .flatten()
                    .map(|r| r.file_hash.clone()),
            })
            .collect();

        tracing::info!(
            repo = %repo.id,
            mode = mode.as_str(),
            files = paths.len(),
            workers = self.config.max_workers,
            "indexing started"
        );

        let counters = Arc::new(Mutex::new(FileCounters::default()));
        let outcomes = self.process_files(jobs, &counters, cancel).await?;

        let mut prepared = Vec::new();
        let mut missing = Vec::new();
        for outcome in outcomes {
            match outcome {
                FileOutcome::Prepared(file) => prepared.push(file),
                FileOutcome::Missing(path) => missing.push(path),
                FileOutcome::Unchanged | FileOutcome::Skipped | FileOutcome::Failed => {}
            }
        }

        let is_uncommitted = mode == RunMode::Incremental;
        let provenance = Provenance {
            commit_hash: if is_uncommitted {
                String::new()
            } else {
                latest_commit.clone().unwrap_or_default()
            },
            is_uncommitted,
        };
        let written = self
            .write_files(repo, prepared, &provenance, cancel)
            .await?;

        let mut removed = 0;
        for path in &missing {
            self.remove_file(repo, path).await?;
            removed += 1;
        }
        if let RunMode::Full { .. } = mode {
            let current: HashSet<&str> = paths.iter().map(String::as_str).collect();
            for path in stored.keys().filter(|p| !current.contains(p.as_str())) {
                self.remove_file(repo, path).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::debug!(repo = %repo.id, removed, "stale files removed");
        }

        let (total_chunks, total_files) = self.record_totals(&repo.id).await?;
        let elapsed = start.elapsed();
        let chunks_per_second = throughput(written, elapsed);
        let info = self.embedder.model_info();
        self.records
            .update_repository(
                &repo.id,
                RepositoryUpdate {
                    status: Some(IndexingStatus::Completed),
                    total_chunks: Some(total_chunks),
                    total_files: Some(total_files),
                    last_commit_hash: latest_commit.clone(),
                    embedding_provider: Some(info.provider),
                    embedding_model: Some(info.model),
                    embedding_dimension: Some(info.dimension),
                    last_index_seconds: Some(elapsed.as_secs_f64()),
                    last_chunks_per_second: Some(chunks_per_second),
                },
            )
            .await?;

        let counts = *counters.lock().await;
        Ok(IndexReport {
            repo_id: repo.id.clone(),
            collection: collection.to_owned(),
            total_files: paths.len(),
            indexed_files: counts.indexed,
            skipped_files: counts.skipped,
            failed_files: counts.failed,
            removed_files: removed,
            total_chunks,
            chunks_written: written,
            latest_commit,
            elapsed,
            chunks_per_second,
            status: IndexingStatus::Completed,
        })
    }

    async fn process_files(
        &self,
        jobs: Vec<FileJob>,
        counters: &Arc<Mutex<FileCounters>>,
        cancel: &CancellationToken,
    ) -> Result<Vec<FileOutcome>> {
        let pool = WorkerPool::new(self.config.max_workers);
        let vcs = Arc::clone(&self.vcs);
        let chunker = self.chunker.clone();
        let counters = Arc::clone(counters);
        pool.run(jobs, cancel, move |job| {
            process_file(
                Arc::clone(&vcs),
                chunker.clone(),
                Arc::clone(&counters),
                job,
            )
        })
        .await
    }

    /// Embed and store every prepared file's chunks in batches, then prune the
    /// previous version of each file and record its new hash.
    ///
    /// Every point written here carries the same `index_run` tag; any other point
    /// for a written path is left over from an earlier run and is deleted.
    async fn write_files(
        &self,
        repo: &RepositoryRecord,
        files: Vec<PreparedFile>,
        provenance: &Provenance,
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let collection = repo.collection_name.as_str();
        let run_id = uuid::Uuid::new_v4().to_string();
        let mut written_files = Vec::with_capacity(files.len());
        let mut chunks = Vec::new();

        for file in files {
            let count = file.chunks.len();
            for (ordinal, mut chunk) in file.chunks.into_iter().enumerate() {
                chunk.id = chunk_id(collection, &file.path, ordinal, &chunk.name);
                chunk.file_hash.clone_from(&file.hash);
                chunk.commit_hash.clone_from(&provenance.commit_hash);
                chunk.is_uncommitted = provenance.is_uncommitted;
                chunks.push(chunk);
            }
            written_files.push((file.path, file.hash, file.language, count));
        }

        let total = chunks.len();
        let mut written = 0;
        for batch in chunks.chunks(self.config.batch_size.max(1)) {
            if cancel.is_cancelled() {
                return Err(IndexError::Cancelled);
            }

            let texts: Vec<String> = batch.iter().map(embedding_text).collect();
            let vectors = self
                .embedder
                .embed_batch(&texts, self.config.embed_batch_size)
                .await?;
            if vectors.len() != batch.len() {
                return Err(IndexError::Other(format!(
                    "embedder returned {} vectors for {} chunks",
                    vectors.len(),
                    batch.len()
                )));
            }

            let points = batch
                .iter()
                .zip(vectors)
                .map(|(chunk, vector)| {
                    let mut payload = chunk.payload();
                    payload.insert(
                        RUN_FIELD.to_owned(),
                        serde_json::Value::String(run_id.clone()),
                    );
                    VectorPoint {
                        id: chunk.id.clone(),
                        vector,
                        document: chunk.code.clone(),
                        payload,
                    }
                })
                .collect();
            self.vectors.upsert(collection, points).await?;

            written += batch.len();
            tracing::debug!(collection, written, total, "batch stored");
        }

        for (path, hash, language, count) in written_files {
            self.vectors
                .delete_by_filter(
                    collection,
                    VectorFilter::eq("file_path", path.as_str())
                        .and_not_eq(RUN_FIELD, run_id.as_str()),
                )
                .await?;
            self.records
                .upsert_file_record(
                    &repo.id,
                    &path,
                    &hash,
                    count as u64,
                    language,
                    provenance.is_uncommitted,
                )
                .await?;
        }

        Ok(written)
    }

    async fn remove_file(&self, repo: &RepositoryRecord, path: &str) -> Result<()> {
        let collection = repo.collection_name.as_str();
        if self.vectors.collection_exists(collection).await? {
            self.vectors
                .delete_by_filter(collection, VectorFilter::eq("file_path", path))
                .await?;
        }
        self.records.delete_file_record(&repo.id, path).await?;
        tracing::debug!(repo = %repo.id, file = path, "file chunks removed");
        Ok(())
    }

    async fn record_totals(&self, repo_id: &str) -> Result<(u64, u64)> {
        let records = self.records.list_file_records(repo_id).await?;
        let chunks = records.iter().map(|r| r.chunk_count).sum();
        Ok((chunks, records.len() as u64))
    }

    async fn refresh_totals(&self, repo_id: &str) -> Result<()> {
        let (chunks, files) = self.record_totals(repo_id).await?;
        self.records
            .update_repository(
                repo_id,
                RepositoryUpdate {
                    total_chunks: Some(chunks),
                    total_files: Some(files),
                    ..RepositoryUpdate::default()
                },
            )
            .await?;
        Ok(())
    }

    /// Re-index one repository-relative file outside a full run.
    ///
    /// Returns the number of chunks written: 0 when the content hash is unchanged,
    /// the file is undecodable, or the file no longer exists (its chunks are then removed).
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown repository, `AlreadyIndexing` while a
    /// full or incremental run holds it, `EmbeddingMismatch`, or any read,
    /// embedding or store failure.
    pub async fn index_single_file(
        &self,
        repo_id: &str,
        path: &str,
        is_uncommitted: bool,
    ) -> Result<usize> {
        let repo = self.repository(repo_id).await?;
        if repo.indexing_status == IndexingStatus::InProgress {
            return Err(IndexError::AlreadyIndexing(repo_id.to_owned()));
        }
        check_embedding_identity(&repo, &self.embedder.model_info())?;
        self.vectors
            .ensure_collection(&repo.collection_name, self.embedder.dimension() as u64)
            .await?;

        let Some(bytes) = self.vcs.read_file_at(path, None).await? else {
            self.remove_file(&repo, path).await?;
            self.refresh_totals(repo_id).await?;
            return Ok(0);
        };

        let known_hash = self
            .records
            .get_file_record(repo_id, path)
            .await?
            .filter(|r| is_uncommitted || !r.is_uncommitted)
            .map(|r| r.file_hash);
        let chunker = self.chunker.clone();
        let task_path = path.to_owned();
        let prepared = tokio::task::spawn_blocking(move || {
            prepare_file(&task_path, &bytes, known_hash.as_deref(), &chunker)
        })
        .await?;

        let (hash, language, chunks) = match prepared {
            Prepared::Unchanged => {
                tracing::debug!(file = path, "content unchanged");
                return Ok(0);
            }
            Prepared::Binary => {
                tracing::warn!(file = path, "skipping undecodable file");
                return Ok(0);
            }
            Prepared::Chunks {
                hash,
                language,
                chunks,
            } => (hash, language, chunks),
        };

        let commit_hash = if is_uncommitted {
            String::new()
        } else {
            self.vcs.latest_commit_hash().await?.unwrap_or_default()
        };
        let written = self
            .write_files(
                &repo,
                vec![PreparedFile {
                    path: path.to_owned(),
                    hash,
                    language,
                    chunks,
                }],
                &Provenance {
                    commit_hash,
                    is_uncommitted,
                },
                &CancellationToken::new(),
            )
            .await?;
        self.refresh_totals(repo_id).await?;

        tracing::info!(repo = repo_id, file = path, chunks = written, "file reindexed");
        Ok(written)
    }

    /// Release a run left in progress by a process that was killed, marking it failed.
    ///
    /// Returns whether a run was released.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown repository, or any store failure.
    pub async fn unlock(&self, repo_id: &str) -> Result<bool> {
        match self.records.reset_indexing(repo_id).await {
            Err(repolens_store::RecordStoreError::NotFound(_)) => {
                Err(IndexError::NotFound(format!("repository {repo_id}")))
            }
            other => Ok(other?),
        }
    }

    /// Remove one file's chunks and record.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown repository, or any store failure.
    pub async fn delete_file_chunks(&self, repo_id: &str, path: &str) -> Result<()> {
        let repo = self.repository(repo_id).await?;
        self.remove_file(&repo, path).await?;
        self.refresh_totals(repo_id).await
    }

    /// Record totals plus the live collection size.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown repository, or any store failure.
    pub async fn indexing_stats(&self, repo_id: &str) -> Result<IndexingStats> {
        let repository = self.repository(repo_id).await?;
        let indexed_files = self.records.list_file_records(repo_id).await?.len() as u64;
        let collection_count = if self
            .vectors
            .collection_exists(&repository.collection_name)
            .await?
        {
            self.vectors.count(&repository.collection_name).await?
        } else {
            0
        };
        Ok(IndexingStats {
            repository,
            indexed_files,
            collection_count,
        })
    }
}
