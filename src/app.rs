//! Component wiring: embedder, stores and per-repository indexer.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use repolens_index::{CodeRetriever, RepositoryIndexer, VersionControl, open_repository};
use repolens_llm::EmbeddingProvider;
use repolens_llm::any::AnyEmbedder;
use repolens_llm::ollama::OllamaEmbedder;
use repolens_llm::openai::OpenAiEmbedder;
use repolens_store::{
    InMemoryVectorStore, QdrantOps, RecordStore, RepositoryRecord, SqliteRecordStore, VectorStore,
};

use crate::config::{Config, EmbeddingBackend, EmbeddingConfig, VectorBackend};

/// Output size of `nomic-embed-text`, the default Ollama model.
const DEFAULT_OLLAMA_DIMENSION: usize = 768;
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared services built once from the configuration.
pub struct App {
    pub config: Config,
    pub embedder: Arc<AnyEmbedder>,
    pub vectors: Arc<dyn VectorStore>,
    pub records: Arc<dyn RecordStore>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("embedder", &self.embedder)
            .finish_non_exhaustive()
    }
}

/// A repository opened for indexing: its id, collection and version control.
pub struct Target {
    pub repo_id: String,
    pub collection: String,
    pub vcs: Arc<dyn VersionControl>,
}

/// # Errors
///
/// Returns an error if the HTTP client cannot be built, an `OpenAI` key is missing,
/// or the Ollama URL is invalid.
pub fn build_embedder(config: &EmbeddingConfig) -> anyhow::Result<AnyEmbedder> {
    match config.provider {
        EmbeddingBackend::OpenAi => {
            let Some(key) = config.api_key.as_ref() else {
                bail!("REPOLENS_OPENAI_API_KEY must be set for the openai embedding provider");
            };
            let client = reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .context("failed to build HTTP client")?;
            Ok(AnyEmbedder::OpenAi(OpenAiEmbedder::new(
                client,
                key.expose().to_owned(),
                config.base_url.clone(),
                config.model.clone(),
                config.dimension,
                config.retry.clone(),
            )))
        }
        EmbeddingBackend::Ollama => Ok(AnyEmbedder::Ollama(OllamaEmbedder::new(
            &config.base_url,
            config.model.clone(),
            config.dimension.unwrap_or(DEFAULT_OLLAMA_DIMENSION),
            config.retry.clone(),
        )?)),
    }
}

/// Repository id derived from the directory name, restricted to `[A-Za-z0-9_-]`.
#[must_use]
pub fn default_repo_id(root: &Path) -> String {
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let id: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if id.is_empty() { "default".into() } else { id }
}

#[must_use]
pub fn collection_name(repo_id: &str) -> String {
    format!("repolens_{repo_id}")
}

impl App {
    /// # Errors
    ///
    /// Returns an error if any backend cannot be initialised.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let embedder = Arc::new(build_embedder(&config.embedding)?);

        let vectors: Arc<dyn VectorStore> = match config.vector_store.backend {
            VectorBackend::Qdrant => Arc::new(
                QdrantOps::new(&config.vector_store.url)
                    .with_context(|| format!("failed to connect to {}", config.vector_store.url))?,
            ),
            VectorBackend::Memory => {
                tracing::warn!("using in-memory vector store, nothing will persist");
                Arc::new(InMemoryVectorStore::new())
            }
        };

        let sqlite_path = PathBuf::from(&config.records.sqlite_path);
        if let Some(parent) = sqlite_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let records = SqliteRecordStore::open(&config.records.sqlite_path)
            .await
            .context("failed to open record store")?;

        tracing::debug!(
            embedder = embedder.name(),
            backend = ?config.vector_store.backend,
            sqlite = %config.records.sqlite_path,
            "components ready"
        );

        Ok(Self {
            config,
            embedder,
            vectors,
            records: Arc::new(records),
        })
    }

    /// # Errors
    ///
    /// Returns an error if `path` is not a readable directory.
    pub async fn open_target(&self, path: &Path, id: Option<&str>) -> anyhow::Result<Target> {
        let vcs: Arc<dyn VersionControl> = Arc::from(
            open_repository(path)
                .await
                .with_context(|| format!("failed to open repository at {}", path.display()))?,
        );
        let repo_id = id.map_or_else(|| default_repo_id(vcs.root()), str::to_owned);
        Ok(Target {
            collection: collection_name(&repo_id),
            repo_id,
            vcs,
        })
    }

    #[must_use]
    pub fn indexer(&self, target: &Target) -> RepositoryIndexer<AnyEmbedder> {
        RepositoryIndexer::new(
            Arc::clone(&self.embedder),
            Arc::clone(&self.vectors),
            Arc::clone(&self.records),
            Arc::clone(&target.vcs),
            self.config.chunker.clone(),
            self.config.indexer.clone(),
        )
    }

    #[must_use]
    pub fn retriever(&self) -> CodeRetriever<AnyEmbedder> {
        CodeRetriever::new(
            Arc::clone(&self.embedder),
            Arc::clone(&self.vectors),
            self.config.retrieval.search.clone(),
        )
    }

    /// # Errors
    ///
    /// Returns an error if the repository was never indexed or the store fails.
    pub async fn repository(&self, repo_id: &str) -> anyhow::Result<RepositoryRecord> {
        self.records
            .get_repository(repo_id)
            .await?
            .with_context(|| format!("repository {repo_id} has not been indexed; run `repolens index` first"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Secret;

    #[test]
    fn repo_id_from_directory_name() {
        assert_eq!(default_repo_id(Path::new("/work/my-app")), "my-app");
        assert_eq!(default_repo_id(Path::new("/work/my app.v2")), "my_app_v2");
        assert_eq!(default_repo_id(Path::new("/")), "default");
        assert_eq!(collection_name("my-app"), "repolens_my-app");
    }

    #[test]
    fn openai_requires_key() {
        let mut config = EmbeddingConfig {
            provider: EmbeddingBackend::OpenAi,
            model: "text-embedding-3-large".into(),
            ..EmbeddingConfig::default()
        };
        assert!(build_embedder(&config).is_err());

        config.api_key = Some(Secret::new("sk-test"));
        let embedder = build_embedder(&config).unwrap();
        assert!(matches!(embedder, AnyEmbedder::OpenAi(_)));
    }

    #[test]
    fn ollama_uses_default_dimension() {
        let embedder = build_embedder(&EmbeddingConfig::default()).unwrap();
        assert_eq!(embedder.dimension(), DEFAULT_OLLAMA_DIMENSION);
    }

    #[tokio::test]
    async fn memory_backend_wiring() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.vector_store.backend = VectorBackend::Memory;
        config.records.sqlite_path = dir
            .path()
            .join("state/index.db")
            .to_string_lossy()
            .into_owned();

        let app = App::new(config).await.unwrap();
        let target = app.open_target(dir.path(), Some("demo")).await.unwrap();
        assert_eq!(target.collection, "repolens_demo");

        let indexer = app.indexer(&target);
        indexer
            .ensure_repository(&target.repo_id, &target.collection)
            .await
            .unwrap();
        let repo = app.repository("demo").await.unwrap();
        assert_eq!(repo.collection_name, "repolens_demo");
        assert!(app.repository("other").await.is_err());
    }
}
