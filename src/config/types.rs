use std::fmt;

use repolens_index::{ChunkerConfig, ContextConfig, IndexerConfig, RerankConfig, RetrievalConfig};
use repolens_llm::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Sensitive string with redacted `Debug` and `Display`.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    #[default]
    Ollama,
    OpenAi,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    #[default]
    Qdrant,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(default)]
    pub records: RecordsConfig,
    #[serde(default)]
    pub chunker: ChunkerConfig,
    #[serde(default)]
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub retrieval: RetrievalSection,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            embedding: EmbeddingConfig::default(),
            vector_store: VectorStoreConfig::default(),
            records: RecordsConfig::default(),
            chunker: ChunkerConfig::default(),
            indexer: IndexerConfig::default(),
            retrieval: RetrievalSection::default(),
            context: ContextConfig::default(),
            watcher: WatcherConfig::default(),
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: EmbeddingBackend,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_base_url")]
    pub base_url: String,
    /// Required for models the provider does not know the size of.
    #[serde(default)]
    pub dimension: Option<usize>,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Only read from `REPOLENS_OPENAI_API_KEY`.
    #[serde(skip)]
    pub api_key: Option<Secret>,
}

fn default_embedding_model() -> String {
    "nomic-embed-text".into()
}

fn default_embedding_base_url() -> String {
    "http://localhost:11434".into()
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingBackend::default(),
            model: default_embedding_model(),
            base_url: default_embedding_base_url(),
            dimension: None,
            retry: RetryPolicy::default(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VectorStoreConfig {
    #[serde(default)]
    pub backend: VectorBackend,
    #[serde(default = "default_qdrant_url")]
    pub url: String,
}

fn default_qdrant_url() -> String {
    "http://localhost:6334".into()
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            backend: VectorBackend::default(),
            url: default_qdrant_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecordsConfig {
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

fn default_sqlite_path() -> String {
    ".repolens/index.db".into()
}

impl Default for RecordsConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
        }
    }
}

/// `[retrieval]` carries both search and rerank settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetrievalSection {
    #[serde(flatten)]
    pub search: RetrievalConfig,
    #[serde(flatten)]
    pub rerank: RerankConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_debounce_ms() -> u64 {
    1000
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}
