//! Error types for repolens-index.

use repolens_llm::LlmError;
use repolens_store::{RecordStoreError, VectorStoreError};

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Embedding failed after the retry policy gave up.
    #[error("embedding error: {0}")]
    Embedding(#[from] LlmError),

    #[error("vector store error: {0}")]
    VectorStore(#[from] VectorStoreError),

    #[error("record store error: {0}")]
    Records(#[from] RecordStoreError),

    /// Unknown repository, missing collection or non-repository path.
    #[error("not found: {0}")]
    NotFound(String),

    /// Another run holds the repository.
    #[error("repository {0} is already being indexed")]
    AlreadyIndexing(String),

    #[error("embedding model mismatch: collection built with {expected}, query uses {actual}")]
    EmbeddingMismatch { expected: String, actual: String },

    #[error("indexing cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("version control error: {0}")]
    Vcs(String),

    #[error("watcher error: {0}")]
    Watcher(#[from] notify::Error),

    #[error("{0}")]
    Other(String),
}

impl From<tokio::task::JoinError> for IndexError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Other(format!("worker task failed: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;
