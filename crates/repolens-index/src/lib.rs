//! Repository indexing and retrieval.
//!
//! Source files are parsed into structural units, chunked under a token
//! budget, embedded in batches and written to a vector store. Re-indexing is
//! driven by content hashes so unchanged files cost nothing. At query time the
//! retriever searches a collection, the reranker trades relevance against
//! redundancy, and the context assembler renders a budgeted prompt.

pub mod chunker;
pub mod context;
pub mod error;
pub mod indexer;
pub mod languages;
pub mod parser;
pub(crate) mod pool;
pub mod reranker;
pub mod retriever;
pub mod vcs;
pub mod watcher;

pub use chunker::{Chunk, ChunkerConfig};
pub use context::{ContextAssembler, ContextConfig, ContextSummary};
pub use error::{IndexError, Result};
pub use indexer::{IndexReport, IndexerConfig, IndexingStats, RepositoryIndexer};
pub use reranker::RerankConfig;
pub use retriever::{CodeRetriever, RetrievalConfig, RetrievedChunk};
pub use vcs::{GitCli, VersionControl, WorkingTree, open_repository};
pub use watcher::IndexWatcher;
