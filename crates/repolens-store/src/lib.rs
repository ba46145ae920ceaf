//! Vector store and bookkeeping backends for repolens.
//!
//! [`VectorStore`] holds one collection of embedded chunks per repository.
//! [`RecordStore`] tracks repositories, their indexing status and the content
//! hash of every indexed file.

pub mod error;
pub mod in_memory_store;
pub mod qdrant_ops;
pub mod records;
pub mod sqlite;
pub mod vector_store;

pub use error::RecordStoreError;
pub use in_memory_store::InMemoryVectorStore;
pub use qdrant_ops::QdrantOps;
pub use records::{
    FileRecord, IndexingStatus, NewRepository, RecordStore, RepositoryRecord, RepositoryUpdate,
};
pub use sqlite::SqliteRecordStore;
pub use vector_store::{
    BoxFuture, FieldCondition, FieldValue, ScoredVectorPoint, VectorFilter, VectorPoint,
    VectorStore, VectorStoreError, similarity_from_distance,
};
