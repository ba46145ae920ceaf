use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

#[derive(Debug, thiserror::Error)]
pub enum VectorStoreError {
    #[error("connection error: {0}")]
    Connection(String),
    #[error("collection error: {0}")]
    Collection(String),
    #[error("collection {0} does not exist")]
    MissingCollection(String),
    #[error("upsert error: {0}")]
    Upsert(String),
    #[error("search error: {0}")]
    Search(String),
    #[error("delete error: {0}")]
    Delete(String),
    #[error("count error: {0}")]
    Count(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// One chunk as written to a collection.
#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub document: String,
    pub payload: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default)]
pub struct VectorFilter {
    pub must: Vec<FieldCondition>,
    pub must_not: Vec<FieldCondition>,
}

impl VectorFilter {
    /// Filter requiring `field == value`.
    #[must_use]
    pub fn eq(field: &str, value: impl Into<FieldValue>) -> Self {
        Self::default().and_eq(field, value)
    }

    #[must_use]
    pub fn and_eq(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
        self.must.push(FieldCondition {
            field: field.to_owned(),
            value: value.into(),
        });
        self
    }

    #[must_use]
    pub fn and_not_eq(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
        self.must_not.push(FieldCondition {
            field: field.to_owned(),
            value: value.into(),
        });
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.must.is_empty() && self.must_not.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct FieldCondition {
    pub field: String,
    pub value: FieldValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Integer(i64),
    Text(String),
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

/// A search hit. `distance` is cosine distance: 0 for identical direction.
#[derive(Debug, Clone)]
pub struct ScoredVectorPoint {
    pub id: String,
    pub document: String,
    pub payload: HashMap<String, serde_json::Value>,
    pub distance: f32,
}

impl ScoredVectorPoint {
    #[must_use]
    pub fn similarity(&self) -> f32 {
        similarity_from_distance(self.distance)
    }
}

/// Map a non-negative distance onto `(0, 1]`.
#[must_use]
pub fn similarity_from_distance(distance: f32) -> f32 {
    1.0 / (1.0 + distance.max(0.0))
}

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub trait VectorStore: Send + Sync {
    fn ensure_collection(
        &self,
        collection: &str,
        vector_size: u64,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    fn collection_exists(&self, collection: &str) -> BoxFuture<'_, Result<bool, VectorStoreError>>;

    fn delete_collection(&self, collection: &str) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    /// Insert or overwrite points by id.
    fn upsert(
        &self,
        collection: &str,
        points: Vec<VectorPoint>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    /// Nearest points first.
    fn search(
        &self,
        collection: &str,
        vector: Vec<f32>,
        limit: u64,
        filter: Option<VectorFilter>,
    ) -> BoxFuture<'_, Result<Vec<ScoredVectorPoint>, VectorStoreError>>;

    fn delete_by_ids(
        &self,
        collection: &str,
        ids: Vec<String>,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    /// Delete every point matching `filter`. An empty filter is rejected.
    fn delete_by_filter(
        &self,
        collection: &str,
        filter: VectorFilter,
    ) -> BoxFuture<'_, Result<(), VectorStoreError>>;

    fn count(&self, collection: &str) -> BoxFuture<'_, Result<u64, VectorStoreError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn similarity_of_zero_distance_is_one() {
        assert!((similarity_from_distance(0.0) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn similarity_decreases_with_distance() {
        assert!(similarity_from_distance(0.5) > similarity_from_distance(1.0));
        assert!((similarity_from_distance(1.0) - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    fn negative_distance_clamped() {
        assert!((similarity_from_distance(-0.001) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn filter_builder() {
        let f = VectorFilter::eq("file_path", "a.py").and_not_eq("file_hash", "h1");
        assert_eq!(f.must.len(), 1);
        assert_eq!(f.must_not.len(), 1);
        assert_eq!(f.must_not[0].value, FieldValue::Text("h1".into()));
        assert!(!f.is_empty());
        assert!(VectorFilter::default().is_empty());
    }
}
