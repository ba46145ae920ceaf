//! Query-time similarity search over a repository collection.

use std::collections::HashMap;
use std::sync::Arc;

use repolens_llm::EmbeddingProvider;
use repolens_store::{
    RepositoryRecord, ScoredVectorPoint, VectorFilter, VectorStore, VectorStoreError,
};
use serde::{Deserialize, Serialize};

use crate::chunker::compose_embedding_text;
use crate::error::Result;
use crate::indexer::check_embedding_identity;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    #[serde(default = "default_results")]
    pub default_results: usize,
    /// Hits below this similarity are dropped.
    #[serde(default)]
    pub min_similarity: f32,
    /// Weight of vector similarity in hybrid search; keywords get the rest.
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f32,
}

fn default_results() -> usize {
    10
}

fn default_semantic_weight() -> f32 {
    0.7
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_results: default_results(),
            min_similarity: 0.0,
            semantic_weight: default_semantic_weight(),
        }
    }
}

/// A search hit with its metadata decoded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    pub id: String,
    pub code: String,
    pub similarity: f32,
    pub distance: f32,
    pub file_path: String,
    pub chunk_type: String,
    pub name: String,
    pub language: String,
    pub start_line: usize,
    pub end_line: usize,
    pub line_count: usize,
    /// Every stored payload field, as strings.
    pub metadata: HashMap<String, String>,
    pub keyword_score: Option<f32>,
    pub hybrid_score: Option<f32>,
    pub rrf_score: Option<f32>,
    pub rrf_rank: Option<usize>,
    pub mmr_rank: Option<usize>,
}

impl RetrievedChunk {
    #[must_use]
    pub fn from_point(point: ScoredVectorPoint) -> Self {
        let similarity = point.similarity();
        let metadata: HashMap<String, String> = point
            .payload
            .into_iter()
            .map(|(k, v)| {
                let s = match v {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, s)
            })
            .collect();

        let text = |key: &str, fallback: &str| {
            metadata
                .get(key)
                .cloned()
                .unwrap_or_else(|| fallback.to_owned())
        };
        let number = |key: &str| {
            metadata
                .get(key)
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(0)
        };

        Self {
            id: point.id,
            code: point.document,
            similarity,
            distance: point.distance,
            file_path: text("file_path", ""),
            chunk_type: text("chunk_type", "unknown"),
            name: text("name", "unknown"),
            language: text("language", "unknown"),
            start_line: number("start_line"),
            end_line: number("end_line"),
            line_count: number("line_count"),
            metadata,
            keyword_score: None,
            hybrid_score: None,
            rrf_score: None,
            rrf_rank: None,
            mmr_rank: None,
        }
    }

    /// Metadata flag stored as `"true"`/`"false"`.
    #[must_use]
    pub fn flag(&self, key: &str) -> bool {
        self.metadata.get(key).is_some_and(|v| v == "true")
    }

    /// The text this chunk's stored vector was computed from.
    #[must_use]
    pub fn embedding_text(&self) -> String {
        let imports = self.metadata.get("imports").map_or("", String::as_str);
        compose_embedding_text(
            &self.file_path,
            &self.chunk_type,
            &self.name,
            &self.language,
            imports.lines(),
            &self.code,
        )
    }
}

#[cfg(test)]
impl RetrievedChunk {
    pub(crate) fn sample(id: &str, file_path: &str, chunk_type: &str, similarity: f32, code: &str) -> Self {
        Self {
            id: id.to_owned(),
            code: code.to_owned(),
            similarity,
            distance: 1.0 / similarity.max(f32::EPSILON) - 1.0,
            file_path: file_path.to_owned(),
            chunk_type: chunk_type.to_owned(),
            name: id.to_owned(),
            language: "python".to_owned(),
            start_line: 1,
            end_line: code.lines().count().max(1),
            line_count: code.lines().count().max(1),
            metadata: HashMap::new(),
            keyword_score: None,
            hybrid_score: None,
            rrf_score: None,
            rrf_rank: None,
            mmr_rank: None,
        }
    }
}

/// Query vector plus freshly embedded candidate vectors, aligned with `chunks`.
#[derive(Debug, Clone)]
pub struct ScoredWithVectors {
    pub query_vector: Vec<f32>,
    pub chunks: Vec<RetrievedChunk>,
    pub vectors: Vec<Vec<f32>>,
}

/// Fraction of `keywords` occurring (case-insensitively) in `code`.
#[must_use]
pub fn keyword_score(code: &str, keywords: &[String]) -> f32 {
    if keywords.is_empty() {
        return 0.0;
    }
    let lower = code.to_lowercase();
    let hits = keywords
        .iter()
        .filter(|k| lower.contains(&k.to_lowercase()))
        .count();
    #[allow(clippy::cast_precision_loss)]
    let score = hits as f32 / keywords.len() as f32;
    score
}

pub struct CodeRetriever<E> {
    embedder: Arc<E>,
    vectors: Arc<dyn VectorStore>,
    config: RetrievalConfig,
}

impl<E> std::fmt::Debug for CodeRetriever<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeRetriever")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<E: EmbeddingProvider> CodeRetriever<E> {
    #[must_use]
    pub fn new(embedder: Arc<E>, vectors: Arc<dyn VectorStore>, config: RetrievalConfig) -> Self {
        Self {
            embedder,
            vectors,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Fail if this retriever's embedder is not the one `repo` was indexed with.
    ///
    /// # Errors
    ///
    /// Returns `IndexError::EmbeddingMismatch` on any difference.
    pub fn check_embedding_identity(&self, repo: &RepositoryRecord) -> Result<()> {
        check_embedding_identity(repo, &self.embedder.model_info())
    }

    async fn search_vector(
        &self,
        collection: &str,
        vector: Vec<f32>,
        n: usize,
        filter: Option<VectorFilter>,
        min_similarity: f32,
    ) -> Result<Vec<RetrievedChunk>> {
        if n == 0 || !self.vectors.collection_exists(collection).await? {
            tracing::debug!(collection, "no index to search");
            return Ok(Vec::new());
        }

        let hits = match self
            .vectors
            .search(collection, vector, n as u64, filter)
            .await
        {
            Ok(hits) => hits,
            Err(VectorStoreError::MissingCollection(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(hits
            .into_iter()
            .map(RetrievedChunk::from_point)
            .filter(|c| c.similarity >= min_similarity)
            .collect())
    }

    /// Nearest chunks to `query`, most similar first.
    ///
    /// A collection that does not exist yet yields an empty list.
    ///
    /// # Errors
    ///
    /// Returns an error if embedding the query or searching fails.
    pub async fn retrieve(
        &self,
        collection: &str,
        query: &str,
        n: usize,
        filter: Option<VectorFilter>,
        min_similarity: f32,
    ) -> Result<Vec<RetrievedChunk>> {
        if !self.vectors.collection_exists(collection).await? {
            tracing::debug!(collection, "collection missing, nothing to retrieve");
            return Ok(Vec::new());
        }
        let vector = self.embedder.embed(query).await?;
        let chunks = self
            .search_vector(collection, vector, n, filter, min_similarity)
            .await?;
        tracing::debug!(collection, n, found = chunks.len(), "retrieved chunks");
        Ok(chunks)
    }

    /// # Errors
    ///
    /// See [`Self::retrieve`].
    pub async fn retrieve_by_file(
        &self,
        collection: &str,
        query: &str,
        file_path: &str,
        n: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        let filter = VectorFilter::eq("file_path", file_path);
        self.retrieve(collection, query, n, Some(filter), self.config.min_similarity)
            .await
    }

    /// # Errors
    ///
    /// See [`Self::retrieve`].
    pub async fn retrieve_by_language(
        &self,
        collection: &str,
        query: &str,
        language: &str,
        n: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        let filter = VectorFilter::eq("language", language);
        self.retrieve(collection, query, n, Some(filter), self.config.min_similarity)
            .await
    }

    /// # Errors
    ///
    /// See [`Self::retrieve`].
    pub async fn retrieve_by_type(
        &self,
        collection: &str,
        query: &str,
        chunk_type: &str,
        n: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        let filter = VectorFilter::eq("chunk_type", chunk_type);
        self.retrieve(collection, query, n, Some(filter), self.config.min_similarity)
            .await
    }

    /// Only chunks indexed from uncommitted changes.
    ///
    /// # Errors
    ///
    /// See [`Self::retrieve`].
    pub async fn retrieve_uncommitted(
        &self,
        collection: &str,
        query: &str,
        n: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        let filter = VectorFilter::eq("is_uncommitted", "true");
        self.retrieve(collection, query, n, Some(filter), self.config.min_similarity)
            .await
    }

    /// Chunks resembling `snippet`. With `exclude_exact`, a chunk whose trimmed
    /// code equals the trimmed snippet is dropped and one extra hit is fetched.
    ///
    /// # Errors
    ///
    /// See [`Self::retrieve`].
    pub async fn find_similar_code(
        &self,
        collection: &str,
        snippet: &str,
        n: usize,
        exclude_exact: bool,
    ) -> Result<Vec<RetrievedChunk>> {
        let fetch = if exclude_exact { n + 1 } else { n };
        let mut chunks = self
            .retrieve(collection, snippet, fetch, None, self.config.min_similarity)
            .await?;
        if exclude_exact {
            let needle = snippet.trim();
            chunks.retain(|c| c.code.trim() != needle);
        }
        chunks.truncate(n);
        Ok(chunks)
    }

    /// Blend vector similarity with keyword overlap:
    /// `hybrid = w * similarity + (1 - w) * hits / keywords`.
    ///
    /// Fetches `2n` candidates and returns the best `n` by hybrid score.
    ///
    /// # Errors
    ///
    /// See [`Self::retrieve`].
    pub async fn hybrid_search(
        &self,
        collection: &str,
        query: &str,
        keywords: &[String],
        n: usize,
        semantic_weight: f32,
    ) -> Result<Vec<RetrievedChunk>> {
        let weight = semantic_weight.clamp(0.0, 1.0);
        let mut chunks = self
            .retrieve(collection, query, n * 2, None, self.config.min_similarity)
            .await?;

        for chunk in &mut chunks {
            let kw = keyword_score(&chunk.code, keywords);
            chunk.keyword_score = Some(kw);
            chunk.hybrid_score = Some(weight * chunk.similarity + (1.0 - weight) * kw);
        }
        chunks.sort_by(|a, b| {
            b.hybrid_score
                .unwrap_or(0.0)
                .total_cmp(&a.hybrid_score.unwrap_or(0.0))
        });
        chunks.truncate(n);
        Ok(chunks)
    }

    /// Retrieve and also embed each candidate, for vector-based MMR.
    ///
    /// # Errors
    ///
    /// See [`Self::retrieve`].
    pub async fn retrieve_with_vectors(
        &self,
        collection: &str,
        query: &str,
        n: usize,
        filter: Option<VectorFilter>,
    ) -> Result<ScoredWithVectors> {
        let query_vector = self.embedder.embed(query).await?;
        let chunks = self
            .search_vector(
                collection,
                query_vector.clone(),
                n,
                filter,
                self.config.min_similarity,
            )
            .await?;
        let vectors = if chunks.is_empty() {
            Vec::new()
        } else {
            let texts: Vec<String> = chunks.iter().map(RetrievedChunk::embedding_text).collect();
            self.embedder.embed_batch(&texts, texts.len()).await?
        };
        Ok(ScoredWithVectors {
            query_vector,
            chunks,
            vectors,
        })
    }
}

#[cfg(test)]
mod tests {
    use repolens_llm::mock::MockEmbedder;
    use repolens_store::{InMemoryVectorStore, VectorPoint};

    use super::*;

    fn point(id: &str, code: &str, path: &str, lang: &str, kind: &str, uncommitted: bool) -> (String, String, HashMap<String, serde_json::Value>) {
        let mut payload = HashMap::new();
        for (k, v) in [
            ("file_path", path),
            ("language", lang),
            ("chunk_type", kind),
            ("name", id),
            ("start_line", "3"),
            ("end_line", "9"),
            ("line_count", "7"),
            ("is_uncommitted", if uncommitted { "true" } else { "false" }),
        ] {
            payload.insert(k.to_owned(), serde_json::Value::String(v.to_owned()));
        }
        (id.to_owned(), code.to_owned(), payload)
    }

    async fn setup() -> (CodeRetriever<MockEmbedder>, Arc<InMemoryVectorStore>) {
        let embedder = MockEmbedder::new(256);
        let store = Arc::new(InMemoryVectorStore::new());
        store.ensure_collection("repo", 256).await.unwrap();

        let rows = [
            point("parse_config", "def parse_config(path): return toml load path", "cfg.py", "python", "function", false),
            point("Server", "class Server: handles http requests and routes", "srv.py", "python", "class", false),
            point("render", "function render(view) { return html view }", "ui.js", "javascript", "function", true),
            point("notes", "release notes and changelog text", "NOTES.md", "markdown", "section", false),
        ];
        let points = rows
            .into_iter()
            .map(|(id, code, payload)| VectorPoint {
                vector: embedder.vector_for(&code),
                id,
                document: code,
                payload,
            })
            .collect();
        store.upsert("repo", points).await.unwrap();

        let retriever = CodeRetriever::new(
            Arc::new(embedder),
            Arc::clone(&store) as Arc<dyn VectorStore>,
            RetrievalConfig::default(),
        );
        (retriever, store)
    }

    #[test]
    fn default_config() {
        let c = RetrievalConfig::default();
        assert_eq!(c.default_results, 10);
        assert!((c.semantic_weight - 0.7).abs() < f32::EPSILON);
    }

    #[test]
    fn from_point_decodes_numbers_and_defaults() {
        let (id, code, mut payload) = point("f", "x", "a.py", "python", "function", false);
        payload.insert("param_count".into(), serde_json::json!(2));
        payload.remove("language");
        let chunk = RetrievedChunk::from_point(ScoredVectorPoint {
            id,
            document: code,
            payload,
            distance: 1.0,
        });
        assert_eq!(chunk.start_line, 3);
        assert_eq!(chunk.end_line, 9);
        assert_eq!(chunk.line_count, 7);
        assert_eq!(chunk.language, "unknown");
        assert_eq!(chunk.metadata["param_count"], "2");
        assert!((chunk.similarity - 0.5).abs() < 1e-6);
        assert!(!chunk.flag("is_uncommitted"));
    }

    #[test]
    fn keyword_scoring() {
        let kws = vec!["Parse".to_owned(), "toml".to_owned(), "yaml".to_owned(), "x".to_owned()];
        let s = keyword_score("def parse(): toml", &kws);
        assert!((s - 0.5).abs() < 1e-6);
        assert!(keyword_score("anything", &[]).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn retrieve_ranks_best_match_first() {
        let (retriever, _) = setup().await;
        let hits = retriever
            .retrieve("repo", "parse_config toml load path", 3, None, 0.0)
            .await
            .unwrap();
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].name, "parse_config");
        assert!(hits.windows(2).all(|w| w[0].similarity >= w[1].similarity));
    }

    #[tokio::test]
    async fn missing_collection_is_empty() {
        let (retriever, _) = setup().await;
        let hits = retriever.retrieve("nope", "q", 5, None, 0.0).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn similarity_floor_applied() {
        let (retriever, _) = setup().await;
        let hits = retriever
            .retrieve("repo", "parse_config toml load path", 4, None, 0.99)
            .await
            .unwrap();
        assert!(hits.iter().all(|h| h.similarity >= 0.99));
    }

    #[tokio::test]
    async fn filtered_variants() {
        let (retriever, _) = setup().await;
        let by_lang = retriever
            .retrieve_by_language("repo", "code", "javascript", 10)
            .await
            .unwrap();
        assert_eq!(by_lang.len(), 1);
        assert_eq!(by_lang[0].file_path, "ui.js");

        let by_type = retriever
            .retrieve_by_type("repo", "code", "function", 10)
            .await
            .unwrap();
        assert_eq!(by_type.len(), 2);

        let by_file = retriever
            .retrieve_by_file("repo", "code", "srv.py", 10)
            .await
            .unwrap();
        assert_eq!(by_file.len(), 1);

        let uncommitted = retriever
            .retrieve_uncommitted("repo", "code", 10)
            .await
            .unwrap();
        assert_eq!(uncommitted.len(), 1);
        assert!(uncommitted[0].flag("is_uncommitted"));
    }

    #[tokio::test]
    async fn find_similar_excludes_exact_match() {
        let (retriever, _) = setup().await;
        let snippet = "  class Server: handles http requests and routes\n";
        let with = retriever
            .find_similar_code("repo", snippet, 2, false)
            .await
            .unwrap();
        assert_eq!(with[0].name, "Server");

        let without = retriever
            .find_similar_code("repo", snippet, 2, true)
            .await
            .unwrap();
        assert_eq!(without.len(), 2);
        assert!(without.iter().all(|c| c.name != "Server"));
    }

    #[tokio::test]
    async fn hybrid_search_boosts_keywords() {
        let (retriever, _) = setup().await;
        let keywords = vec!["changelog".to_owned()];
        let hits = retriever
            .hybrid_search("repo", "parse_config toml load path", &keywords, 2, 0.0)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].name, "notes");
        assert_eq!(hits[0].keyword_score, Some(1.0));
        assert!(hits.iter().all(|h| h.hybrid_score.is_some()));
    }

    #[tokio::test]
    async fn hybrid_with_full_semantic_weight_keeps_similarity_order() {
        let (retriever, _) = setup().await;
        let keywords = vec!["changelog".to_owned()];
        let hits = retriever
            .hybrid_search("repo", "parse_config toml load path", &keywords, 2, 1.0)
            .await
            .unwrap();
        assert_eq!(hits[0].name, "parse_config");
    }

    #[tokio::test]
    async fn retrieve_with_vectors_aligns() {
        let (retriever, _) = setup().await;
        let out = retriever
            .retrieve_with_vectors("repo", "http server", 3, None)
            .await
            .unwrap();
        assert_eq!(out.chunks.len(), 3);
        assert_eq!(out.vectors.len(), 3);
        assert_eq!(out.query_vector.len(), 256);
    }

    #[tokio::test]
    async fn rerank_vectors_match_indexed_vectors() {
        let embedder = MockEmbedder::new(64);
        let store = Arc::new(InMemoryVectorStore::new());
        store.ensure_collection("repo", 64).await.unwrap();

        let mut chunk = crate::chunker::Chunk::new(
            "src/net.py",
            "python",
            crate::parser::ChunkType::Function,
            "fetch",
            "def fetch(url):\n    return get(url)".into(),
            4,
            5,
        );
        chunk.imports = vec!["import requests".into(), "from http import client".into()];
        let stored = embedder.vector_for(&crate::chunker::embedding_text(&chunk));
        store
            .upsert(
                "repo",
                vec![VectorPoint {
                    id: "fetch".into(),
                    vector: stored.clone(),
                    document: chunk.code.clone(),
                    payload: chunk.payload(),
                }],
            )
            .await
            .unwrap();

        let retriever = CodeRetriever::new(
            Arc::new(embedder),
            Arc::clone(&store) as Arc<dyn VectorStore>,
            RetrievalConfig::default(),
        );
        let out = retriever
            .retrieve_with_vectors("repo", "fetch url", 1, None)
            .await
            .unwrap();
        assert_eq!(out.vectors, vec![stored]);
    }

    #[tokio::test]
    async fn identity_check_uses_embedder() {
        let (retriever, _) = setup().await;
        let mut repo = RepositoryRecord {
            id: "r".into(),
            path: "/r".into(),
            collection_name: "repo".into(),
            embedding_provider: Some("mock".into()),
            embedding_model: Some("other-model".into()),
            embedding_dimension: Some(256),
            indexing_status: repolens_store::IndexingStatus::Completed,
            total_chunks: 0,
            total_files: 0,
            last_commit_hash: None,
            last_indexed_at: None,
            last_index_seconds: None,
            last_chunks_per_second: None,
        };
        assert!(retriever.check_embedding_identity(&repo).is_err());
        repo.embedding_provider = None;
        assert!(retriever.check_embedding_identity(&repo).is_ok());
    }
}
