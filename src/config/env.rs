use super::{Config, EmbeddingBackend, Secret, VectorBackend};

impl Config {
    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_services();
        self.apply_env_overrides_tuning();
    }

    fn apply_env_overrides_services(&mut self) {
        if let Ok(v) = std::env::var("REPOLENS_EMBEDDING_PROVIDER") {
            if let Ok(kind) = serde_json::from_value::<EmbeddingBackend>(serde_json::Value::String(v.clone())) {
                self.embedding.provider = kind;
            } else {
                tracing::warn!("ignoring invalid REPOLENS_EMBEDDING_PROVIDER value: {v}");
            }
        }
        if let Ok(v) = std::env::var("REPOLENS_EMBEDDING_MODEL") {
            self.embedding.model = v;
        }
        if let Ok(v) = std::env::var("REPOLENS_EMBEDDING_BASE_URL") {
            self.embedding.base_url = v;
        }
        if let Ok(v) = std::env::var("REPOLENS_EMBEDDING_DIMENSION")
            && let Ok(dimension) = v.parse::<usize>()
        {
            self.embedding.dimension = Some(dimension);
        }
        if let Ok(v) = std::env::var("REPOLENS_OPENAI_API_KEY")
            && !v.is_empty()
        {
            self.embedding.api_key = Some(Secret::new(v));
        }
        if let Ok(v) = std::env::var("REPOLENS_VECTOR_BACKEND") {
            if let Ok(kind) = serde_json::from_value::<VectorBackend>(serde_json::Value::String(v.clone())) {
                self.vector_store.backend = kind;
            } else {
                tracing::warn!("ignoring invalid REPOLENS_VECTOR_BACKEND value: {v}");
            }
        }
        if let Ok(v) = std::env::var("REPOLENS_QDRANT_URL") {
            self.vector_store.url = v;
        }
        if let Ok(v) = std::env::var("REPOLENS_SQLITE_PATH") {
            self.records.sqlite_path = v;
        }
        if let Ok(v) = std::env::var("REPOLENS_LOG_LEVEL") {
            self.log_level = v;
        }
    }

    fn apply_env_overrides_tuning(&mut self) {
        if let Ok(v) = std::env::var("REPOLENS_MAX_WORKERS")
            && let Ok(n) = v.parse::<usize>()
        {
            self.indexer.max_workers = n;
        }
        if let Ok(v) = std::env::var("REPOLENS_BATCH_SIZE")
            && let Ok(n) = v.parse::<usize>()
        {
            self.indexer.batch_size = n;
        }
        if let Ok(v) = std::env::var("REPOLENS_MAX_CHUNK_TOKENS")
            && let Ok(n) = v.parse::<usize>()
        {
            self.chunker.max_chunk_tokens = n;
        }
        if let Ok(v) = std::env::var("REPOLENS_SEMANTIC_WEIGHT")
            && let Ok(w) = v.parse::<f32>()
        {
            self.retrieval.search.semantic_weight = w;
        }
        if let Ok(v) = std::env::var("REPOLENS_CONTEXT_MAX_TOKENS")
            && let Ok(n) = v.parse::<usize>()
        {
            self.context.max_tokens = n;
        }
        if let Ok(v) = std::env::var("REPOLENS_WATCH_DEBOUNCE_MS")
            && let Ok(ms) = v.parse::<u64>()
        {
            self.watcher.debounce_ms = ms;
        }
    }
}
