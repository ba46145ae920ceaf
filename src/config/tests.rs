use std::io::Write;

use serial_test::serial;

use super::*;

const ENV_KEYS: [&str; 16] = [
    "REPOLENS_EMBEDDING_PROVIDER",
    "REPOLENS_EMBEDDING_MODEL",
    "REPOLENS_EMBEDDING_BASE_URL",
    "REPOLENS_EMBEDDING_DIMENSION",
    "REPOLENS_OPENAI_API_KEY",
    "REPOLENS_VECTOR_BACKEND",
    "REPOLENS_QDRANT_URL",
    "REPOLENS_SQLITE_PATH",
    "REPOLENS_LOG_LEVEL",
    "REPOLENS_MAX_WORKERS",
    "REPOLENS_BATCH_SIZE",
    "REPOLENS_MAX_CHUNK_TOKENS",
    "REPOLENS_SEMANTIC_WEIGHT",
    "REPOLENS_CONTEXT_MAX_TOKENS",
    "REPOLENS_WATCH_DEBOUNCE_MS",
    "REPOLENS_CONFIG",
];

fn clear_env() {
    for key in ENV_KEYS {
        unsafe { std::env::remove_var(key) };
    }
}

fn write_config(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("repolens.toml");
    let mut f = std::fs::File::create(&path).unwrap();
    write!(f, "{contents}").unwrap();
    (dir, path)
}

#[test]
fn defaults() {
    let config = Config::default();
    assert_eq!(config.embedding.provider, EmbeddingBackend::Ollama);
    assert_eq!(config.embedding.base_url, "http://localhost:11434");
    assert!(config.embedding.api_key.is_none());
    assert_eq!(config.embedding.retry.max_attempts, 3);
    assert_eq!(config.embedding.retry.base_delay_ms, 1000);
    assert_eq!(config.vector_store.backend, VectorBackend::Qdrant);
    assert_eq!(config.vector_store.url, "http://localhost:6334");
    assert_eq!(config.chunker.max_chunk_tokens, 1000);
    assert_eq!(config.chunker.overlap_tokens, 50);
    assert_eq!(config.indexer.max_workers, 4);
    assert_eq!(config.indexer.batch_size, 50);
    assert_eq!(config.indexer.embed_batch_size, 100);
    assert!((config.retrieval.search.semantic_weight - 0.7).abs() < f32::EPSILON);
    assert!((config.retrieval.rerank.mmr_lambda - 0.5).abs() < f32::EPSILON);
    assert_eq!(config.retrieval.rerank.rrf_k, 60);
    assert_eq!(config.context.max_tokens, 4000);
    assert_eq!(config.debounce(), std::time::Duration::from_secs(1));
    assert_eq!(config.log_level, "info");
    config.validate().unwrap();
}

#[test]
#[serial]
fn shipped_default_config_matches_defaults() {
    clear_env();
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/default.toml");
    let config = Config::load(&path).unwrap();
    let defaults = Config::default();
    assert_eq!(config.embedding.provider, defaults.embedding.provider);
    assert_eq!(config.embedding.model, defaults.embedding.model);
    assert_eq!(config.embedding.retry, defaults.embedding.retry);
    assert_eq!(config.chunker, defaults.chunker);
    assert_eq!(config.indexer, defaults.indexer);
    assert_eq!(config.retrieval.search, defaults.retrieval.search);
    assert_eq!(config.retrieval.rerank, defaults.retrieval.rerank);
    assert_eq!(config.context.max_tokens, defaults.context.max_tokens);
    assert_eq!(config.watcher.debounce_ms, defaults.watcher.debounce_ms);
    assert_eq!(config.records.sqlite_path, defaults.records.sqlite_path);
}

#[test]
#[serial]
fn missing_file_gives_defaults() {
    clear_env();
    let config = Config::load(Path::new("/nonexistent/repolens.toml")).unwrap();
    assert_eq!(config.indexer.max_workers, 4);
}

#[test]
#[serial]
fn parse_valid_toml() {
    clear_env();
    let (_dir, path) = write_config(
        r#"
log_level = "debug"

[embedding]
provider = "openai"
model = "text-embedding-3-small"
base_url = "https://api.openai.com/v1"

[embedding.retry]
max_attempts = 5

[vector_store]
backend = "memory"

[chunker]
max_chunk_tokens = 500

[retrieval]
semantic_weight = 0.5
mmr_lambda = 0.8
rrf_k = 30

[watcher]
debounce_ms = 250
"#,
    );

    let config = Config::load(&path).unwrap();
    assert_eq!(config.log_level, "debug");
    assert_eq!(config.embedding.provider, EmbeddingBackend::OpenAi);
    assert_eq!(config.embedding.model, "text-embedding-3-small");
    assert_eq!(config.embedding.retry.max_attempts, 5);
    assert_eq!(config.embedding.retry.base_delay_ms, 1000);
    assert_eq!(config.vector_store.backend, VectorBackend::Memory);
    assert_eq!(config.chunker.max_chunk_tokens, 500);
    assert_eq!(config.chunker.overlap_tokens, 50);
    assert!((config.retrieval.search.semantic_weight - 0.5).abs() < f32::EPSILON);
    assert_eq!(config.retrieval.search.default_results, 10);
    assert!((config.retrieval.rerank.mmr_lambda - 0.8).abs() < f32::EPSILON);
    assert_eq!(config.retrieval.rerank.rrf_k, 30);
    assert_eq!(config.watcher.debounce_ms, 250);
}

#[test]
#[serial]
fn malformed_toml_is_an_error() {
    clear_env();
    let (_dir, path) = write_config("[indexer\nmax_workers = ");
    assert!(Config::load(&path).is_err());
}

#[test]
#[serial]
fn env_overrides_file() {
    clear_env();
    let (_dir, path) = write_config("[indexer]\nmax_workers = 2\n");
    unsafe {
        std::env::set_var("REPOLENS_MAX_WORKERS", "8");
        std::env::set_var("REPOLENS_EMBEDDING_PROVIDER", "openai");
        std::env::set_var("REPOLENS_QDRANT_URL", "http://qdrant:6334");
        std::env::set_var("REPOLENS_SEMANTIC_WEIGHT", "0.25");
    }

    let config = Config::load(&path).unwrap();
    clear_env();

    assert_eq!(config.indexer.max_workers, 8);
    assert_eq!(config.embedding.provider, EmbeddingBackend::OpenAi);
    assert_eq!(config.vector_store.url, "http://qdrant:6334");
    assert!((config.retrieval.search.semantic_weight - 0.25).abs() < f32::EPSILON);
}

#[test]
#[serial]
fn invalid_env_values_are_ignored() {
    clear_env();
    unsafe {
        std::env::set_var("REPOLENS_MAX_WORKERS", "many");
        std::env::set_var("REPOLENS_VECTOR_BACKEND", "cassandra");
    }
    let mut config = Config::default();
    config.apply_env_overrides();
    clear_env();

    assert_eq!(config.indexer.max_workers, 4);
    assert_eq!(config.vector_store.backend, VectorBackend::Qdrant);
}

#[test]
#[serial]
fn api_key_only_from_env_and_redacted() {
    clear_env();
    let (_dir, path) = write_config("[embedding]\napi_key = \"from-file\"\n");
    let config = Config::load(&path).unwrap();
    assert!(config.embedding.api_key.is_none());

    unsafe { std::env::set_var("REPOLENS_OPENAI_API_KEY", "sk-secret") };
    let config = Config::load(&path).unwrap();
    clear_env();

    let key = config.embedding.api_key.as_ref().unwrap();
    assert_eq!(key.expose(), "sk-secret");
    let debug = format!("{config:?}");
    assert!(!debug.contains("sk-secret"));
    assert!(debug.contains("[REDACTED]"));
}

#[test]
fn validate_rejects_zero_workers() {
    let mut config = Config::default();
    config.indexer.max_workers = 0;
    assert!(config.validate().is_err());
}

#[test]
fn validate_rejects_overlap_not_below_size() {
    let mut config = Config::default();
    config.chunker.overlap_tokens = config.chunker.max_chunk_tokens;
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("overlap_tokens"));
}

#[test]
fn validate_rejects_weights_outside_unit_range() {
    let mut config = Config::default();
    config.retrieval.search.semantic_weight = 1.5;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.retrieval.rerank.mmr_lambda = -0.1;
    assert!(config.validate().is_err());
}

#[test]
fn validate_rejects_zero_dimension() {
    let mut config = Config::default();
    config.embedding.dimension = Some(0);
    assert!(config.validate().is_err());
}
