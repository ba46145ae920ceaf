mod env;
mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};

impl Config {
    /// Load configuration from a TOML file with env var overrides.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or if
    /// the resulting values fail [`Config::validate`].
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str::<Self>(&content).context("failed to parse config file")?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Reject values no component can work with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending field.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.indexer.max_workers == 0 {
            bail!("indexer.max_workers must be at least 1");
        }
        if self.indexer.batch_size == 0 || self.indexer.embed_batch_size == 0 {
            bail!("indexer batch sizes must be at least 1");
        }
        if self.chunker.max_chunk_tokens == 0 {
            bail!("chunker.max_chunk_tokens must be at least 1");
        }
        if self.chunker.overlap_tokens >= self.chunker.max_chunk_tokens {
            bail!(
                "chunker.overlap_tokens ({}) must be smaller than max_chunk_tokens ({})",
                self.chunker.overlap_tokens,
                self.chunker.max_chunk_tokens
            );
        }
        for (name, value) in [
            ("retrieval.semantic_weight", self.retrieval.search.semantic_weight),
            ("retrieval.min_similarity", self.retrieval.search.min_similarity),
            ("retrieval.mmr_lambda", self.retrieval.rerank.mmr_lambda),
        ] {
            if !(0.0..=1.0).contains(&value) {
                bail!("{name} must be within [0, 1], got {value}");
            }
        }
        if self.retrieval.rerank.rrf_k == 0 {
            bail!("retrieval.rrf_k must be at least 1");
        }
        if self.context.max_tokens == 0 {
            bail!("context.max_tokens must be at least 1");
        }
        if self.embedding.dimension == Some(0) {
            bail!("embedding.dimension must be positive");
        }
        if self.embedding.retry.max_attempts == 0 {
            bail!("embedding.retry.max_attempts must be at least 1");
        }
        Ok(())
    }

    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.watcher.debounce_ms)
    }
}
