//! Test-only deterministic embedder.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::{LlmError, Result};
use crate::provider::{EmbeddingProvider, ModelInfo};

/// Bag-of-words embedder: each lowercase alphanumeric token is hashed into one
/// of `dimension` buckets, so texts sharing tokens have high cosine similarity.
#[derive(Debug, Clone)]
pub struct MockEmbedder {
    dimension: usize,
    model: String,
    calls: Arc<AtomicUsize>,
    embedded: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
}

impl MockEmbedder {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            model: "mock-embed".into(),
            calls: Arc::new(AtomicUsize::new(0)),
            embedded: Arc::new(AtomicUsize::new(0)),
            fail: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_owned();
        self
    }

    /// Make every subsequent call fail as if retries were exhausted.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of `embed_batch` calls so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Total number of texts embedded so far.
    #[must_use]
    pub fn embedded(&self) -> usize {
        self.embedded.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        let lower = text.to_lowercase();
        for token in lower
            .split(|c: char| !c.is_alphanumeric() && c != '_')
            .filter(|t| !t.is_empty())
        {
            let hash = blake3::hash(token.as_bytes());
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&hash.as_bytes()[..8]);
            let bucket = u64::from_le_bytes(bytes) % self.dimension as u64;
            #[allow(clippy::cast_possible_truncation)]
            {
                v[bucket as usize] += 1.0;
            }
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        } else {
            v[0] = 1.0;
        }
        v
    }
}

impl EmbeddingProvider for MockEmbedder {
    async fn embed_batch(&self, texts: &[String], _batch_size: usize) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(LlmError::RetriesExhausted {
                op: "mock embeddings".into(),
                attempts: 1,
                last: Box::new(LlmError::Unavailable {
                    provider: "mock",
                    message: "injected failure".into(),
                }),
            });
        }
        self.embedded.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "mock"
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            provider: "mock".into(),
            model: self.model.clone(),
            dimension: self.dimension,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn same_text_same_vector() {
        let e = MockEmbedder::new(64);
        assert_eq!(e.vector_for("fn parse"), e.vector_for("fn parse"));
    }

    #[test]
    fn shared_tokens_score_higher() {
        let e = MockEmbedder::new(256);
        let q = e.vector_for("parse config file");
        let near = e.vector_for("def parse_config(): read config file");
        let far = e.vector_for("render button widget");
        assert!(cosine(&q, &near) > cosine(&q, &far));
    }

    #[tokio::test]
    async fn failure_injection() {
        let e = MockEmbedder::new(4);
        e.set_failing(true);
        assert!(e.embed_batch(&["a".into()], 1).await.is_err());
        e.set_failing(false);
        assert_eq!(e.embed_batch(&["a".into()], 1).await.unwrap().len(), 1);
        assert_eq!(e.calls(), 2);
        assert_eq!(e.embedded(), 1);
    }
}
