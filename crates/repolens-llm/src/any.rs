#[cfg(any(test, feature = "mock"))]
use crate::mock::MockEmbedder;
use crate::ollama::OllamaEmbedder;
use crate::openai::OpenAiEmbedder;
use crate::provider::{EmbeddingProvider, ModelInfo};

/// Generates a match over all `AnyEmbedder` variants, binding the inner embedder
/// and evaluating the given expression for each arm.
macro_rules! delegate_embedder {
    ($self:expr, |$p:ident| $expr:expr) => {
        match $self {
            AnyEmbedder::OpenAi($p) => $expr,
            AnyEmbedder::Ollama($p) => $expr,
            #[cfg(any(test, feature = "mock"))]
            AnyEmbedder::Mock($p) => $expr,
        }
    };
}

/// Embedder selected from configuration at startup.
#[derive(Debug, Clone)]
pub enum AnyEmbedder {
    OpenAi(OpenAiEmbedder),
    Ollama(OllamaEmbedder),
    #[cfg(any(test, feature = "mock"))]
    Mock(MockEmbedder),
}

impl EmbeddingProvider for AnyEmbedder {
    async fn embed_batch(
        &self,
        texts: &[String],
        batch_size: usize,
    ) -> crate::error::Result<Vec<Vec<f32>>> {
        delegate_embedder!(self, |p| p.embed_batch(texts, batch_size).await)
    }

    fn dimension(&self) -> usize {
        delegate_embedder!(self, |p| p.dimension())
    }

    fn name(&self) -> &str {
        delegate_embedder!(self, |p| p.name())
    }

    fn model_info(&self) -> ModelInfo {
        delegate_embedder!(self, |p| p.model_info())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;

    #[test]
    fn delegates_identity() {
        let e = AnyEmbedder::Ollama(OllamaEmbedder::new(
            "http://localhost:11434",
            "all-minilm".into(),
            384,
            RetryPolicy::default(),
        )
        .unwrap());
        assert_eq!(e.name(), "ollama");
        assert_eq!(e.dimension(), 384);
        assert_eq!(e.model_info().model, "all-minilm");
    }

    #[cfg(any(test, feature = "mock"))]
    #[tokio::test]
    async fn delegates_embedding() {
        let e = AnyEmbedder::Mock(MockEmbedder::new(8));
        let vectors = e
            .embed_batch(&["a".to_owned(), "b".to_owned()], 1)
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0].len(), 8);
    }
}
