use ollama_rs::Ollama;
use ollama_rs::error::OllamaError;
use ollama_rs::generation::embeddings::request::{EmbeddingsInput, GenerateEmbeddingsRequest};

use crate::error::{LlmError, Result};
use crate::provider::{EmbeddingProvider, ModelInfo, batch_ranges};
use crate::retry::RetryPolicy;

/// Inputs per `/api/embed` call.
pub const OLLAMA_BATCH_CAP: usize = 64;

/// Embedder backed by a local or remote Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaEmbedder {
    client: Ollama,
    model: String,
    dimension: usize,
    retry: RetryPolicy,
}

impl OllamaEmbedder {
    /// Ollama does not report dimensions up front, so the caller supplies it.
    ///
    /// # Errors
    ///
    /// Returns `LlmError::Other` if `base_url` is not a valid URL.
    pub fn new(base_url: &str, model: String, dimension: usize, retry: RetryPolicy) -> Result<Self> {
        let client = Ollama::try_new(base_url)
            .map_err(|e| LlmError::Other(format!("invalid Ollama URL {base_url}: {e}")))?;
        Ok(Self {
            client,
            model,
            dimension,
            retry,
        })
    }

    async fn request_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let request =
            GenerateEmbeddingsRequest::new(self.model.clone(), EmbeddingsInput::Multiple(batch.to_vec()));

        let response = self
            .client
            .generate_embeddings(request)
            .await
            .map_err(classify)?;

        if response.embeddings.len() != batch.len() {
            return Err(LlmError::CountMismatch {
                provider: "ollama",
                expected: batch.len(),
                got: response.embeddings.len(),
            });
        }
        if response.embeddings.iter().any(Vec::is_empty) {
            return Err(LlmError::EmptyResponse { provider: "ollama" });
        }
        Ok(response.embeddings)
    }
}

impl EmbeddingProvider for OllamaEmbedder {
    async fn embed_batch(&self, texts: &[String], batch_size: usize) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for range in batch_ranges(texts.len(), batch_size, OLLAMA_BATCH_CAP) {
            let batch = &texts[range];
            let vectors = self
                .retry
                .retry("ollama embeddings", || self.request_batch(batch))
                .await?;
            out.extend(vectors);
        }
        Ok(out)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "ollama"
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            provider: "ollama".into(),
            model: self.model.clone(),
            dimension: self.dimension,
        }
    }
}

/// Map a client error onto the retry classification: connection trouble and a
/// busy server are transient, a rejected request (unknown model, bad input) is not.
fn classify(err: OllamaError) -> LlmError {
    match err {
        OllamaError::ReqwestError(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
            LlmError::Unavailable {
                provider: "ollama",
                message: e.to_string(),
            }
        }
        OllamaError::JsonError(e) => LlmError::Json(e),
        OllamaError::Other(body) if is_busy(&body) => LlmError::Unavailable {
            provider: "ollama",
            message: body,
        },
        OllamaError::Other(body) => LlmError::Other(format!("ollama rejected request: {body}")),
        other => LlmError::Other(format!("ollama: {other}")),
    }
}

fn is_busy(body: &str) -> bool {
    let body = body.to_ascii_lowercase();
    body.contains("busy") || body.contains("try again") || body.contains("overloaded")
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn embedder(base_url: &str, attempts: u32) -> OllamaEmbedder {
        OllamaEmbedder::new(
            base_url,
            "nomic-embed-text".into(),
            3,
            RetryPolicy::immediate(attempts),
        )
        .unwrap()
    }

    #[test]
    fn invalid_url_rejected() {
        let err = OllamaEmbedder::new("not a url", "m".into(), 8, RetryPolicy::default()).unwrap_err();
        assert!(matches!(err, LlmError::Other(_)));
    }

    #[test]
    fn busy_server_is_transient() {
        let err = classify(OllamaError::Other("server busy, please try again".into()));
        assert!(err.is_transient());
        let err = classify(OllamaError::Other(r#"{"error":"model \"x\" not found"}"#.into()));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn embeds_batch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "embeddings": [[0.1, 0.2, 0.3], [0.4, 0.5, 0.6]]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let e = embedder(&server.uri(), 3);
        let out = e
            .embed_batch(&["a".to_owned(), "b".to_owned()], 10)
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert!((out[1][0] - 0.4).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn unknown_model_fails_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embed"))
            .respond_with(
                ResponseTemplate::new(404)
                    .set_body_string(r#"{"error":"model \"nomic-embed-text\" not found, try pulling it first"}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let e = embedder(&server.uri(), 3);
        let err = e.embed_batch(&["a".to_owned()], 10).await.unwrap_err();
        assert!(matches!(err, LlmError::Other(ref m) if m.contains("not found")), "got {err:?}");
    }

    #[test]
    fn model_info_uses_configured_dimension() {
        let e = OllamaEmbedder::new(
            "http://localhost:11434",
            "nomic-embed-text".into(),
            768,
            RetryPolicy::default(),
        )
        .unwrap();
        let info = e.model_info();
        assert_eq!(info.provider, "ollama");
        assert_eq!(info.model, "nomic-embed-text");
        assert_eq!(e.dimension(), 768);
    }

    #[tokio::test]
    async fn unreachable_server_exhausts_retries() {
        let e = OllamaEmbedder::new(
            "http://127.0.0.1:1",
            "nomic-embed-text".into(),
            768,
            RetryPolicy::immediate(2),
        )
        .unwrap();
        let err = e.embed_batch(&["x".to_owned()], 8).await.unwrap_err();
        assert!(matches!(err, LlmError::RetriesExhausted { attempts: 2, .. }));
    }
}
