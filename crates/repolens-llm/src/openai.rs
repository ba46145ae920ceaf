use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{LlmError, Result};
use crate::provider::{EmbeddingProvider, ModelInfo, batch_ranges};
use crate::retry::{RetryPolicy, retry_after};

/// Maximum inputs per `/embeddings` request.
pub const OPENAI_BATCH_CAP: usize = 100;

/// Output dimension of the well-known `OpenAI` embedding models.
#[must_use]
pub fn known_dimension(model: &str) -> usize {
    match model {
        "text-embedding-3-large" => 3072,
        _ => 1536,
    }
}

/// Embedder for `OpenAI` and any API exposing the same `/embeddings` endpoint.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    dimension: usize,
    batch_cap: usize,
    retry: RetryPolicy,
}

impl fmt::Debug for OpenAiEmbedder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiEmbedder")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("dimension", &self.dimension)
            .field("batch_cap", &self.batch_cap)
            .finish_non_exhaustive()
    }
}

impl OpenAiEmbedder {
    /// `dimension` overrides the built-in table for models it does not know.
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        api_key: String,
        mut base_url: String,
        model: String,
        dimension: Option<usize>,
        retry: RetryPolicy,
    ) -> Self {
        while base_url.ends_with('/') {
            base_url.pop();
        }
        let dimension = dimension.unwrap_or_else(|| known_dimension(&model));
        Self {
            client,
            api_key,
            base_url,
            model,
            dimension,
            batch_cap: OPENAI_BATCH_CAP,
            retry,
        }
    }

    #[must_use]
    pub fn with_batch_cap(mut self, cap: usize) -> Self {
        self.batch_cap = cap.max(1);
        self
    }

    async fn request_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = EmbeddingRequest {
            input: batch,
            model: &self.model,
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(LlmError::RateLimited {
                retry_after: retry_after(&response),
            });
        }

        let text = response.text().await?;
        if !status.is_success() {
            tracing::error!("OpenAI embedding API error {status}: {text}");
            return Err(LlmError::Status {
                provider: "openai",
                status: status.as_u16(),
                body: text,
            });
        }

        let mut resp: EmbeddingResponse = serde_json::from_str(&text)?;
        if resp.data.len() != batch.len() {
            return Err(LlmError::CountMismatch {
                provider: "openai",
                expected: batch.len(),
                got: resp.data.len(),
            });
        }
        resp.data.sort_by_key(|d| d.index);
        if resp.data.iter().any(|d| d.embedding.is_empty()) {
            return Err(LlmError::EmptyResponse { provider: "openai" });
        }
        Ok(resp.data.into_iter().map(|d| d.embedding).collect())
    }
}

impl EmbeddingProvider for OpenAiEmbedder {
    async fn embed_batch(&self, texts: &[String], batch_size: usize) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        let ranges: Vec<_> = batch_ranges(texts.len(), batch_size, self.batch_cap).collect();
        let total = ranges.len();
        for (i, range) in ranges.into_iter().enumerate() {
            tracing::debug!(
                batch = i + 1,
                total,
                size = range.len(),
                "requesting embeddings"
            );
            let batch = &texts[range];
            let vectors = self
                .retry
                .retry("openai embeddings", || self.request_batch(batch))
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
        "openai"
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            provider: "openai".into(),
            model: self.model.clone(),
            dimension: self.dimension,
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    input: &'a [String],
    model: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn embedder(base_url: &str, attempts: u32) -> OpenAiEmbedder {
        OpenAiEmbedder::new(
            reqwest::Client::new(),
            "sk-test-key".into(),
            base_url.to_owned(),
            "text-embedding-3-small".into(),
            None,
            RetryPolicy::immediate(attempts),
        )
    }

    fn body_for(n: usize) -> serde_json::Value {
        let data: Vec<_> = (0..n)
            .map(|i| serde_json::json!({"index": i, "embedding": [i as f32, 1.0]}))
            .collect();
        serde_json::json!({ "data": data })
    }

    #[test]
    fn dimension_table() {
        assert_eq!(known_dimension("text-embedding-3-large"), 3072);
        assert_eq!(known_dimension("text-embedding-3-small"), 1536);
        assert_eq!(known_dimension("text-embedding-ada-002"), 1536);
        assert_eq!(known_dimension("something-else"), 1536);
    }

    #[test]
    fn explicit_dimension_wins() {
        let e = OpenAiEmbedder::new(
            reqwest::Client::new(),
            String::new(),
            "http://localhost/v1/".into(),
            "custom".into(),
            Some(768),
            RetryPolicy::default(),
        );
        assert_eq!(e.dimension(), 768);
        assert_eq!(e.base_url, "http://localhost/v1");
    }

    #[test]
    fn debug_redacts_api_key() {
        let e = embedder("https://api.openai.com/v1", 1);
        let debug = format!("{e:?}");
        assert!(!debug.contains("sk-test-key"));
        assert!(debug.contains("<redacted>"));
        assert!(debug.contains("text-embedding-3-small"));
    }

    #[test]
    fn model_info_reports_identity() {
        let info = embedder("http://x", 1).model_info();
        assert_eq!(info.provider, "openai");
        assert_eq!(info.model, "text-embedding-3-small");
        assert_eq!(info.dimension, 1536);
    }

    #[test]
    fn response_sorted_by_index() {
        let json = r#"{"data":[{"index":1,"embedding":[0.2]},{"index":0,"embedding":[0.1]}]}"#;
        let mut resp: EmbeddingResponse = serde_json::from_str(json).unwrap();
        resp.data.sort_by_key(|d| d.index);
        assert_eq!(resp.data[0].embedding, vec![0.1]);
    }

    #[tokio::test]
    async fn embeds_in_capped_batches() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .and(header("Authorization", "Bearer sk-test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body_for(2)))
            .expect(3)
            .mount(&server)
            .await;

        let e = embedder(&server.uri(), 1).with_batch_cap(2);
        let texts: Vec<String> = (0..6).map(|i| format!("text {i}")).collect();
        let vectors = e.embed_batch(&texts, 50).await.unwrap();
        assert_eq!(vectors.len(), 6);
        assert_eq!(vectors[1], vec![1.0, 1.0]);
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body_for(1)))
            .mount(&server)
            .await;

        let e = embedder(&server.uri(), 3);
        let vectors = e.embed_batch(&["a".to_owned()], 10).await.unwrap();
        assert_eq!(vectors.len(), 1);
    }

    #[tokio::test]
    async fn rate_limit_exhaustion_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
            .expect(2)
            .mount(&server)
            .await;

        let e = embedder(&server.uri(), 2);
        let err = e.embed_batch(&["a".to_owned()], 10).await.unwrap_err();
        assert!(
            matches!(err, LlmError::RetriesExhausted { attempts: 2, .. }),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn unauthorized_fails_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid key"))
            .expect(1)
            .mount(&server)
            .await;

        let e = embedder(&server.uri(), 3);
        let err = e.embed_batch(&["a".to_owned()], 10).await.unwrap_err();
        assert!(matches!(err, LlmError::Status { status: 401, .. }));
    }

    #[tokio::test]
    async fn count_mismatch_detected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/embeddings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body_for(1)))
            .mount(&server)
            .await;

        let e = embedder(&server.uri(), 1);
        let texts = vec!["a".to_owned(), "b".to_owned()];
        let err = e.embed_batch(&texts, 10).await.unwrap_err();
        assert!(matches!(
            err,
            LlmError::CountMismatch {
                expected: 2,
                got: 1,
                ..
            }
        ));
    }
}
