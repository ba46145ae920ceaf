use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Identity of the model behind an embedder.
///
/// A collection is only comparable with vectors produced by the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub provider: String,
    pub model: String,
    pub dimension: usize,
}

pub trait EmbeddingProvider: Send + Sync {
    /// Embed `texts`, issuing requests of at most `batch_size` inputs.
    ///
    /// The effective batch size is additionally capped by the backend limit.
    /// Output order matches input order.
    ///
    /// # Errors
    ///
    /// Returns an error once the retry policy gives up, or immediately on a
    /// non-transient failure.
    fn embed_batch(
        &self,
        texts: &[String],
        batch_size: usize,
    ) -> impl Future<Output = Result<Vec<Vec<f32>>>> + Send;

    /// Embed a single text.
    ///
    /// # Errors
    ///
    /// Same as [`EmbeddingProvider::embed_batch`].
    fn embed(&self, text: &str) -> impl Future<Output = Result<Vec<f32>>> + Send {
        async move {
            let mut vectors = self.embed_batch(&[text.to_owned()], 1).await?;
            vectors
                .pop()
                .ok_or(crate::LlmError::EmptyResponse { provider: "embed" })
        }
    }

    fn dimension(&self) -> usize;

    fn name(&self) -> &str;

    fn model_info(&self) -> ModelInfo;
}

/// Split `len` inputs into consecutive ranges of at most `min(requested, cap)`.
pub(crate) fn batch_ranges(
    len: usize,
    requested: usize,
    cap: usize,
) -> impl Iterator<Item = std::ops::Range<usize>> {
    let size = requested.clamp(1, cap.max(1));
    (0..len)
        .step_by(size)
        .map(move |start| start..(start + size).min(len))
}
