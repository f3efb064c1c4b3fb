use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::flat_index::normalize;
use crate::retry::RetryPolicy;

/// The external embedding provider.
///
/// Implementations must be deterministic for a fixed model version and return
/// one vector of `dimension()` floats per input text, in input order.
pub trait Embedder: Send + Sync {
    fn model(&self) -> &str;

    /// Declared dimensionality of every returned vector.
    fn dimension(&self) -> usize;

    /// Whether returned vectors are already unit length.
    fn normalizes(&self) -> bool;

    fn embed(
        &self,
        texts: &[String],
    ) -> impl Future<Output = Result<Vec<Vec<f32>>, PipelineError>> + Send;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: String,
    pub dimension: usize,
    /// Unit-normalize vectors before indexing and querying. Forced on for cosine.
    pub normalize: bool,
    pub request_timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            dimension: 768,
            normalize: true,
            request_timeout_secs: 120,
        }
    }
}

/// Ollama `/api/embed` client.
#[derive(Clone)]
pub struct EmbeddingClient {
    base_url: String,
    model: String,
    dimension: usize,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embeddings: Vec<Vec<f32>>,
}

impl EmbeddingClient {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, PipelineError> {
        if config.dimension == 0 {
            return Err(PipelineError::Configuration(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| PipelineError::Configuration(format!("http client: {e}")))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            dimension: config.dimension,
            client,
        })
    }
}

impl Embedder for EmbeddingClient {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn normalizes(&self) -> bool {
        false
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PipelineError> {
        let url = format!("{}/api/embed", self.base_url);

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::EmbeddingProvider(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(PipelineError::EmbeddingProvider(format!(
                "embedding request returned status {}",
                response.status()
            )));
        }

        let embedding_response: EmbeddingResponse = response.json().await.map_err(|e| {
            PipelineError::EmbeddingProvider(format!("failed to parse embedding response: {e}"))
        })?;

        Ok(embedding_response.embeddings)
    }
}

/// Embed `texts` in batches of `batch_size`, in order.
///
/// Each batch is retried as a whole; a batch that still fails, returns the
/// wrong number of vectors, or a vector of the wrong width aborts the call.
pub async fn embed_all<E: Embedder>(
    embedder: &E,
    texts: &[String],
    batch_size: usize,
    retry: &RetryPolicy,
    unit_normalize: bool,
) -> Result<Vec<Vec<f32>>, PipelineError> {
    if batch_size == 0 {
        return Err(PipelineError::Configuration(
            "embed_batch_size must be greater than zero".to_string(),
        ));
    }

    let dimension = embedder.dimension();
    let mut all_embeddings = Vec::with_capacity(texts.len());

    for batch in texts.chunks(batch_size) {
        let embeddings = retry.retry("embed_batch", || embedder.embed(batch)).await?;

        if embeddings.len() != batch.len() {
            return Err(PipelineError::EmbeddingProvider(format!(
                "provider returned {} embeddings for {} inputs",
                embeddings.len(),
                batch.len()
            )));
        }
        if let Some(bad) = embeddings.iter().find(|v| v.len() != dimension) {
            return Err(PipelineError::EmbeddingProvider(format!(
                "expected dimension {dimension}, got {}",
                bad.len()
            )));
        }

        all_embeddings.extend(embeddings);
    }

    if unit_normalize && !embedder.normalizes() {
        for vector in &mut all_embeddings {
            normalize(vector);
        }
    }

    tracing::debug!(
        model = embedder.model(),
        texts = texts.len(),
        batch_size,
        "embedded texts"
    );

    Ok(all_embeddings)
}
